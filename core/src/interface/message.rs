use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 24-bit Mode-S aircraft address. Serialized as six hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Icao(u32);

impl Icao {
    pub fn new(address: u32) -> StageResult<Self> {
        if address > 0x00FF_FFFF {
            return Err(StageError::MalformedMessage(format!(
                "icao {:#x} exceeds 24 bits",
                address
            )));
        }
        Ok(Self(address))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl FromStr for Icao {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let address = u32::from_str_radix(trimmed, 16)
            .map_err(|_| StageError::MalformedMessage(format!("invalid icao '{}'", trimmed)))?;
        Icao::new(address)
    }
}

impl TryFrom<String> for Icao {
    type Error = StageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Icao> for String {
    fn from(value: Icao) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Icao {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}", self.0)
    }
}

/// Deduplication key computed over the raw encoded frame bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgHash(String);

impl MsgHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().to_ascii_lowercase())
    }

    /// Hash of a hex-encoded raw frame: first 8 bytes of SHA-256, lowercase hex.
    pub fn of_raw_frame(frame_hex: &str) -> Self {
        Self::of_bytes(frame_hex.trim().to_ascii_lowercase().as_bytes())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MsgHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Comm-B data selector carried by DF20/21 replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bds {
    Bds40,
    Bds44,
    Bds45,
    Bds50,
    Bds60,
    Other,
}

impl Bds {
    pub fn parse(tag: &str) -> Bds {
        let digits: String = tag.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        let digits = digits.trim_start_matches(['B', 'b', 'D', 'd']);
        match digits {
            "40" => Bds::Bds40,
            "44" => Bds::Bds44,
            "45" => Bds::Bds45,
            "50" => Bds::Bds50,
            "60" => Bds::Bds60,
            _ => Bds::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Bds::Bds40 => "bds40",
            Bds::Bds44 => "bds44",
            Bds::Bds45 => "bds45",
            Bds::Bds50 => "bds50",
            Bds::Bds60 => "bds60",
            Bds::Other => "bds_other",
        }
    }
}

/// CPR format bit of an airborne or surface position message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CprParity {
    Even,
    Odd,
}

impl CprParity {
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(CprParity::Even),
            1 => Some(CprParity::Odd),
            _ => None,
        }
    }
}

fn default_crc_ok() -> bool {
    true
}

/// One decoded report as delivered by the decoding collaborator.
///
/// Field names and default units follow the input contract; `units` may
/// override the unit of any numeric field by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub icao: Icao,
    pub timestamp: f64,
    pub df: u8,
    pub typecode: Option<u8>,
    pub msg_hash: MsgHash,
    /// Hex-encoded frame, when the decoder forwards it.
    pub raw: Option<String>,
    #[serde(default = "default_crc_ok")]
    pub crc_ok: bool,
    pub bds: Option<String>,
    pub oe_flag: Option<u8>,
    pub nac_p: Option<u8>,
    pub nac_v: Option<u8>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_ft: Option<f64>,
    pub geometric_altitude_ft: Option<f64>,
    /// GNSS minus barometric altitude from airborne velocity messages.
    pub altitude_diff_ft: Option<f64>,
    pub ground_speed: Option<f64>,
    pub track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub heading: Option<f64>,
    pub tas: Option<f64>,
    pub ias: Option<f64>,
    pub mach: Option<f64>,
    pub roll: Option<f64>,
    pub track_rate: Option<f64>,
    pub baro_pressure_setting: Option<f64>,
    pub temp_c: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    /// Comm-B 4,5 hazard levels, 0 (nil) to 3 (severe).
    pub turbulence: Option<u8>,
    pub wind_shear: Option<u8>,
    #[serde(default)]
    pub units: BTreeMap<String, String>,
}

impl RawMessage {
    pub fn new(icao: Icao, timestamp: f64, df: u8, msg_hash: MsgHash) -> Self {
        Self {
            icao,
            timestamp,
            df,
            typecode: None,
            msg_hash,
            raw: None,
            crc_ok: true,
            bds: None,
            oe_flag: None,
            nac_p: None,
            nac_v: None,
            latitude: None,
            longitude: None,
            altitude_ft: None,
            geometric_altitude_ft: None,
            altitude_diff_ft: None,
            ground_speed: None,
            track: None,
            vertical_rate: None,
            heading: None,
            tas: None,
            ias: None,
            mach: None,
            roll: None,
            track_rate: None,
            baro_pressure_setting: None,
            temp_c: None,
            pressure_hpa: None,
            humidity_pct: None,
            wind_speed: None,
            wind_direction: None,
            turbulence: None,
            wind_shear: None,
            units: BTreeMap::new(),
        }
    }

    /// Numeric fields in input-contract order, by contract name.
    pub fn numeric_fields(&self) -> [(&'static str, Option<f64>); 20] {
        [
            ("latitude", self.latitude),
            ("longitude", self.longitude),
            ("altitude_ft", self.altitude_ft),
            ("geometric_altitude_ft", self.geometric_altitude_ft),
            ("altitude_diff_ft", self.altitude_diff_ft),
            ("ground_speed", self.ground_speed),
            ("track", self.track),
            ("vertical_rate", self.vertical_rate),
            ("heading", self.heading),
            ("tas", self.tas),
            ("ias", self.ias),
            ("mach", self.mach),
            ("roll", self.roll),
            ("track_rate", self.track_rate),
            ("baro_pressure_setting", self.baro_pressure_setting),
            ("temp_c", self.temp_c),
            ("pressure_hpa", self.pressure_hpa),
            ("humidity_pct", self.humidity_pct),
            ("wind_speed", self.wind_speed),
            ("wind_direction", self.wind_direction),
        ]
    }
}

/// A field removed during normalization, kept so the omission stays visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedField {
    pub field: String,
    pub reason: String,
    pub detail: String,
}

/// A decoded report with every numeric field in canonical units
/// (metres, m/s, degrees, kelvin, pascal, percent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub icao: Icao,
    pub timestamp: f64,
    pub msg_hash: MsgHash,
    pub df: u8,
    pub typecode: Option<u8>,
    pub bds: Option<Bds>,
    pub raw_frame: Option<String>,
    pub crc_claimed: bool,
    pub cpr_parity: Option<CprParity>,
    pub nac_p: Option<u8>,
    pub nac_v: Option<u8>,
    pub latitude_deg: Option<f64>,
    pub longitude_deg: Option<f64>,
    pub altitude_m: Option<f64>,
    pub geometric_altitude_m: Option<f64>,
    pub altitude_diff_m: Option<f64>,
    pub ground_speed_ms: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_ms: Option<f64>,
    pub heading_deg: Option<f64>,
    pub tas_ms: Option<f64>,
    pub ias_ms: Option<f64>,
    pub mach: Option<f64>,
    pub roll_deg: Option<f64>,
    pub track_rate_dps: Option<f64>,
    pub baro_setting_pa: Option<f64>,
    pub temperature_k: Option<f64>,
    pub pressure_pa: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub reported_wind_speed_ms: Option<f64>,
    pub reported_wind_from_deg: Option<f64>,
    pub turbulence_level: Option<u8>,
    pub wind_shear_level: Option<u8>,
    pub dropped: Vec<DroppedField>,
}

impl Message {
    pub fn has_position(&self) -> bool {
        self.latitude_deg.is_some() && self.longitude_deg.is_some()
    }

    pub fn has_velocity(&self) -> bool {
        self.ground_speed_ms.is_some()
            || self.track_deg.is_some()
            || self.vertical_rate_ms.is_some()
            || self.tas_ms.is_some()
            || self.heading_deg.is_some()
    }

    pub fn has_met(&self) -> bool {
        self.temperature_k.is_some()
            || self.pressure_pa.is_some()
            || self.humidity_pct.is_some()
            || self.reported_wind_speed_ms.is_some()
            || self.turbulence_level.is_some()
            || self.wind_shear_level.is_some()
    }

    /// Geometric altitude, reported directly or reconstructed from the
    /// barometric altitude plus the GNSS difference.
    pub fn geometric_altitude(&self) -> Option<f64> {
        self.geometric_altitude_m.or(match (self.altitude_m, self.altitude_diff_m) {
            (Some(baro), Some(diff)) => Some(baro + diff),
            _ => None,
        })
    }

    /// Message category label used for statistics: `df17`, `tc19`, `bds44`.
    pub fn category_labels(&self) -> Vec<String> {
        let mut labels = vec![format!("df{}", self.df)];
        if let Some(tc) = self.typecode {
            labels.push(format!("tc{}", tc));
        }
        if let Some(bds) = self.bds {
            labels.push(bds.label().to_string());
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icao_parses_and_displays_hex() {
        let icao: Icao = "a1b2c3".parse().unwrap();
        assert_eq!(icao.value(), 0xA1B2C3);
        assert_eq!(icao.to_string(), "A1B2C3");
        assert!("1000000".parse::<Icao>().is_err());
        assert!("zz".parse::<Icao>().is_err());
    }

    #[test]
    fn msg_hash_is_stable_over_raw_frame() {
        let a = MsgHash::of_raw_frame("8D4840D6202CC371C32CE0576098");
        let b = MsgHash::of_raw_frame("8d4840d6202cc371c32ce0576098");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn bds_tags_parse_in_common_spellings() {
        assert_eq!(Bds::parse("44"), Bds::Bds44);
        assert_eq!(Bds::parse("4,5"), Bds::Bds45);
        assert_eq!(Bds::parse("BDS50"), Bds::Bds50);
        assert_eq!(Bds::parse("17"), Bds::Other);
    }

    #[test]
    fn raw_message_deserializes_with_missing_optionals() {
        let json = r#"{"icao":"4840D6","timestamp":1700000000.5,"df":17,"typecode":19,
            "msg_hash":"00ff00ff00ff00ff","ground_speed":120.0,"track":90.0}"#;
        let msg: RawMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.icao.value(), 0x4840D6);
        assert!(msg.crc_ok);
        assert_eq!(msg.ground_speed, Some(120.0));
        assert!(msg.tas.is_none());
    }
}
