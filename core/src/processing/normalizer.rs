use crate::config::NormalizerConfig;
use crate::interface::{Bds, CprParity, DroppedField, Message, RawMessage};
use crate::prelude::{ProcessingStage, StageError, StageResult};
use crate::telemetry::LogManager;
use crate::units::{default_input_unit, Unit};
use std::collections::BTreeMap;

/// Converts decoded reports to canonical units.
///
/// A field whose declared unit is unknown, or of the wrong dimension, is
/// dropped and listed in `Message::dropped`; the rest of the message is kept.
/// Only a broken key (timestamp, df, hash) rejects the whole message.
pub struct Normalizer {
    config: NormalizerConfig,
    logger: LogManager,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            config,
            logger: LogManager::new("normalizer"),
        }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    fn validate_key(raw: &RawMessage) -> StageResult<()> {
        if !raw.timestamp.is_finite() || raw.timestamp < 0.0 {
            return Err(StageError::MalformedMessage(format!(
                "{} has invalid timestamp {}",
                raw.icao, raw.timestamp
            )));
        }
        if raw.df > 24 {
            return Err(StageError::MalformedMessage(format!(
                "{} has invalid downlink format {}",
                raw.icao, raw.df
            )));
        }
        if raw.msg_hash.is_empty() {
            return Err(StageError::MalformedMessage(format!(
                "{} at {} carries no msg_hash",
                raw.icao, raw.timestamp
            )));
        }
        Ok(())
    }

    /// Converts each present numeric field, collecting the ones that fail.
    fn convert_fields(
        &self,
        raw: &RawMessage,
        dropped: &mut Vec<DroppedField>,
    ) -> BTreeMap<&'static str, f64> {
        let mut converted = BTreeMap::new();
        for (name, value) in raw.numeric_fields() {
            let Some(value) = value else { continue };
            match Self::convert_one(raw, name, value) {
                Ok(si) => {
                    converted.insert(name, si);
                }
                Err(err) => {
                    self.logger
                        .detail(&format!("{} dropped {}: {}", raw.icao, name, err));
                    dropped.push(DroppedField {
                        field: name.to_string(),
                        reason: err.kind().to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }
        converted
    }

    fn convert_one(raw: &RawMessage, name: &str, value: f64) -> StageResult<f64> {
        if !value.is_finite() {
            return Err(StageError::MalformedMessage(format!(
                "{} is not finite",
                name
            )));
        }
        let native = default_input_unit(name).ok_or_else(|| {
            StageError::Internal(format!("no contract unit for field {}", name))
        })?;
        let declared = match raw.units.get(name) {
            Some(tag) => Unit::parse(tag)?,
            None => native,
        };
        declared.convert(value, Unit::canonical(native.dimension()))
    }
}

impl ProcessingStage for Normalizer {
    type Input = RawMessage;
    type Output = Message;

    fn execute(&mut self, raw: RawMessage) -> StageResult<Message> {
        Self::validate_key(&raw)?;

        let mut dropped = Vec::new();
        for name in raw.units.keys() {
            if default_input_unit(name).is_none() {
                self.logger
                    .detail(&format!("{} declares unit for unknown field {}", raw.icao, name));
            }
        }
        let fields = self.convert_fields(&raw, &mut dropped);
        let get = |name: &str| fields.get(name).copied();

        let (wind_speed, wind_from) = match (get("wind_speed"), get("wind_direction")) {
            (Some(speed), Some(dir)) => (Some(speed), Some(dir.rem_euclid(360.0))),
            _ => (None, None),
        };

        Ok(Message {
            icao: raw.icao,
            timestamp: raw.timestamp,
            msg_hash: raw.msg_hash.clone(),
            df: raw.df,
            typecode: raw.typecode,
            bds: raw.bds.as_deref().map(Bds::parse),
            raw_frame: raw.raw.clone(),
            crc_claimed: raw.crc_ok,
            cpr_parity: raw.oe_flag.and_then(CprParity::from_flag),
            nac_p: raw.nac_p,
            nac_v: raw.nac_v,
            latitude_deg: get("latitude"),
            longitude_deg: get("longitude"),
            altitude_m: get("altitude_ft"),
            geometric_altitude_m: get("geometric_altitude_ft"),
            altitude_diff_m: get("altitude_diff_ft"),
            ground_speed_ms: get("ground_speed"),
            track_deg: get("track").map(|t| t.rem_euclid(360.0)),
            vertical_rate_ms: get("vertical_rate"),
            heading_deg: get("heading").map(|h| h.rem_euclid(360.0)),
            tas_ms: get("tas"),
            ias_ms: get("ias"),
            mach: get("mach"),
            roll_deg: get("roll"),
            track_rate_dps: get("track_rate"),
            baro_setting_pa: get("baro_pressure_setting"),
            temperature_k: get("temp_c"),
            pressure_pa: get("pressure_hpa"),
            humidity_pct: get("humidity_pct"),
            reported_wind_speed_ms: wind_speed,
            reported_wind_from_deg: wind_from,
            turbulence_level: raw.turbulence,
            wind_shear_level: raw.wind_shear,
            dropped,
        })
    }

    fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Icao, MsgHash};

    fn raw() -> RawMessage {
        RawMessage::new(Icao::new(0xABCDEF).unwrap(), 1_700_000_000.0, 17, MsgHash::new("ab12"))
    }

    #[test]
    fn converts_contract_units_to_si() {
        let mut normalizer = Normalizer::new(NormalizerConfig::default());
        let msg = normalizer
            .execute(RawMessage {
                altitude_ft: Some(10_000.0),
                ground_speed: Some(120.0),
                vertical_rate: Some(-500.0),
                temp_c: Some(-10.0),
                pressure_hpa: Some(700.0),
                ..raw()
            })
            .unwrap();
        assert!((msg.altitude_m.unwrap() - 3048.0).abs() < 1e-9);
        assert!((msg.ground_speed_ms.unwrap() - 61.733).abs() < 1e-3);
        assert!((msg.vertical_rate_ms.unwrap() + 2.54).abs() < 1e-9);
        assert!((msg.temperature_k.unwrap() - 263.15).abs() < 1e-9);
        assert!((msg.pressure_pa.unwrap() - 70_000.0).abs() < 1e-9);
        assert!(msg.dropped.is_empty());
    }

    #[test]
    fn declared_units_override_contract_defaults() {
        let mut normalizer = Normalizer::new(NormalizerConfig::default());
        let mut units = BTreeMap::new();
        units.insert("altitude_ft".to_string(), "m".to_string());
        units.insert("temp_c".to_string(), "K".to_string());
        let msg = normalizer
            .execute(RawMessage {
                altitude_ft: Some(1500.0),
                temp_c: Some(270.0),
                units,
                ..raw()
            })
            .unwrap();
        assert_eq!(msg.altitude_m, Some(1500.0));
        assert_eq!(msg.temperature_k, Some(270.0));
    }

    #[test]
    fn unknown_unit_drops_only_that_field() {
        let mut normalizer = Normalizer::new(NormalizerConfig::default());
        let mut units = BTreeMap::new();
        units.insert("ground_speed".to_string(), "furlong/fortnight".to_string());
        let msg = normalizer
            .execute(RawMessage {
                ground_speed: Some(120.0),
                track: Some(90.0),
                units,
                ..raw()
            })
            .unwrap();
        assert!(msg.ground_speed_ms.is_none());
        assert_eq!(msg.track_deg, Some(90.0));
        assert_eq!(msg.dropped.len(), 1);
        assert_eq!(msg.dropped[0].reason, "unit_conversion");
    }

    #[test]
    fn invalid_timestamp_rejects_message() {
        let mut normalizer = Normalizer::new(NormalizerConfig::default());
        let err = normalizer
            .execute(RawMessage {
                timestamp: f64::NAN,
                ..raw()
            })
            .unwrap_err();
        assert_eq!(err.kind(), "malformed_message");
    }
}
