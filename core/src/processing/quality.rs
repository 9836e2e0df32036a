use crate::config::{BasinConfig, QualityConfig};
use crate::interface::{Bds, CprParity, Field, Icao, Message, MsgHash};
use crate::prelude::{ProcessingStage, StageError, StageResult};
use crate::telemetry::LogManager;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

const CRC24_GENERATOR: u32 = 0x1FF_F409;
/// Comm-B temperature resolution of BDS 4,4 and 4,5 replies.
const COMMB_TEMPERATURE_RESOLUTION_K: f64 = 0.25;

/// Outcome of one validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Pass,
    Fail,
    NotApplicable,
}

impl Check {
    pub fn from_ok(ok: bool) -> Self {
        if ok {
            Check::Pass
        } else {
            Check::Fail
        }
    }

    pub fn failed(&self) -> bool {
        matches!(self, Check::Fail)
    }

    /// `Some(true/false)` for evaluated checks, `None` when not applicable.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Check::Pass => Some(true),
            Check::Fail => Some(false),
            Check::NotApplicable => None,
        }
    }
}

/// Validity flags and uncertainty attached alongside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityFlags {
    pub crc_ok: Check,
    pub pos_ok: Check,
    pub alt_ok: Check,
    pub vel_ok: Check,
    pub bds44_ok: Check,
    pub bds45_ok: Check,
    pub duplicate: bool,
    pub reasons: Vec<String>,
    pub position_uncertainty_m: Option<f64>,
    pub velocity_uncertainty_ms: Option<f64>,
    pub temperature_uncertainty_k: Option<f64>,
}

impl QualityFlags {
    fn new() -> Self {
        Self {
            crc_ok: Check::NotApplicable,
            pos_ok: Check::NotApplicable,
            alt_ok: Check::NotApplicable,
            vel_ok: Check::NotApplicable,
            bds44_ok: Check::NotApplicable,
            bds45_ok: Check::NotApplicable,
            duplicate: false,
            reasons: Vec::new(),
            position_uncertainty_m: None,
            velocity_uncertainty_ms: None,
            temperature_uncertainty_k: None,
        }
    }

    pub fn rejected(&self) -> bool {
        self.duplicate
            || [
                self.crc_ok,
                self.pos_ok,
                self.alt_ok,
                self.vel_ok,
                self.bds44_ok,
                self.bds45_ok,
            ]
            .iter()
            .any(Check::failed)
    }

    /// Whether an observation of `field` from this message may be aggregated.
    pub fn admits(&self, field: Field, bds: Option<Bds>) -> bool {
        if self.duplicate || self.crc_ok.failed() {
            return false;
        }
        match field {
            Field::Latitude | Field::Longitude => !self.pos_ok.failed(),
            Field::Altitude | Field::GeometricAltitude | Field::BaroSetting => !self.alt_ok.failed(),
            Field::GroundU
            | Field::GroundV
            | Field::TrueAirspeed
            | Field::HeadingX
            | Field::HeadingY
            | Field::VerticalRate
            | Field::TurbulenceVar => !self.vel_ok.failed(),
            Field::Temperature
            | Field::Pressure
            | Field::Humidity
            | Field::ReportedWindU
            | Field::ReportedWindV => match bds {
                Some(Bds::Bds45) => !self.bds45_ok.failed(),
                _ => !self.bds44_ok.failed(),
            },
        }
    }
}

/// A message with its quality flags attached; the message is never altered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualifiedMessage {
    pub message: Message,
    pub flags: QualityFlags,
}

impl QualifiedMessage {
    pub fn admits(&self, field: Field) -> bool {
        self.flags.admits(field, self.message.bds)
    }
}

#[derive(Debug, Default)]
struct AircraftGateState {
    last_even: Option<f64>,
    last_odd: Option<f64>,
    last_seen: f64,
    recent: VecDeque<(f64, MsgHash)>,
}

/// Residual of the Mode-S CRC-24 over a whole frame, parity field included.
pub fn crc24_residual(frame: &[u8]) -> u32 {
    if frame.len() < 3 {
        return u32::MAX;
    }
    let (data, parity) = frame.split_at(frame.len() - 3);
    let mut crc: u32 = 0;
    for &byte in data {
        crc ^= (byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x100_0000 != 0 {
                crc ^= CRC24_GENERATOR;
            }
        }
    }
    let parity = (parity[0] as u32) << 16 | (parity[1] as u32) << 8 | parity[2] as u32;
    (crc & 0xFF_FFFF) ^ parity
}

/// Horizontal 95% containment bound for a NACp category.
pub fn nac_p_epu_m(nac_p: u8) -> Option<f64> {
    match nac_p {
        11 => Some(3.0),
        10 => Some(10.0),
        9 => Some(30.0),
        8 => Some(92.6),
        7 => Some(185.2),
        6 => Some(555.6),
        5 => Some(926.0),
        4 => Some(1852.0),
        3 => Some(3704.0),
        2 => Some(7408.0),
        1 => Some(18_520.0),
        _ => None,
    }
}

/// Horizontal velocity error bound for a NACv category.
pub fn nac_v_bound_ms(nac_v: u8) -> Option<f64> {
    match nac_v {
        4 => Some(0.3),
        3 => Some(1.0),
        2 => Some(3.0),
        1 => Some(10.0),
        _ => None,
    }
}

/// Attaches validity flags to normalized messages.
///
/// Keeps the last CPR parity times and recently seen hashes per aircraft;
/// that state is owned by the shard running this gate and pruned after
/// `state_timeout_s` of silence.
pub struct QualityGate {
    config: QualityConfig,
    basin: BasinConfig,
    aircraft: HashMap<Icao, AircraftGateState>,
    logger: LogManager,
}

impl QualityGate {
    pub fn new(config: QualityConfig, basin: BasinConfig) -> Self {
        Self {
            config,
            basin,
            aircraft: HashMap::new(),
            logger: LogManager::new("quality"),
        }
    }

    pub fn tracked_aircraft(&self) -> usize {
        self.aircraft.len()
    }

    /// Drops gate state for aircraft silent since `now - state_timeout_s`.
    pub fn prune(&mut self, now: f64) -> usize {
        let timeout = self.config.state_timeout_s;
        let before = self.aircraft.len();
        self.aircraft.retain(|_, state| now - state.last_seen <= timeout);
        before - self.aircraft.len()
    }

    fn check_crc(&self, msg: &Message, flags: &mut QualityFlags) {
        if !self.config.check_crc {
            return;
        }
        let Some(frame_hex) = msg.raw_frame.as_deref() else {
            flags.crc_ok = Check::from_ok(msg.crc_claimed);
            if !msg.crc_claimed {
                flags.reasons.push("crc_claimed_bad".into());
            }
            return;
        };
        let frame = match hex::decode(frame_hex.trim()) {
            Ok(bytes) if bytes.len() == 7 || bytes.len() == 14 => bytes,
            _ => {
                flags.crc_ok = Check::Fail;
                flags.reasons.push("bad_frame".into());
                return;
            }
        };
        let residual = crc24_residual(&frame);
        let ok = match msg.df {
            17 | 18 => residual == 0,
            0 | 4 | 5 | 16 | 20 | 21 => residual == msg.icao.value(),
            11 => residual & 0xFF_FF80 == 0,
            _ => msg.crc_claimed,
        };
        flags.crc_ok = Check::from_ok(ok);
        if !ok {
            flags.reasons.push("crc_residual".into());
        }
    }

    fn check_position(&self, msg: &Message, state: &AircraftGateState, flags: &mut QualityFlags) {
        let (Some(lat), Some(lon)) = (msg.latitude_deg, msg.longitude_deg) else {
            return;
        };
        let mut ok = true;
        if self.config.check_pairing {
            if let Some(parity) = msg.cpr_parity {
                let other = match parity {
                    CprParity::Even => state.last_odd,
                    CprParity::Odd => state.last_even,
                };
                let paired = other
                    .map(|t| (msg.timestamp - t).abs() <= self.config.max_pair_gap_s)
                    .unwrap_or(false);
                if !paired {
                    ok = false;
                    flags.reasons.push("cpr_unpaired".into());
                }
            }
        }
        if self.config.check_range {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                ok = false;
                flags.reasons.push("position_invalid".into());
            } else if !self.basin.contains_with_margin(lat, lon) {
                ok = false;
                flags.reasons.push("position_outside_basin".into());
            }
        }
        flags.pos_ok = Check::from_ok(ok);
        flags.position_uncertainty_m = msg.nac_p.and_then(nac_p_epu_m);
    }

    fn check_altitude(&self, msg: &Message, flags: &mut QualityFlags) {
        let altitudes = [msg.altitude_m, msg.geometric_altitude()];
        if altitudes.iter().all(Option::is_none) {
            return;
        }
        let ok = !self.config.check_range
            || altitudes.iter().flatten().all(|alt| {
                *alt >= self.config.min_altitude_m && *alt <= self.config.max_altitude_m
            });
        flags.alt_ok = Check::from_ok(ok);
        if !ok {
            flags.reasons.push("altitude_envelope".into());
        }
    }

    fn check_velocity(&self, msg: &Message, flags: &mut QualityFlags) {
        if !msg.has_velocity() && msg.roll_deg.is_none() {
            return;
        }
        let c = &self.config;
        let within = |value: Option<f64>, max: f64| value.map(|v| v.abs() <= max).unwrap_or(true);
        let ok = !c.check_range
            || (within(msg.ground_speed_ms, c.max_ground_speed_ms)
                && within(msg.tas_ms, c.max_airspeed_ms)
                && within(msg.ias_ms, c.max_airspeed_ms)
                && within(msg.vertical_rate_ms, c.max_vertical_rate_ms)
                && within(msg.roll_deg, c.max_roll_deg)
                && within(msg.mach, 1.0)
                && msg.ground_speed_ms.map(|v| v >= 0.0).unwrap_or(true)
                && msg.tas_ms.map(|v| v >= 0.0).unwrap_or(true));
        flags.vel_ok = Check::from_ok(ok);
        if !ok {
            flags.reasons.push("velocity_envelope".into());
        }
        flags.velocity_uncertainty_ms = msg.nac_v.and_then(nac_v_bound_ms);
    }

    fn check_met(&self, msg: &Message, flags: &mut QualityFlags) {
        if !msg.has_met() {
            return;
        }
        let c = &self.config;
        let ok = !c.check_range
            || (msg
                .temperature_k
                .map(|t| t >= c.min_temperature_k && t <= c.max_temperature_k)
                .unwrap_or(true)
                && msg
                    .pressure_pa
                    .map(|p| p >= c.min_pressure_pa && p <= c.max_pressure_pa)
                    .unwrap_or(true)
                && msg
                    .humidity_pct
                    .map(|h| (0.0..=100.0).contains(&h))
                    .unwrap_or(true)
                && msg
                    .reported_wind_speed_ms
                    .map(|w| w >= 0.0 && w <= c.max_wind_speed_ms)
                    .unwrap_or(true)
                && msg.turbulence_level.map(|l| l <= 3).unwrap_or(true)
                && msg.wind_shear_level.map(|l| l <= 3).unwrap_or(true));
        match msg.bds {
            Some(Bds::Bds45) => flags.bds45_ok = Check::from_ok(ok),
            _ => flags.bds44_ok = Check::from_ok(ok),
        }
        if !ok {
            flags.reasons.push("met_envelope".into());
        }
        if msg.temperature_k.is_some() {
            flags.temperature_uncertainty_k = Some(COMMB_TEMPERATURE_RESOLUTION_K);
        }
    }
}

impl ProcessingStage for QualityGate {
    type Input = Message;
    type Output = QualifiedMessage;

    fn execute(&mut self, message: Message) -> StageResult<QualifiedMessage> {
        let mut flags = QualityFlags::new();
        self.check_crc(&message, &mut flags);

        let state = self.aircraft.entry(message.icao).or_default();
        state.last_seen = state.last_seen.max(message.timestamp);
        let dedup_window = self.config.dedup_window_s;
        while state
            .recent
            .front()
            .map(|(t, _)| message.timestamp - t > dedup_window)
            .unwrap_or(false)
        {
            state.recent.pop_front();
        }
        flags.duplicate = state.recent.iter().any(|(t, hash)| {
            *hash == message.msg_hash && (message.timestamp - t).abs() <= dedup_window
        });
        state.recent.push_back((message.timestamp, message.msg_hash.clone()));
        match message.cpr_parity {
            Some(CprParity::Even) => state.last_even = Some(message.timestamp),
            Some(CprParity::Odd) => state.last_odd = Some(message.timestamp),
            None => {}
        }

        // Pairing is judged against the state including this frame's parity.
        let state = self
            .aircraft
            .get(&message.icao)
            .ok_or_else(|| StageError::Internal("gate state vanished".into()))?;
        self.check_position(&message, state, &mut flags);
        self.check_altitude(&message, &mut flags);
        self.check_velocity(&message, &mut flags);
        self.check_met(&message, &mut flags);

        if flags.duplicate {
            flags.reasons.push("duplicate".into());
        }
        if flags.rejected() {
            let rejection = StageError::QualityGateRejection(format!(
                "{} at {:.1}: {}",
                message.icao,
                message.timestamp,
                flags.reasons.join(",")
            ));
            self.logger.detail(&rejection.to_string());
        }

        Ok(QualifiedMessage { message, flags })
    }

    fn cleanup(&mut self) {
        self.aircraft.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizerConfig;
    use crate::interface::RawMessage;
    use crate::processing::normalizer::Normalizer;

    fn gate() -> QualityGate {
        QualityGate::new(QualityConfig::default(), BasinConfig::default())
    }

    fn normalize(raw: RawMessage) -> Message {
        Normalizer::new(NormalizerConfig::default()).execute(raw).unwrap()
    }

    fn position(ts: f64, parity: u8, hash: &str) -> Message {
        normalize(RawMessage {
            typecode: Some(11),
            oe_flag: Some(parity),
            latitude: Some(40.4),
            longitude: Some(-109.6),
            altitude_ft: Some(8000.0),
            ..RawMessage::new(Icao::new(0xA0B0C0).unwrap(), ts, 17, MsgHash::new(hash))
        })
    }

    #[test]
    fn crc_of_known_frame_is_zero() {
        let frame = hex::decode("8D4840D6202CC371C32CE0576098").unwrap();
        assert_eq!(crc24_residual(&frame), 0);
        let mut corrupted = frame.clone();
        corrupted[5] ^= 0x01;
        assert_ne!(crc24_residual(&corrupted), 0);
    }

    #[test]
    fn raw_frame_crc_is_reasserted() {
        let mut gate = gate();
        let mut msg = normalize(RawMessage::new(
            Icao::new(0x4840D6).unwrap(),
            10.0,
            17,
            MsgHash::of_raw_frame("8D4840D6202CC371C32CE0576098"),
        ));
        msg.raw_frame = Some("8D4840D6202CC371C32CE0576098".into());
        assert_eq!(gate.execute(msg.clone()).unwrap().flags.crc_ok, Check::Pass);

        msg.raw_frame = Some("8D4840D6202CC371C32CE0576099".into());
        msg.msg_hash = MsgHash::new("other");
        assert_eq!(gate.execute(msg).unwrap().flags.crc_ok, Check::Fail);
    }

    #[test]
    fn position_requires_recent_opposite_parity() {
        let mut gate = gate();
        let first = gate.execute(position(100.0, 0, "a1")).unwrap();
        assert_eq!(first.flags.pos_ok, Check::Fail);
        let second = gate.execute(position(104.0, 1, "a2")).unwrap();
        assert_eq!(second.flags.pos_ok, Check::Pass);
        let stale = gate.execute(position(130.0, 0, "a3")).unwrap();
        assert_eq!(stale.flags.pos_ok, Check::Fail);
        assert!(stale.flags.reasons.iter().any(|r| r == "cpr_unpaired"));
    }

    #[test]
    fn rejected_messages_are_flagged_not_dropped() {
        let mut gate = gate();
        let msg = normalize(RawMessage {
            ground_speed: Some(2_000.0),
            track: Some(10.0),
            ..RawMessage::new(Icao::new(1).unwrap(), 5.0, 17, MsgHash::new("ff"))
        });
        let qualified = gate.execute(msg).unwrap();
        assert_eq!(qualified.flags.vel_ok, Check::Fail);
        assert!(qualified.flags.rejected());
        assert!(!qualified.admits(Field::GroundU));
        assert_eq!(qualified.message.ground_speed_ms.map(|v| v > 1000.0), Some(true));
    }

    #[test]
    fn duplicate_frames_within_window_are_flagged() {
        let mut gate = gate();
        let a = gate.execute(position(200.0, 0, "dup")).unwrap();
        let b = gate.execute(position(200.4, 0, "dup")).unwrap();
        let c = gate.execute(position(205.0, 0, "dup")).unwrap();
        assert!(!a.flags.duplicate);
        assert!(b.flags.duplicate);
        assert!(!c.flags.duplicate);
    }

    #[test]
    fn state_is_pruned_after_inactivity() {
        let mut gate = gate();
        gate.execute(position(0.0, 0, "p")).unwrap();
        assert_eq!(gate.tracked_aircraft(), 1);
        assert_eq!(gate.prune(30.0), 0);
        assert_eq!(gate.prune(61.0), 1);
        assert_eq!(gate.tracked_aircraft(), 0);
    }

    #[test]
    fn checks_can_be_disabled_independently() {
        let mut config = QualityConfig::default();
        config.check_pairing = false;
        let mut gate = QualityGate::new(config, BasinConfig::default());
        let qualified = gate.execute(position(0.0, 0, "solo")).unwrap();
        assert_eq!(qualified.flags.pos_ok, Check::Pass);
        assert_eq!(qualified.flags.alt_ok, Check::Pass);
    }
}
