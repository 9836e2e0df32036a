use crate::config::{BasinConfig, Estimator, WindowConfig};
use crate::interface::{
    BinKey, BinScope, Field, FieldSummary, Icao, MessageRef, SealReason, SealedBin,
};
use crate::math::stats::StatsHelper;
use crate::math::vector::Vec2;
use crate::prelude::{Feature, OmitReason, StageError, StageResult};
use crate::processing::quality::QualifiedMessage;
use crate::telemetry::LogManager;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct OpenBin {
    key: BinKey,
    version: u32,
    observations: BTreeMap<Field, Vec<f64>>,
    contributors: BTreeSet<Icao>,
    members: Vec<MessageRef>,
    last_activity: f64,
}

impl OpenBin {
    fn new(key: BinKey, version: u32) -> Self {
        Self {
            key,
            version,
            observations: BTreeMap::new(),
            contributors: BTreeSet::new(),
            members: Vec::new(),
            last_activity: f64::NEG_INFINITY,
        }
    }

    fn reaches(&self, min_count: usize) -> bool {
        self.observations.values().any(|v| v.len() >= min_count)
    }
}

/// Observations retained after sealing so late messages can produce a revision.
#[derive(Debug, Clone)]
struct SealedRecord {
    bin: OpenBin,
    window_end: f64,
}

/// Buckets qualified messages into per-aircraft time × altitude bins and
/// seals them into robust summaries.
pub struct WindowAggregator {
    config: WindowConfig,
    basin: BasinConfig,
    open: BTreeMap<BinKey, OpenBin>,
    sealed: HashMap<BinKey, SealedRecord>,
    last_altitude: HashMap<Icao, (f64, f64)>,
    last_position: HashMap<Icao, (f64, f64, f64)>,
    clock: f64,
    logger: LogManager,
}

impl WindowAggregator {
    pub fn new(config: WindowConfig, basin: BasinConfig) -> Self {
        Self {
            config,
            basin,
            open: BTreeMap::new(),
            sealed: HashMap::new(),
            last_altitude: HashMap::new(),
            last_position: HashMap::new(),
            clock: f64::NEG_INFINITY,
            logger: LogManager::new("window"),
        }
    }

    pub fn open_bins(&self) -> usize {
        self.open.len()
    }

    /// Version of the open bin under `key`, if one is open.
    pub fn open_version(&self, key: &BinKey) -> Option<u32> {
        self.open.get(key).map(|bin| bin.version)
    }

    pub fn window_index(&self, timestamp: f64) -> i64 {
        (timestamp / self.config.window_s).floor() as i64
    }

    pub fn band_index(&self, altitude_m: f64) -> i32 {
        (altitude_m / self.config.band_m).floor() as i32
    }

    /// Stream time up to which every bin of this aggregator has been sealed:
    /// the start of the oldest open window, capped at the clock.
    pub fn watermark(&self) -> f64 {
        self.open
            .keys()
            .map(|key| key.window as f64 * self.config.window_s)
            .fold(self.clock, f64::min)
    }

    fn window_end(&self, window: i64) -> f64 {
        (window + 1) as f64 * self.config.window_s
    }

    /// Admitted observations carried by one message.
    fn observations(msg: &QualifiedMessage, extra: &[(Field, f64)]) -> Vec<(Field, f64)> {
        let m = &msg.message;
        let mut out = Vec::new();
        let mut push = |field: Field, value: Option<f64>| {
            if let Some(value) = value {
                if msg.admits(field) {
                    out.push((field, value));
                }
            }
        };
        push(Field::Latitude, m.latitude_deg.filter(|_| m.longitude_deg.is_some()));
        push(Field::Longitude, m.longitude_deg.filter(|_| m.latitude_deg.is_some()));
        push(Field::Altitude, m.altitude_m);
        push(Field::GeometricAltitude, m.geometric_altitude());
        push(Field::BaroSetting, m.baro_setting_pa);
        if let (Some(gs), Some(track)) = (m.ground_speed_ms, m.track_deg) {
            let ground = Vec2::from_polar(gs, track);
            push(Field::GroundU, Some(ground.u));
            push(Field::GroundV, Some(ground.v));
        }
        push(Field::TrueAirspeed, m.tas_ms);
        if let Some(heading) = m.heading_deg {
            let unit = Vec2::from_polar(1.0, heading);
            push(Field::HeadingX, Some(unit.u));
            push(Field::HeadingY, Some(unit.v));
        }
        push(Field::VerticalRate, m.vertical_rate_ms);
        push(Field::Temperature, m.temperature_k);
        push(Field::Pressure, m.pressure_pa);
        push(Field::Humidity, m.humidity_pct);
        if let (Some(speed), Some(from)) = (m.reported_wind_speed_ms, m.reported_wind_from_deg) {
            let wind = Vec2::from_wind(speed, from);
            push(Field::ReportedWindU, Some(wind.u));
            push(Field::ReportedWindV, Some(wind.v));
        }
        for &(field, value) in extra {
            push(field, Some(value));
        }
        out
    }

    /// Adds a message (and any per-message derived observations) to its bin.
    ///
    /// Returns the bin key, `None` when the aircraft has no usable altitude
    /// yet, or `OrderingViolation` when the bin fell out of the revision
    /// horizon.
    pub fn ingest(
        &mut self,
        msg: &QualifiedMessage,
        extra: &[(Field, f64)],
    ) -> StageResult<Option<BinKey>> {
        let m = &msg.message;
        let icao = m.icao;
        self.clock = self.clock.max(m.timestamp);

        let altitude = m
            .altitude_m
            .filter(|_| msg.admits(Field::Altitude))
            .or_else(|| {
                self.last_altitude
                    .get(&icao)
                    .filter(|(t, _)| m.timestamp - t <= self.config.window_s)
                    .map(|(_, alt)| *alt)
            });
        let Some(altitude) = altitude else {
            return Ok(None);
        };
        if msg.admits(Field::Altitude) && m.altitude_m.is_some() {
            self.last_altitude.insert(icao, (m.timestamp, altitude));
        }
        if let (Some(lat), Some(lon)) = (m.latitude_deg, m.longitude_deg) {
            if msg.admits(Field::Latitude) {
                self.last_position.insert(icao, (m.timestamp, lat, lon));
            }
        }

        let key = BinKey {
            scope: BinScope::Aircraft(icao),
            window: self.window_index(m.timestamp),
            band: self.band_index(altitude),
        };

        if !self.open.contains_key(&key) {
            let window_end = self.window_end(key.window);
            if let Some(record) = self.sealed.remove(&key) {
                let mut revision = record.bin;
                revision.version += 1;
                self.logger.detail(&format!(
                    "reopening {} as version {}",
                    key, revision.version
                ));
                self.open.insert(key, revision);
            } else if self.clock - window_end > self.config.revision_horizon_s {
                return Err(StageError::OrderingViolation(format!(
                    "message for {} arrived {:.0}s after its window closed",
                    key,
                    self.clock - window_end
                )));
            } else {
                self.open.insert(key, OpenBin::new(key, 1));
            }
        }

        let observations = Self::observations(msg, extra);
        if let Some(bin) = self.open.get_mut(&key) {
            for (field, value) in observations {
                bin.observations.entry(field).or_default().push(value);
            }
            bin.contributors.insert(icao);
            bin.members
                .push(MessageRef::new(icao, m.timestamp, m.msg_hash.clone()));
            bin.last_activity = bin.last_activity.max(m.timestamp);
        }
        Ok(Some(key))
    }

    /// Adds a derived observation to an open bin, e.g. a turbulence proxy
    /// computed after the message was binned.
    pub fn observe(&mut self, key: &BinKey, field: Field, value: f64) {
        if let Some(bin) = self.open.get_mut(key) {
            bin.observations.entry(field).or_default().push(value);
        }
    }

    /// Moves stream time forward and seals every bin whose window has ended.
    /// Bins that never reached the minimum count wait for the inactivity
    /// timeout and seal as partially missing.
    pub fn advance(&mut self, now: f64) -> Vec<SealedBin> {
        self.clock = self.clock.max(now);
        let clock = self.clock;
        let ready: Vec<(BinKey, SealReason)> = self
            .open
            .values()
            .filter_map(|bin| {
                if self.window_end(bin.key.window) > clock {
                    None
                } else if bin.reaches(self.config.min_count) {
                    Some((bin.key, SealReason::WindowElapsed))
                } else if clock - bin.last_activity >= self.config.inactivity_timeout_s {
                    Some((bin.key, SealReason::InactivityTimeout))
                } else {
                    None
                }
            })
            .collect();

        let sealed = ready
            .into_iter()
            .filter_map(|(key, reason)| self.seal(&key, reason))
            .collect();
        self.prune(clock);
        sealed
    }

    /// Seals every open bin regardless of its window, tagging the reason.
    pub fn flush(&mut self, reason: SealReason) -> Vec<SealedBin> {
        let keys: Vec<BinKey> = self.open.keys().copied().collect();
        keys.into_iter()
            .filter_map(|key| self.seal(&key, reason))
            .collect()
    }

    fn prune(&mut self, clock: f64) {
        let horizon = self.config.revision_horizon_s;
        self.sealed
            .retain(|_, record| clock - record.window_end <= horizon);
        let timeout = self.config.inactivity_timeout_s;
        self.last_altitude.retain(|_, (t, _)| clock - *t <= timeout);
        self.last_position.retain(|_, (t, _, _)| clock - *t <= timeout);
    }

    fn estimate(&self, samples: &[f64]) -> Option<f64> {
        match self.config.estimator {
            Estimator::Median => StatsHelper::median(samples),
            Estimator::Huber { k } => StatsHelper::huber_location(samples, k),
        }
    }

    fn seal(&mut self, key: &BinKey, reason: SealReason) -> Option<SealedBin> {
        let bin = self.open.remove(key)?;
        let mut counts = BTreeMap::new();
        let mut summaries = BTreeMap::new();
        for (field, samples) in &bin.observations {
            counts.insert(*field, samples.len());
            let summary = if samples.len() >= self.config.min_count {
                match (self.estimate(samples), StatsHelper::mad_sigma(samples)) {
                    (Some(center), Some(dispersion)) => Feature::present(FieldSummary {
                        count: samples.len(),
                        center,
                        dispersion,
                    }),
                    _ => Feature::omitted(OmitReason::InsufficientData),
                }
            } else {
                Feature::omitted(OmitReason::InsufficientData)
            };
            summaries.insert(*field, summary);
        }

        let center_of = |field: Field| {
            summaries
                .get(&field)
                .and_then(|s: &Feature<FieldSummary>| s.get())
                .map(|s| s.center)
        };
        let icao = key.icao();
        let cell = match (center_of(Field::Latitude), center_of(Field::Longitude)) {
            (Some(lat), Some(lon)) => self.basin.cell_of(lat, lon),
            _ => None,
        }
        .or_else(|| {
            icao.and_then(|icao| self.last_position.get(&icao))
                .and_then(|(_, lat, lon)| self.basin.cell_of(*lat, *lon))
        })
        .unwrap_or_else(|| self.basin.home_cell());

        let window_start = key.window as f64 * self.config.window_s;
        let window_end = self.window_end(key.window);
        let sealed = SealedBin {
            key: *key,
            version: bin.version,
            cell,
            seal_reason: reason,
            window_start,
            window_end,
            band_floor_m: key.band as f64 * self.config.band_m,
            band_ceiling_m: (key.band + 1) as f64 * self.config.band_m,
            contributors: bin.contributors.clone(),
            members: bin.members.clone(),
            counts,
            summaries,
        };
        self.logger.detail(&format!(
            "sealed {} v{} ({}) with {} usable fields",
            key,
            bin.version,
            reason.as_str(),
            sealed.usable_fields()
        ));
        self.sealed.insert(*key, SealedRecord { bin, window_end });
        Some(sealed)
    }
}
