use crate::interface::message::{Icao, MsgHash};
use crate::prelude::Feature;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Grid cell of the basin, counted from the south-west corner of the basin box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    pub row: i32,
    pub col: i32,
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.row, self.col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BinScope {
    Aircraft(Icao),
    Cell(CellId),
}

/// `(aircraft or cell, time window index, altitude band index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinKey {
    pub scope: BinScope,
    pub window: i64,
    pub band: i32,
}

impl BinKey {
    pub fn icao(&self) -> Option<Icao> {
        match self.scope {
            BinScope::Aircraft(icao) => Some(icao),
            BinScope::Cell(_) => None,
        }
    }
}

impl fmt::Display for BinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            BinScope::Aircraft(icao) => write!(f, "{}/w{}/b{}", icao, self.window, self.band),
            BinScope::Cell(cell) => write!(f, "cell{}/w{}/b{}", cell, self.window, self.band),
        }
    }
}

/// Per-bin observable. Direction-like quantities are binned as components so
/// the robust centre never averages across the 0/360 seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Latitude,
    Longitude,
    Altitude,
    GeometricAltitude,
    GroundU,
    GroundV,
    TrueAirspeed,
    HeadingX,
    HeadingY,
    VerticalRate,
    Temperature,
    Pressure,
    Humidity,
    BaroSetting,
    ReportedWindU,
    ReportedWindV,
    TurbulenceVar,
}

/// Robust centre and dispersion of one field within a bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub count: usize,
    pub center: f64,
    /// MAD scaled to a normal-equivalent standard deviation.
    pub dispersion: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealReason {
    /// Window end passed with at least one usable field.
    WindowElapsed,
    /// Never reached the minimum count; sealed as partially missing.
    InactivityTimeout,
    /// Sealed early because a cell queue exceeded its bound.
    Incomplete,
    /// Flushed by session cancellation.
    EarlySeal,
    /// Flushed because the input ended.
    EndOfStream,
}

impl SealReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealReason::WindowElapsed => "complete",
            SealReason::InactivityTimeout => "partial",
            SealReason::Incomplete => "incomplete",
            SealReason::EarlySeal => "early_seal",
            SealReason::EndOfStream => "end_of_stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageRef {
    pub icao: Icao,
    /// Milliseconds since the epoch, so references order and hash exactly.
    pub timestamp_ms: i64,
    pub msg_hash: MsgHash,
}

impl MessageRef {
    pub fn new(icao: Icao, timestamp: f64, msg_hash: MsgHash) -> Self {
        Self {
            icao,
            timestamp_ms: (timestamp * 1000.0).round() as i64,
            msg_hash,
        }
    }
}

/// A bin closed to new input. Later revisions carry a higher `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedBin {
    pub key: BinKey,
    pub version: u32,
    pub cell: CellId,
    pub seal_reason: SealReason,
    pub window_start: f64,
    pub window_end: f64,
    pub band_floor_m: f64,
    pub band_ceiling_m: f64,
    pub contributors: BTreeSet<Icao>,
    pub members: Vec<MessageRef>,
    pub counts: BTreeMap<Field, usize>,
    pub summaries: BTreeMap<Field, Feature<FieldSummary>>,
}

impl SealedBin {
    pub fn summary(&self, field: Field) -> Option<&FieldSummary> {
        self.summaries.get(&field).and_then(|s| s.get())
    }

    pub fn value(&self, field: Field) -> Option<f64> {
        self.summary(field).map(|s| s.center)
    }

    /// Median barometric altitude, or the band midpoint when the field is
    /// below its minimum count.
    pub fn altitude_m(&self) -> f64 {
        self.value(Field::Altitude)
            .unwrap_or(0.5 * (self.band_floor_m + self.band_ceiling_m))
    }

    pub fn heading_deg(&self) -> Option<f64> {
        let x = self.value(Field::HeadingX)?;
        let y = self.value(Field::HeadingY)?;
        if x.hypot(y) < 1e-6 {
            return None;
        }
        Some(x.atan2(y).to_degrees().rem_euclid(360.0))
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.window_start + self.window_end)
    }

    pub fn usable_fields(&self) -> usize {
        self.summaries.values().filter(|s| s.is_present()).count()
    }
}

#[cfg(test)]
impl SealedBin {
    /// Sealed bin whose listed fields are present with the given centres.
    pub(crate) fn fixture(key: BinKey, fields: &[(Field, f64)]) -> Self {
        let mut counts = BTreeMap::new();
        let mut summaries = BTreeMap::new();
        for &(field, center) in fields {
            counts.insert(field, 5);
            summaries.insert(
                field,
                Feature::present(FieldSummary {
                    count: 5,
                    center,
                    dispersion: 0.0,
                }),
            );
        }
        let mut contributors = BTreeSet::new();
        if let Some(icao) = key.icao() {
            contributors.insert(icao);
        }
        Self {
            key,
            version: 1,
            cell: CellId { row: 1, col: 2 },
            seal_reason: SealReason::WindowElapsed,
            window_start: key.window as f64 * 60.0,
            window_end: (key.window + 1) as f64 * 60.0,
            band_floor_m: key.band as f64 * 150.0,
            band_ceiling_m: (key.band + 1) as f64 * 150.0,
            contributors,
            members: Vec::new(),
            counts,
            summaries,
        }
    }
}
