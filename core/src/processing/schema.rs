//! Projection of messages and derived entities into the two joinable record
//! sets, and the column/unit contract both sides must honour.

use crate::config::NormalizerConfig;
use crate::interface::{BinKey, CellId, Icao, Message, MessageRef, MsgHash, SealReason};
use crate::prelude::{Feature, OmitReason, ProcessingStage, StageError, StageResult};
use crate::processing::altitude::AltitudeResidual;
use crate::processing::boundary::BoundaryLayerEstimate;
use crate::processing::changepoint::Segmentation;
use crate::processing::coldpool::ColdPoolEvent;
use crate::processing::lapse::LapseRateFit;
use crate::processing::quality::QualifiedMessage;
use crate::processing::thermo::{PressureSource, ThermoState};
use crate::processing::turbulence::{ShearAgreement, TurbulenceProxy};
use crate::processing::wind::{WindEstimate, WindMethod};
use crate::units::Unit;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const JOIN_KEYS: [&str; 3] = ["icao", "timestamp", "msg_hash"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Key,
    Core,
    Derived,
}

/// Unit entry of a column in the units table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "unit", rename_all = "snake_case")]
pub enum ColumnUnit {
    Measure(Unit),
    Identifier,
    Category,
    Flag,
    Count,
}

impl ColumnUnit {
    pub fn label(&self) -> &'static str {
        match self {
            ColumnUnit::Measure(unit) => unit.symbol(),
            ColumnUnit::Identifier => "id",
            ColumnUnit::Category => "category",
            ColumnUnit::Flag => "bool",
            ColumnUnit::Count => "count",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub side: Side,
    pub unit: Option<ColumnUnit>,
}

/// Core-side numeric field: aviation and SI column names, units, and the
/// reporting resolution used when quantizing aviation values.
struct CoreField {
    aviation: &'static str,
    si: &'static str,
    aviation_unit: Unit,
    si_unit: Unit,
    quantum: Option<f64>,
    read: fn(&Message) -> Option<f64>,
}

fn core_fields() -> Vec<CoreField> {
    fn field(
        aviation: &'static str,
        si: &'static str,
        aviation_unit: Unit,
        si_unit: Unit,
        quantum: Option<f64>,
        read: fn(&Message) -> Option<f64>,
    ) -> CoreField {
        CoreField {
            aviation,
            si,
            aviation_unit,
            si_unit,
            quantum,
            read,
        }
    }
    use Unit::*;
    vec![
        field("latitude", "latitude", Degree, Degree, Some(1e-4), |m| m.latitude_deg),
        field("longitude", "longitude", Degree, Degree, Some(1e-4), |m| m.longitude_deg),
        field("altitude_ft", "altitude_m", Foot, Metre, Some(25.0), |m| m.altitude_m),
        field("geometric_altitude_ft", "geometric_altitude_m", Foot, Metre, Some(25.0), |m| {
            m.geometric_altitude_m
        }),
        field("altitude_diff_ft", "altitude_diff_m", Foot, Metre, Some(25.0), |m| m.altitude_diff_m),
        field("ground_speed_kt", "ground_speed_ms", Knot, MetrePerSecond, Some(0.1), |m| {
            m.ground_speed_ms
        }),
        field("track_deg", "track_deg", Degree, Degree, Some(0.1), |m| m.track_deg),
        field("vertical_rate_fpm", "vertical_rate_ms", FootPerMinute, MetrePerSecond, Some(10.0), |m| {
            m.vertical_rate_ms
        }),
        field("heading_deg", "heading_deg", Degree, Degree, Some(0.1), |m| m.heading_deg),
        field("tas_kt", "tas_ms", Knot, MetrePerSecond, Some(0.1), |m| m.tas_ms),
        field("ias_kt", "ias_ms", Knot, MetrePerSecond, Some(0.1), |m| m.ias_ms),
        field("mach", "mach", Unitless, Unitless, Some(0.001), |m| m.mach),
        field("roll_deg", "roll_deg", Degree, Degree, Some(0.1), |m| m.roll_deg),
        field("track_rate_dps", "track_rate_dps", DegreePerSecond, DegreePerSecond, Some(0.01), |m| {
            m.track_rate_dps
        }),
        field("baro_setting_hpa", "baro_setting_pa", Hectopascal, Pascal, Some(0.1), |m| {
            m.baro_setting_pa
        }),
        field("temp_c", "temperature_k", Celsius, Kelvin, Some(0.1), |m| m.temperature_k),
        field("pressure_hpa", "pressure_pa", Hectopascal, Pascal, Some(0.1), |m| m.pressure_pa),
        field("humidity_pct", "humidity_pct", Percent, Percent, Some(1.0), |m| m.humidity_pct),
        field("wind_speed_kt", "wind_speed_ms", Knot, MetrePerSecond, Some(0.1), |m| {
            m.reported_wind_speed_ms
        }),
        field("wind_direction_deg", "wind_direction_deg", Degree, Degree, Some(0.1), |m| {
            m.reported_wind_from_deg
        }),
    ]
}

const CORE_CATEGORIES: [&str; 4] = ["df", "typecode", "turbulence_level", "wind_shear_level"];

fn derived_columns() -> Vec<(&'static str, ColumnUnit)> {
    use ColumnUnit::*;
    use Unit::*;
    vec![
        ("wind_u_ms", Measure(MetrePerSecond)),
        ("wind_v_ms", Measure(MetrePerSecond)),
        ("wind_method", Category),
        ("wind_confidence", Measure(Unitless)),
        ("wind_uncertainty_ms", Measure(MetrePerSecond)),
        ("wind_reported_delta_ms", Measure(MetrePerSecond)),
        ("theta_k", Measure(Kelvin)),
        ("theta_v_k", Measure(Kelvin)),
        ("density_kgm3", Measure(KilogramPerCubicMetre)),
        ("pressure_source", Category),
        ("humidity_missing", Flag),
        ("lapse_rate_kperkm", Measure(KelvinPerKilometre)),
        ("inversion_flag", Flag),
        ("inversion_base_m", Measure(Metre)),
        ("inversion_top_m", Measure(Metre)),
        ("turbulence_var_vr", Measure(SquareMetrePerSecondSquared)),
        ("turbulence_var_roll", Measure(SquareDegree)),
        ("turbulence_var_track", Measure(SquareDegreePerSecondSquared)),
        ("turbulence_flag", Flag),
        ("shear_agreement", Category),
        ("altitude_residual_ft", Measure(Foot)),
        ("altitude_outlier", Flag),
        ("coldpool_event_id", Identifier),
        ("airmass_segment_id", Identifier),
        ("airmass_state", Category),
        ("mixed_layer_depth_m", Measure(Metre)),
        ("bin_version", Count),
        ("completeness", Category),
        ("late", Flag),
        ("crc_ok", Flag),
        ("pos_ok", Flag),
        ("alt_ok", Flag),
        ("vel_ok", Flag),
        ("bds44_ok", Flag),
        ("bds45_ok", Flag),
        ("duplicate", Flag),
        ("position_uncertainty_m", Measure(Metre)),
        ("velocity_uncertainty_ms", Measure(MetrePerSecond)),
        ("temperature_uncertainty_k", Measure(Kelvin)),
        ("omitted", Category),
    ]
}

/// Column contract of the Core and Derived record sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    retain_aviation_units: bool,
    columns: Vec<ColumnSpec>,
    /// Every Core-side name in either unit system; derived names may match none.
    reserved: Vec<String>,
}

impl Schema {
    pub fn new(config: &NormalizerConfig) -> StageResult<Self> {
        let mut columns: Vec<ColumnSpec> = JOIN_KEYS
            .iter()
            .map(|name| ColumnSpec {
                name: name.to_string(),
                side: Side::Key,
                unit: Some(match *name {
                    "timestamp" => ColumnUnit::Measure(Unit::Second),
                    _ => ColumnUnit::Identifier,
                }),
            })
            .collect();
        let mut reserved = Vec::new();
        for name in CORE_CATEGORIES {
            columns.push(ColumnSpec {
                name: name.to_string(),
                side: Side::Core,
                unit: Some(ColumnUnit::Category),
            });
            reserved.push(name.to_string());
        }
        for field in core_fields() {
            let (name, unit) = if config.retain_aviation_units {
                (field.aviation, field.aviation_unit)
            } else {
                (field.si, field.si_unit)
            };
            columns.push(ColumnSpec {
                name: name.to_string(),
                side: Side::Core,
                unit: Some(ColumnUnit::Measure(unit)),
            });
            reserved.push(field.aviation.to_string());
            reserved.push(field.si.to_string());
        }
        let mut schema = Self {
            retain_aviation_units: config.retain_aviation_units,
            columns,
            reserved,
        };
        for (name, unit) in derived_columns() {
            schema.add_derived(name, Some(unit))?;
        }
        schema.validate()?;
        Ok(schema)
    }

    /// Registers a derived column. A name that duplicates a Core column, in
    /// either unit system, or that has no unit entry is a schema violation.
    pub fn add_derived(&mut self, name: &str, unit: Option<ColumnUnit>) -> StageResult<()> {
        if JOIN_KEYS.contains(&name) || self.reserved.iter().any(|r| r == name) {
            return Err(StageError::SchemaViolation(format!(
                "derived column '{}' duplicates a core column",
                name
            )));
        }
        if self.columns.iter().any(|c| c.name == name) {
            return Err(StageError::SchemaViolation(format!(
                "derived column '{}' is already defined",
                name
            )));
        }
        if unit.is_none() {
            return Err(StageError::SchemaViolation(format!(
                "derived column '{}' has no unit entry",
                name
            )));
        }
        self.columns.push(ColumnSpec {
            name: name.to_string(),
            side: Side::Derived,
            unit,
        });
        Ok(())
    }

    pub fn validate(&self) -> StageResult<()> {
        for column in &self.columns {
            if column.unit.is_none() {
                return Err(StageError::SchemaViolation(format!(
                    "column '{}' has no unit entry",
                    column.name
                )));
            }
        }
        for core in self.side(Side::Core) {
            if self.side(Side::Derived).any(|d| d.name == core.name) {
                return Err(StageError::SchemaViolation(format!(
                    "column '{}' appears in both core and derived",
                    core.name
                )));
            }
        }
        Ok(())
    }

    pub fn retain_aviation_units(&self) -> bool {
        self.retain_aviation_units
    }

    fn side(&self, side: Side) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(move |c| c.side == side)
    }

    /// Join keys followed by the Core-only columns.
    pub fn core_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.side != Side::Derived)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Join keys followed by the Derived-only columns.
    pub fn derived_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.side != Side::Core)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn unit_of(&self, column: &str) -> Option<ColumnUnit> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .and_then(|c| c.unit)
    }

    /// Column → unit label for every column of both record sets.
    pub fn units_table(&self) -> BTreeMap<String, String> {
        self.columns
            .iter()
            .filter_map(|c| Some((c.name.clone(), c.unit?.label().to_string())))
            .collect()
    }

    /// The units table as a markdown document.
    pub fn units_markdown(&self) -> String {
        let mut out = String::from("| column | table | unit |\n|---|---|---|\n");
        for column in &self.columns {
            let table = match column.side {
                Side::Key => "both",
                Side::Core => "core",
                Side::Derived => "derived",
            };
            let unit = column.unit.map(|u| u.label()).unwrap_or("?");
            out.push_str(&format!("| {} | {} | {} |\n", column.name, table, unit));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreRow {
    pub icao: Icao,
    pub timestamp: f64,
    pub msg_hash: MsgHash,
    pub df: u8,
    pub typecode: Option<u8>,
    pub turbulence_level: Option<u8>,
    pub wind_shear_level: Option<u8>,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRow {
    pub icao: Icao,
    pub timestamp: f64,
    pub msg_hash: MsgHash,
    pub wind_u_ms: Option<f64>,
    pub wind_v_ms: Option<f64>,
    pub wind_method: Option<WindMethod>,
    pub wind_confidence: Option<f64>,
    pub wind_uncertainty_ms: Option<f64>,
    pub wind_reported_delta_ms: Option<f64>,
    pub theta_k: Option<f64>,
    pub theta_v_k: Option<f64>,
    pub density_kgm3: Option<f64>,
    pub pressure_source: Option<PressureSource>,
    pub humidity_missing: Option<bool>,
    pub lapse_rate_kperkm: Option<f64>,
    pub inversion_flag: Option<bool>,
    pub inversion_base_m: Option<f64>,
    pub inversion_top_m: Option<f64>,
    pub turbulence_var_vr: Option<f64>,
    pub turbulence_var_roll: Option<f64>,
    pub turbulence_var_track: Option<f64>,
    pub turbulence_flag: Option<bool>,
    pub shear_agreement: Option<ShearAgreement>,
    pub altitude_residual_ft: Option<f64>,
    pub altitude_outlier: Option<bool>,
    pub coldpool_event_id: Option<String>,
    pub airmass_segment_id: Option<String>,
    pub airmass_state: Option<usize>,
    pub mixed_layer_depth_m: Option<f64>,
    pub bin_version: Option<u32>,
    pub completeness: String,
    pub late: bool,
    pub crc_ok: Option<bool>,
    pub pos_ok: Option<bool>,
    pub alt_ok: Option<bool>,
    pub vel_ok: Option<bool>,
    pub bds44_ok: Option<bool>,
    pub bds45_ok: Option<bool>,
    pub duplicate: bool,
    pub position_uncertainty_m: Option<f64>,
    pub velocity_uncertainty_ms: Option<f64>,
    pub temperature_uncertainty_k: Option<f64>,
    /// Column → reason for every value left null on purpose.
    pub omitted: BTreeMap<String, OmitReason>,
}

impl DerivedRow {
    /// Row for one join key with every feature column empty.
    pub fn keyed(icao: Icao, timestamp: f64, msg_hash: MsgHash) -> Self {
        Self {
            icao,
            timestamp,
            msg_hash,
            wind_u_ms: None,
            wind_v_ms: None,
            wind_method: None,
            wind_confidence: None,
            wind_uncertainty_ms: None,
            wind_reported_delta_ms: None,
            theta_k: None,
            theta_v_k: None,
            density_kgm3: None,
            pressure_source: None,
            humidity_missing: None,
            lapse_rate_kperkm: None,
            inversion_flag: None,
            inversion_base_m: None,
            inversion_top_m: None,
            turbulence_var_vr: None,
            turbulence_var_roll: None,
            turbulence_var_track: None,
            turbulence_flag: None,
            shear_agreement: None,
            altitude_residual_ft: None,
            altitude_outlier: None,
            coldpool_event_id: None,
            airmass_segment_id: None,
            airmass_state: None,
            mixed_layer_depth_m: None,
            bin_version: None,
            completeness: String::new(),
            late: false,
            crc_ok: None,
            pos_ok: None,
            alt_ok: None,
            vel_ok: None,
            bds44_ok: None,
            bds45_ok: None,
            duplicate: false,
            position_uncertainty_m: None,
            velocity_uncertainty_ms: None,
            temperature_uncertainty_k: None,
            omitted: BTreeMap::new(),
        }
    }

    /// Unwraps a feature into a column value, recording why it is absent.
    fn take<T: Clone>(&mut self, column: &str, feature: &Feature<T>) -> Option<T> {
        match feature {
            Feature::Present { value } => Some(value.clone()),
            Feature::Omitted { reason } => {
                self.omitted.insert(column.to_string(), *reason);
                None
            }
        }
    }

    fn omit(&mut self, columns: &[&str], reason: OmitReason) {
        for column in columns {
            self.omitted.insert(column.to_string(), reason);
        }
    }
}

/// Bin-level features of one version of an aircraft bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinFeatures {
    pub key: BinKey,
    pub version: u32,
    pub cell: CellId,
    pub seal_reason: SealReason,
    pub late: bool,
    pub wind: Feature<WindEstimate>,
    pub thermo: Feature<ThermoState>,
    pub altitude: Feature<AltitudeResidual>,
}

/// Cross-bin features of one cell window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellWindowFeatures {
    pub lapse: Feature<LapseRateFit>,
    pub boundary: Feature<BoundaryLayerEstimate>,
}

/// Everything the assembler joins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssemblyInput {
    pub messages: Vec<QualifiedMessage>,
    /// Bin and bin version each message was aggregated into.
    pub bin_of: HashMap<MessageRef, (BinKey, u32)>,
    pub turbulence: HashMap<MessageRef, TurbulenceProxy>,
    /// Latest features per bin.
    pub bins: BTreeMap<BinKey, BinFeatures>,
    /// Bin versions that reached their cell after the window was finalised.
    pub late_versions: BTreeSet<(BinKey, u32)>,
    pub cell_windows: BTreeMap<(CellId, i64), CellWindowFeatures>,
    pub cold_pools: BTreeMap<CellId, Vec<ColdPoolEvent>>,
    pub segmentations: BTreeMap<CellId, Segmentation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSets {
    pub core: Vec<CoreRow>,
    pub derived: Vec<DerivedRow>,
}

pub struct SchemaAssembler {
    schema: Schema,
    quantize: bool,
}

fn quantize(value: f64, quantum: f64) -> f64 {
    (value / quantum).round() * quantum
}

impl SchemaAssembler {
    pub fn new(config: &NormalizerConfig) -> StageResult<Self> {
        Ok(Self {
            schema: Schema::new(config)?,
            quantize: config.quantize_core && config.retain_aviation_units,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn core_row(&self, message: &Message) -> CoreRow {
        let aviation = self.schema.retain_aviation_units();
        let mut values = BTreeMap::new();
        for field in core_fields() {
            let Some(si) = (field.read)(message) else { continue };
            let (name, value) = if aviation {
                let mut value = field.aviation_unit.from_canonical(si);
                if self.quantize {
                    if let Some(q) = field.quantum {
                        value = quantize(value, q);
                    }
                }
                (field.aviation, value)
            } else {
                (field.si, field.si_unit.from_canonical(si))
            };
            values.insert(name.to_string(), value);
        }
        CoreRow {
            icao: message.icao,
            timestamp: message.timestamp,
            msg_hash: message.msg_hash.clone(),
            df: message.df,
            typecode: message.typecode,
            turbulence_level: message.turbulence_level,
            wind_shear_level: message.wind_shear_level,
            values,
        }
    }

    pub fn derived_row(&self, qualified: &QualifiedMessage, input: &AssemblyInput) -> DerivedRow {
        let m = &qualified.message;
        let flags = &qualified.flags;
        let reference = MessageRef::new(m.icao, m.timestamp, m.msg_hash.clone());
        let mut row = DerivedRow {
            crc_ok: flags.crc_ok.as_bool(),
            pos_ok: flags.pos_ok.as_bool(),
            alt_ok: flags.alt_ok.as_bool(),
            vel_ok: flags.vel_ok.as_bool(),
            bds44_ok: flags.bds44_ok.as_bool(),
            bds45_ok: flags.bds45_ok.as_bool(),
            duplicate: flags.duplicate,
            position_uncertainty_m: flags.position_uncertainty_m,
            velocity_uncertainty_ms: flags.velocity_uncertainty_ms,
            temperature_uncertainty_k: flags.temperature_uncertainty_k,
            ..DerivedRow::keyed(m.icao, m.timestamp, m.msg_hash.clone())
        };

        match input.turbulence.get(&reference) {
            Some(proxy) => {
                row.turbulence_var_vr = row.take("turbulence_var_vr", &proxy.vertical_rate_var);
                row.turbulence_var_roll = row.take("turbulence_var_roll", &proxy.roll_var);
                row.turbulence_var_track = row.take("turbulence_var_track", &proxy.track_jitter_var);
                row.turbulence_flag = row.take("turbulence_flag", &proxy.turbulent);
                row.shear_agreement = Some(proxy.shear_agreement);
            }
            None => row.omit(
                &[
                    "turbulence_var_vr",
                    "turbulence_var_roll",
                    "turbulence_var_track",
                    "turbulence_flag",
                ],
                OmitReason::NoAirData,
            ),
        }

        let member = input
            .bin_of
            .get(&reference)
            .and_then(|(key, version)| Some((input.bins.get(key)?, *version)));
        let Some((bin, version)) = member else {
            row.completeness = "not_binned".into();
            row.omit(&BIN_COLUMNS, OmitReason::NotBinned);
            row.omit(&CELL_COLUMNS, OmitReason::NotBinned);
            return row;
        };
        row.completeness = bin.seal_reason.as_str().to_string();
        row.late = input.late_versions.contains(&(bin.key, version));
        row.bin_version = Some(bin.version);

        let wind = bin.wind.clone();
        row.wind_u_ms = row.take("wind_u_ms", &wind.map(|w| w.u_ms));
        row.wind_v_ms = row.take("wind_v_ms", &wind.map(|w| w.v_ms));
        row.wind_method = row.take("wind_method", &wind.map(|w| w.method));
        row.wind_confidence = row.take("wind_confidence", &wind.map(|w| w.confidence));
        row.wind_uncertainty_ms = row.take("wind_uncertainty_ms", &wind.map(|w| w.uncertainty_ms));
        row.wind_reported_delta_ms = row.take(
            "wind_reported_delta_ms",
            &wind.and_then(|w| match w.reported_delta_ms {
                Some(delta) => Feature::present(delta),
                None => Feature::omitted(OmitReason::NoAirData),
            }),
        );

        let thermo = bin.thermo.clone();
        row.theta_k = row.take("theta_k", &thermo.map(|t| t.theta_k));
        row.theta_v_k = row.take("theta_v_k", &thermo.and_then(|t| t.theta_v_k.clone()));
        row.density_kgm3 = row.take("density_kgm3", &thermo.map(|t| t.density_kgm3));
        row.pressure_source = row.take("pressure_source", &thermo.map(|t| t.pressure_source));
        row.humidity_missing = row.take("humidity_missing", &thermo.map(|t| t.humidity_missing));

        let altitude = bin.altitude.clone();
        row.altitude_residual_ft = row.take("altitude_residual_ft", &altitude.map(|a| a.residual_ft));
        row.altitude_outlier = row.take("altitude_outlier", &altitude.map(|a| a.outlier));

        if row.late {
            row.omit(&CELL_COLUMNS, OmitReason::Late);
            return row;
        }

        let window = bin.key.window;
        match input.cell_windows.get(&(bin.cell, window)) {
            Some(cw) => {
                row.lapse_rate_kperkm =
                    row.take("lapse_rate_kperkm", &cw.lapse.map(|l| l.lapse_rate_kperkm));
                row.inversion_flag = row.take("inversion_flag", &cw.lapse.map(|l| l.inversion_flag()));
                let layer = cw.lapse.and_then(|l| match l.inversion {
                    Some(layer) => Feature::present(layer),
                    None => Feature::omitted(OmitReason::NoTransition),
                });
                row.inversion_base_m = row.take("inversion_base_m", &layer.map(|l| l.base_m));
                row.inversion_top_m = row.take("inversion_top_m", &layer.map(|l| l.top_m));
                row.mixed_layer_depth_m =
                    row.take("mixed_layer_depth_m", &cw.boundary.map(|b| b.depth_m_agl));
            }
            None => row.omit(
                &[
                    "lapse_rate_kperkm",
                    "inversion_flag",
                    "inversion_base_m",
                    "inversion_top_m",
                    "mixed_layer_depth_m",
                ],
                OmitReason::InsufficientData,
            ),
        }

        match input
            .cold_pools
            .get(&bin.cell)
            .and_then(|events| events.iter().find(|e| e.covers(window)))
        {
            Some(event) => row.coldpool_event_id = Some(event.id.clone()),
            None => row.omit(&["coldpool_event_id"], OmitReason::NoEvent),
        }

        match input
            .segmentations
            .get(&bin.cell)
            .and_then(|s| s.segment_at(window))
        {
            Some(segment) => {
                row.airmass_segment_id = Some(segment.id.clone());
                row.airmass_state = Some(segment.state);
            }
            None => row.omit(
                &["airmass_segment_id", "airmass_state"],
                OmitReason::InsufficientData,
            ),
        }
        row
    }
}

const BIN_COLUMNS: [&str; 13] = [
    "wind_u_ms",
    "wind_v_ms",
    "wind_method",
    "wind_confidence",
    "wind_uncertainty_ms",
    "wind_reported_delta_ms",
    "theta_k",
    "theta_v_k",
    "density_kgm3",
    "pressure_source",
    "humidity_missing",
    "altitude_residual_ft",
    "altitude_outlier",
];

const CELL_COLUMNS: [&str; 8] = [
    "lapse_rate_kperkm",
    "inversion_flag",
    "inversion_base_m",
    "inversion_top_m",
    "mixed_layer_depth_m",
    "coldpool_event_id",
    "airmass_segment_id",
    "airmass_state",
];

impl ProcessingStage for SchemaAssembler {
    type Input = AssemblyInput;
    type Output = RecordSets;

    fn execute(&mut self, input: AssemblyInput) -> StageResult<RecordSets> {
        let mut order: Vec<&QualifiedMessage> = input.messages.iter().collect();
        order.sort_by(|a, b| {
            a.message
                .timestamp
                .total_cmp(&b.message.timestamp)
                .then(a.message.icao.cmp(&b.message.icao))
                .then(a.message.msg_hash.cmp(&b.message.msg_hash))
        });
        let core = order.iter().map(|q| self.core_row(&q.message)).collect();
        let derived = order.iter().map(|q| self.derived_row(q, &input)).collect();
        Ok(RecordSets { core, derived })
    }

    fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BasinConfig, QualityConfig, WindConfig};
    use crate::interface::{BinScope, Field, RawMessage, SealedBin};
    use crate::processing::normalizer::Normalizer;
    use crate::processing::quality::QualityGate;
    use crate::processing::wind::WindEstimator;

    fn qualified(ts: f64) -> QualifiedMessage {
        let raw = RawMessage {
            altitude_ft: Some(10_012.0),
            ground_speed: Some(120.04),
            track: Some(90.0),
            temp_c: Some(-4.96),
            bds: Some("44".into()),
            ..RawMessage::new(Icao::new(0x4840D6).unwrap(), ts, 20, MsgHash::new("0a0b"))
        };
        let mut normalizer = Normalizer::new(NormalizerConfig::default());
        let mut gate = QualityGate::new(QualityConfig::default(), BasinConfig::default());
        gate.execute(normalizer.execute(raw).unwrap()).unwrap()
    }

    #[test]
    fn core_and_derived_share_only_join_keys() {
        for retain in [true, false] {
            let schema = Schema::new(&NormalizerConfig {
                retain_aviation_units: retain,
                quantize_core: false,
            })
            .unwrap();
            let core = schema.core_columns();
            let shared: Vec<&str> = schema
                .derived_columns()
                .into_iter()
                .filter(|c| core.contains(c))
                .collect();
            assert_eq!(shared, JOIN_KEYS.to_vec());
        }
    }

    #[test]
    fn duplicating_a_core_field_is_a_schema_violation() {
        let mut schema = Schema::new(&NormalizerConfig::default()).unwrap();
        let err = schema
            .add_derived("altitude_ft", Some(ColumnUnit::Measure(Unit::Foot)))
            .unwrap_err();
        assert_eq!(err.kind(), "schema_violation");
        // The SI spelling of a core field is reserved too.
        assert!(schema
            .add_derived("altitude_m", Some(ColumnUnit::Measure(Unit::Metre)))
            .is_err());
        assert!(schema.add_derived("vorticity", None).is_err());
        schema
            .add_derived("vorticity_per_s", Some(ColumnUnit::Measure(Unit::Unitless)))
            .unwrap();
    }

    #[test]
    fn every_serialized_column_has_a_unit_entry() {
        let assembler = SchemaAssembler::new(&NormalizerConfig::default()).unwrap();
        let units = assembler.schema().units_table();
        let empty = DerivedRow::keyed(Icao::new(0x4840D6).unwrap(), 0.0, MsgHash::new("00"));
        let row = serde_json::to_value(empty).unwrap();
        for column in row.as_object().unwrap().keys() {
            assert!(units.contains_key(column), "{} missing from units table", column);
        }
        let core = serde_json::to_value(assembler.core_row(&qualified(100.0).message)).unwrap();
        for column in core.as_object().unwrap().keys() {
            assert!(units.contains_key(column), "{} missing from units table", column);
        }
        assert!(assembler.schema().units_markdown().contains("| theta_k | derived | K |"));
    }

    #[test]
    fn core_row_uses_aviation_units_and_optional_quantization() {
        let q = qualified(100.0);
        let plain = SchemaAssembler::new(&NormalizerConfig::default()).unwrap();
        let row = plain.core_row(&q.message);
        assert!((row.values["altitude_ft"] - 10_012.0).abs() < 1e-6);
        assert!(!row.values.contains_key("altitude_m"));

        let quantized = SchemaAssembler::new(&NormalizerConfig {
            retain_aviation_units: true,
            quantize_core: true,
        })
        .unwrap();
        let row = quantized.core_row(&q.message);
        assert!((row.values["altitude_ft"] - 10_000.0).abs() < 1e-6);
        assert!((row.values["temp_c"] - -5.0).abs() < 1e-6);

        let si = SchemaAssembler::new(&NormalizerConfig {
            retain_aviation_units: false,
            quantize_core: false,
        })
        .unwrap();
        let row = si.core_row(&q.message);
        assert!((row.values["temperature_k"] - 268.19).abs() < 1e-6);
    }

    fn bin_key() -> BinKey {
        BinKey {
            scope: BinScope::Aircraft(Icao::new(0x4840D6).unwrap()),
            window: 10,
            band: 20,
        }
    }

    fn reference(q: &QualifiedMessage) -> MessageRef {
        MessageRef::new(q.message.icao, q.message.timestamp, q.message.msg_hash.clone())
    }

    fn input() -> AssemblyInput {
        let q = qualified(630.0);
        let key = bin_key();
        let bin = SealedBin::fixture(
            key,
            &[
                (Field::GroundU, 60.0),
                (Field::GroundV, 0.0),
                (Field::TrueAirspeed, 50.0),
                (Field::HeadingX, 1.0),
                (Field::HeadingY, 0.0),
            ],
        );
        let wind = WindEstimator::new(WindConfig::default()).direct(&bin);
        let mut input = AssemblyInput::default();
        input.bin_of.insert(reference(&q), (key, 1));
        input.messages.push(q);
        input.bins.insert(
            key,
            BinFeatures {
                key,
                version: 1,
                cell: bin.cell,
                seal_reason: SealReason::WindowElapsed,
                late: false,
                wind: Feature::from_result(wind),
                thermo: Feature::omitted(OmitReason::InsufficientData),
                altitude: Feature::omitted(OmitReason::InsufficientData),
            },
        );
        input
    }

    #[test]
    fn derived_row_carries_features_and_omission_reasons() {
        let mut assembler = SchemaAssembler::new(&NormalizerConfig::default()).unwrap();
        let sets = assembler.execute(input()).unwrap();
        assert_eq!(sets.core.len(), 1);
        let row = &sets.derived[0];
        assert!((row.wind_u_ms.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(row.wind_method, Some(WindMethod::Direct));
        assert_eq!(row.theta_k, None);
        assert_eq!(row.omitted["theta_k"], OmitReason::InsufficientData);
        assert_eq!(row.omitted["turbulence_var_vr"], OmitReason::NoAirData);
        assert_eq!(row.completeness, "complete");
        assert_eq!(row.bin_version, Some(1));
        assert_eq!(row.bds44_ok, Some(true));
        assert_eq!(row.omitted["coldpool_event_id"], OmitReason::NoEvent);
        assert!(!row.late);
    }

    #[test]
    fn only_messages_of_a_late_version_lose_cell_features() {
        let mut input = input();
        let key = bin_key();
        let straggler = qualified(650.0);
        input.bin_of.insert(reference(&straggler), (key, 2));
        input.messages.push(straggler);
        input.late_versions.insert((key, 2));
        if let Some(bin) = input.bins.get_mut(&key) {
            bin.version = 2;
            bin.late = true;
        }
        input.cell_windows.insert(
            (CellId { row: 1, col: 2 }, 10),
            CellWindowFeatures {
                lapse: Feature::omitted(OmitReason::InsufficientData),
                boundary: Feature::omitted(OmitReason::InsufficientData),
            },
        );

        let mut assembler = SchemaAssembler::new(&NormalizerConfig::default()).unwrap();
        let sets = assembler.execute(input).unwrap();
        let on_time = &sets.derived[0];
        assert!(!on_time.late);
        assert_eq!(on_time.bin_version, Some(2));
        assert_eq!(on_time.omitted["lapse_rate_kperkm"], OmitReason::InsufficientData);
        assert!((on_time.wind_u_ms.unwrap() - 10.0).abs() < 1e-9);

        let late = &sets.derived[1];
        assert!(late.late);
        assert_eq!(late.omitted["lapse_rate_kperkm"], OmitReason::Late);
        assert_eq!(late.omitted["coldpool_event_id"], OmitReason::Late);
    }

    #[test]
    fn assembly_is_idempotent() {
        let mut assembler = SchemaAssembler::new(&NormalizerConfig::default()).unwrap();
        let first = assembler.execute(input()).unwrap();
        let second = assembler.execute(input()).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn unbinned_message_is_marked_not_binned() {
        let mut assembler = SchemaAssembler::new(&NormalizerConfig::default()).unwrap();
        let mut input = input();
        input.bin_of.clear();
        let sets = assembler.execute(input).unwrap();
        let row = &sets.derived[0];
        assert_eq!(row.completeness, "not_binned");
        assert_eq!(row.omitted["wind_u_ms"], OmitReason::NotBinned);
    }
}
