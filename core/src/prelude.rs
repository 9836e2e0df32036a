use serde::{Deserialize, Serialize};

/// Common error type for stage execution.
///
/// Per-message and per-bin variants are isolated by the caller and never abort
/// a stream; `SchemaViolation` and `InvalidConfig` are raised before any
/// processing begins.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("quality gate rejection: {0}")]
    QualityGateRejection(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("unit conversion: {0}")]
    UnitConversion(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("ordering violation: {0}")]
    OrderingViolation(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl StageError {
    /// Stable snake-case name used by metrics and omission markers.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::MalformedMessage(_) => "malformed_message",
            StageError::QualityGateRejection(_) => "quality_gate_rejection",
            StageError::InsufficientData(_) => "insufficient_data",
            StageError::UnitConversion(_) => "unit_conversion",
            StageError::SchemaViolation(_) => "schema_violation",
            StageError::OrderingViolation(_) => "ordering_violation",
            StageError::InvalidConfig(_) => "invalid_config",
            StageError::Internal(_) => "internal",
        }
    }

    pub fn omit_reason(&self) -> OmitReason {
        match self {
            StageError::InsufficientData(_) => OmitReason::InsufficientData,
            StageError::QualityGateRejection(_) => OmitReason::QualityRejected,
            StageError::UnitConversion(_) => OmitReason::UnitConversion,
            StageError::OrderingViolation(_) => OmitReason::Late,
            StageError::MalformedMessage(_) => OmitReason::Malformed,
            _ => OmitReason::Failed,
        }
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Why a derived value is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmitReason {
    InsufficientData,
    HumidityMissing,
    NoAirData,
    NoAltitude,
    NoTransition,
    /// No tracked event covers the window.
    NoEvent,
    NotBinned,
    QualityRejected,
    UnitConversion,
    Malformed,
    Late,
    Failed,
}

impl OmitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OmitReason::InsufficientData => "insufficient_data",
            OmitReason::HumidityMissing => "humidity_missing",
            OmitReason::NoAirData => "no_air_data",
            OmitReason::NoAltitude => "no_altitude",
            OmitReason::NoTransition => "no_transition",
            OmitReason::NoEvent => "no_event",
            OmitReason::NotBinned => "not_binned",
            OmitReason::QualityRejected => "quality_rejected",
            OmitReason::UnitConversion => "unit_conversion",
            OmitReason::Malformed => "malformed",
            OmitReason::Late => "late",
            OmitReason::Failed => "failed",
        }
    }
}

/// A derived value paired with an explicit presence flag.
///
/// Missing values carry the reason they were omitted; nothing downstream ever
/// infers absence from a sentinel such as `0.0` or `NaN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Feature<T> {
    Present { value: T },
    Omitted { reason: OmitReason },
}

impl<T> Feature<T> {
    pub fn present(value: T) -> Self {
        Feature::Present { value }
    }

    pub fn omitted(reason: OmitReason) -> Self {
        Feature::Omitted { reason }
    }

    pub fn from_result(result: StageResult<T>) -> Self {
        match result {
            Ok(value) => Feature::Present { value },
            Err(err) => Feature::Omitted {
                reason: err.omit_reason(),
            },
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Feature::Present { .. })
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Feature::Present { value } => Some(value),
            Feature::Omitted { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<OmitReason> {
        match self {
            Feature::Present { .. } => None,
            Feature::Omitted { reason } => Some(*reason),
        }
    }

    pub fn map<U, F: FnOnce(&T) -> U>(&self, f: F) -> Feature<U> {
        match self {
            Feature::Present { value } => Feature::Present { value: f(value) },
            Feature::Omitted { reason } => Feature::Omitted { reason: *reason },
        }
    }

    pub fn and_then<U, F: FnOnce(&T) -> Feature<U>>(&self, f: F) -> Feature<U> {
        match self {
            Feature::Present { value } => f(value),
            Feature::Omitted { reason } => Feature::Omitted { reason: *reason },
        }
    }
}

/// Trait describing the streaming per-message stages.
///
/// Each stage receives its configuration section through its constructor and
/// owns whatever running state it needs; `cleanup` discards that state.
pub trait ProcessingStage {
    type Input;
    type Output;

    fn execute(&mut self, input: Self::Input) -> StageResult<Self::Output>;
    fn cleanup(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_from_error_keeps_reason() {
        let feature: Feature<f64> =
            Feature::from_result(Err(StageError::InsufficientData("two samples".into())));
        assert_eq!(feature.reason(), Some(OmitReason::InsufficientData));
        assert!(feature.get().is_none());
    }

    #[test]
    fn feature_serializes_with_status_tag() {
        let feature = Feature::present(1.5);
        let json = serde_json::to_value(&feature).unwrap();
        assert_eq!(json["status"], "present");
        assert_eq!(json["value"], 1.5);

        let missing: Feature<f64> = Feature::omitted(OmitReason::HumidityMissing);
        let json = serde_json::to_value(&missing).unwrap();
        assert_eq!(json["reason"], "humidity_missing");
    }
}
