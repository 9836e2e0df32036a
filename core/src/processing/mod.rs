pub mod altitude;
pub mod boundary;
pub mod changepoint;
pub mod coldpool;
pub mod lapse;
pub mod normalizer;
pub mod quality;
pub mod schema;
pub mod thermo;
pub mod turbulence;
pub mod wind;
pub mod window;

pub use altitude::{AltitudeQa, AltitudeResidual};
pub use boundary::{BoundaryLayerEstimate, BoundaryLayerEstimator};
pub use changepoint::{AirMassSegment, Segmentation, Segmenter};
pub use coldpool::{ColdPoolEvent, ColdPoolTracker};
pub use lapse::{LapseDetector, LapseRateFit};
pub use normalizer::Normalizer;
pub use quality::{QualifiedMessage, QualityFlags, QualityGate};
pub use schema::{CoreRow, DerivedRow, RecordSets, Schema, SchemaAssembler};
pub use thermo::{ThermoDeriver, ThermoState};
pub use turbulence::{TurbulenceCalculator, TurbulenceProxy};
pub use wind::{WindEstimate, WindEstimator, WindMethod};
pub use window::WindowAggregator;
