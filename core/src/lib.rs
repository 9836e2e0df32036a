//! Derived atmospheric features from decoded aircraft telemetry over a basin.
//!
//! Messages are normalized, quality-flagged and binned per aircraft; sealed
//! bins feed wind, thermodynamic and altitude features, and per-cell workers
//! derive lapse rates, cold-air pools, boundary-layer depth and air-mass
//! segments before everything is projected into Core and Derived record sets.

pub mod config;
pub mod interface;
pub mod math;
pub mod pipeline;
pub mod prelude;
pub mod processing;
pub mod telemetry;
pub mod units;

pub use config::PipelineConfig;
pub use pipeline::{Session, SessionReport};
pub use prelude::{Feature, OmitReason, ProcessingStage, StageError, StageResult};
