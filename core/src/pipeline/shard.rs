use crate::config::PipelineConfig;
use crate::interface::{BinKey, Field, Icao, RawMessage, SealReason, SealedBin};
use crate::prelude::{Feature, ProcessingStage, StageError, StageResult};
use crate::processing::altitude::{AltitudeQa, AltitudeResidual};
use crate::processing::normalizer::Normalizer;
use crate::processing::quality::{QualifiedMessage, QualityGate};
use crate::processing::thermo::{ThermoDeriver, ThermoState};
use crate::processing::turbulence::{TurbulenceCalculator, TurbulenceProxy};
use crate::processing::wind::{WindEstimate, WindEstimator};
use crate::processing::window::WindowAggregator;
use crate::telemetry::{LogManager, MetricsRecorder};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum ShardCommand {
    Message(RawMessage),
    /// Stream time advanced; seal elapsed bins and prune idle state.
    Tick(f64),
    Flush(SealReason),
}

/// Per-message outcome kept for the record sets.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub message: QualifiedMessage,
    /// Bin and bin version the message was aggregated into.
    pub bin: Option<(BinKey, u32)>,
    pub turbulence: Option<TurbulenceProxy>,
}

/// A sealed bin together with the features derivable from it alone.
#[derive(Debug, Clone, PartialEq)]
pub struct BinEvent {
    pub bin: SealedBin,
    pub direct_wind: Feature<WindEstimate>,
    pub thermo: Feature<ThermoState>,
    pub altitude: Feature<AltitudeResidual>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShardOutput {
    Record(Box<MessageRecord>),
    Sealed(Box<BinEvent>),
    /// Every bin of this shard ending at or before `time` has been emitted.
    Watermark { shard: usize, time: f64 },
}

pub fn shard_of(icao: Icao, shards: usize) -> usize {
    icao.value() as usize % shards.max(1)
}

/// Exclusive owner of the per-aircraft state for the aircraft routed to it.
pub struct ShardWorker {
    id: usize,
    normalizer: Normalizer,
    quality: QualityGate,
    window: WindowAggregator,
    turbulence: TurbulenceCalculator,
    wind: WindEstimator,
    thermo: ThermoDeriver,
    altitude: AltitudeQa,
    metrics: Arc<MetricsRecorder>,
    logger: LogManager,
}

impl ShardWorker {
    pub fn new(id: usize, config: &PipelineConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            id,
            normalizer: Normalizer::new(config.normalizer.clone()),
            quality: QualityGate::new(config.quality.clone(), config.basin.clone()),
            window: WindowAggregator::new(config.window.clone(), config.basin.clone()),
            turbulence: TurbulenceCalculator::new(config.turbulence.clone()),
            wind: WindEstimator::new(config.wind.clone()),
            thermo: ThermoDeriver::new(config.thermo.clone()),
            altitude: AltitudeQa::new(config.altitude.clone()),
            metrics,
            logger: LogManager::new(format!("shard {}", id)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn handle(&mut self, command: ShardCommand) -> Vec<ShardOutput> {
        match command {
            ShardCommand::Message(raw) => self.process(raw).into_iter().collect(),
            ShardCommand::Tick(now) => {
                let sealed = self.window.advance(now);
                let mut out = self.derive(sealed);
                let pruned = self.quality.prune(now) + self.turbulence.prune(now);
                if pruned > 0 {
                    self.logger.detail(&format!("pruned {} idle aircraft states", pruned));
                }
                out.push(ShardOutput::Watermark {
                    shard: self.id,
                    time: self.window.watermark(),
                });
                out
            }
            ShardCommand::Flush(reason) => {
                let sealed = self.window.flush(reason);
                self.logger.record(&format!(
                    "flushed {} open bins ({})",
                    sealed.len(),
                    reason.as_str()
                ));
                self.derive(sealed)
            }
        }
    }

    fn process(&mut self, raw: RawMessage) -> Option<ShardOutput> {
        let message = match self.normalizer.execute(raw) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.record_error(&err);
                self.logger.detail(&err.to_string());
                return None;
            }
        };
        for dropped in &message.dropped {
            self.metrics.record_error_kind(&dropped.reason);
        }
        self.metrics.record_processed(&message.category_labels());

        let qualified = match self.quality.execute(message) {
            Ok(qualified) => qualified,
            Err(err) => {
                self.metrics.record_error(&err);
                return None;
            }
        };
        if qualified.flags.duplicate {
            self.metrics.record_duplicate();
        } else if qualified.flags.rejected() {
            self.metrics.record_error_kind("quality_gate_rejection");
        }

        let turbulence = self.turbulence.update(&qualified);
        let extra: Vec<(Field, f64)> = turbulence
            .as_ref()
            .and_then(|proxy| proxy.vertical_rate_var.get().copied())
            .map(|var| vec![(Field::TurbulenceVar, var)])
            .unwrap_or_default();
        let bin = match self.window.ingest(&qualified, &extra) {
            Ok(key) => key.and_then(|key| Some((key, self.window.open_version(&key)?))),
            Err(err) => {
                self.metrics.record_error(&err);
                self.logger.warn(&err.to_string());
                None
            }
        };

        Some(ShardOutput::Record(Box::new(MessageRecord {
            message: qualified,
            bin,
            turbulence,
        })))
    }

    fn derive(&self, sealed: Vec<SealedBin>) -> Vec<ShardOutput> {
        sealed
            .into_iter()
            .map(|bin| {
                let event = BinEvent {
                    direct_wind: Feature::from_result(self.wind.direct(&bin)),
                    thermo: Feature::from_result(self.thermo.derive(&bin)),
                    altitude: Feature::from_result(self.altitude.check(&bin)),
                    bin,
                };
                ShardOutput::Sealed(Box::new(event))
            })
            .collect()
    }

    /// Drains commands until the sender side closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ShardCommand>,
        output: mpsc::Sender<ShardOutput>,
    ) -> StageResult<()> {
        while let Some(command) = commands.recv().await {
            for item in self.handle(command) {
                output.send(item).await.map_err(|_| {
                    StageError::Internal(format!("shard {} output channel closed", self.id))
                })?;
            }
        }
        self.logger.detail(&format!(
            "stopped with {} open bins and {} tracked aircraft",
            self.window.open_bins(),
            self.quality.tracked_aircraft()
        ));
        Ok(())
    }
}
