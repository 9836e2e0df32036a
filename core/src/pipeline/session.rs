//! A bounded capture/processing session: shards own per-aircraft state, one
//! worker owns each basin cell, and the assembler joins everything at the end.

use crate::config::PipelineConfig;
use crate::interface::{CellId, MessageRef, RawMessage, SealReason};
use crate::pipeline::cell::{CellCommand, CellReport, CellWorker};
use crate::pipeline::shard::{shard_of, MessageRecord, ShardCommand, ShardOutput, ShardWorker};
use crate::prelude::{ProcessingStage, StageError, StageResult};
use crate::processing::schema::{AssemblyInput, RecordSets, Schema, SchemaAssembler};
use crate::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub records: RecordSets,
    pub cells: Vec<CellReport>,
    pub metrics: MetricsSnapshot,
    /// Column → unit for both record sets.
    pub units: BTreeMap<String, String>,
    /// `EndOfStream` when the input ended, `EarlySeal` when cancelled.
    pub completion: SealReason,
}

impl SessionReport {
    pub fn cold_pool_ids(&self) -> Vec<&str> {
        self.cells
            .iter()
            .flat_map(|c| c.cold_pools.iter().map(|e| e.id.as_str()))
            .collect()
    }

    pub fn segment_count(&self) -> usize {
        self.cells
            .iter()
            .filter_map(|c| c.segmentation.get())
            .map(|s| s.segments.len())
            .sum()
    }
}

pub struct Session {
    config: PipelineConfig,
    metrics: Arc<MetricsRecorder>,
    logger: LogManager,
}

fn worker_failed(what: &str, err: tokio::task::JoinError) -> StageError {
    StageError::Internal(format!("{} worker failed: {}", what, err))
}

async fn send<T>(tx: &mpsc::Sender<T>, item: T, target: &str) -> StageResult<()> {
    tx.send(item)
        .await
        .map_err(|_| StageError::Internal(format!("{} inbox closed", target)))
}

/// Collects message records and routes sealed bins to their cell workers,
/// spawning a worker the first time a cell is seen. The cell watermark is
/// the minimum over all shard watermarks.
async fn dispatch(
    mut outputs: mpsc::Receiver<ShardOutput>,
    shards: usize,
    config: PipelineConfig,
    metrics: Arc<MetricsRecorder>,
) -> StageResult<(Vec<MessageRecord>, Vec<CellReport>)> {
    let mut records = Vec::new();
    let mut cells: BTreeMap<CellId, (mpsc::Sender<CellCommand>, JoinHandle<CellReport>)> =
        BTreeMap::new();
    let mut marks = vec![f64::NEG_INFINITY; shards];
    let mut watermark = f64::NEG_INFINITY;

    while let Some(output) = outputs.recv().await {
        match output {
            ShardOutput::Record(record) => records.push(*record),
            ShardOutput::Sealed(event) => {
                let cell = event.bin.cell;
                let (inbox, _) = cells.entry(cell).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(config.scheduler.cell_queue);
                    let worker = CellWorker::new(cell, &config, metrics.clone());
                    (tx, tokio::spawn(worker.run(rx)))
                });
                send(inbox, CellCommand::Bin(event), "cell").await?;
            }
            ShardOutput::Watermark { shard, time } => {
                if let Some(mark) = marks.get_mut(shard) {
                    *mark = mark.max(time);
                }
                let global = marks.iter().copied().fold(f64::INFINITY, f64::min);
                if global > watermark {
                    watermark = global;
                    for (inbox, _) in cells.values() {
                        send(inbox, CellCommand::Watermark(watermark), "cell").await?;
                    }
                }
            }
        }
    }

    let mut reports = Vec::with_capacity(cells.len());
    for (cell, (inbox, handle)) in cells {
        drop(inbox);
        let report = handle
            .await
            .map_err(|err| worker_failed(&format!("cell {}", cell), err))?;
        reports.push(report);
    }
    Ok((records, reports))
}

impl Session {
    /// Validates configuration and the output schema before anything runs.
    pub fn new(config: PipelineConfig) -> StageResult<Self> {
        config.validate()?;
        Schema::new(&config.normalizer)?;
        Ok(Self {
            config,
            metrics: Arc::new(MetricsRecorder::new()),
            logger: LogManager::new("session"),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    /// Processes messages until the input closes or `cancel` fires. Either
    /// way every open bin is flushed and tagged before the report is built.
    pub async fn run(
        &self,
        mut input: mpsc::Receiver<RawMessage>,
        cancel: CancellationToken,
    ) -> StageResult<SessionReport> {
        let scheduler = &self.config.scheduler;
        let shards = scheduler.aircraft_shards;
        let (output_tx, output_rx) = mpsc::channel(scheduler.shard_queue);
        let mut inboxes = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for id in 0..shards {
            let (tx, rx) = mpsc::channel(scheduler.shard_queue);
            let worker = ShardWorker::new(id, &self.config, self.metrics.clone());
            workers.push(tokio::spawn(worker.run(rx, output_tx.clone())));
            inboxes.push(tx);
        }
        drop(output_tx);
        let dispatcher = tokio::spawn(dispatch(
            output_rx,
            shards,
            self.config.clone(),
            self.metrics.clone(),
        ));

        let mut stream_time = f64::NEG_INFINITY;
        let mut last_tick = f64::NEG_INFINITY;
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = input.recv() => {
                    let Some(raw) = next else { break };
                    if raw.timestamp.is_finite() {
                        stream_time = stream_time.max(raw.timestamp);
                    }
                    let inbox = inboxes
                        .get(shard_of(raw.icao, shards))
                        .ok_or_else(|| StageError::Internal("shard index out of range".into()))?;
                    send(inbox, ShardCommand::Message(raw), "shard").await?;
                    if stream_time - last_tick >= scheduler.tick_interval_s {
                        for inbox in &inboxes {
                            send(inbox, ShardCommand::Tick(stream_time), "shard").await?;
                        }
                        last_tick = stream_time;
                    }
                }
            }
        }

        let completion = if cancelled {
            SealReason::EarlySeal
        } else {
            SealReason::EndOfStream
        };
        self.logger.record(&format!(
            "input {} at stream time {:.0}; flushing open bins",
            if cancelled { "cancelled" } else { "ended" },
            stream_time
        ));
        for inbox in &inboxes {
            send(inbox, ShardCommand::Flush(completion), "shard").await?;
        }
        drop(inboxes);
        for (id, worker) in workers.into_iter().enumerate() {
            worker
                .await
                .map_err(|err| worker_failed(&format!("shard {}", id), err))??;
        }
        let (records, cells) = dispatcher
            .await
            .map_err(|err| worker_failed("dispatch", err))??;

        let assembled = self.assemble(records, &cells)?;
        let schema = Schema::new(&self.config.normalizer)?;
        let metrics = self.metrics.snapshot();
        self.logger.record(&format!(
            "{} messages, {} duplicates, {} cells, {} rows",
            metrics.processed,
            metrics.duplicates,
            cells.len(),
            assembled.derived.len()
        ));
        Ok(SessionReport {
            records: assembled,
            cells,
            metrics,
            units: schema.units_table(),
            completion,
        })
    }

    /// Convenience wrapper feeding an in-memory capture through `run`.
    pub async fn run_batch(
        &self,
        messages: Vec<RawMessage>,
        cancel: CancellationToken,
    ) -> StageResult<SessionReport> {
        let (tx, rx) = mpsc::channel(self.config.scheduler.shard_queue);
        let feeder = tokio::spawn(async move {
            for message in messages {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        let report = self.run(rx, cancel).await;
        feeder.await.map_err(|err| worker_failed("feeder", err))?;
        report
    }

    fn assemble(&self, records: Vec<MessageRecord>, cells: &[CellReport]) -> StageResult<RecordSets> {
        let mut input = AssemblyInput::default();
        for report in cells {
            for features in &report.bins {
                if features.late {
                    input.late_versions.insert((features.key, features.version));
                }
                let newer = input
                    .bins
                    .get(&features.key)
                    .map_or(true, |existing| features.version >= existing.version);
                if newer {
                    input.bins.insert(features.key, features.clone());
                }
            }
            for (window, features) in &report.windows {
                input
                    .cell_windows
                    .insert((report.cell, *window), features.clone());
            }
            input.cold_pools.insert(report.cell, report.cold_pools.clone());
            if let Some(segmentation) = report.segmentation.get() {
                input.segmentations.insert(report.cell, segmentation.clone());
            }
        }
        for record in records {
            let m = &record.message.message;
            let reference = MessageRef::new(m.icao, m.timestamp, m.msg_hash.clone());
            if let Some(bin) = record.bin {
                input.bin_of.insert(reference.clone(), bin);
            }
            if let Some(proxy) = record.turbulence {
                input.turbulence.insert(reference, proxy);
            }
            input.messages.push(record.message);
        }
        let mut assembler = SchemaAssembler::new(&self.config.normalizer)?;
        assembler.execute(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Icao, MsgHash};
    use crate::prelude::OmitReason;
    use std::time::Duration;

    const T0: f64 = 1_700_000_000.0;

    fn capture(icao: u32, track: f64, count: usize) -> Vec<RawMessage> {
        (0..count)
            .map(|i| {
                let t = T0 + 5.0 * i as f64;
                let east = if track == 90.0 { 1.0 } else { -1.0 };
                RawMessage {
                    latitude: Some(40.2),
                    longitude: Some(-110.0 + east * 0.0005 * i as f64),
                    altitude_ft: Some(7000.0 + 10.0 * i as f64),
                    ground_speed: Some(200.0),
                    track: Some(track),
                    vertical_rate: Some(if i % 2 == 0 { 64.0 } else { -64.0 }),
                    tas: Some(190.0),
                    heading: Some(track - 2.0),
                    temp_c: Some(-2.0 - 0.01 * i as f64),
                    bds: Some("44".into()),
                    ..RawMessage::new(
                        Icao::new(icao).unwrap(),
                        t,
                        20,
                        MsgHash::new(format!("{:06x}{:08x}", icao, i)),
                    )
                }
            })
            .collect()
    }

    /// Comm-B meteorological report at a fixed position with temperature
    /// falling 6.5 K per km.
    fn sounding(icao: u32, t: f64, altitude_ft: f64, n: usize) -> RawMessage {
        RawMessage {
            latitude: Some(40.2),
            longitude: Some(-110.2),
            altitude_ft: Some(altitude_ft),
            temp_c: Some(10.0 - 0.0065 * altitude_ft * 0.3048),
            bds: Some("44".into()),
            ..RawMessage::new(
                Icao::new(icao).unwrap(),
                t,
                20,
                MsgHash::new(format!("{:06x}{:08x}", icao, n)),
            )
        }
    }

    #[tokio::test]
    async fn late_message_leaves_on_time_rows_of_its_bin_intact() {
        const W: f64 = 1_700_000_040.0;
        let profile = [(0xA00001, 6_000.0), (0xA00002, 7_000.0), (0xA00003, 8_000.0)];
        let mut messages = Vec::new();
        for (n, offset) in [5.0, 15.0, 25.0].into_iter().enumerate() {
            for (icao, altitude_ft) in profile {
                messages.push(sounding(icao, W + offset, altitude_ft, n));
            }
        }
        for n in 0..25 {
            messages.push(sounding(0xA00001, W + 65.0 + 10.0 * n as f64, 6_000.0, 10 + n));
        }
        messages.push(sounding(0xA00001, W + 45.0, 6_000.0, 99));

        let mut config = PipelineConfig::default();
        config.scheduler.aircraft_shards = 1;
        let session = Session::new(config).unwrap();
        let report = session
            .run_batch(messages, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.cells.iter().map(|c| c.late_bins).sum::<usize>(), 1);

        let row = |icao: u32, t: f64| {
            report
                .records
                .derived
                .iter()
                .find(|r| r.icao == Icao::new(icao).unwrap() && r.timestamp == t)
                .unwrap()
        };
        let straggler = row(0xA00001, W + 45.0);
        assert!(straggler.late);
        assert_eq!(straggler.bin_version, Some(2));
        assert_eq!(straggler.omitted["lapse_rate_kperkm"], OmitReason::Late);

        for (icao, _) in profile {
            for offset in [5.0, 15.0, 25.0] {
                let on_time = row(icao, W + offset);
                assert!(!on_time.late);
                let lapse = on_time.lapse_rate_kperkm.unwrap();
                assert!((lapse - 6.5).abs() < 0.1);
            }
        }
        assert_eq!(row(0xA00001, W + 5.0).bin_version, Some(2));
    }

    #[tokio::test]
    async fn session_produces_joinable_record_sets() {
        let mut messages = capture(0xA00001, 90.0, 60);
        messages.extend(capture(0xA00002, 270.0, 60));
        messages.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        let session = Session::new(PipelineConfig::default()).unwrap();
        let report = session
            .run_batch(messages, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.completion, SealReason::EndOfStream);
        assert_eq!(report.metrics.processed, 120);
        assert_eq!(report.records.core.len(), 120);
        assert_eq!(report.records.derived.len(), 120);
        for (core, derived) in report.records.core.iter().zip(&report.records.derived) {
            assert_eq!(core.icao, derived.icao);
            assert_eq!(core.timestamp, derived.timestamp);
            assert_eq!(core.msg_hash, derived.msg_hash);
        }
        assert!(report.records.derived.iter().any(|r| r.wind_u_ms.is_some()));
        assert!(report.records.derived.iter().any(|r| r.theta_k.is_some()));
        assert!(!report.cells.is_empty());
        assert!(report.units.contains_key("wind_u_ms"));
    }

    #[tokio::test]
    async fn cancellation_flushes_open_bins_as_early_seal() {
        let (tx, rx) = mpsc::channel(64);
        for message in capture(0xA00001, 90.0, 6) {
            tx.send(message).await.unwrap();
        }
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let session = Session::new(PipelineConfig::default()).unwrap();
        let report = session.run(rx, cancel).await.unwrap();
        drop(tx);

        assert_eq!(report.completion, SealReason::EarlySeal);
        assert_eq!(report.records.derived.len(), 6);
        for row in &report.records.derived {
            assert_eq!(row.completeness, "early_seal");
        }
    }

    #[test]
    fn invalid_configuration_is_rejected_before_running() {
        let mut config = PipelineConfig::default();
        config.window.window_s = 0.0;
        let err = Session::new(config).err().unwrap();
        assert_eq!(err.kind(), "invalid_config");
    }
}
