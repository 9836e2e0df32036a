use crate::config::PipelineConfig;
use crate::interface::{CellId, SealReason, SealedBin};
use crate::math::stats::StatsHelper;
use crate::pipeline::shard::BinEvent;
use crate::prelude::{Feature, OmitReason, ProcessingStage, StageError};
use crate::processing::boundary::{BoundaryLayerEstimator, ProfileSample};
use crate::processing::changepoint::{CellSeries, Segmentation, Segmenter, SeriesPoint};
use crate::processing::coldpool::{ColdPoolEvent, ColdPoolObservation, ColdPoolTracker};
use crate::processing::lapse::{LapseDetector, ProfilePoint};
use crate::processing::schema::{BinFeatures, CellWindowFeatures};
use crate::processing::wind::{WindEstimate, WindEstimator, WindMethod};
use crate::telemetry::{LogManager, MetricsRecorder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-window features fed to the air-mass segmenter, in column order.
pub const SERIES_FEATURES: [&str; 6] = [
    "low_temperature_k",
    "theta_k",
    "wind_u_ms",
    "wind_v_ms",
    "lapse_rate_kperkm",
    "mixed_layer_depth_m",
];

#[derive(Debug, Clone, PartialEq)]
pub enum CellCommand {
    Bin(Box<BinEvent>),
    /// Every shard has emitted all bins ending at or before this time.
    Watermark(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellReport {
    pub cell: CellId,
    /// Every version of every bin routed here, in processing order.
    pub bins: Vec<BinFeatures>,
    pub windows: BTreeMap<i64, CellWindowFeatures>,
    pub cold_pools: Vec<ColdPoolEvent>,
    pub series: CellSeries,
    pub segmentation: Feature<Segmentation>,
    pub late_bins: usize,
    pub incomplete_windows: usize,
}

/// Single owner of one basin cell's cross-aircraft state. Windows are
/// finalised strictly in order once the watermark has passed them by the
/// lateness tolerance.
pub struct CellWorker {
    cell: CellId,
    lateness_s: f64,
    revision_horizon_s: f64,
    max_pending_windows: usize,
    low_layer_ceiling_m: f64,
    axis_azimuth_deg: f64,
    wind: WindEstimator,
    lapse: LapseDetector,
    boundary: BoundaryLayerEstimator,
    cold_pool: ColdPoolTracker,
    segmenter: Segmenter,
    pending: BTreeMap<i64, Vec<BinEvent>>,
    finalized: BTreeMap<i64, Vec<BinEvent>>,
    last_finalized: Option<i64>,
    watermark: f64,
    bins: Vec<BinFeatures>,
    windows: BTreeMap<i64, CellWindowFeatures>,
    series: Vec<SeriesPoint>,
    late_bins: usize,
    incomplete_windows: usize,
    metrics: Arc<MetricsRecorder>,
    logger: LogManager,
}

fn replace_or_push(events: &mut Vec<BinEvent>, event: BinEvent) {
    match events.iter_mut().find(|e| e.bin.key == event.bin.key) {
        Some(slot) => *slot = event,
        None => events.push(event),
    }
}

impl CellWorker {
    pub fn new(cell: CellId, config: &PipelineConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            cell,
            lateness_s: config.scheduler.lateness_s,
            revision_horizon_s: config.window.revision_horizon_s,
            max_pending_windows: config.scheduler.max_pending_windows,
            low_layer_ceiling_m: config.basin.floor_elevation_m + config.cold_pool.low_layer_depth_m,
            axis_azimuth_deg: config.basin.axis_azimuth_deg,
            wind: WindEstimator::new(config.wind.clone()),
            lapse: LapseDetector::new(config.lapse.clone()),
            boundary: BoundaryLayerEstimator::new(config.boundary_layer.clone(), &config.basin),
            cold_pool: ColdPoolTracker::new(config.cold_pool.clone(), config.basin.clone(), cell),
            segmenter: Segmenter::new(config.segmenter.clone()),
            pending: BTreeMap::new(),
            finalized: BTreeMap::new(),
            last_finalized: None,
            watermark: f64::NEG_INFINITY,
            bins: Vec::new(),
            windows: BTreeMap::new(),
            series: Vec::new(),
            late_bins: 0,
            incomplete_windows: 0,
            metrics,
            logger: LogManager::new(format!("cell {}", cell)),
        }
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn pending_windows(&self) -> usize {
        self.pending.len()
    }

    pub fn handle(&mut self, command: CellCommand) {
        match command {
            CellCommand::Bin(event) => {
                let window = event.bin.key.window;
                if self.last_finalized.map_or(false, |last| window <= last) {
                    self.accept_late(*event);
                } else {
                    replace_or_push(self.pending.entry(window).or_default(), *event);
                }
            }
            CellCommand::Watermark(time) => {
                self.watermark = self.watermark.max(time);
                while let Some(window) = self.next_ready() {
                    self.finalize(window, false);
                }
            }
        }
        while self.pending.len() > self.max_pending_windows {
            if let Some(&oldest) = self.pending.keys().next() {
                self.finalize(oldest, true);
            }
        }
    }

    fn next_ready(&self) -> Option<i64> {
        let (&window, events) = self.pending.iter().next()?;
        let end = events.first()?.bin.window_end;
        (end + self.lateness_s <= self.watermark).then_some(window)
    }

    /// Latest features of one bin; consensus replaces a direct estimate that
    /// lacked air data.
    fn bin_features(&self, event: &BinEvent, peers: &[BinEvent], late: bool) -> BinFeatures {
        let wind = match &event.direct_wind {
            Feature::Omitted {
                reason: OmitReason::InsufficientData,
            } => {
                let band: Vec<&SealedBin> = peers
                    .iter()
                    .map(|e| &e.bin)
                    .filter(|b| b.key.band == event.bin.key.band)
                    .collect();
                Feature::from_result(self.wind.consensus(&band))
            }
            other => other.clone(),
        };
        for (name, reason) in [
            ("wind", wind.reason()),
            ("thermo", event.thermo.reason()),
            ("altitude", event.altitude.reason()),
        ] {
            if let Some(reason) = reason {
                self.metrics.record_omission(name, reason.as_str());
            }
        }
        BinFeatures {
            key: event.bin.key,
            version: event.bin.version,
            cell: self.cell,
            seal_reason: event.bin.seal_reason,
            late,
            wind,
            thermo: event.thermo.clone(),
            altitude: event.altitude.clone(),
        }
    }

    fn accept_late(&mut self, event: BinEvent) {
        let window = event.bin.key.window;
        let err = StageError::OrderingViolation(format!(
            "{} v{} arrived after window {} was finalised",
            event.bin.key, event.bin.version, window
        ));
        self.metrics.record_error(&err);
        self.logger.detail(&err.to_string());
        self.late_bins += 1;

        let mut peers = self.finalized.remove(&window).unwrap_or_default();
        replace_or_push(&mut peers, event.clone());
        let features = self.bin_features(&event, &peers, true);
        self.bins.push(features);
        self.finalized.insert(window, peers);
    }

    fn median(values: impl Iterator<Item = f64>) -> Option<f64> {
        StatsHelper::median(&values.collect::<Vec<f64>>())
    }

    /// Winds standing for one window: the direct estimates of each band, or
    /// its consensus once when no bin of the band had air data.
    fn window_winds(features: &[BinFeatures]) -> Vec<WindEstimate> {
        let mut bands: BTreeMap<i32, Vec<&WindEstimate>> = BTreeMap::new();
        for wind in features.iter().filter_map(|f| f.wind.get()) {
            bands.entry(wind.key.band).or_default().push(wind);
        }
        bands
            .into_values()
            .flat_map(|winds| {
                let direct: Vec<&WindEstimate> = winds
                    .iter()
                    .copied()
                    .filter(|w| w.method == WindMethod::Direct)
                    .collect();
                if direct.is_empty() {
                    winds.into_iter().take(1).collect()
                } else {
                    direct
                }
            })
            .cloned()
            .collect()
    }

    fn finalize(&mut self, window: i64, incomplete: bool) {
        let Some(mut events) = self.pending.remove(&window) else { return };
        if incomplete {
            self.incomplete_windows += 1;
            self.logger.warn(&format!(
                "window {} finalised early with {} bins; queue bound {} reached",
                window,
                events.len(),
                self.max_pending_windows
            ));
            for event in &mut events {
                event.bin.seal_reason = SealReason::Incomplete;
            }
        }
        let features: Vec<BinFeatures> = events
            .iter()
            .map(|event| self.bin_features(event, &events, false))
            .collect();
        for event in &events {
            self.metrics.record_seal(event.bin.seal_reason.as_str());
        }

        let points: Vec<ProfilePoint> = features
            .iter()
            .filter_map(|f| f.thermo.get())
            .map(ProfilePoint::from)
            .collect();
        let lapse = Feature::from_result(self.lapse.fit(self.cell, window, &points));
        let samples: Vec<ProfileSample> = events
            .iter()
            .filter_map(|e| ProfileSample::from_bin(&e.bin))
            .collect();
        let boundary = Feature::from_result(self.boundary.estimate(self.cell, window, &samples));
        for (name, reason) in [("lapse", lapse.reason()), ("boundary_layer", boundary.reason())] {
            if let Some(reason) = reason {
                self.metrics.record_omission(name, reason.as_str());
            }
        }

        let ceiling = self.low_layer_ceiling_m;
        let low = || {
            events
                .iter()
                .zip(&features)
                .filter(move |(e, _)| e.bin.altitude_m() < ceiling)
        };
        let low_temperature = Self::median(low().filter_map(|(_, f)| f.thermo.get()).map(|t| t.temperature_k));
        let winds = Self::window_winds(&features);
        let along = Self::median(
            winds
                .iter()
                .filter(|w| w.altitude_m < ceiling)
                .map(|w| w.vector().project(self.axis_azimuth_deg)),
        );
        let theta = Self::median(features.iter().filter_map(|f| f.thermo.get()).map(|t| t.theta_k));
        let wind_u = Self::median(winds.iter().map(|w| w.u_ms));
        let wind_v = Self::median(winds.iter().map(|w| w.v_ms));
        let inversion_depth = lapse
            .get()
            .map(|fit| fit.inversion.map_or(0.0, |layer| layer.depth_m));

        let (start, end) = events
            .first()
            .map(|e| (e.bin.window_start, e.bin.window_end))
            .unwrap_or_default();
        let observation = ColdPoolObservation {
            window,
            timestamp: start,
            low_temperature_k: low_temperature,
            along_basin_wind_ms: along,
            inversion_depth_m: inversion_depth,
        };
        if let Err(err) = self.cold_pool.execute(observation) {
            self.metrics.record_error(&err);
            self.logger.warn(&err.to_string());
        }

        self.series.push(SeriesPoint {
            window,
            start,
            end,
            features: vec![
                low_temperature,
                theta,
                wind_u,
                wind_v,
                lapse.get().map(|fit| fit.lapse_rate_kperkm),
                boundary.get().map(|b| b.depth_m_agl),
            ],
        });
        self.windows.insert(window, CellWindowFeatures { lapse, boundary });
        self.bins.extend(features);
        self.finalized.insert(window, events);
        self.last_finalized = Some(window);

        let horizon = self.revision_horizon_s;
        let watermark = self.watermark;
        self.finalized.retain(|_, events| {
            events
                .first()
                .map_or(false, |e| watermark - e.bin.window_end <= horizon)
        });
    }

    /// Finalises whatever is still pending and segments the whole series.
    pub fn finish(mut self) -> CellReport {
        while let Some(&window) = self.pending.keys().next() {
            self.finalize(window, false);
        }
        let series = CellSeries {
            cell: self.cell,
            feature_names: SERIES_FEATURES.iter().map(|s| s.to_string()).collect(),
            points: self.series,
        };
        let segmentation = match self.segmenter.execute(series.clone()) {
            Ok(segmentation) => {
                self.logger.record(&format!(
                    "{} windows in {} segments over {} states",
                    series.points.len(),
                    segmentation.segments.len(),
                    segmentation.state_count
                ));
                Feature::present(segmentation)
            }
            Err(err) => {
                self.metrics.record_error(&err);
                self.logger.detail(&err.to_string());
                Feature::omitted(err.omit_reason())
            }
        };
        CellReport {
            cell: self.cell,
            bins: self.bins,
            windows: self.windows,
            cold_pools: self.cold_pool.events(),
            series,
            segmentation,
            late_bins: self.late_bins,
            incomplete_windows: self.incomplete_windows,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<CellCommand>) -> CellReport {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ThermoConfig, WindConfig};
    use crate::interface::{BinKey, BinScope, Field, Icao};
    use crate::processing::altitude::AltitudeQa;
    use crate::processing::thermo::ThermoDeriver;

    const CELL: CellId = CellId { row: 1, col: 2 };

    fn event(icao: u32, window: i64, fields: &[(Field, f64)]) -> BinEvent {
        let key = BinKey {
            scope: BinScope::Aircraft(Icao::new(icao).unwrap()),
            window,
            band: 12,
        };
        let bin = SealedBin::fixture(key, fields);
        BinEvent {
            direct_wind: Feature::from_result(WindEstimator::new(WindConfig::default()).direct(&bin)),
            thermo: Feature::from_result(ThermoDeriver::new(ThermoConfig::default()).derive(&bin)),
            altitude: Feature::from_result(AltitudeQa::new(Default::default()).check(&bin)),
            bin,
        }
    }

    fn met(icao: u32, window: i64) -> BinEvent {
        event(icao, window, &[(Field::Altitude, 1850.0), (Field::Temperature, 270.0)])
    }

    fn worker(config: &PipelineConfig) -> CellWorker {
        CellWorker::new(CELL, config, Arc::new(MetricsRecorder::new()))
    }

    #[test]
    fn windows_finalise_after_lateness_and_late_bins_are_versioned_apart() {
        let mut cell = worker(&PipelineConfig::default());
        cell.handle(CellCommand::Bin(Box::new(met(0xA00001, 10))));
        cell.handle(CellCommand::Bin(Box::new(met(0xA00001, 11))));
        cell.handle(CellCommand::Watermark(700.0));
        assert_eq!(cell.pending_windows(), 2);
        cell.handle(CellCommand::Watermark(800.0));
        assert_eq!(cell.pending_windows(), 1);

        cell.handle(CellCommand::Bin(Box::new(met(0xA00002, 10))));
        let report = cell.finish();
        assert_eq!(report.late_bins, 1);
        let late: Vec<&BinFeatures> = report.bins.iter().filter(|b| b.late).collect();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].key.window, 10);
        assert!(report.windows.contains_key(&10));
        assert_eq!(report.series.points.len(), 2);
        assert!(report.segmentation.is_present());
    }

    #[test]
    fn queue_bound_forces_incomplete_finalisation() {
        let mut config = PipelineConfig::default();
        config.scheduler.max_pending_windows = 2;
        let mut cell = worker(&config);
        for window in 1..=4 {
            cell.handle(CellCommand::Bin(Box::new(met(0xA00001, window))));
        }
        assert_eq!(cell.pending_windows(), 2);
        let report = cell.finish();
        assert_eq!(report.incomplete_windows, 2);
        let reasons: Vec<SealReason> = report.bins.iter().map(|b| b.seal_reason).collect();
        assert_eq!(
            reasons,
            vec![
                SealReason::Incomplete,
                SealReason::Incomplete,
                SealReason::WindowElapsed,
                SealReason::WindowElapsed
            ]
        );
    }

    #[test]
    fn bins_without_air_data_fall_back_to_consensus() {
        let mut cell = worker(&PipelineConfig::default());
        cell.handle(CellCommand::Bin(Box::new(event(
            0xA00001,
            5,
            &[(Field::GroundU, 60.0), (Field::GroundV, 0.0)],
        ))));
        cell.handle(CellCommand::Bin(Box::new(event(
            0xA00002,
            5,
            &[(Field::GroundU, -40.0), (Field::GroundV, 0.0)],
        ))));
        let report = cell.finish();
        assert_eq!(report.bins.len(), 2);
        for bin in &report.bins {
            let wind = bin.wind.get().unwrap();
            assert_eq!(wind.method, WindMethod::Consensus);
            assert!((wind.u_ms - 10.0).abs() < 1e-9);
            assert!(wind.confidence <= 0.4);
        }
        assert_eq!(report.windows[&5].lapse.reason(), Some(OmitReason::InsufficientData));
    }

    #[test]
    fn series_wind_prefers_direct_estimates_of_a_band() {
        let mut cell = worker(&PipelineConfig::default());
        cell.handle(CellCommand::Bin(Box::new(event(
            0xA00001,
            5,
            &[
                (Field::GroundU, 60.0),
                (Field::GroundV, 0.0),
                (Field::TrueAirspeed, 50.0),
                (Field::HeadingX, 1.0),
                (Field::HeadingY, 0.0),
            ],
        ))));
        for icao in [0xA00002, 0xA00003] {
            cell.handle(CellCommand::Bin(Box::new(event(
                icao,
                5,
                &[(Field::GroundU, -40.0), (Field::GroundV, 0.0)],
            ))));
        }
        let report = cell.finish();
        let consensus = report
            .bins
            .iter()
            .filter(|b| b.wind.get().map(|w| w.method) == Some(WindMethod::Consensus))
            .count();
        assert_eq!(consensus, 2);

        let point = &report.series.points[0];
        assert!((point.features[2].unwrap() - 10.0).abs() < 1e-9);
        assert!(point.features[3].unwrap().abs() < 1e-9);
    }
}
