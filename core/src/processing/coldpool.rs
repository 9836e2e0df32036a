use crate::config::{BasinConfig, ColdPoolConfig};
use crate::interface::CellId;
use crate::math::solar::solar_elevation_deg;
use crate::prelude::{ProcessingStage, StageResult};
use crate::telemetry::LogManager;
use serde::{Deserialize, Serialize};

/// Cross-bin low-layer state of one cell for one finalised window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColdPoolObservation {
    pub window: i64,
    pub timestamp: f64,
    pub low_temperature_k: Option<f64>,
    /// Wind component along the basin axis in the low layer.
    pub along_basin_wind_ms: Option<f64>,
    /// Inversion depth from the lapse fit; `Some(0.0)` when fitted without inversion.
    pub inversion_depth_m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdPoolStatus {
    Active,
    BrokenUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakupCause {
    InversionCollapse,
    SustainedWarming,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub timestamp: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdPoolEvent {
    pub id: String,
    pub cell: CellId,
    pub onset_ts: f64,
    pub onset_window: i64,
    pub breakup_ts: Option<f64>,
    pub breakup_window: Option<i64>,
    pub status: ColdPoolStatus,
    pub breakup_cause: Option<BreakupCause>,
    pub depth_trajectory: Vec<TrajectoryPoint>,
    /// Low-layer cooling rate, K/h.
    pub cooling_rates: Vec<TrajectoryPoint>,
    pub wind_reversals: Vec<f64>,
    pub onset_solar_elevation_deg: f64,
    pub nocturnal: bool,
}

impl ColdPoolEvent {
    pub fn covers(&self, window: i64) -> bool {
        window >= self.onset_window && self.breakup_window.map_or(true, |end| window < end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trend {
    Cooling,
    Warming,
    Steady,
}

/// Tracks nocturnal pooling for one basin cell from its time-ordered windows.
pub struct ColdPoolTracker {
    config: ColdPoolConfig,
    basin: BasinConfig,
    cell: CellId,
    last_temperature: Option<(f64, f64)>,
    last_along: Option<f64>,
    /// Window history since the current trend began: (window, timestamp, rate, depth).
    run: Vec<(i64, f64, f64, Option<f64>)>,
    run_trend: Trend,
    max_depth: f64,
    active: Option<ColdPoolEvent>,
    events: Vec<ColdPoolEvent>,
    logger: LogManager,
}

impl ColdPoolTracker {
    pub fn new(config: ColdPoolConfig, basin: BasinConfig, cell: CellId) -> Self {
        Self {
            config,
            basin,
            cell,
            last_temperature: None,
            last_along: None,
            run: Vec::new(),
            run_trend: Trend::Steady,
            max_depth: 0.0,
            active: None,
            events: Vec::new(),
            logger: LogManager::new(format!("coldpool {}", cell)),
        }
    }

    pub fn active(&self) -> Option<&ColdPoolEvent> {
        self.active.as_ref()
    }

    /// Closed events followed by the still-active one, if any.
    pub fn events(&self) -> Vec<ColdPoolEvent> {
        self.events.iter().chain(self.active.iter()).cloned().collect()
    }

    /// Id of the event covering a window, closed or active.
    pub fn event_at(&self, window: i64) -> Option<&str> {
        self.events
            .iter()
            .chain(self.active.iter())
            .find(|e| e.covers(window))
            .map(|e| e.id.as_str())
    }

    fn trend(&self, rate: f64) -> Trend {
        if rate < -self.config.rate_deadband_kph {
            Trend::Cooling
        } else if rate > self.config.rate_deadband_kph {
            Trend::Warming
        } else {
            Trend::Steady
        }
    }

    fn open_event(&mut self) {
        let Some(&(onset_window, onset_ts, _, _)) = self.run.first() else { return };
        let elevation =
            solar_elevation_deg(onset_ts, self.basin.receiver_lat, self.basin.receiver_lon);
        let id = format!(
            "CP-{}-{}-{}",
            self.cell.row,
            self.cell.col,
            self.events.len() + 1
        );
        self.logger.record(&format!(
            "{} onset at {:.0} (solar elevation {:.1} deg)",
            id, onset_ts, elevation
        ));
        let mut event = ColdPoolEvent {
            id,
            cell: self.cell,
            onset_ts,
            onset_window,
            breakup_ts: None,
            breakup_window: None,
            status: ColdPoolStatus::Active,
            breakup_cause: None,
            depth_trajectory: Vec::new(),
            cooling_rates: Vec::new(),
            wind_reversals: Vec::new(),
            onset_solar_elevation_deg: elevation,
            nocturnal: elevation < 0.0,
        };
        for &(_, timestamp, rate, depth) in &self.run {
            event.cooling_rates.push(TrajectoryPoint { timestamp, value: rate });
            if let Some(depth) = depth {
                event.depth_trajectory.push(TrajectoryPoint { timestamp, value: depth });
            }
        }
        self.max_depth = event
            .depth_trajectory
            .iter()
            .map(|p| p.value)
            .fold(0.0, f64::max);
        self.active = Some(event);
    }

    fn close_event(&mut self, window: i64, timestamp: f64, cause: BreakupCause) {
        if let Some(mut event) = self.active.take() {
            event.breakup_ts = Some(timestamp);
            event.breakup_window = Some(window);
            event.status = ColdPoolStatus::BrokenUp;
            event.breakup_cause = Some(cause);
            self.logger.record(&format!(
                "{} broke up at {:.0} ({:?})",
                event.id, timestamp, cause
            ));
            self.events.push(event);
        }
        self.max_depth = 0.0;
        // A new pool needs a fresh sustained cooling run.
        self.run.clear();
        self.run_trend = Trend::Steady;
    }

    fn observe_reversal(&mut self, obs: &ColdPoolObservation) {
        let Some(along) = obs.along_basin_wind_ms else { return };
        if along.abs() < self.config.min_reversal_ms {
            return;
        }
        if let (Some(previous), Some(event)) = (self.last_along, self.active.as_mut()) {
            if previous.signum() != along.signum() {
                event.wind_reversals.push(obs.timestamp);
            }
        }
        self.last_along = Some(along);
    }
}

impl ProcessingStage for ColdPoolTracker {
    type Input = ColdPoolObservation;
    /// Id of the event active after this window, if any.
    type Output = Option<String>;

    fn execute(&mut self, obs: ColdPoolObservation) -> StageResult<Option<String>> {
        self.observe_reversal(&obs);

        let rate = match (self.last_temperature, obs.low_temperature_k) {
            (Some((t0, temp0)), Some(temp)) if obs.timestamp > t0 => {
                Some((temp - temp0) / ((obs.timestamp - t0) / 3600.0))
            }
            _ => None,
        };
        if let Some(temp) = obs.low_temperature_k {
            self.last_temperature = Some((obs.timestamp, temp));
        }

        if let Some(event) = self.active.as_mut() {
            if let Some(depth) = obs.inversion_depth_m {
                event.depth_trajectory.push(TrajectoryPoint {
                    timestamp: obs.timestamp,
                    value: depth,
                });
            }
            if let Some(rate) = rate {
                event.cooling_rates.push(TrajectoryPoint {
                    timestamp: obs.timestamp,
                    value: rate,
                });
            }
        }

        if let Some(depth) = obs.inversion_depth_m {
            if self.active.is_some() {
                if self.max_depth >= self.config.breakup_depth_m
                    && depth < self.config.breakup_depth_m
                {
                    self.close_event(obs.window, obs.timestamp, BreakupCause::InversionCollapse);
                }
                self.max_depth = self.max_depth.max(depth);
            }
        }

        if let Some(rate) = rate {
            let trend = self.trend(rate);
            if trend != self.run_trend || trend == Trend::Steady {
                self.run.clear();
                self.run_trend = trend;
            }
            self.run
                .push((obs.window, obs.timestamp, rate, obs.inversion_depth_m));
            let sustained = self.run.len() >= self.config.sustain_windows;
            match (trend, self.active.is_some()) {
                (Trend::Cooling, false) if sustained => self.open_event(),
                (Trend::Warming, true) if sustained => {
                    if let Some(&(window, timestamp, _, _)) = self.run.first() {
                        self.close_event(window, timestamp, BreakupCause::SustainedWarming);
                    }
                }
                _ => {}
            }
        }

        Ok(self.active.as_ref().map(|e| e.id.clone()))
    }

    fn cleanup(&mut self) {
        self.last_temperature = None;
        self.last_along = None;
        self.run.clear();
        self.run_trend = Trend::Steady;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-15 02:00 UTC, early evening in the basin.
    const EVENING: f64 = 1_705_284_000.0;
    const CELL: CellId = CellId { row: 1, col: 3 };

    fn obs(i: i64, temp: f64, depth: Option<f64>) -> ColdPoolObservation {
        ColdPoolObservation {
            window: i,
            timestamp: EVENING + 600.0 * i as f64,
            low_temperature_k: Some(temp),
            along_basin_wind_ms: None,
            inversion_depth_m: depth,
        }
    }

    fn tracker() -> ColdPoolTracker {
        ColdPoolTracker::new(ColdPoolConfig::default(), BasinConfig::default(), CELL)
    }

    #[test]
    fn sustained_cooling_after_sunset_opens_event_at_first_cooling_window() {
        let mut t = tracker();
        let temps = [275.0, 275.2, 275.4, 275.1, 274.8, 274.5, 274.2];
        let ids: Vec<Option<String>> = temps
            .iter()
            .enumerate()
            .map(|(i, &temp)| t.execute(obs(i as i64, temp, None)).unwrap())
            .collect();
        assert!(ids[4].is_none());
        assert_eq!(ids[5].as_deref(), Some("CP-1-3-1"));
        let event = t.active().unwrap();
        assert_eq!(event.onset_window, 3);
        assert_eq!(event.onset_ts, EVENING + 1800.0);
        assert!(event.nocturnal);
        assert_eq!(event.cooling_rates.len(), 4);
        assert_eq!(t.event_at(3), Some("CP-1-3-1"));
        assert_eq!(t.event_at(2), None);
    }

    #[test]
    fn brief_cooling_does_not_open_event() {
        let mut t = tracker();
        for (i, temp) in [275.0, 274.8, 274.6, 274.9, 274.7].iter().enumerate() {
            assert!(t.execute(obs(i as i64, *temp, None)).unwrap().is_none());
        }
        assert!(t.events().is_empty());
    }

    #[test]
    fn inversion_collapse_breaks_up_the_pool() {
        let mut t = tracker();
        let series = [
            (275.0, Some(100.0)),
            (274.7, Some(150.0)),
            (274.4, Some(200.0)),
            (274.1, Some(250.0)),
            (273.9, Some(20.0)),
        ];
        for (i, (temp, depth)) in series.iter().enumerate() {
            t.execute(obs(i as i64, *temp, *depth)).unwrap();
        }
        let events = t.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, ColdPoolStatus::BrokenUp);
        assert_eq!(events[0].breakup_cause, Some(BreakupCause::InversionCollapse));
        assert_eq!(events[0].breakup_window, Some(4));
        assert!(!events[0].covers(4));
        assert!(events[0].covers(1));
    }

    #[test]
    fn sustained_warming_breaks_up_and_records_reversals() {
        let mut t = tracker();
        let temps = [275.0, 274.7, 274.4, 274.1, 274.4, 274.7, 275.0];
        let winds = [2.0, 2.0, -1.5, -1.5, 1.0, 0.2, 1.0];
        for i in 0..temps.len() {
            let mut o = obs(i as i64, temps[i], None);
            o.along_basin_wind_ms = Some(winds[i]);
            t.execute(o).unwrap();
        }
        let events = t.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].breakup_cause, Some(BreakupCause::SustainedWarming));
        assert_eq!(events[0].breakup_window, Some(4));
        assert_eq!(events[0].wind_reversals.len(), 1);
    }
}
