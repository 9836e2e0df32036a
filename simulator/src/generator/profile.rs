use anyhow::{bail, Context};
use basinmet::interface::{Icao, MsgHash, RawMessage};
use basinmet::math::Vec2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const FT: f64 = 0.3048;
const KT: f64 = 0.514_444;
const M_PER_DEG_LAT: f64 = 111_320.0;

/// Configuration for generating a synthetic basin capture.
///
/// The atmosphere is a surface layer cooling at a constant rate under an
/// inversion of fixed depth, with a uniform wind aloft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub aircraft: usize,
    pub duration_s: f64,
    /// Seconds between position/velocity reports of one aircraft.
    pub interval_s: f64,
    /// Unix time of the first report.
    pub start_time: f64,
    pub seed: u64,
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    pub floor_elevation_m: f64,
    pub ceiling_m: f64,
    pub surface_temp_c: f64,
    pub surface_cooling_k_per_h: f64,
    pub inversion_depth_m: f64,
    pub inversion_strength_k: f64,
    pub lapse_kperkm: f64,
    pub wind_speed_kt: f64,
    pub wind_from_deg: f64,
    /// Probability that a report cycle also carries Comm-B replies.
    pub comm_b_fraction: f64,
    /// Probability that a frame is heard twice by the receiver.
    pub duplicate_fraction: f64,
    /// Amplitude of the uniform jitter added to measured values.
    pub noise: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            aircraft: 6,
            duration_s: 7_200.0,
            interval_s: 5.0,
            // 2023-11-15 00:00 UTC, late afternoon over the basin.
            start_time: 1_700_006_400.0,
            seed: 0,
            lat_min: 39.9,
            lat_max: 40.8,
            lon_min: -110.7,
            lon_max: -109.1,
            floor_elevation_m: 1_550.0,
            ceiling_m: 4_500.0,
            surface_temp_c: 4.0,
            surface_cooling_k_per_h: 1.5,
            inversion_depth_m: 400.0,
            inversion_strength_k: 3.0,
            lapse_kperkm: 6.5,
            wind_speed_kt: 20.0,
            wind_from_deg: 270.0,
            comm_b_fraction: 0.6,
            duplicate_fraction: 0.02,
            noise: 0.5,
        }
    }
}

impl GeneratorConfig {
    /// Air temperature at `altitude_m` (MSL) after `elapsed_s` of capture.
    pub fn temperature_c(&self, altitude_m: f64, elapsed_s: f64) -> f64 {
        let surface = self.surface_temp_c - self.surface_cooling_k_per_h * elapsed_s / 3_600.0;
        let height = (altitude_m - self.floor_elevation_m).max(0.0);
        if self.inversion_depth_m > 0.0 && height < self.inversion_depth_m {
            surface + self.inversion_strength_k * height / self.inversion_depth_m
        } else {
            surface + self.inversion_strength_k
                - self.lapse_kperkm * (height - self.inversion_depth_m.max(0.0)) / 1_000.0
        }
    }

    pub fn wind(&self) -> Vec2 {
        Vec2::from_wind(self.wind_speed_kt * KT, self.wind_from_deg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(self.interval_s > 0.0) {
            bail!("capture interval_s must be positive");
        }
        if !(self.duration_s >= 0.0) {
            bail!("capture duration_s must not be negative");
        }
        if self.lat_min >= self.lat_max || self.lon_min >= self.lon_max {
            bail!("capture bounding box is inverted");
        }
        if self.ceiling_m <= self.floor_elevation_m + 300.0 {
            bail!("capture ceiling_m must be more than 300 m above floor_elevation_m");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Profile {
    Climb,
    Descent,
    Level,
}

/// Kinematic state of one synthetic aircraft.
struct Flight {
    icao: Icao,
    profile: Profile,
    lat: f64,
    lon: f64,
    altitude_m: f64,
    heading_deg: f64,
    tas_kt: f64,
    phase_s: f64,
    frame: u64,
}

fn jitter(rng: &mut StdRng, amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        rng.gen_range(-amplitude..amplitude)
    } else {
        0.0
    }
}

impl Flight {
    fn launch(index: usize, config: &GeneratorConfig, rng: &mut StdRng) -> anyhow::Result<Self> {
        let icao = Icao::new(0xA0_0000 + index as u32)
            .with_context(|| format!("allocating synthetic address for aircraft {}", index))?;
        let profile = match index % 3 {
            0 => Profile::Climb,
            1 => Profile::Descent,
            _ => Profile::Level,
        };
        let altitude_m = match profile {
            Profile::Climb => config.floor_elevation_m + 100.0,
            Profile::Descent => config.ceiling_m,
            Profile::Level => rng.gen_range(config.floor_elevation_m + 300.0..config.ceiling_m),
        };
        Ok(Self {
            icao,
            profile,
            lat: rng.gen_range(config.lat_min..config.lat_max),
            lon: rng.gen_range(config.lon_min..config.lon_max),
            altitude_m,
            heading_deg: rng.gen_range(0.0..360.0),
            tas_kt: rng.gen_range(140.0..260.0),
            phase_s: rng.gen_range(0.0..config.interval_s),
            frame: 0,
        })
    }

    fn vertical_rate_ms(&self, config: &GeneratorConfig) -> f64 {
        match self.profile {
            Profile::Climb if self.altitude_m < config.ceiling_m => 6.0,
            Profile::Descent if self.altitude_m > config.floor_elevation_m + 150.0 => -5.0,
            _ => 0.0,
        }
    }

    fn ground_vector(&self, wind: Vec2) -> Vec2 {
        let air = Vec2::from_polar(self.tas_kt * KT, self.heading_deg);
        Vec2::new(air.u + wind.u, air.v + wind.v)
    }

    fn advance(&mut self, config: &GeneratorConfig, wind: Vec2, dt: f64) {
        let ground = self.ground_vector(wind);
        self.lat += ground.v * dt / M_PER_DEG_LAT;
        self.lon += ground.u * dt / (M_PER_DEG_LAT * self.lat.to_radians().cos());
        self.altitude_m = (self.altitude_m + self.vertical_rate_ms(config) * dt)
            .clamp(config.floor_elevation_m + 100.0, config.ceiling_m);
        let outside = self.lat < config.lat_min
            || self.lat > config.lat_max
            || self.lon < config.lon_min
            || self.lon > config.lon_max;
        if outside {
            self.heading_deg = (self.heading_deg + 180.0).rem_euclid(360.0);
            self.lat = self.lat.clamp(config.lat_min, config.lat_max);
            self.lon = self.lon.clamp(config.lon_min, config.lon_max);
        }
    }

    fn message(&mut self, timestamp: f64, df: u8, kind: &str) -> RawMessage {
        self.frame += 1;
        let hash = MsgHash::of_bytes(format!("{}:{}:{}", self.icao, kind, self.frame).as_bytes());
        RawMessage::new(self.icao, timestamp, df, hash)
    }

    /// One report cycle: airborne position and velocity, plus Comm-B
    /// replies when the receiver happened to catch an interrogation.
    fn report(
        &mut self,
        timestamp: f64,
        elapsed_s: f64,
        config: &GeneratorConfig,
        rng: &mut StdRng,
    ) -> Vec<RawMessage> {
        let noise = config.noise;
        let wind = config.wind();
        let ground = self.ground_vector(wind);
        let altitude_ft = self.altitude_m / FT;
        let vertical_rate_fpm = self.vertical_rate_ms(config) / FT * 60.0;
        let mut out = Vec::with_capacity(5);

        let parity = (self.frame % 2) as u8;
        out.push(RawMessage {
            typecode: Some(11),
            oe_flag: Some(parity),
            nac_p: Some(9),
            latitude: Some(self.lat),
            longitude: Some(self.lon),
            altitude_ft: Some(altitude_ft + jitter(rng, 25.0 * noise)),
            ..self.message(timestamp, 17, "position")
        });
        out.push(RawMessage {
            typecode: Some(19),
            nac_v: Some(2),
            ground_speed: Some(ground.norm() / KT + jitter(rng, noise)),
            track: Some(ground.azimuth_deg() + jitter(rng, noise)),
            vertical_rate: Some(vertical_rate_fpm + jitter(rng, 64.0 * noise)),
            altitude_diff_ft: Some(75.0 + jitter(rng, 25.0 * noise)),
            ..self.message(timestamp + 0.5, 17, "velocity")
        });

        if rng.gen_bool(config.comm_b_fraction.clamp(0.0, 1.0)) {
            let temp_c = config.temperature_c(self.altitude_m, elapsed_s);
            out.push(RawMessage {
                bds: Some("44".into()),
                altitude_ft: Some(altitude_ft),
                temp_c: Some(temp_c + jitter(rng, 0.5 * noise)),
                wind_speed: Some(config.wind_speed_kt + jitter(rng, 2.0 * noise)),
                wind_direction: Some(config.wind_from_deg + jitter(rng, 5.0 * noise)),
                ..self.message(timestamp + 1.0, 20, "bds44")
            });
            out.push(RawMessage {
                bds: Some("50".into()),
                altitude_ft: Some(altitude_ft),
                roll: Some(jitter(rng, 2.0 * noise)),
                track: Some(ground.azimuth_deg() + jitter(rng, noise)),
                ground_speed: Some(ground.norm() / KT + jitter(rng, noise)),
                tas: Some(self.tas_kt + jitter(rng, noise)),
                track_rate: Some(jitter(rng, 0.1 * noise)),
                ..self.message(timestamp + 1.5, 20, "bds50")
            });
            out.push(RawMessage {
                bds: Some("60".into()),
                altitude_ft: Some(altitude_ft),
                heading: Some(self.heading_deg + jitter(rng, noise)),
                vertical_rate: Some(vertical_rate_fpm + jitter(rng, 64.0 * noise)),
                ..self.message(timestamp + 2.0, 20, "bds60")
            });
        }
        out
    }
}

/// Builds a time-ordered capture for every aircraft over the whole duration.
pub fn build_capture(config: &GeneratorConfig) -> anyhow::Result<Vec<RawMessage>> {
    config.validate()?;
    let cycles = (config.duration_s / config.interval_s).floor() as usize;
    let capacity = cycles
        .checked_mul(config.aircraft)
        .and_then(|n| n.checked_mul(5))
        .context("overflow computing message count for generator")?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let wind = config.wind();
    let mut messages = Vec::with_capacity(capacity);
    for index in 0..config.aircraft {
        let mut flight = Flight::launch(index, config, &mut rng)?;
        for cycle in 0..cycles {
            let elapsed = flight.phase_s + cycle as f64 * config.interval_s;
            for message in flight.report(config.start_time + elapsed, elapsed, config, &mut rng) {
                if rng.gen_bool(config.duplicate_fraction.clamp(0.0, 1.0)) {
                    messages.push(RawMessage {
                        timestamp: message.timestamp + 0.2,
                        ..message.clone()
                    });
                }
                messages.push(message);
            }
            flight.advance(config, wind, config.interval_s);
        }
    }
    messages.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    Ok(messages)
}

pub fn build_basin_capture(aircraft: usize, duration_s: f64, seed: u64) -> anyhow::Result<Vec<RawMessage>> {
    let config = GeneratorConfig {
        aircraft,
        duration_s,
        seed,
        ..Default::default()
    };
    build_capture(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(aircraft: usize, duration_s: f64) -> GeneratorConfig {
        GeneratorConfig {
            aircraft,
            duration_s,
            comm_b_fraction: 1.0,
            duplicate_fraction: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn generator_builds_expected_message_count() {
        let messages = build_capture(&quiet(2, 600.0)).unwrap();
        assert_eq!(messages.len(), 2 * 120 * 5);
        assert!(messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[test]
    fn same_seed_repeats_the_capture() {
        let a = build_basin_capture(3, 300.0, 7).unwrap();
        let b = build_basin_capture(3, 300.0, 7).unwrap();
        let c = build_basin_capture(3, 300.0, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn positions_stay_inside_the_capture_box() {
        let config = quiet(4, 1_800.0);
        let messages = build_capture(&config).unwrap();
        for m in messages.iter().filter(|m| m.latitude.is_some()) {
            let (lat, lon) = (m.latitude.unwrap(), m.longitude.unwrap());
            assert!(lat >= config.lat_min && lat <= config.lat_max);
            assert!(lon >= config.lon_min && lon <= config.lon_max);
        }
    }

    #[test]
    fn profile_has_a_surface_inversion_that_cools() {
        let config = GeneratorConfig::default();
        let floor = config.floor_elevation_m;
        let top = floor + config.inversion_depth_m;
        assert!(config.temperature_c(top, 0.0) > config.temperature_c(floor, 0.0));
        assert!(config.temperature_c(top + 1_000.0, 0.0) < config.temperature_c(top, 0.0));
        let cooled = config.temperature_c(floor, 3_600.0);
        assert!((config.temperature_c(floor, 0.0) - cooled - 1.5).abs() < 1e-9);
    }

    #[test]
    fn duplicated_frames_share_their_hash() {
        let config = GeneratorConfig {
            duplicate_fraction: 1.0,
            ..quiet(1, 60.0)
        };
        let messages = build_capture(&config).unwrap();
        assert_eq!(messages.len(), 12 * 5 * 2);
        let first = &messages[0];
        let twin = messages
            .iter()
            .skip(1)
            .find(|m| m.msg_hash == first.msg_hash)
            .unwrap();
        assert!((twin.timestamp - first.timestamp - 0.2).abs() < 1e-9);
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let config = GeneratorConfig {
            interval_s: 0.0,
            ..Default::default()
        };
        assert!(build_capture(&config).is_err());
    }
}
