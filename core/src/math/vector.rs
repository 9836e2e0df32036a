use serde::{Deserialize, Serialize};

/// Horizontal vector in meteorological components: `u` east, `v` north.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub u: f64,
    pub v: f64,
}

impl Vec2 {
    pub fn new(u: f64, v: f64) -> Self {
        Self { u, v }
    }

    /// Vector of magnitude `speed` pointing toward azimuth `azimuth_deg`
    /// (clockwise from north), as aircraft track and heading are reported.
    pub fn from_polar(speed: f64, azimuth_deg: f64) -> Self {
        let rad = azimuth_deg.to_radians();
        Self {
            u: speed * rad.sin(),
            v: speed * rad.cos(),
        }
    }

    /// Vector for a wind reported as speed and the direction it blows *from*.
    pub fn from_wind(speed: f64, from_deg: f64) -> Self {
        Self::from_polar(speed, from_deg + 180.0)
    }

    pub fn norm(&self) -> f64 {
        self.u.hypot(self.v)
    }

    /// Azimuth the vector points toward, in `[0, 360)`.
    pub fn azimuth_deg(&self) -> f64 {
        self.u.atan2(self.v).to_degrees().rem_euclid(360.0)
    }

    /// Meteorological "from" direction, in `[0, 360)`.
    pub fn from_direction_deg(&self) -> f64 {
        (self.azimuth_deg() + 180.0).rem_euclid(360.0)
    }

    pub fn sub(&self, other: &Vec2) -> Vec2 {
        Vec2::new(self.u - other.u, self.v - other.v)
    }

    /// Component along the unit vector at `azimuth_deg`.
    pub fn project(&self, azimuth_deg: f64) -> f64 {
        let axis = Vec2::from_polar(1.0, azimuth_deg);
        self.u * axis.u + self.v * axis.v
    }
}

/// Signed smallest difference `b - a` between two azimuths, in `(-180, 180]`.
pub fn angle_diff_deg(a: f64, b: f64) -> f64 {
    let d = (b - a).rem_euclid(360.0);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}
