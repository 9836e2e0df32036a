//! Low-precision solar elevation (NOAA approximation, about 0.1 degree), good
//! enough to tell day from night at a receiver.

use std::f64::consts::PI;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Solar elevation angle in degrees at a UTC epoch time and location.
pub fn solar_elevation_deg(epoch_s: f64, lat_deg: f64, lon_deg: f64) -> f64 {
    let days = epoch_s / SECONDS_PER_DAY;
    // Day of year and fractional hour, UTC. Epoch day 0 was a Jan 1.
    let day_of_year = day_of_year(days.floor() as i64) as f64;
    let hour = (days - days.floor()) * 24.0;

    let gamma = 2.0 * PI / 365.0 * (day_of_year - 1.0 + (hour - 12.0) / 24.0);
    let eqtime = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());
    let decl = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    let true_solar_minutes = hour * 60.0 + eqtime + 4.0 * lon_deg;
    let hour_angle = (true_solar_minutes / 4.0 - 180.0).to_radians();
    let lat = lat_deg.to_radians();
    let cos_zenith = lat.sin() * decl.sin() + lat.cos() * decl.cos() * hour_angle.cos();
    90.0 - cos_zenith.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Day of the year (1-based) for a count of days since 1970-01-01.
fn day_of_year(epoch_days: i64) -> i64 {
    // Civil-from-days, Howard Hinnant's algorithm.
    let z = epoch_days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy_march = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy_march + 2) / 153;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let day = doy_march - (153 * mp + 2) / 5 + 1;
    let year = if month <= 2 { year + 1 } else { year };
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    const CUMULATIVE: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    let mut doy = CUMULATIVE[(month - 1) as usize] + day;
    if leap && month > 2 {
        doy += 1;
    }
    doy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_of_year_matches_known_dates() {
        assert_eq!(day_of_year(0), 1);
        // 2024-03-01 is day 61 of a leap year.
        assert_eq!(day_of_year(19_783), 61);
    }

    #[test]
    fn vernal_noon_is_day_and_midnight_is_night() {
        // 2024-01-15, Vernal UT: local solar noon is near 19:20 UTC.
        let midnight_utc = 19_737.0 * SECONDS_PER_DAY;
        let noon = solar_elevation_deg(midnight_utc + 19.3 * 3600.0, 40.46, -109.57);
        let night = solar_elevation_deg(midnight_utc + 7.3 * 3600.0, 40.46, -109.57);
        assert!(noon > 20.0, "noon elevation {}", noon);
        assert!(night < -20.0, "night elevation {}", night);
    }
}
