//! Time scales, sidereal time and precession used by the geometry stage.
//!
//! Chunk timestamps are microseconds since MJD 0 (UTC). UT1 − UTC, polar
//! motion and nutation are neglected; the apparent direction of a source is
//! its J2000 position precessed to the mean equator of date.
//!
//! ITRF conventions:
//! - source unit vector `s = (cos δ cos H, −cos δ sin H, sin δ)` with `H` the
//!   Greenwich hour angle
//! - antenna geometric delay `τ_i = −(b_i · s) / c`; positive means the
//!   wavefront reaches the antenna late
//! - baseline delay `τ_12 = τ_2 − τ_1`

use chrono::{DateTime, Utc};
use nalgebra::{Rotation3, Vector3};
use std::f64::consts::{FRAC_PI_2, PI, TAU};

use crate::data::vis_chunk::Direction;

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// MJD of the Unix epoch (1970-01-01T00:00:00Z).
pub const MJD_UNIX_EPOCH: f64 = 40_587.0;

/// MJD of J2000.0 (2000-01-01T12:00:00).
pub const MJD_J2000: f64 = 51_544.5;

const MICROS_PER_DAY: f64 = 86_400.0e6;
const ARCSEC: f64 = PI / (180.0 * 3600.0);

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Chunk timestamp to MJD (UTC days).
#[must_use]
pub fn timestamp_to_mjd(timestamp_us: u64) -> f64 {
    timestamp_us as f64 / MICROS_PER_DAY
}

/// MJD to chunk timestamp, saturating at zero.
#[must_use]
pub fn mjd_to_timestamp(mjd: f64) -> u64 {
    (mjd * MICROS_PER_DAY).round().max(0.0) as u64
}

/// Wall-clock time to chunk timestamp.
#[must_use]
pub fn timestamp_from_datetime(time: DateTime<Utc>) -> u64 {
    let offset = (MJD_UNIX_EPOCH * MICROS_PER_DAY) as i64;
    (time.timestamp_micros() + offset).max(0) as u64
}

/// Chunk timestamp to wall-clock time; `None` if out of chrono's range.
#[must_use]
pub fn datetime_from_timestamp(timestamp_us: u64) -> Option<DateTime<Utc>> {
    let offset = (MJD_UNIX_EPOCH * MICROS_PER_DAY) as i64;
    let unix_us = i64::try_from(timestamp_us).ok()? - offset;
    DateTime::<Utc>::from_timestamp_micros(unix_us)
}

/// Greenwich mean sidereal time in radians (IAU 1982 expression).
#[must_use]
pub fn gmst(mjd: f64) -> f64 {
    let t = (mjd - MJD_J2000) / 36_525.0;
    let seconds = 67_310.548_41 + (876_600.0 * 3600.0 + 8_640_184.812_866) * t
        + 0.093_104 * t * t
        - 6.2e-6 * t * t * t;
    (seconds * PI / 43_200.0).rem_euclid(TAU)
}

/// Local mean sidereal time in radians for an east longitude in radians.
#[must_use]
pub fn local_sidereal_time(mjd: f64, longitude: f64) -> f64 {
    (gmst(mjd) + longitude).rem_euclid(TAU)
}

/// Rotation from the J2000 mean equator to the mean equator and equinox of
/// date (IAU 1976 angles ζ, z, θ).
#[must_use]
pub fn precession_matrix(mjd: f64) -> Rotation3<f64> {
    let t = (mjd - MJD_J2000) / 36_525.0;
    let t2 = t * t;
    let t3 = t2 * t;
    let zeta = (2306.2181 * t + 0.30188 * t2 + 0.017998 * t3) * ARCSEC;
    let z = (2306.2181 * t + 1.09468 * t2 + 0.018203 * t3) * ARCSEC;
    let theta = (2004.3109 * t - 0.42665 * t2 - 0.041833 * t3) * ARCSEC;

    Rotation3::from_axis_angle(&Vector3::z_axis(), z)
        * Rotation3::from_axis_angle(&Vector3::y_axis(), -theta)
        * Rotation3::from_axis_angle(&Vector3::z_axis(), zeta)
}

/// Precess a J2000 direction to the mean equator and equinox of date.
#[must_use]
pub fn precess_from_j2000(direction: Direction, mjd: f64) -> Direction {
    let v = precession_matrix(mjd) * direction_vector(direction);
    Direction::new(
        v.y.atan2(v.x).rem_euclid(TAU),
        v.z.clamp(-1.0, 1.0).asin(),
    )
}

/// Celestial unit vector of a direction in its own equatorial frame.
#[must_use]
pub fn direction_vector(direction: Direction) -> Vector3<f64> {
    let (sin_a, cos_a) = direction.ra.sin_cos();
    let (sin_d, cos_d) = direction.dec.sin_cos();
    Vector3::new(cos_d * cos_a, cos_d * sin_a, sin_d)
}

/// ITRF unit vector towards a source at Greenwich hour angle `hour_angle`
/// and declination `dec`.
#[must_use]
pub fn source_vector(hour_angle: f64, dec: f64) -> Vector3<f64> {
    direction_vector(Direction::new(-hour_angle, dec))
}

/// Geodetic (WGS84) east longitude, latitude (radians) and height (m) of an
/// ITRF position.
#[must_use]
pub fn itrf_to_geodetic(position: [f64; 3]) -> (f64, f64, f64) {
    let [x, y, z] = position;
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let longitude = y.atan2(x);
    let p = x.hypot(y);

    if p < 1.0e-6 {
        let latitude = if z >= 0.0 { FRAC_PI_2 } else { -FRAC_PI_2 };
        let height = z.abs() - WGS84_A * (1.0 - WGS84_F);
        return (longitude, latitude, height);
    }

    let mut latitude = z.atan2(p * (1.0 - e2));
    let mut height = 0.0;
    for _ in 0..5 {
        let sin_lat = latitude.sin();
        let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        height = p / latitude.cos() - n;
        latitude = z.atan2(p * (1.0 - e2 * n / (n + height)));
    }
    (longitude, latitude, height)
}

/// ITRF unit vector of the local vertical at a geodetic position.
#[must_use]
pub fn zenith_vector(longitude: f64, latitude: f64) -> Vector3<f64> {
    direction_vector(Direction::new(longitude, latitude))
}
