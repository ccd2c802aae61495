//! Great-circle distance and a local tangent-plane projection.
//!
//! Only what the association engine needs: haversine distance, and a
//! spherical azimuthal-equidistant plane centred on a reference point with
//! its exact inverse. Distances are in meters, angles in degrees.

use crate::types::Position;

/// Mean earth radius in nautical miles.
const EARTH_RADIUS_NM: f64 = 3440.065;

/// Meters per nautical mile.
pub const NM_TO_M: f64 = 1852.0;

const EARTH_RADIUS_M: f64 = EARTH_RADIUS_NM * NM_TO_M;

/// Great-circle distance in nautical miles.
pub fn haversine_nm(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_NM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Great-circle distance in meters between two positions.
pub fn distance_m(a: &Position, b: &Position) -> f64 {
    haversine_nm(a.latitude, a.longitude, b.latitude, b.longitude) * NM_TO_M
}

/// Initial bearing from `a` to `b`, radians clockwise from north.
fn bearing_rad(a: &Position, b: &Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x)
}

/// Normalize longitude to [-180, 180).
fn wrap_lon(lon: f64) -> f64 {
    let l = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if l == -180.0 && lon > 0.0 {
        180.0
    } else {
        l
    }
}

// ---------------------------------------------------------------------------
// Local plane
// ---------------------------------------------------------------------------

/// Azimuthal-equidistant plane around an origin. `x` points east, `y` north.
///
/// Distances and bearings from the origin are preserved exactly, so
/// `unproject(project(p)) == p` up to floating point error.
#[derive(Debug, Clone, Copy)]
pub struct LocalPlane {
    origin: Position,
}

impl LocalPlane {
    pub fn new(origin: Position) -> Self {
        LocalPlane { origin }
    }

    pub fn origin(&self) -> &Position {
        &self.origin
    }

    /// Project a geodetic position to plane coordinates (meters).
    pub fn project(&self, pos: &Position) -> (f64, f64) {
        let d = distance_m(&self.origin, pos);
        if d == 0.0 {
            return (0.0, 0.0);
        }
        let brg = bearing_rad(&self.origin, pos);
        (d * brg.sin(), d * brg.cos())
    }

    /// Map plane coordinates (meters) back onto the sphere.
    pub fn unproject(&self, x: f64, y: f64) -> Position {
        let d = x.hypot(y);
        if d == 0.0 {
            return self.origin;
        }
        let brg = x.atan2(y);
        let delta = d / EARTH_RADIUS_M;

        let lat1 = self.origin.latitude.to_radians();
        let lon1 = self.origin.longitude.to_radians();

        let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * brg.cos()).asin();
        let lon2 = lon1
            + (brg.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

        Position::new(lat2.to_degrees(), wrap_lon(lon2.to_degrees()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
