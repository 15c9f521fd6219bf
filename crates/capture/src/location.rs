//! Location sources consulted when a depth snapshot is persisted.

use std::sync::{Arc, RwLock};

use serde::Serialize;

/// Environment variable overriding the fixed latitude.
pub const LATITUDE_ENV: &str = "STREET_RECORDER_LAT";
/// Environment variable overriding the fixed longitude.
pub const LONGITUDE_ENV: &str = "STREET_RECORDER_LON";

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Best-effort current position, sampled synchronously at persistence time.
pub trait LocationProvider: Send + Sync {
    fn current_coordinate(&self) -> Coordinate;
}

/// Provider that always reports the same coordinate.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedLocation(pub Coordinate);

impl FixedLocation {
    /// Read the coordinate from the environment, defaulting each axis to `0.0`.
    pub fn from_env() -> Self {
        let axis = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|value| value.trim().parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        Self(Coordinate::new(axis(LATITUDE_ENV), axis(LONGITUDE_ENV)))
    }
}

impl LocationProvider for FixedLocation {
    fn current_coordinate(&self) -> Coordinate {
        self.0
    }
}

/// Coordinate cell updated by an external receiver thread and read by the pipeline.
#[derive(Clone, Debug, Default)]
pub struct SharedLocation {
    inner: Arc<RwLock<Coordinate>>,
}

impl SharedLocation {
    pub fn new(initial: Coordinate) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn update(&self, coordinate: Coordinate) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = coordinate;
        }
    }
}

impl LocationProvider for SharedLocation {
    fn current_coordinate(&self) -> Coordinate {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_location_is_constant() {
        let provider = FixedLocation(Coordinate::new(47.6062, -122.3321));
        assert_eq!(provider.current_coordinate(), provider.current_coordinate());
        assert_eq!(provider.current_coordinate().longitude, -122.3321);
    }

    #[test]
    fn shared_location_reflects_latest_update() {
        let provider = SharedLocation::default();
        assert_eq!(provider.current_coordinate(), Coordinate::default());

        let feeder = provider.clone();
        std::thread::spawn(move || feeder.update(Coordinate::new(1.5, 2.5)))
            .join()
            .unwrap();
        assert_eq!(provider.current_coordinate(), Coordinate::new(1.5, 2.5));
    }
}
