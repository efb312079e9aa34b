//! Device position for location sharing.

use std::fmt;
use std::str::FromStr;

use petchat_proto::message::parse_lat_lng;
use serde::Deserialize;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct Coordinates {
    /// Latitude, -90..=90.
    pub lat: f64,
    /// Longitude, -180..=180.
    pub lng: f64,
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

impl FromStr for Coordinates {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_lat_lng(s)
            .map(|(lat, lng)| Self { lat, lng })
            .ok_or_else(|| LocationError::Unavailable(format!("invalid coordinates {s:?}")))
    }
}

impl TryFrom<String> for Coordinates {
    type Error = LocationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Why no position could be obtained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    /// The user (or platform policy) refused access.
    #[error("location permission denied")]
    PermissionDenied,

    /// No fix could be obtained.
    #[error("location unavailable: {0}")]
    Unavailable(String),
}

/// Source of the device's current position.
pub trait LocationProvider: Send + Sync {
    /// Obtain the current position.
    fn current_position(
        &self,
    ) -> impl std::future::Future<Output = Result<Coordinates, LocationError>> + Send;
}

/// Always reports the same position.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub Coordinates);

impl LocationProvider for FixedLocation {
    async fn current_position(&self) -> Result<Coordinates, LocationError> {
        Ok(self.0)
    }
}

/// A device without location access.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeniedLocation;

impl LocationProvider for DeniedLocation {
    async fn current_position(&self) -> Result<Coordinates, LocationError> {
        Err(LocationError::PermissionDenied)
    }
}

/// Either a configured fixed position or no access at all.
#[derive(Debug, Clone, Copy)]
pub enum ConfiguredLocation {
    /// A fixed position from configuration.
    Fixed(FixedLocation),
    /// No position configured.
    Denied(DeniedLocation),
}

impl From<Option<Coordinates>> for ConfiguredLocation {
    fn from(value: Option<Coordinates>) -> Self {
        value.map_or(Self::Denied(DeniedLocation), |c| {
            Self::Fixed(FixedLocation(c))
        })
    }
}

impl LocationProvider for ConfiguredLocation {
    async fn current_position(&self) -> Result<Coordinates, LocationError> {
        match self {
            Self::Fixed(fixed) => fixed.current_position().await,
            Self::Denied(denied) => denied.current_position().await,
        }
    }
}
