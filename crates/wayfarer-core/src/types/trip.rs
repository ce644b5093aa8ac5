//! Trip and place entities mirrored from the server

use serde::{Deserialize, Serialize};

use super::TripId;

/// A trip mirrored from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    /// Stable identifier
    pub id: TripId,
    /// Trip title
    pub title: String,
    /// Start of the trip (millis), if scheduled
    pub starts_at: Option<i64>,
    /// End of the trip (millis), if scheduled
    pub ends_at: Option<i64>,
}

/// A saved place attached to a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    /// Stable identifier
    pub id: String,
    /// Trip this place belongs to
    pub trip_id: TripId,
    /// Place name
    pub name: String,
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
}
