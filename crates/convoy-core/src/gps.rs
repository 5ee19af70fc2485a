//! GPS signal cleaning.
//!
//! Pure functions over coordinates and route points: great-circle distance,
//! plausibility filtering of fixes, and reconciliation of device-reported
//! distance against server-side summation.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{round2, Coordinates, RoutePoint};

/// Fastest speed considered physically reasonable for a rider.
pub const DEFAULT_SPEED_CEILING_KMH: f64 = 250.0;

/// Relative divergence between client and server distance that gets logged.
pub const DEFAULT_TOLERANCE_RATIO: f64 = 0.5;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Unrounded haversine distance in kilometers.
#[must_use]
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Great-circle distance between two coordinates, in km rounded to 2 decimals.
#[must_use]
pub fn segment_distance(a: Coordinates, b: Coordinates) -> f64 {
    round2(haversine_km(a, b))
}

/// Seconds elapsed between two fixes. Negative when out of order.
#[must_use]
pub fn elapsed_seconds(from: &RoutePoint, to: &RoutePoint) -> f64 {
    (to.recorded_at - from.recorded_at).num_milliseconds() as f64 / 1000.0
}

/// Speed implied by travelling from one fix to another, in km/h.
///
/// Returns `None` when the fixes are out of order, or share a timestamp
/// while being at different positions.
#[must_use]
pub fn implied_speed_kmh(from: &RoutePoint, to: &RoutePoint) -> Option<f64> {
    let km = haversine_km(from.coordinates, to.coordinates);
    let secs = elapsed_seconds(from, to);
    if secs < 0.0 {
        return None;
    }
    if secs == 0.0 {
        return (km == 0.0).then_some(0.0);
    }
    Some(km / (secs / 3600.0))
}

/// Average speed in km/h, or 0 when no moving time has accrued.
#[must_use]
pub fn average_speed(distance_km: f64, moving_seconds: f64) -> f64 {
    if moving_seconds <= 0.0 {
        return 0.0;
    }
    distance_km / (moving_seconds / 3600.0)
}

/// Where a reconciled distance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceSource {
    /// Server-side summation of accepted fixes.
    Calculated,
    /// The device's own figure, trusted.
    Client,
    /// The device's figure, capped at the plausibility ceiling.
    Capped,
}

/// Outcome of [`GpsSanitizer::reconcile_distance`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconciledDistance {
    pub km: f64,
    pub source: DistanceSource,
    /// Client and server disagreed by more than the tolerance ratio.
    pub diverged: bool,
}

/// Plausibility policy applied to incoming fixes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsSanitizer {
    /// Maximum plausible speed in km/h.
    pub ceiling_kmh: f64,
    /// Divergence ratio above which client distances are logged.
    pub tolerance_ratio: f64,
}

impl Default for GpsSanitizer {
    fn default() -> Self {
        Self {
            ceiling_kmh: DEFAULT_SPEED_CEILING_KMH,
            tolerance_ratio: DEFAULT_TOLERANCE_RATIO,
        }
    }
}

impl GpsSanitizer {
    #[must_use]
    pub fn new(ceiling_kmh: f64, tolerance_ratio: f64) -> Self {
        Self {
            ceiling_kmh,
            tolerance_ratio,
        }
    }

    /// Whether `candidate` can follow `last_accepted` without exceeding the
    /// ceiling.
    #[must_use]
    pub fn is_plausible(&self, last_accepted: &RoutePoint, candidate: &RoutePoint) -> bool {
        implied_speed_kmh(last_accepted, candidate).is_some_and(|kmh| kmh <= self.ceiling_kmh)
    }

    /// Drop fixes that imply an impossible speed.
    ///
    /// Each candidate is compared with the last accepted point, so a single
    /// bad fix never causes the following good fixes to be rejected. The
    /// first point is always accepted.
    #[must_use]
    pub fn filter_outliers(&self, points: &[RoutePoint]) -> Vec<RoutePoint> {
        let mut kept: Vec<RoutePoint> = Vec::with_capacity(points.len());

        for point in points {
            match kept.last() {
                Some(last) if !self.is_plausible(last, point) => {
                    debug!(
                        latitude = point.coordinates.latitude,
                        longitude = point.coordinates.longitude,
                        speed_kmh = ?implied_speed_kmh(last, point),
                        "Dropped implausible fix"
                    );
                }
                _ => kept.push(*point),
            }
        }

        kept
    }

    /// Decide which distance to record.
    ///
    /// Without a client figure the calculated one is used. A client figure
    /// implying a speed above the ceiling is capped to `ceiling * hours`.
    /// Otherwise the client is trusted, since it may come from road-snapped
    /// routing, and a large divergence is only logged.
    #[must_use]
    pub fn reconcile_distance(
        &self,
        client_km: Option<f64>,
        calculated_km: f64,
        elapsed_seconds: f64,
    ) -> ReconciledDistance {
        let Some(client_km) = client_km else {
            return ReconciledDistance {
                km: calculated_km,
                source: DistanceSource::Calculated,
                diverged: false,
            };
        };

        let hours = elapsed_seconds.max(0.0) / 3600.0;
        let cap = self.ceiling_kmh * hours;
        if client_km > cap {
            warn!(
                client_km,
                calculated_km,
                elapsed_seconds,
                cap_km = cap,
                "Client distance exceeds plausibility ceiling, capping"
            );
            return ReconciledDistance {
                km: cap,
                source: DistanceSource::Capped,
                diverged: true,
            };
        }

        let diverged = (client_km - calculated_km).abs() > self.tolerance_ratio * calculated_km;
        if diverged {
            warn!(
                client_km,
                calculated_km,
                tolerance = self.tolerance_ratio,
                "Client distance diverges from calculated distance"
            );
        }

        ReconciledDistance {
            km: client_km,
            source: DistanceSource::Client,
            diverged,
        }
    }

    /// Average speed for a finished instance, never above the ceiling.
    #[must_use]
    pub fn final_average_speed(&self, distance_km: f64, moving_seconds: f64) -> f64 {
        average_speed(distance_km, moving_seconds).min(self.ceiling_kmh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn point(lat: f64, lon: f64, secs: i64) -> RoutePoint {
        RoutePoint::new(Coordinates::new(lat, lon), epoch() + Duration::seconds(secs))
    }

    #[test]
    fn test_segment_distance() {
        // One degree of latitude is ~111.19 km on a 6371 km sphere.
        let d = segment_distance(Coordinates::new(0.0, 0.0), Coordinates::new(1.0, 0.0));
        assert_eq!(d, 111.19);

        let same = segment_distance(Coordinates::new(45.0, 7.0), Coordinates::new(45.0, 7.0));
        assert_eq!(same, 0.0);
    }

    #[test]
    fn test_filter_drops_spike_without_cascading() {
        let sanitizer = GpsSanitizer::default();
        let p0 = point(0.0, 0.0, 0);
        let p1 = point(10.0, 0.0, 1);
        let p2 = point(0.001, 0.0, 5);

        let kept = sanitizer.filter_outliers(&[p0, p1, p2]);
        assert_eq!(kept, vec![p0, p2]);
    }

    #[test]
    fn test_filter_rejects_out_of_order_and_teleports() {
        let sanitizer = GpsSanitizer::default();
        let p0 = point(0.0, 0.0, 10);
        let earlier = point(0.0001, 0.0, 5);
        let same_instant_elsewhere = point(0.01, 0.0, 10);
        let good = point(0.0002, 0.0, 20);

        let kept = sanitizer.filter_outliers(&[p0, earlier, same_instant_elsewhere, good]);
        assert_eq!(kept, vec![p0, good]);
    }

    #[test]
    fn test_filter_keeps_everything_plausible() {
        let sanitizer = GpsSanitizer::default();
        let points: Vec<_> = (0..10).map(|i| point(0.0009 * i as f64, 0.0, 3 * i)).collect();
        assert_eq!(sanitizer.filter_outliers(&points).len(), 10);
        assert!(sanitizer.filter_outliers(&[]).is_empty());
    }

    #[test]
    fn test_reconcile_caps_impossible_client_distance() {
        let sanitizer = GpsSanitizer::default();
        let result = sanitizer.reconcile_distance(Some(500.0), 120.0, 3600.0);
        assert_eq!(result.km, 250.0);
        assert_eq!(result.source, DistanceSource::Capped);
    }

    #[test]
    fn test_reconcile_trusts_plausible_client() {
        let sanitizer = GpsSanitizer::default();

        let close = sanitizer.reconcile_distance(Some(10.5), 10.0, 1800.0);
        assert_eq!(close.km, 10.5);
        assert_eq!(close.source, DistanceSource::Client);
        assert!(!close.diverged);

        // Trusted even when it diverges; only flagged.
        let far = sanitizer.reconcile_distance(Some(20.0), 10.0, 1800.0);
        assert_eq!(far.km, 20.0);
        assert!(far.diverged);
    }

    #[test]
    fn test_reconcile_without_client_uses_calculated() {
        let result = GpsSanitizer::default().reconcile_distance(None, 3.2, 600.0);
        assert_eq!(result.km, 3.2);
        assert_eq!(result.source, DistanceSource::Calculated);
    }

    #[test]
    fn test_average_speed() {
        assert_eq!(average_speed(10.0, 0.0), 0.0);
        assert_eq!(average_speed(10.0, -5.0), 0.0);
        assert_eq!(average_speed(30.0, 3600.0), 30.0);

        let sanitizer = GpsSanitizer::default();
        assert_eq!(sanitizer.final_average_speed(1000.0, 3600.0), 250.0);
    }
}
