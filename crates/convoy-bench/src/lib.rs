//! Shared fixtures for the Convoy benchmarks.

use chrono::{DateTime, Duration, TimeZone, Utc};
use convoy_core::{Coordinates, MemberIdentity, RoutePoint};

/// Start of every synthetic ride.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A northbound ride of `len` fixes, 100 m every 10 s (36 km/h).
///
/// Every `glitch_every`-th fix jumps a degree east, far beyond any plausible
/// speed; pass 0 for a clean track.
#[must_use]
pub fn synthetic_route(len: usize, glitch_every: usize) -> Vec<RoutePoint> {
    let start = epoch();
    (0..len)
        .map(|i| {
            let glitch = glitch_every != 0 && i != 0 && i % glitch_every == 0;
            let longitude = if glitch { 5.0 } else { 4.0 };
            RoutePoint::new(
                Coordinates::new(45.0 + i as f64 * 0.0009, longitude),
                start + Duration::seconds(i as i64 * 10),
            )
        })
        .collect()
}

/// Identities `rider-0`, `rider-1`, ...
#[must_use]
pub fn riders(count: usize) -> Vec<MemberIdentity> {
    (0..count)
        .map(|i| MemberIdentity::new(format!("rider-{i}"), format!("Rider {i}")))
        .collect()
}
