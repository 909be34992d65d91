//! Watch-zone matching.
//!
//! Candidates pass three filters in order: category, severity, then
//! great-circle distance from the subscription's center. The radius test is
//! inclusive. Incidents without usable coordinates never match.

use std::f64::consts::{FRAC_PI_2, PI};

use crate::models::{BoundingBox, Coordinates, IncidentRecord, MatchResult, Subscription};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// Slack added to prefilter boxes so float rounding never drops an incident
// sitting on the radius.
const BBOX_MARGIN_DEG: f64 = 1e-6;

/// Great-circle distance in kilometers.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * h.min(1.0).sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Smallest latitude/longitude box containing every point within
/// `radius_km` of `center`.
///
/// Returns `None` when the zone reaches a pole or wraps the antimeridian; the
/// caller then has to scan without a spatial prefilter.
pub fn bounding_box(center: Coordinates, radius_km: f64) -> Option<BoundingBox> {
    if !center.is_valid() || !radius_km.is_finite() || radius_km < 0.0 {
        return None;
    }

    let angular = radius_km / EARTH_RADIUS_KM;
    let lat = center.latitude.to_radians();
    let south = lat - angular;
    let north = lat + angular;
    if south <= -FRAC_PI_2 || north >= FRAC_PI_2 {
        return None;
    }

    // Widest longitude offset of a spherical cap: sin(dlng) = sin(r) / cos(lat).
    let ratio = angular.sin() / lat.cos();
    if !(0.0..1.0).contains(&ratio) {
        return None;
    }
    let dlng = ratio.asin();
    let lng = center.longitude.to_radians();
    let west = lng - dlng;
    let east = lng + dlng;
    if west < -PI || east > PI {
        return None;
    }

    Some(BoundingBox::new(
        west.to_degrees() - BBOX_MARGIN_DEG,
        south.to_degrees() - BBOX_MARGIN_DEG,
        east.to_degrees() + BBOX_MARGIN_DEG,
        north.to_degrees() + BBOX_MARGIN_DEG,
    ))
}

/// Incidents from `candidates` that satisfy the subscription's criteria,
/// annotated with their distance from the watch-zone center. Order is not
/// meaningful.
pub fn match_incidents(sub: &Subscription, candidates: &[IncidentRecord]) -> Vec<MatchResult> {
    candidates
        .iter()
        .filter(|incident| sub.accepts_category(&incident.category))
        .filter(|incident| sub.accepts_severity(incident.severity))
        .filter_map(|incident| {
            let at = incident.location.valid_coordinates()?;
            let distance_km = haversine_km(sub.center, at);
            (distance_km <= sub.radius_km).then(|| MatchResult {
                subscription_id: sub.id,
                incident: incident.clone(),
                distance_km,
            })
        })
        .collect()
}
