//! Great-circle distance on a sphere scaled by a study's km-per-degree.

use crate::models::GeoPoint;

/// Central angle between two points, in degrees (haversine form).
pub fn arc_degrees(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());
    c.to_degrees()
}

/// Distance in kilometres. Regulatory distance tables are calibrated to a
/// specific earth approximation, so the scale comes from the study.
pub fn distance_km(a: &GeoPoint, b: &GeoPoint, km_per_degree: f64) -> f64 {
    arc_degrees(a, b) * km_per_degree
}

/// Smallest distance between any pair drawn from two site sets.
pub fn min_distance_km(a: &[GeoPoint], b: &[GeoPoint], km_per_degree: f64) -> Option<f64> {
    a.iter()
        .flat_map(|p| b.iter().map(move |q| distance_km(p, q, km_per_degree)))
        .min_by(|x, y| x.total_cmp(y))
}
