use async_trait::async_trait;

/// Straight-line distance between two coordinates, in kilometers. Used to
/// rank SOS candidate clinics and to estimate travel time for home visits.
#[async_trait]
pub trait DistanceProvider: Send + Sync {
    async fn distance_km(&self, lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64;
}

/// Great-circle distance via the haversine formula. Good enough for ranking
/// clinics within a city; a routing API can replace it behind the same trait.
pub struct HaversineDistanceProvider;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[async_trait]
impl DistanceProvider for HaversineDistanceProvider {
    async fn distance_km(&self, lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
        haversine_km(lat1, lng1, lat2, lng2)
    }
}

pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}
