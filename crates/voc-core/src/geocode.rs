//! Optional reverse geocoding of vehicle positions

use async_trait::async_trait;

/// Resolves GPS coordinates to a human-readable address.
///
/// Consumers hold an `Arc<dyn Geocoder>`; the default is [`NoGeocoder`].
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Return an address for the coordinates, or `None` if unavailable
    async fn reverse(&self, latitude: f64, longitude: f64) -> Option<String>;
}

/// Geocoder that never resolves anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeocoder;

#[async_trait]
impl Geocoder for NoGeocoder {
    async fn reverse(&self, _latitude: f64, _longitude: f64) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_geocoder_resolves_nothing() {
        assert_eq!(NoGeocoder.reverse(57.7, 11.9).await, None);
    }
}
