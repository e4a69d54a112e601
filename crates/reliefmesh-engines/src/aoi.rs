//! Area-of-interest resolution boundary.
//!
//! Intake resolves a region name into a GeoJSON boundary before writing the
//! request record; failure here aborts intake synchronously.

use async_trait::async_trait;

use crate::EngineError;

/// Resolves a region name to a serialized GeoJSON area of interest.
#[async_trait]
pub trait AoiResolver: Send + Sync {
    async fn resolve(&self, region_name: &str) -> Result<String, EngineError>;
}

/// Development resolver: wraps the region name into a GeoJSON feature with
/// no geometry, so downstream consumers always receive a well-formed
/// document.
pub struct StaticAoiResolver;

#[async_trait]
impl AoiResolver for StaticAoiResolver {
    async fn resolve(&self, region_name: &str) -> Result<String, EngineError> {
        let feature = serde_json::json!({
            "type": "Feature",
            "properties": { "region_name": region_name },
            "geometry": null,
        });
        serde_json::to_string(&feature).map_err(|e| EngineError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver_embeds_region_name() {
        tokio_test::block_on(async {
            let aoi = StaticAoiResolver.resolve("Cebu Province").await.unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&aoi).unwrap();
            assert_eq!(parsed["properties"]["region_name"], "Cebu Province");
            assert_eq!(parsed["type"], "Feature");
        });
    }
}
