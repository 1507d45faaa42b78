//! Waypoint routes and the GeoJSON loader.

use std::fs;
use std::path::Path;

use log::warn;
use serde::Deserialize;

use crate::error::{MapError, MapResult};

/// One waypoint in WGS-84; altitude is NaN when unknown.
#[derive(Debug, Clone)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub name: Option<String>,
}

/// An ordered list of waypoints.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub name: Option<String>,
    pub waypoints: Vec<Waypoint>,
}

#[derive(Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Properties,
    geometry: Option<Geometry>,
}

#[derive(Deserialize, Default)]
struct Properties {
    name: Option<String>,
}

#[derive(Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    /// GeoJSON positions are `[lon, lat]`.
    coordinates: Vec<[f64; 2]>,
}

impl Route {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            waypoints: Vec::new(),
        }
    }

    pub fn push(&mut self, waypoint: Waypoint) {
        self.waypoints.push(waypoint);
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Load a route from a GeoJSON `LineString` feature file.
    pub fn from_geojson(path: &Path) -> MapResult<Route> {
        let text = fs::read_to_string(path)?;
        Self::from_geojson_str(&text)
    }

    /// Parse a GeoJSON `LineString` feature.
    pub fn from_geojson_str(text: &str) -> MapResult<Route> {
        let feature: Feature = serde_json::from_str(text)?;

        let Some(geometry) = feature.geometry else {
            return Err(MapError::Manifest(
                "GeoJSON feature has no geometry".into(),
            ));
        };

        if geometry.kind != "LineString" {
            warn!("expected 'LineString' geometry, got '{}'", geometry.kind);
        }

        let waypoints = geometry
            .coordinates
            .iter()
            .map(|&[lon, lat]| Waypoint {
                lat,
                lon,
                alt: f64::NAN,
                name: None,
            })
            .collect();

        Ok(Route {
            name: feature.properties.name,
            waypoints,
        })
    }
}
