//! mapview_core - asynchronous tile cache and view pipeline for an
//! offline tiled-map viewer.
//!
//! Maps are pyramids of pre-rendered image tiles, stored either in
//! packed random-access archives or as loose files, described by a small
//! text manifest. The crate provides:
//!
//! - a memory-bounded tile cache with a priority-aware eviction policy
//!   and a cooperative scheduler that interleaves tile loads with UI
//!   redraws ([`cache::TileCache`])
//! - a view owning an ordered stack of rendering layers with consistent
//!   pixel/tile geometry across zoom levels ([`view::View`])
//! - the map layer that requests visible, halo and prefetch tiles in a
//!   deterministic order ([`map_layer::MapLayer`])
//! - the packed tile archive ([`archive::TileArchive`])
//! - overlay layers: coordinate grid, GPS cursor, waypoint routes
//!
//! Everything runs on the host's single-threaded event loop; the crate
//! is driven through the collaborator traits in [`shell`].

pub mod archive;
pub mod cache;
pub mod decoder;
pub mod error;
pub mod gps;
pub mod gps_layer;
pub mod grid_layer;
pub mod map;
pub mod map_layer;
pub mod shell;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod view;
pub mod waypoints;
pub mod waypoints_layer;

pub use archive::{ItemCursor, TileArchive};
pub use cache::{
    CacheClient, ClientId, MapId, TileCache, TileKey, TileNode, TileQuery, MAX_PRIO, MIN_PRIO,
};
pub use decoder::Pixmap;
pub use error::{MapError, MapResult};
pub use gps::{GpsFix, GpsLink, GpsMode, GpsMsg, GpsTransport};
pub use gps_layer::GpsLayer;
pub use grid_layer::GridLayer;
pub use map::{GeoRef, Map, MapFormat, MapRegistry};
pub use map_layer::MapLayer;
pub use shell::{
    CacheTask, Canvas, Projection, ProjectedPoint, Shell, TaskOutcome, TextAnchor, TimerId,
    TimerOutcome,
};
pub use view::{Coord, Layer, PixRect, View, ViewChange, ViewState};
pub use waypoints::{Route, Waypoint};
pub use waypoints_layer::WaypointsLayer;
