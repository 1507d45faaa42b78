//! Map descriptors and the manifest loader.
//!
//! A map is described by a small text manifest of `key value` lines next
//! to its tile data. Tiles for each pyramid level live either in a packed
//! archive (`NN.pia` sibling file) or as loose files under
//! `NN/XXXX/YYYY.<suffix>`. Level 0 is the highest resolution; every
//! further level halves the tile counts, rounded up.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{error, info, warn};

use crate::archive::TileArchive;
use crate::cache::{MapId, TileCache, TileNode};
use crate::decoder;
use crate::error::{MapError, MapResult};

/// Georeference affine between pixel space and projected coordinates.
///
/// Derived from two reference points: `(pox, poy)`/`(cox, coy)` is the
/// first point in pixels/coordinates, `(psx, psy)`/`(csx, csy)` the
/// deltas to the second. Coordinates are 28.4 fixed-point.
#[derive(Debug, Clone, Copy)]
pub struct GeoRef {
    pub pox: i32,
    pub poy: i32,
    pub psx: i32,
    pub psy: i32,
    pub cox: i32,
    pub coy: i32,
    pub csx: i32,
    pub csy: i32,
}

impl GeoRef {
    /// Pixel-based identity reference: one pixel per projected meter.
    fn pixel_based() -> Self {
        Self {
            pox: 0,
            poy: 0,
            psx: 1,
            psy: 1,
            cox: 0,
            coy: 0,
            csx: 16,
            csy: 16,
        }
    }
}

/// Backing store of one pyramid level.
#[derive(Debug)]
enum LevelStore {
    /// Packed archive; carries its own empty-slot color.
    Archive(TileArchive),
    /// Loose files `dir/NN/XXXX/YYYY.<suffix>`.
    Files {
        dir: PathBuf,
        suffix: String,
        empty_color: u32,
    },
}

/// Immutable map descriptor with per-level tile stores.
#[derive(Debug)]
pub struct Map {
    id: MapId,
    map_w: u32,
    map_h: u32,
    tile_w: u32,
    tile_h: u32,
    num_levels: u32,
    tiles_x: Vec<u32>,
    tiles_y: Vec<u32>,
    geo: GeoRef,
    epsg: u32,
    levels: Vec<LevelStore>,
}

impl Map {
    /// Load a map from its manifest file and register it with the cache.
    pub fn load(path: &Path, cache: &mut TileCache) -> MapResult<Rc<Map>> {
        let text = fs::read_to_string(path)?;
        let m = Manifest::parse(&text, path)?;

        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        let geo = match (m.point1, m.point2) {
            (Some(p1), Some(p2)) => {
                // manifest coordinates are whole units, internal fixed
                // point is 28.4
                let (c1x, c1y) = (p1.cx * 16, p1.cy * 16);
                let (c2x, c2y) = (p2.cx * 16, p2.cy * 16);
                let geo = GeoRef {
                    pox: p1.px,
                    poy: p1.py,
                    cox: c1x,
                    coy: c1y,
                    psx: p2.px - p1.px,
                    psy: p2.py - p1.py,
                    csx: c2x - c1x,
                    csy: c2y - c1y,
                };
                if geo.psx == 0 || geo.psy == 0 || geo.csx == 0 || geo.csy == 0 {
                    return Err(MapError::Manifest(format!(
                        "'point-1' and 'point-2' coincide in '{}'",
                        path.display()
                    )));
                }
                geo
            }
            _ => GeoRef::pixel_based(),
        };

        let mut tiles_x = Vec::with_capacity(m.levels as usize);
        let mut tiles_y = Vec::with_capacity(m.levels as usize);
        let mut stores = Vec::with_capacity(m.levels as usize);

        let mut nx = (m.image_w + m.tile_w - 1) / m.tile_w;
        let mut ny = (m.image_h + m.tile_h - 1) / m.tile_h;

        for l in 0..m.levels {
            let pia_path = dir.join(format!("{:02}.pia", l));
            if pia_path.exists() {
                info!("found tile archive '{}'", pia_path.display());
                stores.push(LevelStore::Archive(TileArchive::open(&pia_path, false)?));
            } else {
                let suffix = if l < m.jpeg_level {
                    m.suffix.clone()
                } else {
                    "jpeg".to_string()
                };
                stores.push(LevelStore::Files {
                    dir: dir.clone(),
                    suffix,
                    empty_color: m.empty_color,
                });
            }

            tiles_x.push(nx);
            tiles_y.push(ny);
            nx = (nx + 1) / 2;
            ny = (ny + 1) / 2;
        }

        let id = cache.register_map(m.tile_w, m.tile_h, m.levels);

        Ok(Rc::new(Map {
            id,
            map_w: m.image_w,
            map_h: m.image_h,
            tile_w: m.tile_w,
            tile_h: m.tile_h,
            num_levels: m.levels,
            tiles_x,
            tiles_y,
            geo,
            epsg: m.projection,
            levels: stores,
        }))
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn map_w(&self) -> u32 {
        self.map_w
    }

    pub fn map_h(&self) -> u32 {
        self.map_h
    }

    pub fn tile_w(&self) -> u32 {
        self.tile_w
    }

    pub fn tile_h(&self) -> u32 {
        self.tile_h
    }

    pub fn num_levels(&self) -> u32 {
        self.num_levels
    }

    /// Tile count in x at `level`.
    pub fn tiles_x(&self, level: u32) -> u32 {
        self.tiles_x.get(level as usize).copied().unwrap_or(0)
    }

    /// Tile count in y at `level`.
    pub fn tiles_y(&self, level: u32) -> u32 {
        self.tiles_y.get(level as usize).copied().unwrap_or(0)
    }

    pub fn geo(&self) -> &GeoRef {
        &self.geo
    }

    /// EPSG projection id, 0 when the map is not georeferenced.
    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    /// Read one tile from the level's backing store.
    ///
    /// Total: every outcome maps to a node. An I/O or decode failure
    /// becomes [`TileNode::Error`], an empty archive slot or missing
    /// loose file becomes [`TileNode::Color`] with the level's empty
    /// color, success becomes [`TileNode::Data`]. Paired with one cache
    /// insertion by [`TileCache::load_tile`].
    pub fn read_tile(&self, level: u32, x: u32, y: u32) -> TileNode {
        let Some(store) = self.levels.get(level as usize) else {
            warn!("tile read for level {} out of range", level);
            return TileNode::Error;
        };

        match store {
            LevelStore::Archive(pia) => match pia.read_whole(x, y) {
                Ok(Some(buf)) => decode_node(&buf, level, x, y),
                Ok(None) => TileNode::Color(pia.empty_color()),
                Err(e) => {
                    warn!("archive read of L{} X{} Y{} failed: {}", level, x, y, e);
                    TileNode::Error
                }
            },
            LevelStore::Files {
                dir,
                suffix,
                empty_color,
            } => {
                let path = dir.join(format!("{:02}/{:04}/{:04}.{}", level, x, y, suffix));
                if !path.exists() {
                    return TileNode::Color(*empty_color);
                }
                match fs::read(&path) {
                    Ok(buf) => decode_node(&buf, level, x, y),
                    Err(e) => {
                        warn!("tile read of '{}' failed: {}", path.display(), e);
                        TileNode::Error
                    }
                }
            }
        }
    }
}

fn decode_node(buf: &[u8], level: u32, x: u32, y: u32) -> TileNode {
    match decoder::decode_tile(buf) {
        Ok(pm) => TileNode::Data(pm),
        Err(e) => {
            warn!("decode of L{} X{} Y{} failed: {}", level, x, y, e);
            TileNode::Error
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RefPoint {
    px: i32,
    py: i32,
    cx: i32,
    cy: i32,
}

#[derive(Debug)]
struct Manifest {
    image_w: u32,
    image_h: u32,
    tile_w: u32,
    tile_h: u32,
    suffix: String,
    levels: u32,
    projection: u32,
    empty_color: u32,
    jpeg_level: u32,
    point1: Option<RefPoint>,
    point2: Option<RefPoint>,
}

impl Manifest {
    fn parse(text: &str, path: &Path) -> MapResult<Self> {
        let mut m = Manifest {
            image_w: 0,
            image_h: 0,
            tile_w: 0,
            tile_h: 0,
            suffix: String::new(),
            levels: 0,
            projection: 0,
            empty_color: 0xFFFF_FFFF,
            jpeg_level: u32::MAX,
            point1: None,
            point2: None,
        };

        for line in text.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let Some(&key) = tokens.first() else {
                continue;
            };

            let bad_line = || {
                MapError::Manifest(format!(
                    "unparsable line in '{}': '{}'",
                    path.display(),
                    line
                ))
            };

            match key {
                "image-width" => m.image_w = parse_value(&tokens, bad_line)?,
                "image-height" => m.image_h = parse_value(&tokens, bad_line)?,
                "tile-width" => m.tile_w = parse_value(&tokens, bad_line)?,
                "tile-height" => m.tile_h = parse_value(&tokens, bad_line)?,
                "levels" => m.levels = parse_value(&tokens, bad_line)?,
                "projection" => m.projection = parse_value(&tokens, bad_line)?,
                "jpeg-level" => m.jpeg_level = parse_value(&tokens, bad_line)?,
                "tile-format" => {
                    if tokens.len() != 2 {
                        return Err(bad_line());
                    }
                    m.suffix = tokens[1].to_string();
                }
                "empty-color" => {
                    if tokens.len() != 2 {
                        return Err(bad_line());
                    }
                    m.empty_color =
                        u32::from_str_radix(tokens[1], 16).map_err(|_| bad_line())?;
                }
                "point-1" => m.point1 = Some(parse_point(&tokens, bad_line)?),
                "point-2" => m.point2 = Some(parse_point(&tokens, bad_line)?),
                _ => warn!(
                    "unsupported option in '{}': '{}'",
                    path.display(),
                    line
                ),
            }
        }

        let mut ok = true;
        let mut require = |cond: bool, what: &str| {
            if !cond {
                error!("'{}' is missing in '{}'", what, path.display());
                ok = false;
            }
        };
        require(m.image_w != 0, "image-width");
        require(m.image_h != 0, "image-height");
        require(m.tile_w != 0, "tile-width");
        require(m.tile_h != 0, "tile-height");
        require(!m.suffix.is_empty(), "tile-format");
        require(m.levels != 0, "levels");

        if m.point1.is_some() != m.point2.is_some() {
            error!(
                "'point-1' and 'point-2' are not used together in '{}'",
                path.display()
            );
            ok = false;
        }

        if !ok {
            return Err(MapError::Manifest(format!(
                "required keys missing in '{}'",
                path.display()
            )));
        }

        Ok(m)
    }
}

fn parse_value<T: std::str::FromStr>(
    tokens: &[&str],
    bad_line: impl Fn() -> MapError,
) -> MapResult<T> {
    if tokens.len() != 2 {
        return Err(bad_line());
    }
    tokens[1].parse().map_err(|_| bad_line())
}

fn parse_point(tokens: &[&str], bad_line: impl Fn() -> MapError) -> MapResult<RefPoint> {
    if tokens.len() != 5 {
        return Err(bad_line());
    }
    let mut vals = [0i32; 4];
    for (v, t) in vals.iter_mut().zip(&tokens[1..5]) {
        *v = t.parse().map_err(|_| bad_line())?;
    }
    Ok(RefPoint {
        px: vals[0],
        py: vals[1],
        cx: vals[2],
        cy: vals[3],
    })
}

/// A registered map file format, keyed by file suffix.
pub trait MapFormat {
    fn suffix(&self) -> &str;
    fn load(&self, path: &Path, cache: &mut TileCache) -> MapResult<Rc<Map>>;
}

/// The built-in manifest format (`.tmc`).
pub struct ManifestFormat;

impl MapFormat for ManifestFormat {
    fn suffix(&self) -> &str {
        "tmc"
    }

    fn load(&self, path: &Path, cache: &mut TileCache) -> MapResult<Rc<Map>> {
        Map::load(path, cache)
    }
}

/// Registry of map loaders; dispatches on the file suffix.
pub struct MapRegistry {
    formats: Vec<Box<dyn MapFormat>>,
}

impl MapRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// Registry with the built-in formats.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(ManifestFormat));
        reg
    }

    /// Register a format. Later registrations take precedence over
    /// earlier ones with the same suffix.
    pub fn register(&mut self, format: Box<dyn MapFormat>) {
        self.formats.insert(0, format);
    }

    /// Load a map, dispatching on the path's file suffix.
    pub fn load(&self, path: &Path, cache: &mut TileCache) -> MapResult<Rc<Map>> {
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        for format in &self.formats {
            if format.suffix() == suffix {
                return format.load(path, cache);
            }
        }

        Err(MapError::Manifest(format!(
            "no loader registered for '{}'",
            path.display()
        )))
    }
}

impl Default for MapRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
