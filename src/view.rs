//! View state and the rendering layer stack.
//!
//! The view owns what the user sees: the center in projected
//! coordinates, the zoom (a power-of-two divisor matching a pyramid
//! level), the viewport size and an ordered list of layers. The bottom
//! layer draws the map, overlays (grid, GPS cursor, waypoint routes) sit
//! on top. All mutations notify the layers synchronously and then ask
//! the host toolkit for a repaint; the actual paint arrives later
//! through [`View::paint`].

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};

use crate::cache::TileCache;
use crate::gps::GpsMsg;
use crate::gps_layer::GpsLayer;
use crate::grid_layer::GridLayer;
use crate::map::Map;
use crate::map_layer::MapLayer;
use crate::shell::{Canvas, Projection, Shell};

/// Point in projected coordinates, 28.4 fixed-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

/// Pixel rectangle `[lx, hx) x [ly, hy)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixRect {
    pub lx: i32,
    pub ly: i32,
    pub hx: i32,
    pub hy: i32,
}

/// Geometry change delivered to every layer before the repaint that
/// depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChange {
    Init,
    Finish,
    Move,
    Resize,
    Scale,
}

/// A rendering layer.
///
/// `notify` prepares the layer for a geometry change; `render` draws the
/// layer's part of a dirty rectangle. Layers are stacked front to back
/// and painted back to front.
pub trait Layer {
    fn notify(&mut self, view: &ViewState, change: ViewChange) {
        let _ = (view, change);
    }

    fn render(&mut self, view: &ViewState, canvas: &mut dyn Canvas, rect: &PixRect);
}

/// The geometry part of a view, shared read-only with the layers.
#[derive(Debug, Clone)]
pub struct ViewState {
    /// False until the first resize delivered a viewport size.
    pub valid: bool,
    /// True once a first map seeded the center and scale.
    pub used: bool,
    /// Center of the view in projected coordinates.
    pub center: Coord,
    /// Pixel deltas of the active map's georeference.
    pub scale_px: i32,
    pub scale_py: i32,
    /// Coordinate deltas of the active map's georeference.
    pub scale_cx: i32,
    pub scale_cy: i32,
    /// Zoom as the power-of-two pyramid divisor (1, 2, 4, ...).
    pub scale_main: i32,
    /// Projected units per pixel at the current zoom, for level matching
    /// across maps.
    pub scale_def: i32,
    /// Viewport size in pixels.
    pub w: u32,
    pub h: u32,
    /// Keyboard pan step in projected units (256 px worth).
    pub step_x: i32,
    pub step_y: i32,
    /// EPSG id of the active map, 0 when not georeferenced.
    pub epsg: u32,
}

/// Narrow a 64-bit intermediate to the 32-bit fixed-point range.
///
/// All coordinate arithmetic runs in 64 bits; only the final
/// viewport-space value is narrowed, and the narrowing saturates rather
/// than wraps.
pub(crate) fn narrow(v: i64) -> i32 {
    match i32::try_from(v) {
        Ok(v) => v,
        Err(_) => {
            warn!("coordinate {} out of 32-bit range, clamping", v);
            v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
        }
    }
}

impl ViewState {
    fn new() -> Self {
        Self {
            valid: false,
            used: false,
            center: Coord::default(),
            // non-zero so the transforms never divide by zero before the
            // first map attaches
            scale_px: 1,
            scale_py: 1,
            scale_cx: 0,
            scale_cy: 0,
            scale_main: 1,
            scale_def: 0,
            w: 0,
            h: 0,
            step_x: 0,
            step_y: 0,
            epsg: 0,
        }
    }

    /// Viewport pixel to projected coordinates.
    pub fn pixels_to_coords(&self, px: i32, py: i32) -> Coord {
        let mut x = px as i64;
        x -= self.w as i64 / 2;
        x *= self.scale_cx as i64;
        x *= self.scale_main as i64;
        x /= self.scale_px as i64;
        x += self.center.x as i64;

        let mut y = py as i64;
        y -= self.h as i64 / 2;
        y *= self.scale_cy as i64;
        y *= self.scale_main as i64;
        y /= self.scale_py as i64;
        y += self.center.y as i64;

        Coord {
            x: narrow(x),
            y: narrow(y),
        }
    }

    /// Projected coordinates to viewport pixel; inverse of
    /// [`Self::pixels_to_coords`].
    pub fn coords_to_pixels(&self, c: Coord) -> (i32, i32) {
        let mut x = c.x as i64 - self.center.x as i64;
        x *= self.scale_px as i64;
        x /= self.scale_cx as i64;
        x /= self.scale_main as i64;
        x += self.w as i64 / 2;

        let mut y = c.y as i64 - self.center.y as i64;
        y *= self.scale_py as i64;
        y /= self.scale_cy as i64;
        y /= self.scale_main as i64;
        y += self.h as i64 / 2;

        (narrow(x), narrow(y))
    }
}

/// Clamp a redraw rectangle to a `w x h` viewport.
pub(crate) fn clamp_redraw_rect(
    lx: i32,
    ly: i32,
    hx: i32,
    hy: i32,
    w: u32,
    h: u32,
) -> (i32, i32, i32, i32) {
    let lx = lx.clamp(0, w as i32);
    let ly = ly.clamp(0, h as i32);
    let hx = hx.clamp(lx, w as i32);
    let hy = hy.clamp(ly, h as i32);
    (lx, ly, hx, hy)
}

fn same_layer(a: &Rc<RefCell<dyn Layer>>, b: &Rc<RefCell<dyn Layer>>) -> bool {
    std::ptr::eq(
        Rc::as_ptr(a) as *const (),
        Rc::as_ptr(b) as *const (),
    )
}

/// The view: geometry state plus the layer stack.
pub struct View {
    state: ViewState,
    /// Front-to-back; painted back to front.
    layers: Vec<Rc<RefCell<dyn Layer>>>,
    maps: Vec<Rc<Map>>,
    active_map: Option<Rc<Map>>,
    map_layer: Option<Rc<RefCell<MapLayer>>>,
    grid: Option<Rc<RefCell<GridLayer>>>,
    gps: Option<Rc<RefCell<GpsLayer>>>,
    cache: Rc<RefCell<TileCache>>,
    shell: Rc<dyn Shell>,
}

impl View {
    pub fn new(maps: Vec<Rc<Map>>, cache: Rc<RefCell<TileCache>>, shell: Rc<dyn Shell>) -> Self {
        Self {
            state: ViewState::new(),
            layers: Vec::new(),
            maps,
            active_map: None,
            map_layer: None,
            grid: None,
            gps: None,
            cache,
            shell,
        }
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn active_map(&self) -> Option<&Rc<Map>> {
        self.active_map.as_ref()
    }

    pub fn map_layer(&self) -> Option<&Rc<RefCell<MapLayer>>> {
        self.map_layer.as_ref()
    }

    pub fn grid_enabled(&self) -> bool {
        self.grid.is_some()
    }

    pub fn gps_enabled(&self) -> bool {
        self.gps.is_some()
    }

    fn invalidate(&self) {
        self.shell
            .request_redraw(0, 0, self.state.w as i32, self.state.h as i32);
    }

    fn notify_layer(&self, layer: &Rc<RefCell<dyn Layer>>, change: ViewChange) {
        if self.state.valid {
            layer.borrow_mut().notify(&self.state, change);
        }
    }

    fn notify_layers(&self, change: ViewChange) {
        if !self.state.valid {
            return;
        }
        for layer in &self.layers {
            layer.borrow_mut().notify(&self.state, change);
        }
    }

    fn update_step(&mut self) {
        let mut sx = 256i64;
        sx *= self.state.scale_cx as i64;
        sx *= self.state.scale_main as i64;
        sx /= self.state.scale_px as i64;

        let mut sy = 256i64;
        sy *= self.state.scale_cy as i64;
        sy *= self.state.scale_main as i64;
        sy /= self.state.scale_py as i64;

        self.state.step_x = narrow(sx);
        self.state.step_y = narrow(sy);
    }

    fn compute_scale_def(&self) -> i32 {
        let def = self.state.scale_main as i64 * self.state.scale_cx as i64
            / self.state.scale_px as i64;
        narrow(def.abs())
    }

    /// Set the view center and repaint.
    pub fn set_center(&mut self, x: i32, y: i32) {
        self.state.center = Coord { x, y };
        self.notify_layers(ViewChange::Move);
        self.invalidate();
    }

    /// Pan by a projected-coordinate delta.
    pub fn move_by(&mut self, dx: i32, dy: i32) {
        self.set_center(self.state.center.x + dx, self.state.center.y + dy);
    }

    /// Pan on user input; manual movement releases the GPS follow lock.
    pub fn move_user(&mut self, dx: i32, dy: i32) {
        if let Some(gps) = &self.gps {
            gps.borrow_mut().set_locked(false);
        }
        self.move_by(dx, dy);
    }

    /// Set the zoom divisor, clamped to the active map's pyramid.
    pub fn set_scale(&mut self, s: i32) {
        let Some(map) = &self.active_map else {
            return;
        };
        let smax = 1i32 << (map.num_levels() - 1);
        let s = s.clamp(1, smax);

        if s == self.state.scale_main {
            return;
        }

        self.state.scale_main = s;
        self.state.scale_def = self.compute_scale_def();
        self.update_step();
        self.notify_layers(ViewChange::Scale);
        self.invalidate();
    }

    /// Zoom in by `coef / 1024`.
    pub fn zoom_in(&mut self, coef: i32) {
        let ns = self.state.scale_main as i64 * 1024 / coef as i64;
        self.set_scale(narrow(ns));
    }

    /// Zoom out by `coef / 1024`.
    pub fn zoom_out(&mut self, coef: i32) {
        let ns = self.state.scale_main as i64 * coef as i64 / 1024;
        self.set_scale(narrow(ns));
    }

    /// Seed or preserve the projected view when a map attaches.
    fn adopt_map_scales(&mut self, map: &Map) {
        let geo = map.geo();

        if !self.state.used {
            // first map: center on the pixel midpoint, start roughly
            // half-way up the pyramid
            let mut cx = map.map_w() as i64 / 2;
            cx -= geo.pox as i64;
            cx *= geo.csx as i64;
            cx /= geo.psx as i64;
            cx += geo.cox as i64;

            let mut cy = map.map_h() as i64 / 2;
            cy -= geo.poy as i64;
            cy *= geo.csy as i64;
            cy /= geo.psy as i64;
            cy += geo.coy as i64;

            self.state.center = Coord {
                x: narrow(cx),
                y: narrow(cy),
            };

            self.state.scale_cx = geo.csx;
            self.state.scale_cy = geo.csy;
            self.state.scale_px = geo.psx;
            self.state.scale_py = geo.psy;

            self.state.scale_main = 1;
            if map.num_levels() > 2 {
                self.state.scale_main = 1 << (map.num_levels() - 2);
            }
            self.state.scale_def = self.compute_scale_def();
            self.state.used = true;
        } else {
            // keep the projected view: pick the level whose pixel step is
            // closest to the previous one, with hysteresis toward the
            // coarser level
            let oscale = self.state.scale_def as i64;

            self.state.scale_cx = geo.csx;
            self.state.scale_cy = geo.csy;
            self.state.scale_px = geo.psx;
            self.state.scale_py = geo.psy;

            let mut nscale = 0i64;
            let mut l = 0;
            while l < map.num_levels() {
                self.state.scale_main = 1 << l;
                nscale = self.state.scale_main as i64 * geo.csx as i64 / geo.psx as i64;
                if oscale <= nscale {
                    break;
                }
                l += 1;
            }

            if l > 0
                && l < map.num_levels()
                && oscale > 0
                && nscale > 0
                && (oscale * 64 / nscale) < (nscale * 32 / oscale)
            {
                self.state.scale_main /= 2;
            }
        }

        self.update_step();
    }

    /// Switch the active map: detach the current map layer, adopt the new
    /// map's georeference and attach a fresh layer at the bottom of the
    /// stack.
    pub fn choose_map(&mut self, index: usize) {
        let Some(map) = self.maps.get(index).cloned() else {
            return;
        };

        if let Some(old) = self.map_layer.take() {
            let as_layer: Rc<RefCell<dyn Layer>> = old.clone();
            self.remove_layer(&as_layer);
            if let Some(client) = old.borrow().client_id() {
                self.cache.borrow_mut().discard_client(client);
            }
        }

        self.active_map = Some(Rc::clone(&map));
        self.state.epsg = map.epsg();
        self.adopt_map_scales(&map);

        let ml = MapLayer::new(Rc::clone(&map), Rc::clone(&self.cache), Rc::clone(&self.shell));
        self.map_layer = Some(Rc::clone(&ml));
        self.append_layer(ml);
        self.invalidate();
    }

    /// Add a layer at the front (painted last, on top).
    pub fn prepend_layer(&mut self, layer: Rc<RefCell<dyn Layer>>) {
        self.layers.insert(0, Rc::clone(&layer));
        self.notify_layer(&layer, ViewChange::Init);
    }

    /// Add a layer at the back (painted first, below everything).
    pub fn append_layer(&mut self, layer: Rc<RefCell<dyn Layer>>) {
        self.layers.push(Rc::clone(&layer));
        self.notify_layer(&layer, ViewChange::Init);
    }

    /// Remove a layer from the stack.
    pub fn remove_layer(&mut self, layer: &Rc<RefCell<dyn Layer>>) {
        self.layers.retain(|l| !same_layer(l, layer));
        self.notify_layer(layer, ViewChange::Finish);
    }

    pub fn enable_grid(&mut self) {
        if self.grid.is_some() {
            return;
        }
        let grid = Rc::new(RefCell::new(GridLayer::new()));
        self.grid = Some(Rc::clone(&grid));
        self.prepend_layer(grid);
        self.invalidate();
    }

    pub fn disable_grid(&mut self) {
        let Some(grid) = self.grid.take() else {
            return;
        };
        let as_layer: Rc<RefCell<dyn Layer>> = grid;
        self.remove_layer(&as_layer);
        self.invalidate();
    }

    pub fn toggle_grid(&mut self) {
        if self.grid.is_some() {
            self.disable_grid();
        } else {
            self.enable_grid();
        }
    }

    pub fn enable_gps(&mut self, projection: Rc<dyn Projection>) {
        if self.gps.is_some() {
            return;
        }
        let gps = Rc::new(RefCell::new(GpsLayer::new(projection)));
        self.gps = Some(Rc::clone(&gps));
        self.prepend_layer(gps);
        self.invalidate();
    }

    pub fn disable_gps(&mut self) {
        let Some(gps) = self.gps.take() else {
            return;
        };
        let as_layer: Rc<RefCell<dyn Layer>> = gps;
        self.remove_layer(&as_layer);
        self.invalidate();
    }

    /// Toggle whether the view follows GPS fixes; locking recenters on
    /// the last reported position.
    pub fn toggle_gps_lock(&mut self) {
        let Some(gps) = self.gps.clone() else {
            return;
        };
        let (locked, (px, py)) = {
            let mut g = gps.borrow_mut();
            let locked = !g.locked();
            g.set_locked(locked);
            (locked, g.position())
        };
        if locked {
            self.set_center(px, py);
        }
    }

    /// Route a GPS message to the GPS layer, recentring while locked.
    pub fn on_gps_msg(&mut self, msg: &GpsMsg) {
        let Some(gps) = self.gps.clone() else {
            return;
        };
        if let GpsMsg::Fix(fix) = msg {
            if self.state.epsg == 0 {
                return;
            }
            let follow = gps.borrow_mut().apply_fix(self.state.epsg, fix);
            if let Some((x, y)) = follow {
                self.set_center(x, y);
            }
        }
    }

    /// Forward a clamped repaint request to the host toolkit.
    pub fn request_redraw(&self, lx: i32, ly: i32, hx: i32, hy: i32) {
        let (lx, ly, hx, hy) = clamp_redraw_rect(lx, ly, hx, hy, self.state.w, self.state.h);
        debug!("redraw request {} {} {} {}", lx, ly, hx, hy);
        self.shell.request_redraw(lx, ly, hx, hy);
    }

    /// The viewport was resized (or shown for the first time).
    pub fn resize(&mut self, w: u32, h: u32) {
        let was_valid = self.state.valid;
        self.state.valid = true;
        self.state.w = w;
        self.state.h = h;
        self.update_step();

        let change = if was_valid {
            ViewChange::Resize
        } else {
            ViewChange::Init
        };
        for layer in &self.layers {
            layer.borrow_mut().notify(&self.state, change);
        }
    }

    /// Paint a dirty rectangle: walk the layer stack back to front and
    /// let every layer render its part.
    pub fn paint(&self, canvas: &mut dyn Canvas, rect: &PixRect) {
        if !self.state.valid {
            return;
        }
        for layer in self.layers.iter().rev() {
            layer.borrow_mut().render(&self.state, canvas, rect);
        }
    }
}
