//! The map layer: renders tiles and drives the cache.
//!
//! The layer tracks three concentric tile rectangles at the current
//! level: VISIBLE (`tx2..tx3 x ty2..ty3`, covering the viewport), HALO
//! (`tx1..tx4 x ty1..ty4`, the viewport extended by half its size on
//! each side) and a finer-level PREFETCH rectangle (`t2*`, the visible
//! indices doubled on level - 1, for the next zoom-in). A resumable scan
//! walks these rectangles in usefulness order and feeds the cache's
//! query callback one missing tile at a time.

use std::cell::RefCell;
use std::rc::Rc;

use log::warn;

use crate::cache::{CacheClient, ClientId, MapId, TileCache, TileKey, TileNode, TileQuery};
use crate::map::Map;
use crate::shell::{Canvas, Shell};
use crate::view::{clamp_redraw_rect, narrow, Layer, PixRect, ViewChange, ViewState};

/// Scan states; the order fetches the most useful tile first.
const SCAN_START: u8 = 0;
const SCAN_VISIBLE: u8 = 1;
const SCAN_HALO_TOP: u8 = 2;
const SCAN_HALO_BOTTOM: u8 = 3;
const SCAN_HALO_LEFT: u8 = 4;
const SCAN_HALO_RIGHT: u8 = 5;
const SCAN_PREFETCH: u8 = 6;
const SCAN_DONE: u8 = 7;

pub struct MapLayer {
    map: Rc<Map>,
    cache: Rc<RefCell<TileCache>>,
    shell: Rc<dyn Shell>,
    client: Option<ClientId>,

    level: u32,
    /// Pixel offset of the first VISIBLE tile relative to the viewport.
    pix_off_x: i32,
    pix_off_y: i32,
    view_w: u32,
    view_h: u32,

    /// Monotone tile-x description: `tx1 <= tx2 <= tx3 <= tx4`.
    tx1: u32,
    tx2: u32,
    tx3: u32,
    tx4: u32,
    ty1: u32,
    ty2: u32,
    ty3: u32,
    ty4: u32,

    /// Prefetch rectangle on the next finer level.
    t2x1: u32,
    t2x2: u32,
    t2y1: u32,
    t2y2: u32,

    /// Missing-tile scan cursor.
    ax: u32,
    ay: u32,
    scan_state: u8,
}

impl MapLayer {
    /// Create a map layer and attach it to the cache as a client.
    pub fn new(
        map: Rc<Map>,
        cache: Rc<RefCell<TileCache>>,
        shell: Rc<dyn Shell>,
    ) -> Rc<RefCell<MapLayer>> {
        let layer = Rc::new(RefCell::new(MapLayer {
            map,
            cache: Rc::clone(&cache),
            shell,
            client: None,
            level: 0,
            pix_off_x: 0,
            pix_off_y: 0,
            view_w: 0,
            view_h: 0,
            tx1: 0,
            tx2: 0,
            tx3: 0,
            tx4: 0,
            ty1: 0,
            ty2: 0,
            ty3: 0,
            ty4: 0,
            t2x1: 0,
            t2x2: 0,
            t2y1: 0,
            t2y2: 0,
            ax: 0,
            ay: 0,
            scan_state: SCAN_START,
        }));

        let id = cache.borrow_mut().make_client(layer.clone());
        layer.borrow_mut().client = Some(id);
        layer
    }

    /// Cache client handle, for detaching the layer.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client
    }

    pub fn map(&self) -> &Rc<Map> {
        &self.map
    }

    /// Level currently rendered.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Visible tile rectangle `(tx2, ty2, tx3, ty3)`, upper bounds
    /// exclusive.
    pub fn visible_rect(&self) -> (u32, u32, u32, u32) {
        (self.tx2, self.ty2, self.tx3, self.ty3)
    }

    /// Halo tile rectangle `(tx1, ty1, tx4, ty4)`, upper bounds
    /// exclusive.
    pub fn halo_rect(&self) -> (u32, u32, u32, u32) {
        (self.tx1, self.ty1, self.tx4, self.ty4)
    }

    /// Scan cursor, exposed as `(state, ay, ax)` in scan order.
    pub fn scan_cursor(&self) -> (u8, u32, u32) {
        (self.scan_state, self.ay, self.ax)
    }

    /// Advance through `[lx, hx) x [.., hy)` from the saved cursor until
    /// a missing tile is found. The cursor stays on the missing tile.
    fn search_rect(&mut self, cache: &TileCache, level: u32, lx: u32, hx: u32, hy: u32) -> bool {
        while self.ay < hy {
            while self.ax < hx {
                if cache
                    .lookup(self.map.id(), TileKey::new(level, self.ax, self.ay))
                    .is_none()
                {
                    return true;
                }
                self.ax += 1;
            }
            self.ax = lx;
            self.ay += 1;
        }
        false
    }

    /// Resume the missing-tile scan; returns the priority class of the
    /// found tile (3 visible, 2 halo, 1 prefetch) or 0 when done.
    fn find_missing_tile(&mut self, cache: &TileCache) -> u32 {
        if self.scan_state == SCAN_START {
            self.ax = self.tx2;
            self.ay = self.ty2;
            self.scan_state = SCAN_VISIBLE;
        }
        if self.scan_state == SCAN_VISIBLE {
            if self.search_rect(cache, self.level, self.tx2, self.tx3, self.ty3) {
                return 3;
            }
            self.ax = self.tx1;
            self.ay = self.ty1;
            self.scan_state = SCAN_HALO_TOP;
        }
        if self.scan_state == SCAN_HALO_TOP {
            if self.search_rect(cache, self.level, self.tx1, self.tx4, self.ty2) {
                return 2;
            }
            self.ax = self.tx1;
            self.ay = self.ty3;
            self.scan_state = SCAN_HALO_BOTTOM;
        }
        if self.scan_state == SCAN_HALO_BOTTOM {
            if self.search_rect(cache, self.level, self.tx1, self.tx4, self.ty4) {
                return 2;
            }
            self.ax = self.tx1;
            self.ay = self.ty2;
            self.scan_state = SCAN_HALO_LEFT;
        }
        if self.scan_state == SCAN_HALO_LEFT {
            if self.search_rect(cache, self.level, self.tx1, self.tx2, self.ty3) {
                return 2;
            }
            self.ax = self.tx3;
            self.ay = self.ty2;
            self.scan_state = SCAN_HALO_RIGHT;
        }
        if self.scan_state == SCAN_HALO_RIGHT {
            if self.search_rect(cache, self.level, self.tx3, self.tx4, self.ty3) {
                return 2;
            }
            self.ax = self.t2x1;
            self.ay = self.t2y1;
            self.scan_state = SCAN_PREFETCH;
            if self.level == 0 {
                self.scan_state = SCAN_DONE;
                return 0;
            }
        }
        if self.scan_state == SCAN_PREFETCH {
            if self.search_rect(cache, self.level - 1, self.t2x1, self.t2x2, self.t2y2) {
                return 1;
            }
            self.scan_state = SCAN_DONE;
        }
        0
    }

    /// Recompute the tile rectangles for the current view geometry,
    /// reset the scan and ask the cache for attention if anything is
    /// missing.
    fn update_geometry(&mut self, view: &ViewState) {
        if view.scale_main != (1 << self.level) {
            warn!(
                "inconsistent scale {} and level {}",
                view.scale_main, self.level
            );
        }

        let tw = self.map.tile_w() as i32;
        let th = self.map.tile_h() as i32;
        let txc = self.map.tiles_x(self.level) as i32;
        let tyc = self.map.tiles_y(self.level) as i32;
        let geo = self.map.geo();

        // center of the view in pixels of the current level, relative to
        // the image origin
        let mut tmpx = view.center.x as i64;
        tmpx -= geo.cox as i64;
        tmpx *= geo.psx as i64;
        tmpx /= geo.csx as i64;
        tmpx += geo.pox as i64;
        let cx = narrow(tmpx / (1i64 << self.level));

        let mut tmpy = view.center.y as i64;
        tmpy -= geo.coy as i64;
        tmpy *= geo.psy as i64;
        tmpy /= geo.csy as i64;
        tmpy += geo.poy as i64;
        let cy = narrow(tmpy / (1i64 << self.level));

        // view corners in the same space
        let lx = cx - (view.w as i32 / 2);
        let ly = cy - (view.h as i32 / 2);
        let hx = lx + view.w as i32;
        let hy = ly + view.h as i32;

        // indices of the tiles containing the corners, clamped to the
        // level's tile range
        let tlx = (lx / tw).clamp(0, txc);
        let tly = (ly / th).clamp(0, tyc);
        let thx = ((hx - 1 + tw) / tw).clamp(0, txc);
        let thy = ((hy - 1 + th) / th).clamp(0, tyc);

        self.pix_off_x = tlx * tw - lx;
        self.pix_off_y = tly * th - ly;

        self.tx2 = tlx as u32;
        self.tx3 = thx as u32;
        self.ty2 = tly as u32;
        self.ty3 = thy as u32;

        let dx = (thx - tlx + 1) / 2;
        let dy = (thy - tly + 1) / 2;

        self.tx1 = (tlx - dx).max(0) as u32;
        self.ty1 = (tly - dy).max(0) as u32;
        self.tx4 = (thx + dx).min(txc) as u32;
        self.ty4 = (thy + dy).min(tyc) as u32;

        if self.level > 0 {
            let t2xc = self.map.tiles_x(self.level - 1);
            let t2yc = self.map.tiles_y(self.level - 1);
            self.t2x1 = (self.tx2 * 2).min(t2xc);
            self.t2y1 = (self.ty2 * 2).min(t2yc);
            self.t2x2 = (self.tx3 * 2).min(t2xc);
            self.t2y2 = (self.ty3 * 2).min(t2yc);
        }

        self.view_w = view.w;
        self.view_h = view.h;
        self.scan_state = SCAN_START;
    }
}

fn nearest_level(map: &Map, scale_main: i32) -> u32 {
    let mut ns = 1;
    let mut l = 0u32;
    while ns <= scale_main && l < map.num_levels() {
        ns *= 2;
        l += 1;
    }
    l.saturating_sub(1)
}

impl Layer for MapLayer {
    fn notify(&mut self, view: &ViewState, change: ViewChange) {
        if change == ViewChange::Finish {
            return;
        }

        if matches!(change, ViewChange::Init | ViewChange::Scale) {
            self.level = nearest_level(&self.map, view.scale_main);
            if let Some(id) = self.client {
                let cache = Rc::clone(&self.cache);
                cache
                    .borrow_mut()
                    .request_notification(id, self.map.id(), self.level);
            }
        }

        self.update_geometry(view);

        let cache = Rc::clone(&self.cache);
        let mt = self.find_missing_tile(&cache.borrow());
        if let Some(id) = self.client {
            cache.borrow_mut().request_attention(id, mt);
        }
    }

    fn render(&mut self, _view: &ViewState, canvas: &mut dyn Canvas, rect: &PixRect) {
        let tw = self.map.tile_w() as i32;
        let th = self.map.tile_h() as i32;

        // translate the dirty pixel rectangle to tile indices relative to
        // the first visible tile, then intersect with VISIBLE
        let lx = ((rect.lx - self.pix_off_x) / tw + self.tx2 as i32).max(self.tx2 as i32);
        let ly = ((rect.ly - self.pix_off_y) / th + self.ty2 as i32).max(self.ty2 as i32);
        let hx = ((rect.hx - self.pix_off_x - 1 + tw) / tw + self.tx2 as i32).min(self.tx3 as i32);
        let hy = ((rect.hy - self.pix_off_y - 1 + th) / th + self.ty2 as i32).min(self.ty3 as i32);

        let cache = Rc::clone(&self.cache);
        let cache = cache.borrow();

        for i in lx..hx {
            for j in ly..hy {
                let ax = (i - self.tx2 as i32) * tw + self.pix_off_x;
                let ay = (j - self.ty2 as i32) * th + self.pix_off_y;
                let mut aw = tw;
                let mut ah = th;

                // the last column/row may be clipped by the map size
                if (i + 1) as u32 == self.map.tiles_x(self.level) {
                    aw = ((self.map.map_w() >> self.level) as i32 - i * tw).clamp(0, tw);
                }
                if (j + 1) as u32 == self.map.tiles_y(self.level) {
                    ah = ((self.map.map_h() >> self.level) as i32 - j * th).clamp(0, th);
                }

                let key = TileKey::new(self.level, i as u32, j as u32);
                match cache.lookup(self.map.id(), key) {
                    Some(TileNode::Data(pm)) => {
                        canvas.blit(pm, 0, 0, aw as u32, ah as u32, ax, ay);
                    }
                    Some(TileNode::Color(rgb)) => {
                        canvas.fill_rect(ax, ay, aw as u32, ah as u32, rgb & 0x00FF_FFFF);
                    }
                    // missing or failed tiles leave whatever is underneath
                    Some(TileNode::Error) | None => {}
                }
            }
        }
    }
}

impl CacheClient for MapLayer {
    fn query(&mut self, cache: &TileCache) -> TileQuery {
        let mt = self.find_missing_tile(cache);
        if mt == 0 {
            return TileQuery::Idle;
        }

        let level = if mt == 1 { self.level - 1 } else { self.level };
        TileQuery::Load {
            prio: mt,
            map: Rc::clone(&self.map),
            key: TileKey::new(level, self.ax, self.ay),
        }
    }

    fn notify(&mut self, _cache: &TileCache, _map: MapId, key: TileKey, _node: &TileNode) {
        if key.level == self.level
            && self.tx2 <= key.x
            && key.x < self.tx3
            && self.ty2 <= key.y
            && key.y < self.ty3
        {
            let tw = self.map.tile_w() as i32;
            let th = self.map.tile_h() as i32;
            let sx = (key.x - self.tx2) as i32 * tw + self.pix_off_x;
            let sy = (key.y - self.ty2) as i32 * th + self.pix_off_y;

            let (lx, ly, hx, hy) =
                clamp_redraw_rect(sx, sy, sx + tw, sy + th, self.view_w, self.view_h);
            self.shell.request_redraw(lx, ly, hx, hy);
        }
    }

    fn eval(&self, key: TileKey, _node: &TileNode) -> u32 {
        if key.level == self.level
            && self.tx2 <= key.x
            && key.x < self.tx3
            && self.ty2 <= key.y
            && key.y < self.ty3
        {
            return 3;
        }

        if key.level == self.level
            && self.tx1 <= key.x
            && key.x < self.tx4
            && self.ty1 <= key.y
            && key.y < self.ty4
        {
            return 2;
        }

        // finer-level prefetch is deliberately unprotected, it can be
        // rebuilt cheaply
        0
    }
}
