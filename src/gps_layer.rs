//! GPS position overlay.
//!
//! Draws a ring at the last reported fix, sized by the reported
//! position error. While locked, the view follows each fix.

use std::rc::Rc;

use crate::gps::{GpsFix, GpsMode};
use crate::shell::{Canvas, Projection};
use crate::view::{narrow, Layer, PixRect, ViewState};

const CURSOR_COLOR: u32 = 0xFF0000;

pub struct GpsLayer {
    projection: Rc<dyn Projection>,
    /// Last fix in projected coordinates, 28.4 fixed point.
    px: i32,
    py: i32,
    pz: i32,
    /// Reported position error in meters.
    epx: f64,
    epy: f64,
    locked: bool,
    mode: GpsMode,
}

impl GpsLayer {
    pub fn new(projection: Rc<dyn Projection>) -> Self {
        Self {
            projection,
            px: 0,
            py: 0,
            pz: 0,
            epx: 0.0,
            epy: 0.0,
            locked: true,
            mode: GpsMode::NotSeen,
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Last projected position.
    pub fn position(&self) -> (i32, i32) {
        (self.px, self.py)
    }

    /// Take a fix report: project it into the map's coordinate system
    /// and remember the error. Returns the position to recenter on when
    /// the layer is locked.
    pub fn apply_fix(&mut self, epsg: u32, fix: &GpsFix) -> Option<(i32, i32)> {
        self.mode = fix.mode;

        if fix.mode < GpsMode::Fix2d {
            return None;
        }

        let p = self
            .projection
            .wgs84_to_projected(epsg, fix.lat, fix.lon, fix.alt)?;
        self.px = p.x;
        self.py = p.y;
        self.pz = p.z;
        self.epx = fix.epx;
        self.epy = fix.epy;

        if self.locked {
            Some((self.px, self.py))
        } else {
            None
        }
    }
}

impl Layer for GpsLayer {
    fn render(&mut self, view: &ViewState, canvas: &mut dyn Canvas, _rect: &PixRect) {
        if self.mode == GpsMode::NotSeen {
            return;
        }

        let mut x = self.px as i64;
        x -= view.center.x as i64;
        x *= view.scale_px as i64;
        x /= view.scale_cx as i64;
        x /= view.scale_main as i64;
        x += view.w as i64 / 2;

        let mut ex = (self.epx * 16.0) as i64;
        ex *= view.scale_px as i64;
        ex /= view.scale_cx as i64;
        ex /= view.scale_main as i64;
        let ex = ex.abs();

        let mut y = self.py as i64;
        y -= view.center.y as i64;
        y *= view.scale_py as i64;
        y /= view.scale_cy as i64;
        y /= view.scale_main as i64;
        y += view.h as i64 / 2;

        let mut ey = (self.epy * 16.0) as i64;
        ey *= view.scale_py as i64;
        ey /= view.scale_cy as i64;
        ey /= view.scale_main as i64;
        let ey = ey.abs();

        // ring radius scales with the reported error
        let r = 4i64.max(ex + 1).max(ey + 1) as u32;

        canvas.fill_ring(narrow(x), narrow(y), r, r - 2, CURSOR_COLOR);
    }
}
