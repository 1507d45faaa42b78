//! Coordinate grid overlay.
//!
//! Draws vertical and horizontal grid lines in projected coordinates,
//! dashed between 5-multiples and solid at them, with axis labels at
//! whole kilometres (16000 units in 28.4 fixed point).

use crate::shell::{Canvas, TextAnchor};
use crate::view::{narrow, Layer, PixRect, ViewChange, ViewState};

/// Grid spacing multipliers; combined with powers of 16 they give the
/// candidate spacings `{2, 5, 10} * 16^k`.
const STEP_TABLE: [i32; 3] = [2, 5, 10];

const GRID_COLOR: u32 = 0x2222AA;
/// One kilometre in 28.4 fixed-point units.
const LABEL_UNIT: i32 = 16000;

pub struct GridLayer {
    /// Target on-screen line spacing in pixels.
    dist: i32,
    /// Chosen spacing in projected units.
    step: i32,
}

impl GridLayer {
    pub fn new() -> Self {
        Self { dist: 60, step: 0 }
    }

    /// Chosen grid spacing in projected units.
    pub fn step(&self) -> i32 {
        self.step
    }
}

impl Default for GridLayer {
    fn default() -> Self {
        Self::new()
    }
}

fn dashed_vline(canvas: &mut dyn Canvas, x: i32, y0: i32, y1: i32, rgb: u32) {
    let len = y1 - y0;
    for i in 1..=(len / 10) {
        if i % 2 == 1 {
            canvas.vline(x, y0 + 10 * (i - 1), y0 + 10 * i, rgb);
        }
    }
}

fn dashed_hline(canvas: &mut dyn Canvas, x0: i32, x1: i32, y: i32, rgb: u32) {
    let len = x1 - x0;
    for i in 1..=(len / 10) {
        if i % 2 == 1 {
            canvas.hline(x0 + 10 * (i - 1), x0 + 10 * i, y, rgb);
        }
    }
}

fn draw_coord(canvas: &mut dyn Canvas, x: i32, y: i32, anchor: TextAnchor, coord: i32) {
    let text = format!("{}", coord / LABEL_UNIT);
    // white shadow behind black text
    canvas.text(x + 1, y + 1, anchor, 0xFFFFFF, &text);
    canvas.text(x, y, anchor, 0x000000, &text);
}

impl Layer for GridLayer {
    fn notify(&mut self, view: &ViewState, change: ViewChange) {
        if !matches!(change, ViewChange::Init | ViewChange::Scale) {
            return;
        }

        // projected units spanned by `dist` pixels at the current zoom
        let mut dx = self.dist as i64;
        dx *= view.scale_cx as i64;
        dx *= view.scale_main as i64;
        dx /= view.scale_px as i64;
        let dx = dx.abs();

        let mut step_base = 16i64;
        let mut i = 16i64;
        while i < dx {
            step_base = i;
            i *= 16;
        }

        let mut pick = STEP_TABLE[STEP_TABLE.len() - 1];
        for &mult in &STEP_TABLE {
            if step_base * mult as i64 >= dx {
                pick = mult;
                break;
            }
        }

        self.step = narrow(step_base * pick as i64);
    }

    fn render(&mut self, view: &ViewState, canvas: &mut dyn Canvas, rect: &PixRect) {
        if self.step <= 0 {
            return;
        }

        let lc = view.pixels_to_coords(rect.lx, rect.ly);
        let hc = view.pixels_to_coords(rect.hx, rect.hy);

        let mut lx = lc.x / self.step;
        let mut ly = lc.y / self.step;
        let mut hx = hc.x / self.step;
        let mut hy = hc.y / self.step;

        if hx < lx {
            std::mem::swap(&mut lx, &mut hx);
        }
        if hy < ly {
            std::mem::swap(&mut ly, &mut hy);
        }

        lx -= 1;
        ly -= 1;
        hx += 1;
        hy += 1;

        for i in lx..=hx {
            let mut tmp = i as i64 * self.step as i64;
            tmp -= view.center.x as i64;
            tmp *= view.scale_px as i64;
            tmp /= view.scale_cx as i64;
            tmp /= view.scale_main as i64;
            tmp += view.w as i64 / 2;
            let x = narrow(tmp);

            if i % 5 != 0 {
                dashed_vline(canvas, x, rect.ly, rect.hy, GRID_COLOR);
            } else {
                canvas.vline(x, rect.ly, rect.hy, GRID_COLOR);
            }
        }

        for i in ly..=hy {
            let mut tmp = i as i64 * self.step as i64;
            tmp -= view.center.y as i64;
            tmp *= view.scale_py as i64;
            tmp /= view.scale_cy as i64;
            tmp /= view.scale_main as i64;
            tmp += view.h as i64 / 2;
            let y = narrow(tmp);

            if i % 5 != 0 {
                dashed_hline(canvas, rect.lx, rect.hx, y, GRID_COLOR);
            } else {
                canvas.hline(rect.lx, rect.hx, y, GRID_COLOR);
            }
        }

        for i in lx..=hx {
            let coord = match i.checked_mul(self.step) {
                Some(c) => c,
                None => continue,
            };
            if coord % LABEL_UNIT == 0 {
                let mut tmp = coord as i64;
                tmp -= view.center.x as i64;
                tmp *= view.scale_px as i64;
                tmp /= view.scale_cx as i64;
                tmp /= view.scale_main as i64;
                tmp += view.w as i64 / 2;
                draw_coord(canvas, narrow(tmp), 1, TextAnchor::CenterBelow, coord);
            }
        }

        for i in ly..=hy {
            let coord = match i.checked_mul(self.step) {
                Some(c) => c,
                None => continue,
            };
            if coord % LABEL_UNIT == 0 {
                let mut tmp = coord as i64;
                tmp -= view.center.y as i64;
                tmp *= view.scale_py as i64;
                tmp /= view.scale_cy as i64;
                tmp /= view.scale_main as i64;
                tmp += view.h as i64 / 2;
                draw_coord(canvas, 1, narrow(tmp), TextAnchor::RightCenter, coord);
            }
        }
    }
}
