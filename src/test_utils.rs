//! Shared fixtures for the test suite.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::rc::Rc;

use crate::cache::TileCache;
use crate::decoder::Pixmap;
use crate::map::Map;
use crate::shell::{
    CacheTask, Canvas, Projection, ProjectedPoint, Shell, TaskOutcome, TextAnchor, TimerId,
};
use crate::view::{Coord, ViewState};

/// Shell that records everything and lets tests drive the task queue.
pub(crate) struct RecordingShell {
    tasks: RefCell<VecDeque<CacheTask>>,
    queued: RefCell<HashSet<CacheTask>>,
    redraws: RefCell<Vec<(i32, i32, i32, i32)>>,
    timers: RefCell<Vec<(TimerId, u64)>>,
    cancelled: RefCell<Vec<TimerId>>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(VecDeque::new()),
            queued: RefCell::new(HashSet::new()),
            redraws: RefCell::new(Vec::new()),
            timers: RefCell::new(Vec::new()),
            cancelled: RefCell::new(Vec::new()),
        }
    }

    pub fn pop_task(&self) -> Option<CacheTask> {
        let task = self.tasks.borrow_mut().pop_front();
        if let Some(task) = task {
            self.queued.borrow_mut().remove(&task);
        }
        task
    }

    pub fn has_task(&self, task: CacheTask) -> bool {
        self.queued.borrow().contains(&task)
    }

    pub fn redraws(&self) -> Vec<(i32, i32, i32, i32)> {
        self.redraws.borrow().clone()
    }

    pub fn clear_redraws(&self) {
        self.redraws.borrow_mut().clear();
    }

    pub fn timers(&self) -> Vec<(TimerId, u64)> {
        self.timers.borrow().clone()
    }

    pub fn cancelled(&self) -> Vec<TimerId> {
        self.cancelled.borrow().clone()
    }
}

impl Shell for RecordingShell {
    fn schedule_task(&self, task: CacheTask) {
        if self.queued.borrow_mut().insert(task) {
            self.tasks.borrow_mut().push_back(task);
        }
    }

    fn request_redraw(&self, lx: i32, ly: i32, hx: i32, hy: i32) {
        self.redraws.borrow_mut().push((lx, ly, hx, hy));
    }

    fn insert_timer(&self, id: TimerId, ms: u64) {
        self.timers.borrow_mut().push((id, ms));
    }

    fn cancel_timer(&self, id: TimerId) {
        self.cancelled.borrow_mut().push(id);
    }
}

/// Run scheduled cache tasks until the queue is quiescent.
pub(crate) fn pump(shell: &RecordingShell, cache: &Rc<RefCell<TileCache>>) {
    let mut guard = 0;
    while let Some(task) = shell.pop_task() {
        if cache.borrow_mut().run_task(task) == TaskOutcome::Again {
            shell.schedule_task(task);
        }
        guard += 1;
        assert!(guard < 10_000, "task queue does not settle");
    }
}

/// Recorded drawing command.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DrawCmd {
    Blit {
        sx: u32,
        sy: u32,
        w: u32,
        h: u32,
        dx: i32,
        dy: i32,
    },
    FillRect {
        x: i32,
        y: i32,
        w: u32,
        h: u32,
        rgb: u32,
    },
    HLine {
        x0: i32,
        x1: i32,
        y: i32,
    },
    VLine {
        x: i32,
        y0: i32,
        y1: i32,
    },
    Line {
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
    },
    Circle {
        cx: i32,
        cy: i32,
        r: u32,
    },
    Ring {
        cx: i32,
        cy: i32,
        r_out: u32,
        r_in: u32,
        rgb: u32,
    },
    Text {
        x: i32,
        y: i32,
        text: String,
    },
}

/// Canvas that records every call for assertions.
pub(crate) struct RecordingCanvas {
    cmds: Vec<DrawCmd>,
}

impl RecordingCanvas {
    pub fn new() -> Self {
        Self { cmds: Vec::new() }
    }

    pub fn commands(&self) -> &[DrawCmd] {
        &self.cmds
    }
}

impl Canvas for RecordingCanvas {
    fn blit(&mut self, _src: &Pixmap, sx: u32, sy: u32, w: u32, h: u32, dx: i32, dy: i32) {
        self.cmds.push(DrawCmd::Blit {
            sx,
            sy,
            w,
            h,
            dx,
            dy,
        });
    }

    fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, rgb: u32) {
        self.cmds.push(DrawCmd::FillRect { x, y, w, h, rgb });
    }

    fn hline(&mut self, x0: i32, x1: i32, y: i32, _rgb: u32) {
        self.cmds.push(DrawCmd::HLine { x0, x1, y });
    }

    fn vline(&mut self, x: i32, y0: i32, y1: i32, _rgb: u32) {
        self.cmds.push(DrawCmd::VLine { x, y0, y1 });
    }

    fn line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, _thickness: u32, _rgb: u32) {
        self.cmds.push(DrawCmd::Line { x0, y0, x1, y1 });
    }

    fn fill_circle(&mut self, cx: i32, cy: i32, r: u32, _rgb: u32) {
        self.cmds.push(DrawCmd::Circle { cx, cy, r });
    }

    fn fill_ring(&mut self, cx: i32, cy: i32, r_out: u32, r_in: u32, rgb: u32) {
        self.cmds.push(DrawCmd::Ring {
            cx,
            cy,
            r_out,
            r_in,
            rgb,
        });
    }

    fn text(&mut self, x: i32, y: i32, _anchor: TextAnchor, _rgb: u32, text: &str) {
        self.cmds.push(DrawCmd::Text {
            x,
            y,
            text: text.to_string(),
        });
    }
}

/// Degenerate projection for tests: 1 degree = 1 projected meter.
pub(crate) struct LinearProjection;

impl Projection for LinearProjection {
    fn wgs84_to_projected(
        &self,
        _epsg: u32,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> Option<ProjectedPoint> {
        Some(ProjectedPoint {
            x: (lon * 16.0) as i32,
            y: (lat * 16.0) as i32,
            z: (alt * 16.0) as i32,
        })
    }
}

/// A solid-color PNG tile.
pub(crate) fn test_tile_png(w: u32, h: u32, rgb: u32) -> Vec<u8> {
    let px = image::Rgba([(rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8, 0xFF]);
    let img = image::RgbaImage::from_pixel(w, h, px);
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Write a pixel-based 1024x1024 test map (256 px tiles, 3 levels) and
/// load it. Tile files are not materialized; reads produce color nodes.
pub(crate) fn build_test_map(dir: &Path, cache: &Rc<RefCell<TileCache>>) -> Rc<Map> {
    let manifest = dir.join("test.tmc");
    std::fs::write(
        &manifest,
        "image-width 1024\nimage-height 1024\ntile-width 256\ntile-height 256\n\
         tile-format png\nlevels 3\n",
    )
    .unwrap();
    Map::load(&manifest, &mut cache.borrow_mut()).unwrap()
}

/// A zeroed view state for tests to fill in.
pub(crate) fn blank_view_state() -> ViewState {
    ViewState {
        valid: false,
        used: false,
        center: Coord::default(),
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
