//! Collaborator contracts: event loop hooks, 2D drawing and projection.
//!
//! The crate owns no event loop, no window and no drawing backend. The
//! host toolkit implements [`Shell`] and [`Canvas`] and drives the cache
//! and GPS supervisor through [`crate::cache::TileCache::run_task`] and
//! [`crate::gps::GpsLink::on_timer`].

use crate::decoder::Pixmap;

/// Cooperative cache tasks the core asks the host loop to run.
///
/// The host calls `TileCache::run_task(task)` once per scheduled entry
/// and re-posts the task while it returns [`TaskOutcome::Again`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTask {
    /// Services clients at the maximum priority only.
    HighPrio,
    /// Services clients at any priority >= 1.
    LowPrio,
    /// One watermark cleanup pass over all maps.
    Cleanup,
}

/// Timers owned by the GPS supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Fires when no GPS packet arrived for the read-timeout interval.
    GpsReadTimeout,
    /// Periodic reconnect attempt while the GPS link is down.
    GpsReconnect,
}

/// Result of one cooperative task iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// No work left, the task can be dropped from the loop.
    Stop,
    /// More work remains, run the task again.
    Again,
}

/// Result of a timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Remove the timer.
    Stop,
    /// Re-arm the timer to fire again after the given delay.
    RescheduleMs(u64),
}

/// Event-loop services provided by the host toolkit.
///
/// Both `schedule_task` and `request_redraw` MUST be deferred: the host
/// queues the request and acts on it after the current callback returns
/// to the loop. Scheduling an already-queued task is a no-op.
pub trait Shell {
    /// Ask the loop to run `TileCache::run_task(task)` soon.
    fn schedule_task(&self, task: CacheTask);

    /// Ask the toolkit to repaint the pixel rectangle `[lx, hx) x [ly, hy)`
    /// of the view widget. The actual paint arrives later through
    /// `View::paint`.
    fn request_redraw(&self, lx: i32, ly: i32, hx: i32, hy: i32);

    /// Arm (or re-arm) a timer; `GpsLink::on_timer(id)` is called on expiry.
    fn insert_timer(&self, id: TimerId, ms: u64);

    /// Cancel a pending timer. Cancelling a non-pending timer is a no-op.
    fn cancel_timer(&self, id: TimerId);
}

/// Horizontal/vertical anchoring for axis labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAnchor {
    /// Centered horizontally, drawn below the anchor point.
    CenterBelow,
    /// Right-aligned to the anchor point, centered vertically.
    RightCenter,
}

/// Minimal 2D pixmap drawing surface the layers render into.
///
/// Colors are packed `0x00RRGGBB`. Coordinates may lie outside the
/// surface; implementations clip.
pub trait Canvas {
    /// Blit the `w x h` region of `src` starting at `(sx, sy)` to `(dx, dy)`.
    fn blit(&mut self, src: &Pixmap, sx: u32, sy: u32, w: u32, h: u32, dx: i32, dy: i32);

    /// Fill an axis-aligned rectangle.
    fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, rgb: u32);

    /// Horizontal line from `x0` to `x1` inclusive.
    fn hline(&mut self, x0: i32, x1: i32, y: i32, rgb: u32);

    /// Vertical line from `y0` to `y1` inclusive.
    fn vline(&mut self, x: i32, y0: i32, y1: i32, rgb: u32);

    /// Line of the given thickness between two points.
    fn line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, thickness: u32, rgb: u32);

    /// Filled circle.
    fn fill_circle(&mut self, cx: i32, cy: i32, r: u32, rgb: u32);

    /// Filled ring with outer radius `r_out` and inner radius `r_in`.
    fn fill_ring(&mut self, cx: i32, cy: i32, r_out: u32, r_in: u32, rgb: u32);

    /// Draw a text label anchored at `(x, y)`.
    fn text(&mut self, x: i32, y: i32, anchor: TextAnchor, rgb: u32, text: &str);
}

/// Projected point in 28.4 fixed-point meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectedPoint {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// WGS-84 to projected-coordinate transform.
///
/// Implemented by the host on top of a projection library; the core only
/// consumes the result. Returns `None` when the EPSG code is unknown or
/// the transform fails.
pub trait Projection {
    fn wgs84_to_projected(&self, epsg: u32, lat: f64, lon: f64, alt: f64)
        -> Option<ProjectedPoint>;
}
