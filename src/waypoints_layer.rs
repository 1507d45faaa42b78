//! Waypoint route overlay: dots at each point, a polyline between them.

use std::rc::Rc;

use crate::shell::{Canvas, Projection};
use crate::view::{narrow, Layer, PixRect, ViewState};
use crate::waypoints::Route;

pub struct WaypointsLayer {
    route: Route,
    projection: Rc<dyn Projection>,
    point_r: u32,
    line_r: u32,
    point_color: u32,
    line_color: u32,
}

impl WaypointsLayer {
    pub fn new(route: Route, projection: Rc<dyn Projection>) -> Self {
        Self {
            route,
            projection,
            point_r: 3,
            line_r: 1,
            point_color: 0x0000FF,
            line_color: 0x000000,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }
}

impl Layer for WaypointsLayer {
    fn render(&mut self, view: &ViewState, canvas: &mut dyn Canvas, _rect: &PixRect) {
        let mut prev: Option<(i32, i32)> = None;

        for wp in &self.route.waypoints {
            let Some(p) = self
                .projection
                .wgs84_to_projected(view.epsg, wp.lat, wp.lon, wp.alt)
            else {
                continue;
            };

            let mut x = p.x as i64;
            x -= view.center.x as i64;
            x *= view.scale_px as i64;
            x /= view.scale_cx as i64;
            x /= view.scale_main as i64;
            x += view.w as i64 / 2;

            let mut y = p.y as i64;
            y -= view.center.y as i64;
            y *= view.scale_py as i64;
            y /= view.scale_cy as i64;
            y /= view.scale_main as i64;
            y += view.h as i64 / 2;

            let (x, y) = (narrow(x), narrow(y));

            canvas.fill_circle(x, y, self.point_r, self.point_color);
            canvas.fill_circle(x, y, self.line_r, self.line_color);

            if let Some((px, py)) = prev {
                canvas.line(x, y, px, py, self.line_r, self.line_color);
            }
            prev = Some((x, y));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{blank_view_state, DrawCmd, LinearProjection, RecordingCanvas};
    use crate::waypoints::Waypoint;

    fn route_of(points: &[(f64, f64)]) -> Route {
        let mut route = Route::new(None);
        for &(lat, lon) in points {
            route.push(Waypoint {
                lat,
                lon,
                alt: f64::NAN,
                name: None,
            });
        }
        route
    }

    fn test_state() -> ViewState {
        let mut state = blank_view_state();
        state.valid = true;
        state.w = 512;
        state.h = 512;
        state.scale_px = 1;
        state.scale_py = 1;
        state.scale_cx = 16;
        state.scale_cy = 16;
        state.scale_main = 1;
        state.epsg = 32633;
        state
    }

    #[test]
    fn draws_dots_and_a_polyline() {
        let mut layer = WaypointsLayer::new(
            route_of(&[(0.0, 0.0), (10.0, 10.0), (20.0, 20.0)]),
            Rc::new(LinearProjection),
        );

        let mut canvas = RecordingCanvas::new();
        layer.render(
            &test_state(),
            &mut canvas,
            &PixRect {
                lx: 0,
                ly: 0,
                hx: 512,
                hy: 512,
            },
        );

        let circles = canvas
            .commands()
            .iter()
            .filter(|c| matches!(c, DrawCmd::Circle { .. }))
            .count();
        let lines = canvas
            .commands()
            .iter()
            .filter(|c| matches!(c, DrawCmd::Line { .. }))
            .count();

        // two circles per point, a segment between consecutive points
        assert_eq!(circles, 6);
        assert_eq!(lines, 2);
    }

    #[test]
    fn empty_route_draws_nothing() {
        let mut layer = WaypointsLayer::new(route_of(&[]), Rc::new(LinearProjection));
        let mut canvas = RecordingCanvas::new();
        layer.render(
            &test_state(),
            &mut canvas,
            &PixRect {
                lx: 0,
                ly: 0,
                hx: 64,
                hy: 64,
            },
        );
        assert!(canvas.commands().is_empty());
    }

    #[test]
    fn points_project_through_the_view_transform() {
        // one waypoint at lon 10 / lat 0: projected x = 160 units = 10 px
        // right of a zero-centered view
        let mut layer =
            WaypointsLayer::new(route_of(&[(0.0, 10.0)]), Rc::new(LinearProjection));

        let mut canvas = RecordingCanvas::new();
        layer.render(
            &test_state(),
            &mut canvas,
            &PixRect {
                lx: 0,
                ly: 0,
                hx: 512,
                hy: 512,
            },
        );

        assert!(canvas
            .commands()
            .iter()
            .any(|c| matches!(c, DrawCmd::Circle { cx: 266, cy: 256, .. })));
    }
}
