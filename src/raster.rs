//! Software rasterization.
//!
//! Shared by the simulated device's draw path and the CPU reference
//! renderer. Positions arrive in clip space (`vec4`); primitives are
//! clipped to `0 <= z <= w`, mapped to the viewport and covered with edge
//! functions sampled at pixel centres.

use crate::driver::{Extent, PolygonMode, Rect};

/// Clip-space position.
pub type Position = [f32; 4];

/// Highest tessellation level the tessellator honours.
pub const MAX_TESS_LEVEL: u32 = 64;

/// Maps a clip-space position to framebuffer coordinates.
///
/// The viewport covers the whole extent; NDC `y = -1` is the top row.
pub fn to_screen(position: Position, extent: Extent) -> [f32; 2] {
    let w = if position[3] == 0.0 { 1.0 } else { position[3] };
    let x = (position[0] / w + 1.0) * 0.5 * extent.width as f32;
    let y = (position[1] / w + 1.0) * 0.5 * extent.height as f32;
    [x, y]
}

fn lerp(a: Position, b: Position, t: f32) -> Position {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

/// Clips a convex polygon against one plane; `distance` is positive inside.
fn clip_against(polygon: &[Position], distance: impl Fn(&Position) -> f32) -> Vec<Position> {
    let mut out = Vec::with_capacity(polygon.len() + 1);
    for (i, &current) in polygon.iter().enumerate() {
        let next = polygon[(i + 1) % polygon.len()];
        let (dc, dn) = (distance(&current), distance(&next));
        if dc >= 0.0 {
            out.push(current);
        }
        if (dc >= 0.0) != (dn >= 0.0) {
            out.push(lerp(current, next, dc / (dc - dn)));
        }
    }
    out
}

/// Clips a convex polygon to the depth range `0 <= z <= w`.
pub fn clip_polygon_depth(polygon: &[Position]) -> Vec<Position> {
    let near = clip_against(polygon, |p| p[2]);
    if near.is_empty() {
        return near;
    }
    clip_against(&near, |p| p[3] - p[2])
}

/// Clips a segment to the depth range; `None` when fully outside.
pub fn clip_segment_depth(a: Position, b: Position) -> Option<(Position, Position)> {
    let mut t0 = 0.0f32;
    let mut t1 = 1.0f32;
    let planes: [fn(&Position) -> f32; 2] = [|p| p[2], |p| p[3] - p[2]];
    for distance in planes {
        let (da, db) = (distance(&a), distance(&b));
        if da < 0.0 && db < 0.0 {
            return None;
        }
        if da < 0.0 {
            t0 = t0.max(da / (da - db));
        } else if db < 0.0 {
            t1 = t1.min(da / (da - db));
        }
    }
    if t0 > t1 {
        return None;
    }
    Some((lerp(a, b, t0), lerp(a, b, t1)))
}

fn edge(a: [f32; 2], b: [f32; 2], p: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

/// Covers a screen-space triangle, calling `plot` for every pixel whose
/// centre lies inside (edges inclusive) and inside `clip`.
pub fn fill_triangle(clip: Rect, v: [[f32; 2]; 3], plot: &mut dyn FnMut(i32, i32)) {
    let area = edge(v[0], v[1], v[2]);
    if area == 0.0 || !area.is_finite() {
        return;
    }
    let sign = area.signum();

    let min_x = v[0][0].min(v[1][0]).min(v[2][0]).floor() as i64;
    let max_x = v[0][0].max(v[1][0]).max(v[2][0]).ceil() as i64;
    let min_y = v[0][1].min(v[1][1]).min(v[2][1]).floor() as i64;
    let max_y = v[0][1].max(v[1][1]).max(v[2][1]).ceil() as i64;

    let start_x = min_x.max(clip.x as i64);
    let end_x = max_x.min(clip.right());
    let start_y = min_y.max(clip.y as i64);
    let end_y = max_y.min(clip.bottom());

    for y in start_y..end_y {
        for x in start_x..end_x {
            let p = [x as f32 + 0.5, y as f32 + 0.5];
            let w0 = edge(v[1], v[2], p) * sign;
            let w1 = edge(v[2], v[0], p) * sign;
            let w2 = edge(v[0], v[1], p) * sign;
            if w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0 {
                plot(x as i32, y as i32);
            }
        }
    }
}

/// Steps a screen-space segment one pixel at a time, calling `plot` for
/// each covered pixel inside `clip`.
pub fn draw_line(clip: Rect, a: [f32; 2], b: [f32; 2], plot: &mut dyn FnMut(i32, i32)) {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    if !(dx.is_finite() && dy.is_finite()) {
        return;
    }
    let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as u32;
    let mut last = None;
    for i in 0..=steps {
        let t = i as f32 / steps as f32;
        let x = (a[0] + dx * t).floor() as i64;
        let y = (a[1] + dy * t).floor() as i64;
        if last == Some((x, y)) {
            continue;
        }
        last = Some((x, y));
        if clip.contains(x, y) {
            plot(x as i32, y as i32);
        }
    }
}

/// Rasterizes one clip-space triangle in the given polygon mode.
pub fn draw_triangle(
    triangle: [Position; 3],
    mode: PolygonMode,
    extent: Extent,
    clip: Rect,
    plot: &mut dyn FnMut(i32, i32),
) {
    match mode {
        PolygonMode::Fill => {
            let polygon = clip_polygon_depth(&triangle);
            if polygon.len() < 3 {
                return;
            }
            let screen: Vec<[f32; 2]> = polygon.iter().map(|p| to_screen(*p, extent)).collect();
            for i in 1..screen.len() - 1 {
                fill_triangle(clip, [screen[0], screen[i], screen[i + 1]], plot);
            }
        }
        PolygonMode::Line => {
            for i in 0..3 {
                let (a, b) = (triangle[i], triangle[(i + 1) % 3]);
                if let Some((a, b)) = clip_segment_depth(a, b) {
                    draw_line(clip, to_screen(a, extent), to_screen(b, extent), plot);
                }
            }
        }
    }
}

/// Integer subdivision used for an equal-spacing tessellation level.
pub fn tess_segments(level: f32) -> u32 {
    if !level.is_finite() {
        return 1;
    }
    (level.round() as i64).clamp(1, MAX_TESS_LEVEL as i64) as u32
}

/// Projects a point of the octahedron onto the unit sphere.
///
/// Each component is remapped through `(1 - tan(pi/4 - |c| * pi/2)) / 2`
/// before normalisation, which spreads the vertices evenly over the sphere.
pub fn sphere_eval(position: Position) -> Position {
    let mut xyz = [position[0], position[1], position[2]];
    let sign = xyz.map(|c| {
        if c > 0.0 {
            1.0
        } else if c < 0.0 {
            -1.0
        } else {
            0.0
        }
    });
    for c in xyz.iter_mut() {
        let angle = 0.785398 - c.abs() * 1.570_796_3;
        *c = (1.0 - angle.tan()) / 2.0;
    }
    let length = (xyz[0] * xyz[0] + xyz[1] * xyz[1] + xyz[2] * xyz[2]).sqrt();
    if length == 0.0 {
        return [0.0, 0.0, 0.0, position[3]];
    }
    [
        sign[0] * xyz[0] / length,
        sign[1] * xyz[1] / length,
        sign[2] * xyz[2] / length,
        position[3],
    ]
}

/// Splits a triangle patch into `segments^2` triangles on a uniform
/// barycentric grid and projects every vertex with [`sphere_eval`].
///
/// Vertex weights follow the evaluation convention: `p0` gets the third
/// barycentric coordinate, `p1` the first and `p2` the second.
pub fn tessellate_sphere_patch(patch: [Position; 3], segments: u32) -> Vec<[Position; 3]> {
    let n = segments.max(1);
    let point = |i: u32, j: u32| -> Position {
        let u = i as f32 / n as f32;
        let v = j as f32 / n as f32;
        let w = 1.0 - u - v;
        let mut p = [0.0f32; 4];
        for (k, out) in p.iter_mut().enumerate() {
            *out = w * patch[0][k] + u * patch[1][k] + v * patch[2][k];
        }
        sphere_eval(p)
    };

    let mut triangles = Vec::with_capacity((n * n) as usize);
    for j in 0..n {
        for i in 0..(n - j) {
            triangles.push([point(i, j), point(i + 1, j), point(i, j + 1)]);
            if i + j + 1 < n {
                triangles.push([point(i + 1, j), point(i + 1, j + 1), point(i, j + 1)]);
            }
        }
    }
    triangles
}
