//! Point, box, and cubic-Bezier primitives shared by the route calculator
//! and the crossing resolver. Points are `(x, y)` tuples in normalized
//! diagram coordinates.

pub type Point = (f32, f32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn centered(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            x: cx - width / 2.0,
            y: cy - height / 2.0,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn left(&self) -> f32 {
        self.x
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn contains(&self, point: Point) -> bool {
        point.0 >= self.x
            && point.0 <= self.x + self.width
            && point.1 >= self.y
            && point.1 <= self.y + self.height
    }

    /// The same box grown by `margin` on every side.
    pub fn expanded(&self, margin: f32) -> Self {
        Self {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + margin * 2.0,
            height: self.height + margin * 2.0,
        }
    }
}

pub fn distance(a: Point, b: Point) -> f32 {
    let dx = b.0 - a.0;
    let dy = b.1 - a.1;
    (dx * dx + dy * dy).sqrt()
}

/// Evaluate a cubic Bezier at parameter `t` in `[0, 1]`.
pub fn cubic_point(control: &[Point; 4], t: f32) -> Point {
    let u = 1.0 - t;
    let b0 = u * u * u;
    let b1 = 3.0 * u * u * t;
    let b2 = 3.0 * u * t * t;
    let b3 = t * t * t;
    (
        b0 * control[0].0 + b1 * control[1].0 + b2 * control[2].0 + b3 * control[3].0,
        b0 * control[0].1 + b1 * control[1].1 + b2 * control[2].1 + b3 * control[3].1,
    )
}

/// Sample the curve into `count` points including both endpoints.
pub fn sample_cubic(control: &[Point; 4], count: usize) -> Vec<Point> {
    let count = count.max(2);
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let t = i as f32 / (count - 1) as f32;
        samples.push(cubic_point(control, t));
    }
    samples
}

/// Intersection of segments `a1→a2` and `b1→b2`, solved parametrically.
/// Returns the intersection point and both parameters when `t, u ∈ [0, 1]`.
pub fn segment_intersection(
    a1: Point,
    a2: Point,
    b1: Point,
    b2: Point,
) -> Option<(Point, f32, f32)> {
    let d1 = (a2.0 - a1.0, a2.1 - a1.1);
    let d2 = (b2.0 - b1.0, b2.1 - b1.1);
    let denom = d1.0 * d2.1 - d1.1 * d2.0;
    if denom.abs() < 1e-10 {
        return None;
    }
    let qx = b1.0 - a1.0;
    let qy = b1.1 - a1.1;
    let t = (qx * d2.1 - qy * d2.0) / denom;
    let u = (qx * d1.1 - qy * d1.0) / denom;
    if !(0.0..=1.0).contains(&t) || !(0.0..=1.0).contains(&u) {
        return None;
    }
    Some(((a1.0 + d1.0 * t, a1.1 + d1.1 * t), t, u))
}

/// Acute angle between two segment directions, in radians `[0, π/2]`.
pub fn segment_angle(a1: Point, a2: Point, b1: Point, b2: Point) -> f32 {
    let d1 = (a2.0 - a1.0, a2.1 - a1.1);
    let d2 = (b2.0 - b1.0, b2.1 - b1.1);
    let len1 = (d1.0 * d1.0 + d1.1 * d1.1).sqrt();
    let len2 = (d2.0 * d2.0 + d2.1 * d2.1).sqrt();
    if len1 < 1e-10 || len2 < 1e-10 {
        return 0.0;
    }
    let cos = ((d1.0 * d2.0 + d1.1 * d2.1) / (len1 * len2)).clamp(-1.0, 1.0);
    cos.abs().acos()
}

/// Minimum distance between any sample of one polyline and any sample of
/// another. Used for parallel-overlap detection between sibling routes.
pub fn min_sample_separation(a: &[Point], b: &[Point]) -> f32 {
    let mut min = f32::INFINITY;
    for &pa in a {
        for &pb in b {
            min = min.min(distance(pa, pb));
        }
    }
    min
}

/// SVG `M … C …` command string for a cubic curve.
pub fn svg_cubic_path(control: &[Point; 4]) -> String {
    format!(
        "M {:.5},{:.5} C {:.5},{:.5} {:.5},{:.5} {:.5},{:.5}",
        control[0].0,
        control[0].1,
        control[1].0,
        control[1].1,
        control[2].0,
        control[2].1,
        control[3].0,
        control[3].1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cubic_endpoints_match_anchors() {
        let control = [(0.0, 0.0), (0.25, 0.5), (0.75, 0.5), (1.0, 0.0)];
        assert_eq!(cubic_point(&control, 0.0), (0.0, 0.0));
        assert_eq!(cubic_point(&control, 1.0), (1.0, 0.0));
        let mid = cubic_point(&control, 0.5);
        assert!(mid.1 > 0.0, "interior control points should lift the curve");
    }

    #[test]
    fn sampling_is_monotone_in_x_for_monotone_curves() {
        let control = [(0.0, 0.0), (0.3, 0.2), (0.7, 0.2), (1.0, 0.0)];
        let samples = sample_cubic(&control, 20);
        assert_eq!(samples.len(), 20);
        for pair in samples.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
    }

    #[test]
    fn crossing_segments_intersect_at_parametric_midpoint() {
        let hit = segment_intersection((0.0, 0.0), (1.0, 1.0), (0.0, 1.0), (1.0, 0.0));
        let (point, t, u) = hit.expect("segments cross");
        assert!((point.0 - 0.5).abs() < 1e-6);
        assert!((point.1 - 0.5).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);
        assert!((u - 0.5).abs() < 1e-6);
    }

    #[test]
    fn parallel_segments_do_not_intersect() {
        assert!(segment_intersection((0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)).is_none());
    }

    #[test]
    fn disjoint_segments_do_not_intersect() {
        assert!(segment_intersection((0.0, 0.0), (0.4, 0.4), (0.6, 1.0), (1.0, 0.6)).is_none());
    }

    #[test]
    fn perpendicular_angle_is_right() {
        let angle = segment_angle((0.0, 0.0), (1.0, 0.0), (0.0, 0.0), (0.0, 1.0));
        assert!((angle - std::f32::consts::FRAC_PI_2).abs() < 1e-5);
    }

    #[test]
    fn expanded_box_contains_margin_points() {
        let bbox = BoundingBox::centered(0.5, 0.5, 0.1, 0.2);
        assert!(bbox.contains((0.5, 0.5)));
        assert!(!bbox.contains((0.58, 0.5)));
        assert!(bbox.expanded(0.05).contains((0.58, 0.5)));
    }
}
