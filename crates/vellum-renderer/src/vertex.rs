//! Vertex layout and CPU tessellation of canvas primitives

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use vellum_core::Rect;

/// Vertex as stored in segment geometry buffers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl Vertex {
    pub const STRIDE: u64 = std::mem::size_of::<Vertex>() as u64;

    pub fn new(position: Vec2, tex_coords: Vec2) -> Self {
        Self {
            position: position.to_array(),
            tex_coords: tex_coords.to_array(),
        }
    }
}

/// Vertices and `u32` indices accumulated for one segment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Index range a primitive occupies in its segment's geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpan {
    pub first: u32,
    pub count: u32,
}

impl Geometry {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn vertex_bytes(&self) -> u64 {
        self.vertices.len() as u64 * Vertex::STRIDE
    }

    pub fn index_bytes(&self) -> u64 {
        self.indices.len() as u64 * 4
    }

    fn base(&self) -> u32 {
        self.vertices.len() as u32
    }

    fn span_from(&self, first: usize) -> IndexSpan {
        IndexSpan {
            first: first as u32,
            count: (self.indices.len() - first) as u32,
        }
    }

    /// Quad from four corners (counter-clockwise) and their uv rectangle
    fn push_quad_corners(&mut self, corners: [Vec2; 4], uv: Rect) {
        let base = self.base();
        let uvs = uv.corners();
        for (corner, uv) in corners.iter().zip(uvs.iter()) {
            self.vertices.push(Vertex::new(*corner, *uv));
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    pub fn push_rectangle(&mut self, rect: Rect, uv: Rect) -> IndexSpan {
        let first = self.indices.len();
        self.push_quad_corners(rect.corners(), uv);
        self.span_from(first)
    }

    /// Triangle fan over the ellipse inscribed in `bounds`, from
    /// `angle_start` to `angle_end` in radians
    pub fn push_ellipse(
        &mut self,
        bounds: Rect,
        segments: u32,
        angle_start: f32,
        angle_end: f32,
    ) -> IndexSpan {
        let first = self.indices.len();
        let segments = segments.max(3);
        let radius = Vec2::new(bounds.width, bounds.height) * 0.5;
        let center = Vec2::new(bounds.x, bounds.y) + radius;
        let uv_of = |p: Vec2| {
            if bounds.is_empty() {
                Vec2::splat(0.5)
            } else {
                (p - Vec2::new(bounds.x, bounds.y)) / Vec2::new(bounds.width, bounds.height)
            }
        };

        let base = self.base();
        self.vertices.push(Vertex::new(center, uv_of(center)));
        let step = (angle_end - angle_start) / segments as f32;
        for i in 0..=segments {
            let angle = angle_start + step * i as f32;
            let p = center + Vec2::new(angle.cos(), angle.sin()) * radius;
            self.vertices.push(Vertex::new(p, uv_of(p)));
        }
        for i in 0..segments {
            self.indices
                .extend_from_slice(&[base, base + 1 + i, base + 2 + i]);
        }
        self.span_from(first)
    }

    /// Caller-supplied mesh; empty `indices` means sequential
    pub fn push_mesh(&mut self, vertices: &[Vertex], indices: &[u32]) -> IndexSpan {
        let first = self.indices.len();
        let base = self.base();
        self.vertices.extend_from_slice(vertices);
        if indices.is_empty() {
            self.indices.extend((0..vertices.len() as u32).map(|i| base + i));
        } else {
            self.indices.extend(indices.iter().map(|i| base + i));
        }
        self.span_from(first)
    }

    /// Polyline as one quad per segment of the given width.
    /// Zero-length segments are skipped.
    pub fn push_line(&mut self, points: &[Vec2], close: bool, width: f32) -> IndexSpan {
        let first = self.indices.len();
        let half = width.max(0.0) * 0.5;
        let closing = if close && points.len() > 2 {
            points.first().zip(points.last()).map(|(a, b)| (*b, *a))
        } else {
            None
        };

        let pairs = points.windows(2).map(|w| (w[0], w[1])).chain(closing);
        for (a, b) in pairs {
            let dir = b - a;
            if dir.length_squared() <= f32::EPSILON {
                continue;
            }
            let normal = dir.normalize().perp() * half;
            self.push_quad_corners(
                [a + normal, b + normal, b - normal, a - normal],
                Rect::new(0.0, 0.0, 1.0, 1.0),
            );
        }
        self.span_from(first)
    }

    /// One square of side `size` centered on each point
    pub fn push_points(&mut self, points: &[Vec2], size: f32) -> IndexSpan {
        let first = self.indices.len();
        let half = Vec2::splat(size.max(0.0) * 0.5);
        for point in points {
            let rect = Rect::from_pos_size(*point - half, half * 2.0);
            self.push_quad_corners(rect.corners(), Rect::new(0.0, 0.0, 1.0, 1.0));
        }
        self.span_from(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_stride() {
        assert_eq!(Vertex::STRIDE, 16);
    }

    #[test]
    fn test_rectangles_append_contiguous_spans() {
        let mut geometry = Geometry::default();
        let a = geometry.push_rectangle(Rect::new(0.0, 0.0, 10.0, 10.0), Rect::new(0.0, 0.0, 1.0, 1.0));
        let b = geometry.push_rectangle(Rect::new(5.0, 5.0, 10.0, 10.0), Rect::new(0.0, 0.0, 1.0, 1.0));

        assert_eq!(a, IndexSpan { first: 0, count: 6 });
        assert_eq!(b, IndexSpan { first: 6, count: 6 });
        assert_eq!(geometry.indices[6..], [4, 5, 6, 4, 6, 7]);
        assert_eq!(geometry.vertices[2].position, [10.0, 10.0]);
    }

    #[test]
    fn test_ellipse_fan() {
        let mut geometry = Geometry::default();
        let span = geometry.push_ellipse(
            Rect::new(0.0, 0.0, 2.0, 2.0),
            8,
            0.0,
            std::f32::consts::TAU,
        );

        assert_eq!(span.count, 24);
        assert_eq!(geometry.vertices.len(), 10);
        assert_eq!(geometry.vertices[0].position, [1.0, 1.0]);
    }

    #[test]
    fn test_closed_line_adds_closing_segment() {
        let mut geometry = Geometry::default();
        let points = [Vec2::ZERO, Vec2::new(10.0, 0.0), Vec2::new(10.0, 10.0)];

        let open = geometry.push_line(&points, false, 2.0);
        let closed = geometry.push_line(&points, true, 2.0);

        assert_eq!(open.count, 12);
        assert_eq!(closed.count, 18);
        assert_eq!(geometry.vertices[0].position, [0.0, 1.0]);
    }

    #[test]
    fn test_mesh_indices_are_rebased() {
        let mut geometry = Geometry::default();
        geometry.push_points(&[Vec2::ZERO], 1.0);
        let vertices = [Vertex::new(Vec2::ZERO, Vec2::ZERO); 3];
        let span = geometry.push_mesh(&vertices, &[2, 1, 0]);

        assert_eq!(span, IndexSpan { first: 6, count: 3 });
        assert_eq!(geometry.indices[6..], [6, 5, 4]);
    }
}
