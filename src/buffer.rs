use crate::driver::Driver;
use bytemuck::{Pod, Zeroable};

/// One vertex as the shaders consume it: clip-space position plus texture
/// coordinate. Fixed stride; the whole frame's vertices live in a single
/// append-only arena.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DrawVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

/// Append-only vertex arena backing every draw batch of a frame.
///
/// Draw batches record `(offset, count)` ranges into this buffer; at
/// execute time the whole content is uploaded once into a fresh GL buffer
/// and the cursor resets. Allocated capacity is kept across frames.
pub struct VertexBuffer {
    vertices: Vec<DrawVertex>,
}

impl VertexBuffer {
    pub fn new() -> Self {
        Self {
            vertices: Vec::with_capacity(512),
        }
    }

    /// Current write cursor, in elements. The next reservation starts here.
    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.vertices.len() as u32
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Reserves `count` vertices and returns the writable reservation.
    /// Growth is amortized doubling via `Vec`.
    pub fn advance(&mut self, count: usize) -> &mut [DrawVertex] {
        let start = self.vertices.len();
        self.vertices.resize(start + count, DrawVertex::default());
        &mut self.vertices[start..]
    }

    /// Drops all reserved vertices without uploading, for frames that are
    /// abandoned before execution.
    pub fn clear(&mut self) {
        self.vertices.clear();
    }

    /// Hands `[0, cursor)` to the driver as a freshly created GL buffer
    /// (plus vertex layout) and resets the cursor. The driver owns the GL
    /// objects until `release_vertices` is called after the frame's draws.
    pub fn submit<D: Driver>(&mut self, driver: &mut D) {
        driver.upload_vertices(bytemuck::cast_slice(&self.vertices));
        self.vertices.clear();
    }
}

impl Default for VertexBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::trace::{Call, TraceDriver};

    #[test]
    fn reservations_are_contiguous() {
        let mut buf = VertexBuffer::new();
        assert_eq!(buf.offset(), 0);
        buf.advance(3);
        assert_eq!(buf.offset(), 3);
        let slice = buf.advance(6);
        assert_eq!(slice.len(), 6, "advance should hand back exactly the reservation");
        assert_eq!(buf.offset(), 9);
    }

    #[test]
    fn submit_uploads_everything_and_resets_cursor() {
        let mut buf = VertexBuffer::new();
        buf.advance(4)[0].position = [1.0, 2.0];
        let mut driver = TraceDriver::new();
        buf.submit(&mut driver);
        assert_eq!(
            driver.calls,
            vec![Call::UploadVertices(4 * std::mem::size_of::<DrawVertex>())],
            "submit should upload the byte content of all reserved vertices"
        );
        assert_eq!(buf.offset(), 0, "submit must reset the write cursor");
    }
}
