use crate::attachments::Attachments;
use crate::buffer::{DrawVertex, VertexBuffer};
use crate::driver::Driver;
use crate::uniforms::{ChangedUniform, RoundedRect, SharedUniformState, UniformState};
use crate::{ClearMask, SamplerFilter, Viewport};
use glam::Mat4;
use log::warn;
use smallvec::SmallVec;

/// Sentinel for "no batch" in the linked order. Doubles as the tail value
/// of the last batch in a frame.
pub(crate) const NO_BATCH: u32 = u32::MAX;

/// Slice into the per-frame label arena.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LabelRange {
    offset: u32,
    len: u32,
}

/// Debug-group labels for a frame, interned into one string so batches
/// stay `Copy` and nothing allocates per group.
#[derive(Default)]
struct LabelArena {
    buf: String,
}

impl LabelArena {
    fn intern(&mut self, label: &str) -> LabelRange {
        let offset = self.buf.len() as u32;
        self.buf.push_str(label);
        LabelRange {
            offset,
            len: label.len() as u32,
        }
    }

    fn get(&self, range: LabelRange) -> &str {
        &self.buf[range.offset as usize..(range.offset + range.len) as usize]
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Payload of a draw batch. Offsets and counts index the frame's vertex
/// arena and the queue's per-frame uniform/bind logs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DrawInfo {
    pub framebuffer: u32,
    pub vbo_offset: u32,
    pub vbo_count: u32,
    pub uniform_offset: u32,
    pub uniform_count: u32,
    pub bind_offset: u32,
    pub bind_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum BatchKind {
    Clear { bits: ClearMask, framebuffer: u32 },
    PushDebugGroup { label: LabelRange },
    PopDebugGroup,
    Draw(DrawInfo),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Batch {
    pub program: u32,
    pub viewport: Viewport,
    /// Index of the next batch in submission order, or [`NO_BATCH`].
    pub next: u32,
    pub kind: BatchKind,
}

/// One logged texture binding, replayed before the draw that recorded it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TextureBind {
    pub slot: u8,
    pub id: u32,
}

/// Records work for a frame and replays it against a [`Driver`] in one
/// pass. Recording is cheap and stateless from GL's point of view; no GL
/// call happens until [`CommandQueue::execute`].
///
/// A frame is bracketed by [`begin_frame`]/[`end_frame`], and each draw by
/// [`begin_draw`]/[`end_draw`]. Closing a draw snapshots the pending
/// uniform and texture changes, then either appends a batch or merges it
/// into the previous one when nothing but vertices differ.
///
/// [`begin_frame`]: CommandQueue::begin_frame
/// [`end_frame`]: CommandQueue::end_frame
/// [`begin_draw`]: CommandQueue::begin_draw
/// [`end_draw`]: CommandQueue::end_draw
pub struct CommandQueue {
    pub(crate) batches: Vec<Batch>,
    pub(crate) vertices: VertexBuffer,
    attachments: Attachments,
    pub(crate) uniforms: SharedUniformState,
    pub(crate) batch_uniforms: Vec<ChangedUniform>,
    pub(crate) batch_binds: Vec<TextureBind>,
    saved: SmallVec<[Attachments; 2]>,
    labels: LabelArena,
    tail_batch_index: u32,
    /// Cached GL limit; queried once on first use.
    max_texture_size: i32,
    pub(crate) in_frame: bool,
    pub(crate) in_draw: bool,
    /// The batch being recorded while `in_draw`.
    open: Batch,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::with_uniforms(UniformState::new_shared())
    }

    /// Builds a queue over an existing uniform cache, so several queues
    /// rendering with the same programs share change detection.
    pub fn with_uniforms(uniforms: SharedUniformState) -> Self {
        Self {
            batches: Vec::with_capacity(128),
            vertices: VertexBuffer::new(),
            attachments: Attachments::new(),
            uniforms,
            batch_uniforms: Vec::with_capacity(128),
            batch_binds: Vec::with_capacity(64),
            saved: SmallVec::new(),
            labels: LabelArena::default(),
            tail_batch_index: NO_BATCH,
            max_texture_size: -1,
            in_frame: false,
            in_draw: false,
            open: Batch {
                program: 0,
                viewport: Viewport::default(),
                next: NO_BATCH,
                kind: BatchKind::PopDebugGroup,
            },
        }
    }

    /// Handle to the shared uniform cache.
    pub fn uniforms(&self) -> SharedUniformState {
        SharedUniformState::clone(&self.uniforms)
    }

    // --- Frame bracket ---

    pub fn begin_frame(&mut self) {
        assert!(!self.in_frame, "begin_frame inside an open frame");
        debug_assert!(self.batches.is_empty());
        self.in_frame = true;
    }

    /// Discards all recorded state and reclaims per-frame storage. Must be
    /// called after [`execute`](Self::execute) (or instead of it, to drop
    /// a frame on the floor).
    pub fn end_frame(&mut self) {
        assert!(self.in_frame && !self.in_draw, "end_frame inside an open draw");
        assert!(
            self.saved.is_empty(),
            "end_frame with unbalanced save/restore"
        );
        self.uniforms.borrow_mut().end_frame();
        self.attachments.reset_textures();
        self.vertices.clear();
        self.batches.clear();
        self.batch_uniforms.clear();
        self.batch_binds.clear();
        self.labels.clear();
        self.tail_batch_index = NO_BATCH;
        self.in_frame = false;
    }

    // --- Attachment state ---

    /// Records the render target for subsequent draws. Takes effect at
    /// each draw's close, so the target in force when a draw *ends* is the
    /// one it renders to.
    pub fn bind_framebuffer(&mut self, id: u32) {
        self.attachments.bind_framebuffer(id);
    }

    pub fn current_framebuffer(&self) -> u32 {
        self.attachments.framebuffer
    }

    /// Binds `texture_id` to a unit and points the sampler uniform at it.
    pub fn set_uniform_texture(
        &mut self,
        program: u32,
        location: u32,
        slot: u32,
        texture_id: u32,
    ) {
        self.attachments.bind_texture(slot as usize, texture_id);
        self.uniforms
            .borrow_mut()
            .set_texture(program, location, slot);
    }

    /// Pushes the attachment state; a matching [`restore`](Self::restore)
    /// brings it back. Used around offscreen render-target setup.
    pub fn save(&mut self) {
        self.saved.push(self.attachments.clone());
    }

    pub fn restore(&mut self) {
        self.attachments = self
            .saved
            .pop()
            .expect("restore without a matching save");
    }

    // --- Draw bracket ---

    pub fn begin_draw(&mut self, program: u32, viewport: Viewport) {
        assert!(self.in_frame, "begin_draw outside a frame");
        assert!(!self.in_draw, "begin_draw inside an open draw");
        assert!(program > 0, "begin_draw requires a valid program id");
        self.in_draw = true;
        self.open = Batch {
            program,
            viewport,
            next: NO_BATCH,
            kind: BatchKind::Draw(DrawInfo {
                framebuffer: 0,
                vbo_offset: self.vertices.offset(),
                vbo_count: 0,
                uniform_offset: 0,
                uniform_count: 0,
                bind_offset: 0,
                bind_count: 0,
            }),
        };
    }

    /// Reserves `count` vertices for the open draw and returns them for
    /// the caller to fill in place.
    pub fn add_vertices(&mut self, count: u32) -> &mut [DrawVertex] {
        assert!(self.in_draw, "add_vertices outside a draw");
        let BatchKind::Draw(ref mut draw) = self.open.kind else {
            unreachable!("open batch is always a draw");
        };
        draw.vbo_count += count;
        self.vertices.advance(count as usize)
    }

    /// Closes the open draw. Draws that gathered no vertices vanish
    /// without a trace; otherwise the pending uniform and texture changes
    /// are logged, and the batch is appended or merged into the previous
    /// one.
    pub fn end_draw(&mut self) {
        assert!(self.in_draw, "end_draw without begin_draw");
        self.in_draw = false;

        let BatchKind::Draw(mut draw) = self.open.kind else {
            unreachable!("open batch is always a draw");
        };
        if draw.vbo_count == 0 {
            return;
        }
        let program = self.open.program;

        // The framebuffer a draw targets is whatever is bound when it
        // closes, not when it opened.
        draw.framebuffer = self.attachments.framebuffer;

        draw.uniform_offset = self.batch_uniforms.len() as u32;
        {
            let uniforms = self.uniforms.borrow();
            let log = &mut self.batch_uniforms;
            uniforms.for_each_changed(program, |c| log.push(c));
        }
        draw.uniform_count = self.batch_uniforms.len() as u32 - draw.uniform_offset;
        self.uniforms.borrow_mut().clear_changed(program);

        draw.bind_offset = self.batch_binds.len() as u32;
        for (slot, tex) in self.attachments.textures.iter_mut().enumerate() {
            if tex.changed {
                tex.changed = false;
                if tex.id != 0 {
                    self.batch_binds.push(TextureBind {
                        slot: slot as u8,
                        id: tex.id,
                    });
                }
            }
        }
        draw.bind_count = self.batch_binds.len() as u32 - draw.bind_offset;

        self.open.kind = BatchKind::Draw(draw);

        // Merge into the previous batch when only vertices differ and the
        // vertex ranges are contiguous.
        if self.tail_batch_index != NO_BATCH && draw.uniform_count == 0 && draw.bind_count == 0 {
            let viewport = self.open.viewport;
            let tail = &mut self.batches[self.tail_batch_index as usize];
            if tail.program == program
                && tail.viewport == viewport
                && let BatchKind::Draw(ref mut prev) = tail.kind
                && prev.framebuffer == draw.framebuffer
                && prev.vbo_offset + prev.vbo_count == draw.vbo_offset
            {
                prev.vbo_count += draw.vbo_count;
                return;
            }
        }

        self.enqueue_open();
    }

    /// Closes the open draw and immediately reopens one with the same
    /// program and viewport. Callers use it to force a batch boundary,
    /// e.g. before rebinding a texture mid-shape.
    pub fn split_draw(&mut self) {
        assert!(self.in_draw, "split_draw outside a draw");
        let program = self.open.program;
        let viewport = self.open.viewport;
        self.end_draw();
        self.begin_draw(program, viewport);
    }

    // --- Non-draw batches ---

    /// Records a clear of the current framebuffer. An empty mask clears
    /// everything.
    pub fn clear(&mut self, bits: ClearMask, viewport: Viewport) {
        assert!(self.in_frame && !self.in_draw, "clear inside an open draw");
        let bits = if bits.is_empty() { ClearMask::all() } else { bits };
        let framebuffer = self.attachments.framebuffer;
        self.open = Batch {
            program: 0,
            viewport,
            next: NO_BATCH,
            kind: BatchKind::Clear { bits, framebuffer },
        };
        self.enqueue_open();
    }

    pub fn push_debug_group(&mut self, label: &str) {
        assert!(self.in_frame && !self.in_draw);
        let label = self.labels.intern(label);
        self.open = Batch {
            program: 0,
            viewport: Viewport::default(),
            next: NO_BATCH,
            kind: BatchKind::PushDebugGroup { label },
        };
        self.enqueue_open();
    }

    pub fn pop_debug_group(&mut self) {
        assert!(self.in_frame && !self.in_draw);
        self.open = Batch {
            program: 0,
            viewport: Viewport::default(),
            next: NO_BATCH,
            kind: BatchKind::PopDebugGroup,
        };
        self.enqueue_open();
    }

    fn enqueue_open(&mut self) {
        let index = self.batches.len() as u32;
        self.batches.push(self.open);
        if self.tail_batch_index != NO_BATCH {
            self.batches[self.tail_batch_index as usize].next = index;
        }
        self.tail_batch_index = index;
    }

    pub(crate) fn label(&self, range: LabelRange) -> &str {
        self.labels.get(range)
    }

    // --- Uniform setters ---
    //
    // Thin forwards to the shared cache; kept on the queue so recording
    // code touches one object.

    pub fn set_uniform_1f(&mut self, program: u32, location: u32, v0: f32) {
        self.uniforms.borrow_mut().set_1f(program, location, v0);
    }

    pub fn set_uniform_2f(&mut self, program: u32, location: u32, v0: f32, v1: f32) {
        self.uniforms.borrow_mut().set_2f(program, location, v0, v1);
    }

    pub fn set_uniform_3f(&mut self, program: u32, location: u32, v0: f32, v1: f32, v2: f32) {
        self.uniforms
            .borrow_mut()
            .set_3f(program, location, v0, v1, v2);
    }

    pub fn set_uniform_4f(
        &mut self,
        program: u32,
        location: u32,
        v0: f32,
        v1: f32,
        v2: f32,
        v3: f32,
    ) {
        self.uniforms
            .borrow_mut()
            .set_4f(program, location, v0, v1, v2, v3);
    }

    pub fn set_uniform_1i(&mut self, program: u32, location: u32, v0: i32) {
        self.uniforms.borrow_mut().set_1i(program, location, v0);
    }

    pub fn set_uniform_2i(&mut self, program: u32, location: u32, v0: i32, v1: i32) {
        self.uniforms.borrow_mut().set_2i(program, location, v0, v1);
    }

    pub fn set_uniform_3i(&mut self, program: u32, location: u32, v0: i32, v1: i32, v2: i32) {
        self.uniforms
            .borrow_mut()
            .set_3i(program, location, v0, v1, v2);
    }

    pub fn set_uniform_4i(
        &mut self,
        program: u32,
        location: u32,
        v0: i32,
        v1: i32,
        v2: i32,
        v3: i32,
    ) {
        self.uniforms
            .borrow_mut()
            .set_4i(program, location, v0, v1, v2, v3);
    }

    pub fn set_uniform_1ui(&mut self, program: u32, location: u32, v0: u32) {
        self.uniforms.borrow_mut().set_1ui(program, location, v0);
    }

    pub fn set_uniform_1fv(&mut self, program: u32, location: u32, values: &[f32]) {
        self.uniforms.borrow_mut().set_1fv(program, location, values);
    }

    pub fn set_uniform_2fv(&mut self, program: u32, location: u32, values: &[f32]) {
        self.uniforms.borrow_mut().set_2fv(program, location, values);
    }

    pub fn set_uniform_3fv(&mut self, program: u32, location: u32, values: &[f32]) {
        self.uniforms.borrow_mut().set_3fv(program, location, values);
    }

    pub fn set_uniform_4fv(&mut self, program: u32, location: u32, values: &[f32]) {
        self.uniforms.borrow_mut().set_4fv(program, location, values);
    }

    pub fn set_uniform_matrix(&mut self, program: u32, location: u32, matrix: &Mat4) {
        self.uniforms
            .borrow_mut()
            .set_matrix(program, location, matrix);
    }

    pub fn set_uniform_color(&mut self, program: u32, location: u32, color: [f32; 4]) {
        self.uniforms.borrow_mut().set_color(program, location, color);
    }

    pub fn set_uniform_rounded_rect(&mut self, program: u32, location: u32, rect: &RoundedRect) {
        self.uniforms
            .borrow_mut()
            .set_rounded_rect(program, location, rect);
    }

    // --- Resource management ---

    pub fn max_texture_size<D: Driver>(&mut self, driver: &D) -> i32 {
        if self.max_texture_size < 0 {
            self.max_texture_size = driver.max_texture_size();
        }
        self.max_texture_size
    }

    /// Allocates an RGBA8 texture, or `None` when either dimension exceeds
    /// the GL limit or the allocation fails. Unlike recording, this talks
    /// to the driver immediately.
    pub fn create_texture<D: Driver>(
        &mut self,
        driver: &mut D,
        width: i32,
        height: i32,
        filter: SamplerFilter,
    ) -> Option<u32> {
        let max = self.max_texture_size(driver);
        if width > max || height > max {
            warn!("texture of {width}x{height} exceeds the GL limit of {max}");
            return None;
        }
        let id = driver.create_texture(width, height, filter);
        if id == 0 {
            return None;
        }
        // Allocation bound the new texture on unit 0; restore the binding
        // recording left there. The tracker stays untouched since
        // record-time GL state is invisible to replay.
        let prior = self.attachments.textures[0];
        driver.bind_texture(0, if prior.initial { 0 } else { prior.id });
        Some(id)
    }

    pub fn create_framebuffer<D: Driver>(&mut self, driver: &mut D) -> u32 {
        driver.create_framebuffer()
    }

    /// Allocates a texture plus a framebuffer rendering into it. The
    /// attachment state in force before the call is preserved.
    pub fn create_render_target<D: Driver>(
        &mut self,
        driver: &mut D,
        width: i32,
        height: i32,
        filter: SamplerFilter,
    ) -> Option<(u32, u32)> {
        self.save();
        let Some(texture) = self.create_texture(driver, width, height, filter) else {
            self.restore();
            return None;
        };
        let framebuffer = self.create_framebuffer(driver);
        driver.attach_color_texture(framebuffer, texture);
        self.restore();
        Some((framebuffer, texture))
    }

    /// Deletes a program and forgets its cached uniforms.
    pub fn delete_program<D: Driver>(&mut self, driver: &mut D, program: u32) {
        driver.delete_program(program);
        self.uniforms.borrow_mut().clear_program(program);
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
