use glam::Mat4;
use log::error;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Location reported for uniforms a shader declared but never bound.
/// Writes to it are silently ignored.
pub const UNUSED_LOCATION: u32 = u32::MAX;

/// Only guaranteed up to 1024 by conformant GL implementations; anything
/// past this is a caller bug, not a big shader.
const MAX_UNIFORM_LOCATIONS: u32 = 1024;

/// Value shape of one uniform slot. Fixed for the lifetime of a
/// (program, location) pair within a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformFormat {
    F1,
    F2,
    F3,
    F4,
    Fv1,
    Fv2,
    Fv3,
    Fv4,
    I1,
    I2,
    I3,
    I4,
    Ui1,
    /// A sampler uniform holding a texture slot index.
    Texture,
    /// 4x4 column-major matrix.
    Matrix,
    /// RGBA color.
    Color,
    RoundedRect,
}

impl UniformFormat {
    /// Size in bytes of a single element of this format.
    pub fn size(self) -> u32 {
        match self {
            Self::F1 | Self::Fv1 | Self::I1 | Self::Ui1 | Self::Texture => 4,
            Self::F2 | Self::Fv2 | Self::I2 => 8,
            Self::F3 | Self::Fv3 | Self::I3 => 12,
            Self::F4 | Self::Fv4 | Self::I4 | Self::Color => 16,
            Self::RoundedRect => 48,
            Self::Matrix => 64,
        }
    }
}

/// A rectangle with per-corner sizes. Shaders receive either the compact
/// form (bounds only, one vec4) or the corner-inclusive form (three vec4s)
/// depending on whether the corners changed since the last upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RoundedRect {
    /// x, y, width, height.
    pub bounds: [f32; 4],
    /// Width/height per corner, clockwise from top-left.
    pub corners: [[f32; 2]; 4],
}

/// Descriptor of one pending uniform change, copied into the per-frame
/// change log when a draw closes so replay sees the value the draw saw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChangedUniform {
    pub location: u32,
    pub format: UniformFormat,
    pub array_count: u16,
    pub offset: u32,
    pub send_corners: bool,
}

/// Cached state for one (program, location) pair.
#[derive(Clone, Copy, Debug)]
struct UniformSlot {
    format: Option<UniformFormat>,
    /// Reserved element count for array formats, 1 otherwise.
    array_count: u16,
    /// Byte offset of the value in the shared arena.
    offset: u32,
    /// Differs from the last-applied value; pending flush.
    changed: bool,
    /// No real value has been written this frame.
    initial: bool,
    /// Rounded rect only: corners changed, transmit the long form.
    send_corners: bool,
}

impl Default for UniformSlot {
    fn default() -> Self {
        Self {
            format: None,
            array_count: 0,
            offset: 0,
            changed: false,
            initial: true,
            send_corners: false,
        }
    }
}

#[derive(Default)]
struct ProgramUniforms {
    slots: Vec<UniformSlot>,
    /// Locations that changed since the last snapshot, in write order.
    changed: Vec<u32>,
}

/// Shared growable byte arena backing every slot's value across all
/// programs. Backed by `u32` words so slices of the 4-byte GL scalar types
/// can be cast out without alignment hazards.
struct ValueArena {
    buf: Vec<u32>,
    /// Bytes allocated so far.
    pos: u32,
}

impl ValueArena {
    fn new() -> Self {
        Self {
            buf: vec![0; 1024],
            pos: 0,
        }
    }

    /// Destination-API addressing rule: allocations of more than 8 bytes
    /// align to 16, more than 4 to 8, otherwise 4.
    fn align_up(pos: u32, size: u32) -> u32 {
        let align = if size > 8 {
            16
        } else if size > 4 {
            8
        } else {
            4
        };
        (pos + align - 1) & !(align - 1)
    }

    fn alloc(&mut self, size: u32) -> u32 {
        debug_assert!(size > 0 && size % 4 == 0);
        let offset = Self::align_up(self.pos, size);
        let end = (offset + size) as usize;
        while self.buf.len() * 4 < end {
            let doubled = self.buf.len() * 2;
            self.buf.resize(doubled, 0);
        }
        self.pos = offset + size;
        offset
    }

    fn bytes(&self, offset: u32, size: u32) -> &[u8] {
        let bytes: &[u8] = bytemuck::cast_slice(&self.buf);
        &bytes[offset as usize..(offset + size) as usize]
    }

    fn bytes_mut(&mut self, offset: u32, size: u32) -> &mut [u8] {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.buf);
        &mut bytes[offset as usize..(offset + size) as usize]
    }

    fn f32s(&self, offset: u32, count: usize) -> &[f32] {
        let words: &[f32] = bytemuck::cast_slice(&self.buf);
        let start = offset as usize / 4;
        &words[start..start + count]
    }

    fn i32s(&self, offset: u32, count: usize) -> &[i32] {
        let words: &[i32] = bytemuck::cast_slice(&self.buf);
        let start = offset as usize / 4;
        &words[start..start + count]
    }

    fn u32s(&self, offset: u32, count: usize) -> &[u32] {
        let start = offset as usize / 4;
        &self.buf[start..start + count]
    }
}

/// Handle for sharing one uniform cache between several queues. The whole
/// engine is single-threaded by contract, so plain `Rc<RefCell>`.
pub type SharedUniformState = Rc<RefCell<UniformState>>;

/// Per-program cache of uniform values with change detection.
///
/// Every typed setter funnels into the same byte-level write: look up the
/// slot, compare against the cached bytes, and only record a change when
/// they differ (or the slot is untouched this frame). The per-frame
/// changed-location lists are what draws snapshot into their batches.
pub struct UniformState {
    programs: FxHashMap<u32, ProgramUniforms>,
    values: ValueArena,
}

impl UniformState {
    pub fn new() -> Self {
        Self {
            programs: FxHashMap::default(),
            values: ValueArena::new(),
        }
    }

    pub fn new_shared() -> SharedUniformState {
        Rc::new(RefCell::new(Self::new()))
    }

    /// The central write. Returns without mutating anything on an unused
    /// location or a cross-call format mismatch; otherwise stores `new`
    /// and records the location as changed the first time its value
    /// transitions this bracket.
    fn set_bytes(
        &mut self,
        program: u32,
        location: u32,
        format: UniformFormat,
        array_count: u16,
        new: &[u8],
    ) {
        if location == UNUSED_LOCATION {
            return;
        }
        assert!(program > 0, "uniform write requires a valid program id");
        debug_assert!(location < MAX_UNIFORM_LOCATIONS);
        debug_assert_eq!(
            new.len() as u32,
            format.size() * u32::from(array_count.max(1))
        );

        let Self { programs, values } = self;
        let prog = programs.entry(program).or_default();
        let idx = location as usize;
        if idx >= prog.slots.len() {
            prog.slots.resize_with(idx + 1, UniformSlot::default);
        }

        let slot = &mut prog.slots[idx];
        if let Some(have) = slot.format
            && have != format
        {
            error!(
                "uniform at program {program} location {location} was initialized \
                 as {have:?} but written as {format:?} (array length {} now {array_count}); \
                 dropping write",
                slot.array_count
            );
            return;
        }

        let size = new.len() as u32;
        if slot.format.is_none() || array_count != slot.array_count {
            // Fresh slot, or an array whose length changed. Either way
            // there is no prior value to compare against.
            slot.offset = values.alloc(size);
            slot.format = Some(format);
            slot.array_count = array_count;
            slot.initial = true;
        }

        if slot.initial {
            values.bytes_mut(slot.offset, size).copy_from_slice(new);
        } else if values.bytes(slot.offset, size) != new {
            // A batch recorded earlier this frame may reference the current
            // offset; move to fresh storage so its snapshot keeps the bytes
            // it saw.
            slot.offset = values.alloc(size);
            values.bytes_mut(slot.offset, size).copy_from_slice(new);
        } else {
            return;
        }

        slot.initial = false;
        if !slot.changed {
            slot.changed = true;
            prog.changed.push(location);
        }
    }

    pub fn set_1f(&mut self, program: u32, location: u32, v0: f32) {
        self.set_bytes(program, location, UniformFormat::F1, 1, bytemuck::bytes_of(&v0));
    }

    pub fn set_2f(&mut self, program: u32, location: u32, v0: f32, v1: f32) {
        self.set_bytes(program, location, UniformFormat::F2, 1, bytemuck::bytes_of(&[v0, v1]));
    }

    pub fn set_3f(&mut self, program: u32, location: u32, v0: f32, v1: f32, v2: f32) {
        self.set_bytes(program, location, UniformFormat::F3, 1, bytemuck::bytes_of(&[v0, v1, v2]));
    }

    pub fn set_4f(&mut self, program: u32, location: u32, v0: f32, v1: f32, v2: f32, v3: f32) {
        self.set_bytes(program, location, UniformFormat::F4, 1, bytemuck::bytes_of(&[v0, v1, v2, v3]));
    }

    pub fn set_1i(&mut self, program: u32, location: u32, v0: i32) {
        self.set_bytes(program, location, UniformFormat::I1, 1, bytemuck::bytes_of(&v0));
    }

    pub fn set_2i(&mut self, program: u32, location: u32, v0: i32, v1: i32) {
        self.set_bytes(program, location, UniformFormat::I2, 1, bytemuck::bytes_of(&[v0, v1]));
    }

    pub fn set_3i(&mut self, program: u32, location: u32, v0: i32, v1: i32, v2: i32) {
        self.set_bytes(program, location, UniformFormat::I3, 1, bytemuck::bytes_of(&[v0, v1, v2]));
    }

    pub fn set_4i(&mut self, program: u32, location: u32, v0: i32, v1: i32, v2: i32, v3: i32) {
        self.set_bytes(program, location, UniformFormat::I4, 1, bytemuck::bytes_of(&[v0, v1, v2, v3]));
    }

    pub fn set_1ui(&mut self, program: u32, location: u32, v0: u32) {
        self.set_bytes(program, location, UniformFormat::Ui1, 1, bytemuck::bytes_of(&v0));
    }

    pub fn set_matrix(&mut self, program: u32, location: u32, matrix: &Mat4) {
        self.set_bytes(
            program,
            location,
            UniformFormat::Matrix,
            1,
            bytemuck::bytes_of(&matrix.to_cols_array()),
        );
    }

    pub fn set_color(&mut self, program: u32, location: u32, color: [f32; 4]) {
        self.set_bytes(program, location, UniformFormat::Color, 1, bytemuck::bytes_of(&color));
    }

    /// Stores the texture slot index a sampler uniform should read from.
    /// Slot indices are 0-based (not `GL_TEXTURE0`-based).
    pub fn set_texture(&mut self, program: u32, location: u32, slot: u32) {
        debug_assert!(slot < crate::attachments::MAX_TEXTURE_SLOTS as u32);
        self.set_bytes(program, location, UniformFormat::Texture, 1, bytemuck::bytes_of(&slot));
    }

    pub fn set_1fv(&mut self, program: u32, location: u32, values: &[f32]) {
        self.set_fv(program, location, UniformFormat::Fv1, 1, values);
    }

    pub fn set_2fv(&mut self, program: u32, location: u32, values: &[f32]) {
        self.set_fv(program, location, UniformFormat::Fv2, 2, values);
    }

    pub fn set_3fv(&mut self, program: u32, location: u32, values: &[f32]) {
        self.set_fv(program, location, UniformFormat::Fv3, 3, values);
    }

    pub fn set_4fv(&mut self, program: u32, location: u32, values: &[f32]) {
        self.set_fv(program, location, UniformFormat::Fv4, 4, values);
    }

    fn set_fv(
        &mut self,
        program: u32,
        location: u32,
        format: UniformFormat,
        components: usize,
        values: &[f32],
    ) {
        assert!(
            !values.is_empty() && values.len() % components == 0,
            "array uniform expects a non-empty multiple of {components} floats"
        );
        let count = values.len() / components;
        assert!(
            count <= usize::from(u16::MAX),
            "array uniform of {count} elements exceeds the element limit"
        );
        self.set_bytes(
            program,
            location,
            format,
            count as u16,
            bytemuck::cast_slice(values),
        );
    }

    /// Rounded rects get the extra `send_corners` bookkeeping: when any
    /// corner size differs from the cached value, replay must transmit the
    /// corner-inclusive form instead of the compact one.
    pub fn set_rounded_rect(&mut self, program: u32, location: u32, rect: &RoundedRect) {
        if location == UNUSED_LOCATION {
            return;
        }
        assert!(program > 0, "uniform write requires a valid program id");

        let Self { programs, values } = self;
        let prog = programs.entry(program).or_default();
        let idx = location as usize;
        if idx >= prog.slots.len() {
            prog.slots.resize_with(idx + 1, UniformSlot::default);
        }

        let slot = &mut prog.slots[idx];
        if let Some(have) = slot.format
            && have != UniformFormat::RoundedRect
        {
            error!(
                "uniform at program {program} location {location} was initialized \
                 as {have:?} but written as RoundedRect; dropping write"
            );
            return;
        }

        let size = UniformFormat::RoundedRect.size();
        if slot.format.is_none() {
            slot.offset = values.alloc(size);
            slot.format = Some(UniformFormat::RoundedRect);
            slot.array_count = 1;
            slot.initial = true;
        }

        let new = bytemuck::bytes_of(rect);
        if !slot.initial && values.bytes(slot.offset, size) == new {
            return;
        }

        debug_assert!(!slot.send_corners || slot.changed);
        if !slot.send_corners {
            let corners_differ = slot.initial || {
                let prior: RoundedRect =
                    bytemuck::pod_read_unaligned(values.bytes(slot.offset, size));
                prior.corners != rect.corners
            };
            if corners_differ {
                slot.send_corners = true;
            }
        }

        if slot.initial {
            values.bytes_mut(slot.offset, size).copy_from_slice(new);
        } else {
            slot.offset = values.alloc(size);
            values.bytes_mut(slot.offset, size).copy_from_slice(new);
        }

        slot.initial = false;
        if !slot.changed {
            slot.changed = true;
            prog.changed.push(location);
        }
    }

    /// Visits every slot of `program` that changed since the last
    /// `clear_changed`, in write order. Does not clear any flags.
    pub fn for_each_changed(&self, program: u32, mut f: impl FnMut(ChangedUniform)) {
        let Some(prog) = self.programs.get(&program) else {
            return;
        };
        for &location in &prog.changed {
            let slot = &prog.slots[location as usize];
            debug_assert!(
                slot.changed && !slot.initial,
                "changed list must only hold committed, pending slots"
            );
            let Some(format) = slot.format else {
                unreachable!("changed slot without a format");
            };
            f(ChangedUniform {
                location,
                format,
                array_count: slot.array_count,
                offset: slot.offset,
                send_corners: slot.send_corners,
            });
        }
    }

    /// Number of pending changes for `program`.
    pub fn changed_len(&self, program: u32) -> usize {
        self.programs.get(&program).map_or(0, |p| p.changed.len())
    }

    /// Acknowledges a snapshot: clears the changed list plus each slot's
    /// `changed`/`send_corners` flags. Values stay cached so identical
    /// rewrites later in the frame remain no-ops.
    pub fn clear_changed(&mut self, program: u32) {
        if let Some(prog) = self.programs.get_mut(&program) {
            for location in prog.changed.drain(..) {
                let slot = &mut prog.slots[location as usize];
                slot.changed = false;
                slot.send_corners = false;
            }
        }
    }

    /// Drops everything cached for `program`; called when its GL program
    /// object is deleted.
    pub fn clear_program(&mut self, program: u32) {
        if program == 0 {
            return;
        }
        self.programs.remove(&program);
    }

    /// End-of-frame reclamation: compacts every live slot's storage to the
    /// front of the arena (same alignment rule as allocation) and resets
    /// all slots to `initial` so the next frame's first write is always
    /// treated as a real change. No bytes are copied; the storage at the
    /// new offsets is simply considered uninitialized.
    pub fn end_frame(&mut self) {
        let mut allocator = 0u32;
        for prog in self.programs.values_mut() {
            for slot in &mut prog.slots {
                let Some(format) = slot.format else {
                    continue;
                };
                let size = format.size() * u32::from(slot.array_count.max(1));
                allocator = ValueArena::align_up(allocator, size);
                slot.offset = allocator;
                slot.changed = false;
                slot.initial = true;
                slot.send_corners = false;
                allocator += size;
            }
            prog.changed.clear();
        }
        debug_assert!(allocator as usize <= self.values.buf.len() * 4);
        self.values.pos = allocator;
    }

    // Typed views into the value arena, used by the replay pass.

    pub fn data_f32(&self, offset: u32, count: usize) -> &[f32] {
        self.values.f32s(offset, count)
    }

    pub fn data_i32(&self, offset: u32, count: usize) -> &[i32] {
        self.values.i32s(offset, count)
    }

    pub fn data_u32(&self, offset: u32, count: usize) -> &[u32] {
        self.values.u32s(offset, count)
    }
}

impl Default for UniformState {
    fn default() -> Self {
        Self::new()
    }
}
