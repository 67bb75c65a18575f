use crate::{ClearMask, SamplerFilter};
use glow::{HasContext, PixelUnpackData};
use log::warn;
use std::{mem, num::NonZeroU32};

/// GL calls the replay pass can issue. Object ids are raw GL names with 0
/// meaning "none", matching what the shader compiler hands out.
///
/// The trait exists so replay can be exercised against a recording fake in
/// tests; production code always goes through [`GlowDriver`].
pub trait Driver {
    fn max_texture_size(&self) -> i32;

    /// Fixed-function setup applied once per replayed frame.
    fn begin_render(&mut self);

    /// Uploads the frame's whole vertex arena and points the attribute
    /// layout at it.
    fn upload_vertices(&mut self, data: &[u8]);

    /// Releases the frame's vertex objects after the last draw.
    fn release_vertices(&mut self);

    fn use_program(&mut self, program: u32);
    fn delete_program(&mut self, program: u32);
    fn bind_framebuffer(&mut self, id: u32);
    fn set_viewport(&mut self, width: u16, height: u16);
    fn set_scissor(&mut self, x: i32, y: i32, width: i32, height: i32);
    fn disable_scissor(&mut self);
    fn clear(&mut self, mask: ClearMask);
    fn bind_texture(&mut self, slot: u32, id: u32);
    fn draw_arrays(&mut self, first: u32, count: u32);

    fn push_debug_group(&mut self, label: &str);
    fn pop_debug_group(&mut self);

    /// Allocates an uninitialized RGBA8 texture, or 0 if the GL rejects it.
    fn create_texture(&mut self, width: i32, height: i32, filter: SamplerFilter) -> u32;
    fn create_framebuffer(&mut self) -> u32;
    fn attach_color_texture(&mut self, framebuffer: u32, texture: u32);

    fn uniform_1f(&mut self, location: u32, v0: f32);
    fn uniform_2f(&mut self, location: u32, v0: f32, v1: f32);
    fn uniform_3f(&mut self, location: u32, v0: f32, v1: f32, v2: f32);
    fn uniform_4f(&mut self, location: u32, v0: f32, v1: f32, v2: f32, v3: f32);
    fn uniform_1i(&mut self, location: u32, v0: i32);
    fn uniform_2i(&mut self, location: u32, v0: i32, v1: i32);
    fn uniform_3i(&mut self, location: u32, v0: i32, v1: i32, v2: i32);
    fn uniform_4i(&mut self, location: u32, v0: i32, v1: i32, v2: i32, v3: i32);
    fn uniform_1ui(&mut self, location: u32, v0: u32);
    fn uniform_1fv(&mut self, location: u32, values: &[f32]);
    fn uniform_2fv(&mut self, location: u32, values: &[f32]);
    fn uniform_3fv(&mut self, location: u32, values: &[f32]);
    fn uniform_4fv(&mut self, location: u32, values: &[f32]);
    /// Exactly 16 floats, column-major.
    fn uniform_matrix(&mut self, location: u32, values: &[f32]);
}

/// [`Driver`] over a live glow context.
pub struct GlowDriver {
    gl: glow::Context,
    /// Emit KHR_debug group markers. Off unless debugging a capture.
    debug: bool,
    vbo: Option<glow::NativeBuffer>,
    vao: Option<glow::NativeVertexArray>,
}

fn program(id: u32) -> Option<glow::NativeProgram> {
    NonZeroU32::new(id).map(glow::NativeProgram)
}

fn texture(id: u32) -> Option<glow::NativeTexture> {
    NonZeroU32::new(id).map(glow::NativeTexture)
}

fn framebuffer(id: u32) -> Option<glow::NativeFramebuffer> {
    NonZeroU32::new(id).map(glow::NativeFramebuffer)
}

fn location(location: u32) -> Option<glow::NativeUniformLocation> {
    Some(glow::NativeUniformLocation(location))
}

impl GlowDriver {
    pub fn new(gl: glow::Context, gfx_debug_enabled: bool) -> Self {
        Self {
            gl,
            debug: gfx_debug_enabled,
            vbo: None,
            vao: None,
        }
    }

    pub fn context(&self) -> &glow::Context {
        &self.gl
    }
}

impl Driver for GlowDriver {
    fn max_texture_size(&self) -> i32 {
        unsafe { self.gl.get_parameter_i32(glow::MAX_TEXTURE_SIZE) }
    }

    fn begin_render(&mut self) {
        let gl = &self.gl;
        unsafe {
            gl.enable(glow::DEPTH_TEST);
            gl.depth_func(glow::LEQUAL);
            gl.enable(glow::BLEND);
            // Premultiplied alpha throughout the shader library.
            gl.blend_func(glow::ONE, glow::ONE_MINUS_SRC_ALPHA);
        }
    }

    fn upload_vertices(&mut self, data: &[u8]) {
        let gl = &self.gl;
        unsafe {
            // Buffer allocation failing here means the context is lost;
            // nothing sensible to do but abort the process.
            let vao = gl
                .create_vertex_array()
                .expect("failed to create vertex array");
            let vbo = gl.create_buffer().expect("failed to create vertex buffer");
            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, data, glow::STREAM_DRAW);

            let stride = 4 * mem::size_of::<f32>() as i32;
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, stride, 0);
            gl.enable_vertex_attrib_array(1);
            gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, stride, 8);

            self.vao = Some(vao);
            self.vbo = Some(vbo);
        }
    }

    fn release_vertices(&mut self) {
        let gl = &self.gl;
        unsafe {
            if let Some(vbo) = self.vbo.take() {
                gl.delete_buffer(vbo);
            }
            if let Some(vao) = self.vao.take() {
                gl.bind_vertex_array(None);
                gl.delete_vertex_array(vao);
            }
        }
    }

    fn use_program(&mut self, program_id: u32) {
        unsafe { self.gl.use_program(program(program_id)) }
    }

    fn delete_program(&mut self, program_id: u32) {
        if let Some(p) = program(program_id) {
            unsafe { self.gl.delete_program(p) }
        }
    }

    fn bind_framebuffer(&mut self, id: u32) {
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, framebuffer(id)) }
    }

    fn set_viewport(&mut self, width: u16, height: u16) {
        unsafe { self.gl.viewport(0, 0, i32::from(width), i32::from(height)) }
    }

    fn set_scissor(&mut self, x: i32, y: i32, width: i32, height: i32) {
        unsafe {
            self.gl.enable(glow::SCISSOR_TEST);
            self.gl.scissor(x, y, width, height);
        }
    }

    fn disable_scissor(&mut self) {
        unsafe { self.gl.disable(glow::SCISSOR_TEST) }
    }

    fn clear(&mut self, mask: ClearMask) {
        let mut bits = 0;
        if mask.contains(ClearMask::COLOR) {
            bits |= glow::COLOR_BUFFER_BIT;
        }
        if mask.contains(ClearMask::DEPTH) {
            bits |= glow::DEPTH_BUFFER_BIT;
        }
        if mask.contains(ClearMask::STENCIL) {
            bits |= glow::STENCIL_BUFFER_BIT;
        }
        unsafe { self.gl.clear(bits) }
    }

    fn bind_texture(&mut self, slot: u32, id: u32) {
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + slot);
            self.gl.bind_texture(glow::TEXTURE_2D, texture(id));
        }
    }

    fn draw_arrays(&mut self, first: u32, count: u32) {
        unsafe {
            self.gl
                .draw_arrays(glow::TRIANGLES, first as i32, count as i32)
        }
    }

    fn push_debug_group(&mut self, label: &str) {
        if self.debug {
            unsafe {
                self.gl
                    .push_debug_group(glow::DEBUG_SOURCE_APPLICATION, 0, label)
            }
        }
    }

    fn pop_debug_group(&mut self) {
        if self.debug {
            unsafe { self.gl.pop_debug_group() }
        }
    }

    fn create_texture(&mut self, width: i32, height: i32, filter: SamplerFilter) -> u32 {
        let gl = &self.gl;
        let filter_mode = match filter {
            SamplerFilter::Linear => glow::LINEAR,
            SamplerFilter::Nearest => glow::NEAREST,
        } as i32;
        unsafe {
            let t = match gl.create_texture() {
                Ok(t) => t,
                Err(e) => {
                    warn!("texture allocation failed: {e}");
                    return 0;
                }
            };
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, Some(t));

            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter_mode);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter_mode);
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_S,
                glow::CLAMP_TO_EDGE as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_T,
                glow::CLAMP_TO_EDGE as i32,
            );
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_BASE_LEVEL, 0);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAX_LEVEL, 0);

            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                width,
                height,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                PixelUnpackData::Slice(None),
            );

            t.0.get()
        }
    }

    fn create_framebuffer(&mut self) -> u32 {
        unsafe {
            match self.gl.create_framebuffer() {
                Ok(f) => f.0.get(),
                Err(e) => {
                    warn!("framebuffer allocation failed: {e}");
                    0
                }
            }
        }
    }

    fn attach_color_texture(&mut self, framebuffer_id: u32, texture_id: u32) {
        unsafe {
            self.gl
                .bind_framebuffer(glow::FRAMEBUFFER, framebuffer(framebuffer_id));
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                texture(texture_id),
                0,
            );
        }
    }

    fn uniform_1f(&mut self, loc: u32, v0: f32) {
        unsafe { self.gl.uniform_1_f32(location(loc).as_ref(), v0) }
    }

    fn uniform_2f(&mut self, loc: u32, v0: f32, v1: f32) {
        unsafe { self.gl.uniform_2_f32(location(loc).as_ref(), v0, v1) }
    }

    fn uniform_3f(&mut self, loc: u32, v0: f32, v1: f32, v2: f32) {
        unsafe { self.gl.uniform_3_f32(location(loc).as_ref(), v0, v1, v2) }
    }

    fn uniform_4f(&mut self, loc: u32, v0: f32, v1: f32, v2: f32, v3: f32) {
        unsafe {
            self.gl
                .uniform_4_f32(location(loc).as_ref(), v0, v1, v2, v3)
        }
    }

    fn uniform_1i(&mut self, loc: u32, v0: i32) {
        unsafe { self.gl.uniform_1_i32(location(loc).as_ref(), v0) }
    }

    fn uniform_2i(&mut self, loc: u32, v0: i32, v1: i32) {
        unsafe { self.gl.uniform_2_i32(location(loc).as_ref(), v0, v1) }
    }

    fn uniform_3i(&mut self, loc: u32, v0: i32, v1: i32, v2: i32) {
        unsafe { self.gl.uniform_3_i32(location(loc).as_ref(), v0, v1, v2) }
    }

    fn uniform_4i(&mut self, loc: u32, v0: i32, v1: i32, v2: i32, v3: i32) {
        unsafe {
            self.gl
                .uniform_4_i32(location(loc).as_ref(), v0, v1, v2, v3)
        }
    }

    fn uniform_1ui(&mut self, loc: u32, v0: u32) {
        unsafe { self.gl.uniform_1_u32(location(loc).as_ref(), v0) }
    }

    fn uniform_1fv(&mut self, loc: u32, values: &[f32]) {
        unsafe { self.gl.uniform_1_f32_slice(location(loc).as_ref(), values) }
    }

    fn uniform_2fv(&mut self, loc: u32, values: &[f32]) {
        unsafe { self.gl.uniform_2_f32_slice(location(loc).as_ref(), values) }
    }

    fn uniform_3fv(&mut self, loc: u32, values: &[f32]) {
        unsafe { self.gl.uniform_3_f32_slice(location(loc).as_ref(), values) }
    }

    fn uniform_4fv(&mut self, loc: u32, values: &[f32]) {
        unsafe { self.gl.uniform_4_f32_slice(location(loc).as_ref(), values) }
    }

    fn uniform_matrix(&mut self, loc: u32, values: &[f32]) {
        debug_assert_eq!(values.len(), 16);
        unsafe {
            self.gl
                .uniform_matrix_4_f32_slice(location(loc).as_ref(), false, values)
        }
    }
}

#[cfg(test)]
pub(crate) mod trace {
    use super::Driver;
    use crate::{ClearMask, SamplerFilter};

    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        BeginRender,
        UploadVertices(usize),
        ReleaseVertices,
        UseProgram(u32),
        DeleteProgram(u32),
        BindFramebuffer(u32),
        Viewport(u16, u16),
        Scissor(i32, i32, i32, i32),
        DisableScissor,
        Clear(ClearMask),
        BindTexture(u32, u32),
        DrawArrays(u32, u32),
        PushDebugGroup(String),
        PopDebugGroup,
        CreateTexture(i32, i32),
        CreateFramebuffer,
        AttachColorTexture(u32, u32),
        Uniform1f(u32, f32),
        Uniform2f(u32, f32, f32),
        Uniform3f(u32, f32, f32, f32),
        Uniform4f(u32, f32, f32, f32, f32),
        Uniform1i(u32, i32),
        Uniform2i(u32, i32, i32),
        Uniform3i(u32, i32, i32, i32),
        Uniform4i(u32, i32, i32, i32, i32),
        Uniform1ui(u32, u32),
        /// (location, components per element, flat values)
        UniformFv(u32, u8, Vec<f32>),
        UniformMatrix(u32, Vec<f32>),
    }

    /// Records every call in order so tests can assert on the exact GL
    /// stream a replay produces.
    pub struct TraceDriver {
        pub calls: Vec<Call>,
        pub max_texture_size: i32,
        next_id: u32,
    }

    impl TraceDriver {
        pub fn new() -> Self {
            Self {
                calls: Vec::new(),
                max_texture_size: 4096,
                next_id: 1,
            }
        }

        fn fresh_id(&mut self) -> u32 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }
    }

    impl Driver for TraceDriver {
        fn max_texture_size(&self) -> i32 {
            self.max_texture_size
        }

        fn begin_render(&mut self) {
            self.calls.push(Call::BeginRender);
        }

        fn upload_vertices(&mut self, data: &[u8]) {
            self.calls.push(Call::UploadVertices(data.len()));
        }

        fn release_vertices(&mut self) {
            self.calls.push(Call::ReleaseVertices);
        }

        fn use_program(&mut self, program: u32) {
            self.calls.push(Call::UseProgram(program));
        }

        fn delete_program(&mut self, program: u32) {
            self.calls.push(Call::DeleteProgram(program));
        }

        fn bind_framebuffer(&mut self, id: u32) {
            self.calls.push(Call::BindFramebuffer(id));
        }

        fn set_viewport(&mut self, width: u16, height: u16) {
            self.calls.push(Call::Viewport(width, height));
        }

        fn set_scissor(&mut self, x: i32, y: i32, width: i32, height: i32) {
            self.calls.push(Call::Scissor(x, y, width, height));
        }

        fn disable_scissor(&mut self) {
            self.calls.push(Call::DisableScissor);
        }

        fn clear(&mut self, mask: ClearMask) {
            self.calls.push(Call::Clear(mask));
        }

        fn bind_texture(&mut self, slot: u32, id: u32) {
            self.calls.push(Call::BindTexture(slot, id));
        }

        fn draw_arrays(&mut self, first: u32, count: u32) {
            self.calls.push(Call::DrawArrays(first, count));
        }

        fn push_debug_group(&mut self, label: &str) {
            self.calls.push(Call::PushDebugGroup(label.to_owned()));
        }

        fn pop_debug_group(&mut self) {
            self.calls.push(Call::PopDebugGroup);
        }

        fn create_texture(&mut self, width: i32, height: i32, _filter: SamplerFilter) -> u32 {
            self.calls.push(Call::CreateTexture(width, height));
            self.fresh_id()
        }

        fn create_framebuffer(&mut self) -> u32 {
            self.calls.push(Call::CreateFramebuffer);
            self.fresh_id()
        }

        fn attach_color_texture(&mut self, framebuffer: u32, texture: u32) {
            self.calls.push(Call::AttachColorTexture(framebuffer, texture));
        }

        fn uniform_1f(&mut self, location: u32, v0: f32) {
            self.calls.push(Call::Uniform1f(location, v0));
        }

        fn uniform_2f(&mut self, location: u32, v0: f32, v1: f32) {
            self.calls.push(Call::Uniform2f(location, v0, v1));
        }

        fn uniform_3f(&mut self, location: u32, v0: f32, v1: f32, v2: f32) {
            self.calls.push(Call::Uniform3f(location, v0, v1, v2));
        }

        fn uniform_4f(&mut self, location: u32, v0: f32, v1: f32, v2: f32, v3: f32) {
            self.calls.push(Call::Uniform4f(location, v0, v1, v2, v3));
        }

        fn uniform_1i(&mut self, location: u32, v0: i32) {
            self.calls.push(Call::Uniform1i(location, v0));
        }

        fn uniform_2i(&mut self, location: u32, v0: i32, v1: i32) {
            self.calls.push(Call::Uniform2i(location, v0, v1));
        }

        fn uniform_3i(&mut self, location: u32, v0: i32, v1: i32, v2: i32) {
            self.calls.push(Call::Uniform3i(location, v0, v1, v2));
        }

        fn uniform_4i(&mut self, location: u32, v0: i32, v1: i32, v2: i32, v3: i32) {
            self.calls.push(Call::Uniform4i(location, v0, v1, v2, v3));
        }

        fn uniform_1ui(&mut self, location: u32, v0: u32) {
            self.calls.push(Call::Uniform1ui(location, v0));
        }

        fn uniform_1fv(&mut self, location: u32, values: &[f32]) {
            self.calls.push(Call::UniformFv(location, 1, values.to_vec()));
        }

        fn uniform_2fv(&mut self, location: u32, values: &[f32]) {
            self.calls.push(Call::UniformFv(location, 2, values.to_vec()));
        }

        fn uniform_3fv(&mut self, location: u32, values: &[f32]) {
            self.calls.push(Call::UniformFv(location, 3, values.to_vec()));
        }

        fn uniform_4fv(&mut self, location: u32, values: &[f32]) {
            self.calls.push(Call::UniformFv(location, 4, values.to_vec()));
        }

        fn uniform_matrix(&mut self, location: u32, values: &[f32]) {
            self.calls.push(Call::UniformMatrix(location, values.to_vec()));
        }
    }
}
