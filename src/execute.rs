use crate::driver::Driver;
use crate::queue::{BatchKind, CommandQueue, NO_BATCH};
use crate::uniforms::{ChangedUniform, UniformFormat, UniformState};
use crate::{FrameMetrics, ScissorRect, Viewport};
use log::trace;

impl CommandQueue {
    /// Replays the recorded frame against `driver`, issuing only the state
    /// transitions the batches actually require. Batches run in submission
    /// order via their links, which is also index order today.
    ///
    /// `scissor` limits rendering on the default framebuffer; offscreen
    /// targets are always drawn in full. The rectangle is given in
    /// logical surface coordinates with a top-left origin and is mapped to
    /// GL's bottom-left convention using `surface_height` and
    /// `scale_factor`.
    ///
    /// The queue still holds the frame afterwards; call
    /// [`end_frame`](Self::end_frame) to reclaim it.
    pub fn execute<D: Driver>(
        &mut self,
        driver: &mut D,
        surface_height: u32,
        scale_factor: u32,
        scissor: Option<ScissorRect>,
    ) -> FrameMetrics {
        assert!(!self.in_draw, "execute inside an open draw");
        let mut metrics = FrameMetrics::default();
        if self.batches.is_empty() {
            return metrics;
        }

        driver.begin_render();
        self.vertices.submit(driver);

        // Replay-side last-seen state. `framebuffer` starts unknown so the
        // first batch always binds; scissor starts disabled to match.
        let mut framebuffer: Option<u32> = None;
        let mut program: Option<u32> = None;
        let mut viewport = Viewport::default();
        driver.disable_scissor();

        let uniforms = self.uniforms.borrow();
        let mut next = 0u32;
        while next != NO_BATCH {
            let batch = &self.batches[next as usize];
            debug_assert_ne!(batch.next, next, "batch list cycle");
            next = batch.next;

            match batch.kind {
                BatchKind::Clear { bits, framebuffer: target } => {
                    if framebuffer != Some(target) {
                        framebuffer = Some(target);
                        driver.bind_framebuffer(target);
                        apply_scissor(driver, target, surface_height, scale_factor, scissor);
                        metrics.n_fbos += 1;
                    }
                    if viewport != batch.viewport {
                        viewport = batch.viewport;
                        driver.set_viewport(viewport.width, viewport.height);
                    }
                    driver.clear(bits);
                }
                BatchKind::PushDebugGroup { label } => {
                    driver.push_debug_group(self.label(label));
                }
                BatchKind::PopDebugGroup => {
                    driver.pop_debug_group();
                }
                BatchKind::Draw(draw) => {
                    if program != Some(batch.program) {
                        program = Some(batch.program);
                        driver.use_program(batch.program);
                    }
                    if framebuffer != Some(draw.framebuffer) {
                        framebuffer = Some(draw.framebuffer);
                        driver.bind_framebuffer(draw.framebuffer);
                        apply_scissor(
                            driver,
                            draw.framebuffer,
                            surface_height,
                            scale_factor,
                            scissor,
                        );
                        metrics.n_fbos += 1;
                    }
                    if viewport != batch.viewport {
                        viewport = batch.viewport;
                        driver.set_viewport(viewport.width, viewport.height);
                    }

                    let binds = draw.bind_offset as usize
                        ..(draw.bind_offset + draw.bind_count) as usize;
                    for bind in &self.batch_binds[binds] {
                        driver.bind_texture(u32::from(bind.slot), bind.id);
                    }
                    metrics.n_binds += draw.bind_count;

                    let changes = draw.uniform_offset as usize
                        ..(draw.uniform_offset + draw.uniform_count) as usize;
                    for change in &self.batch_uniforms[changes] {
                        apply_uniform(driver, &uniforms, change);
                    }
                    metrics.n_uniforms += draw.uniform_count;

                    driver.draw_arrays(draw.vbo_offset, draw.vbo_count);
                }
            }
        }
        drop(uniforms);

        driver.release_vertices();
        trace!(
            "executed {} batches: {} fbo binds, {} texture binds, {} uniform uploads",
            self.batches.len(),
            metrics.n_fbos,
            metrics.n_binds,
            metrics.n_uniforms
        );
        metrics
    }
}

/// Scissoring applies only to the default framebuffer; offscreen passes
/// render their full target. Reapplied on every framebuffer switch so the
/// GL scissor state always matches the bound target.
fn apply_scissor<D: Driver>(
    driver: &mut D,
    framebuffer: u32,
    surface_height: u32,
    scale_factor: u32,
    scissor: Option<ScissorRect>,
) {
    if let (0, Some(rect)) = (framebuffer, scissor) {
        let scale = scale_factor as i32;
        // Top-left logical coordinates to bottom-left device pixels.
        let y = surface_height as i32 - rect.height * scale - rect.y * scale;
        driver.set_scissor(rect.x * scale, y, rect.width * scale, rect.height * scale);
    } else {
        driver.disable_scissor();
    }
}

fn apply_uniform<D: Driver>(driver: &mut D, state: &UniformState, change: &ChangedUniform) {
    let loc = change.location;
    let off = change.offset;
    let n = usize::from(change.array_count.max(1));
    match change.format {
        UniformFormat::F1 => {
            let v = state.data_f32(off, 1);
            driver.uniform_1f(loc, v[0]);
        }
        UniformFormat::F2 => {
            let v = state.data_f32(off, 2);
            driver.uniform_2f(loc, v[0], v[1]);
        }
        UniformFormat::F3 => {
            let v = state.data_f32(off, 3);
            driver.uniform_3f(loc, v[0], v[1], v[2]);
        }
        UniformFormat::F4 => {
            let v = state.data_f32(off, 4);
            driver.uniform_4f(loc, v[0], v[1], v[2], v[3]);
        }
        UniformFormat::Fv1 => driver.uniform_1fv(loc, state.data_f32(off, n)),
        UniformFormat::Fv2 => driver.uniform_2fv(loc, state.data_f32(off, 2 * n)),
        UniformFormat::Fv3 => driver.uniform_3fv(loc, state.data_f32(off, 3 * n)),
        UniformFormat::Fv4 => driver.uniform_4fv(loc, state.data_f32(off, 4 * n)),
        UniformFormat::I1 => {
            let v = state.data_i32(off, 1);
            driver.uniform_1i(loc, v[0]);
        }
        UniformFormat::I2 => {
            let v = state.data_i32(off, 2);
            driver.uniform_2i(loc, v[0], v[1]);
        }
        UniformFormat::I3 => {
            let v = state.data_i32(off, 3);
            driver.uniform_3i(loc, v[0], v[1], v[2]);
        }
        UniformFormat::I4 => {
            let v = state.data_i32(off, 4);
            driver.uniform_4i(loc, v[0], v[1], v[2], v[3]);
        }
        UniformFormat::Ui1 => driver.uniform_1ui(loc, state.data_u32(off, 1)[0]),
        // Samplers read a slot index; GL wants it as a signed int.
        UniformFormat::Texture => driver.uniform_1i(loc, state.data_u32(off, 1)[0] as i32),
        UniformFormat::Matrix => driver.uniform_matrix(loc, state.data_f32(off, 16)),
        UniformFormat::Color => driver.uniform_4fv(loc, state.data_f32(off, 4)),
        // Compact form sends the bounds vec4 only, the long form adds the
        // four corner vec2s.
        UniformFormat::RoundedRect => {
            let count = if change.send_corners { 12 } else { 4 };
            driver.uniform_4fv(loc, state.data_f32(off, count));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::trace::{Call, TraceDriver};
    use crate::uniforms::RoundedRect;
    use crate::{ClearMask, SamplerFilter};
    use glam::Mat4;

    const QUAD: u32 = 6;
    const VP: Viewport = Viewport {
        width: 800,
        height: 600,
    };

    fn quad(queue: &mut CommandQueue, program: u32) {
        queue.begin_draw(program, VP);
        queue.add_vertices(QUAD);
        queue.end_draw();
    }

    fn run(queue: &mut CommandQueue) -> (Vec<Call>, FrameMetrics) {
        let mut driver = TraceDriver::new();
        let metrics = queue.execute(&mut driver, 600, 1, None);
        (driver.calls, metrics)
    }

    #[test]
    fn empty_frame_touches_nothing() {
        let mut queue = CommandQueue::new();
        queue.begin_frame();
        let (calls, metrics) = run(&mut queue);
        assert!(calls.is_empty());
        assert_eq!(metrics.n_fbos, 0);
    }

    #[test]
    fn a_simple_frame_issues_the_minimal_stream() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut queue = CommandQueue::new();
        queue.begin_frame();
        queue.clear(ClearMask::COLOR, VP);
        queue.set_uniform_texture(1, 2, 0, 40);
        quad(&mut queue, 1);
        queue.set_uniform_texture(1, 2, 0, 40);
        quad(&mut queue, 1);

        let (calls, metrics) = run(&mut queue);
        assert_eq!(
            calls,
            vec![
                Call::BeginRender,
                Call::UploadVertices(2 * QUAD as usize * 16),
                Call::DisableScissor,
                Call::BindFramebuffer(0),
                Call::DisableScissor,
                Call::Viewport(800, 600),
                Call::Clear(ClearMask::COLOR),
                Call::UseProgram(1),
                Call::BindTexture(0, 40),
                Call::Uniform1i(2, 0),
                Call::DrawArrays(0, 2 * QUAD),
                Call::ReleaseVertices,
            ],
            "two draws with identical state must replay as one"
        );
        assert_eq!(metrics.n_binds, 1);
        assert_eq!(metrics.n_uniforms, 1);
        assert_eq!(metrics.n_fbos, 1);
    }

    #[test]
    fn program_and_viewport_changes_are_deduplicated() {
        let mut queue = CommandQueue::new();
        queue.begin_frame();
        quad(&mut queue, 1);
        queue.set_uniform_1f(1, 0, 0.5);
        quad(&mut queue, 1);
        quad(&mut queue, 2);

        let (calls, _) = run(&mut queue);
        let programs: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::UseProgram(_)))
            .collect();
        assert_eq!(programs.len(), 2, "the program is only switched when it differs");
        let viewports = calls.iter().filter(|c| matches!(c, Call::Viewport(..)));
        assert_eq!(viewports.count(), 1, "an unchanged viewport is never reissued");
    }

    #[test]
    fn scissor_applies_on_the_default_framebuffer_only() {
        let mut queue = CommandQueue::new();
        queue.begin_frame();
        quad(&mut queue, 1);
        queue.bind_framebuffer(5);
        queue.set_uniform_1f(1, 0, 0.5);
        quad(&mut queue, 1);
        queue.bind_framebuffer(0);
        queue.set_uniform_1f(1, 0, 0.75);
        quad(&mut queue, 1);

        let mut driver = TraceDriver::new();
        let rect = ScissorRect {
            x: 10,
            y: 20,
            width: 100,
            height: 50,
        };
        queue.execute(&mut driver, 600, 2, Some(rect));

        // y = surface_height - height*scale - y*scale = 600 - 100 - 40.
        let scissors: Vec<_> = driver
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Scissor(..) | Call::DisableScissor))
            .cloned()
            .collect();
        assert_eq!(
            scissors,
            vec![
                Call::DisableScissor,
                Call::Scissor(20, 460, 200, 100),
                Call::DisableScissor,
                Call::Scissor(20, 460, 200, 100),
            ],
            "the scissor follows the framebuffer: on for the default target, off offscreen"
        );
    }

    #[test]
    fn uniform_dispatch_matches_each_format() {
        let mut queue = CommandQueue::new();
        queue.begin_frame();
        queue.set_uniform_1f(1, 0, 0.25);
        queue.set_uniform_2i(1, 1, 3, 4);
        queue.set_uniform_matrix(1, 2, &Mat4::IDENTITY);
        queue.set_uniform_color(1, 3, [0.1, 0.2, 0.3, 1.0]);
        queue.set_uniform_2fv(1, 4, &[1.0, 2.0, 3.0, 4.0]);
        quad(&mut queue, 1);

        let (calls, metrics) = run(&mut queue);
        assert_eq!(metrics.n_uniforms, 5);
        assert!(calls.contains(&Call::Uniform1f(0, 0.25)));
        assert!(calls.contains(&Call::Uniform2i(1, 3, 4)));
        assert!(calls.contains(&Call::UniformMatrix(2, Mat4::IDENTITY.to_cols_array().to_vec())));
        assert!(calls.contains(&Call::UniformFv(3, 4, vec![0.1, 0.2, 0.3, 1.0])));
        assert!(calls.contains(&Call::UniformFv(4, 2, vec![1.0, 2.0, 3.0, 4.0])));
    }

    #[test]
    fn rounded_rect_sends_the_long_form_only_when_corners_changed() {
        let mut queue = CommandQueue::new();
        queue.begin_frame();
        let mut rect = RoundedRect {
            bounds: [0.0, 0.0, 10.0, 10.0],
            corners: [[2.0, 2.0]; 4],
        };
        queue.set_uniform_rounded_rect(1, 0, &rect);
        quad(&mut queue, 1);
        rect.bounds = [5.0, 5.0, 10.0, 10.0];
        queue.set_uniform_rounded_rect(1, 0, &rect);
        quad(&mut queue, 1);

        let (calls, _) = run(&mut queue);
        let rects: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::UniformFv(0, 4, v) => Some(v.len()),
                _ => None,
            })
            .collect();
        assert_eq!(
            rects,
            vec![12, 4],
            "the first upload carries corners, the bounds-only change does not"
        );
    }

    #[test]
    fn snapshots_survive_later_writes_to_the_same_uniform() {
        let mut queue = CommandQueue::new();
        queue.begin_frame();
        queue.set_uniform_1f(1, 0, 0.25);
        quad(&mut queue, 1);
        queue.set_uniform_1f(1, 0, 0.75);
        quad(&mut queue, 1);

        let (calls, _) = run(&mut queue);
        let values: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Uniform1f(0, v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(
            values,
            vec![0.25, 0.75],
            "each draw must replay the value it recorded, not the final one"
        );
    }

    #[test]
    fn debug_groups_are_forwarded_in_order() {
        let mut queue = CommandQueue::new();
        queue.begin_frame();
        queue.push_debug_group("shadow pass");
        quad(&mut queue, 1);
        queue.pop_debug_group();

        let (calls, _) = run(&mut queue);
        let idx_push = calls
            .iter()
            .position(|c| *c == Call::PushDebugGroup("shadow pass".into()))
            .unwrap();
        let idx_draw = calls
            .iter()
            .position(|c| matches!(c, Call::DrawArrays(..)))
            .unwrap();
        let idx_pop = calls.iter().position(|c| *c == Call::PopDebugGroup).unwrap();
        assert!(idx_push < idx_draw && idx_draw < idx_pop);
    }

    #[test]
    fn offscreen_target_round_trip() {
        let mut queue = CommandQueue::new();
        let mut driver = TraceDriver::new();
        queue.begin_frame();
        let (fbo, tex) = queue
            .create_render_target(&mut driver, 64, 64, SamplerFilter::Linear)
            .unwrap();

        queue.bind_framebuffer(fbo);
        queue.set_uniform_matrix(1, 0, &Mat4::IDENTITY);
        queue.begin_draw(1, Viewport::new(64, 64));
        queue.add_vertices(QUAD);
        queue.end_draw();

        queue.bind_framebuffer(0);
        queue.set_uniform_texture(2, 1, 0, tex);
        quad(&mut queue, 2);

        let metrics = queue.execute(&mut driver, 600, 1, None);
        assert_eq!(metrics.n_fbos, 2, "one bind per distinct target");
        assert!(driver.calls.contains(&Call::BindFramebuffer(fbo)));
        assert!(driver.calls.contains(&Call::BindTexture(0, tex)));
        queue.end_frame();
    }
}
