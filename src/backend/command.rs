// Command recording
//
// CommandStream wraps one command buffer and enforces its lifecycle:
//   Idle -> Recording -> Executable -> Submitted -> Idle
// Record operations are only legal while Recording. Image layout
// transitions are limited to the policies in `transition_policy`.
//
// CommandPool hands out streams FIFO from one command pool and is reset
// wholesale at frame boundaries.

use super::gpu::{Gpu, GpuCommand, Submission};
use crate::error::{CoreError, CoreResult};
use ash::vk;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Recording,
    Executable,
    Submitted,
}

/// Stages, access masks and aspect for one supported layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// Barrier policy for `old -> new`, or None if the pair is unsupported
pub fn transition_policy(old: vk::ImageLayout, new: vk::ImageLayout) -> Option<LayoutTransition> {
    use vk::ImageLayout as L;
    match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Some(LayoutTransition {
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            src_access: vk::AccessFlags::empty(),
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            aspect: vk::ImageAspectFlags::COLOR,
        }),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Some(LayoutTransition {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags::SHADER_READ,
            aspect: vk::ImageAspectFlags::COLOR,
        }),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => Some(LayoutTransition {
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            src_access: vk::AccessFlags::empty(),
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            aspect: vk::ImageAspectFlags::DEPTH,
        }),
        _ => None,
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

/// One recordable command buffer
pub struct CommandStream {
    gpu: Arc<dyn Gpu>,
    buffer: vk::CommandBuffer,
    state: StreamState,
    in_render_pass: bool,
}

impl CommandStream {
    pub fn new(gpu: Arc<dyn Gpu>, buffer: vk::CommandBuffer) -> Self {
        Self {
            gpu,
            buffer,
            state: StreamState::Idle,
            in_render_pass: false,
        }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn expect_state(&self, expected: StreamState, operation: &str) -> CoreResult<()> {
        if self.state != expected {
            return Err(CoreError::invalid(format!(
                "{} requires a {:?} command stream (stream is {:?})",
                operation, expected, self.state
            )));
        }
        Ok(())
    }

    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> CoreResult<()> {
        self.expect_state(StreamState::Idle, "begin")?;
        self.gpu.begin_command_buffer(self.buffer, flags)?;
        self.state = StreamState::Recording;
        self.in_render_pass = false;
        Ok(())
    }

    pub fn end(&mut self) -> CoreResult<()> {
        self.expect_state(StreamState::Recording, "end")?;
        if self.in_render_pass {
            return Err(CoreError::invalid("end with an open render pass"));
        }
        self.gpu.end_command_buffer(self.buffer)?;
        self.state = StreamState::Executable;
        Ok(())
    }

    /// Discard recorded work. Legal in Idle and Executable.
    pub fn reset(&mut self) -> CoreResult<()> {
        match self.state {
            StreamState::Idle | StreamState::Executable => {
                self.gpu.reset_command_buffer(self.buffer)?;
                self.state = StreamState::Idle;
                Ok(())
            }
            other => Err(CoreError::invalid(format!("reset of a {:?} command stream", other))),
        }
    }

    /// Submit to the graphics queue; the stream becomes Submitted
    pub fn submit(
        &mut self,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> CoreResult<()> {
        self.expect_state(StreamState::Executable, "submit")?;
        let wait_semaphores: Vec<vk::Semaphore> = wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = wait.iter().map(|(_, stage)| *stage).collect();
        let command_buffers = [self.buffer];

        self.gpu
            .queue_submit(&Submission {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: signal,
                fence,
            })
            .map_err(|e| CoreError::from_vk(e, CoreError::SubmitFailed))?;
        self.state = StreamState::Submitted;
        Ok(())
    }

    /// Call once the fence covering the submission has been waited on
    pub fn mark_complete(&mut self) -> CoreResult<()> {
        self.expect_state(StreamState::Submitted, "mark_complete")?;
        self.state = StreamState::Idle;
        Ok(())
    }

    fn record(&mut self, command: GpuCommand) -> CoreResult<()> {
        self.expect_state(StreamState::Recording, "recording")?;
        if command.requires_render_pass() && !self.in_render_pass {
            return Err(CoreError::invalid("draw outside a render pass"));
        }
        if command.forbidden_in_render_pass() && self.in_render_pass {
            return Err(CoreError::invalid("transfer or nested render pass inside a render pass"));
        }
        match command {
            GpuCommand::BeginRenderPass { .. } => self.in_render_pass = true,
            GpuCommand::EndRenderPass => {
                if !self.in_render_pass {
                    return Err(CoreError::invalid("end_pass without begin_pass"));
                }
                self.in_render_pass = false;
            }
            _ => {}
        }
        self.gpu.record(self.buffer, &command);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Render pass
    // ─────────────────────────────────────────────────────────────────────

    pub fn begin_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) -> CoreResult<()> {
        self.record(GpuCommand::BeginRenderPass {
            render_pass,
            framebuffer,
            render_area,
            clear_values: clear_values.to_vec(),
        })
    }

    pub fn end_pass(&mut self) -> CoreResult<()> {
        self.record(GpuCommand::EndRenderPass)
    }

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) -> CoreResult<()> {
        self.record(GpuCommand::BindPipeline { bind_point, pipeline })
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize) -> CoreResult<()> {
        self.record(GpuCommand::BindVertexBuffer { binding, buffer, offset })
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) -> CoreResult<()> {
        self.record(GpuCommand::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        })
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> CoreResult<()> {
        self.record(GpuCommand::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        })
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> CoreResult<()> {
        self.record(GpuCommand::SetViewport(viewport))
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> CoreResult<()> {
        self.record(GpuCommand::SetScissor(scissor))
    }

    /// Viewport and scissor covering the whole of `extent`
    pub fn set_full_viewport(&mut self, extent: vk::Extent2D) -> CoreResult<()> {
        self.set_viewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        })?;
        self.set_scissor(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
    }

    pub fn set_line_width(&mut self, width: f32) -> CoreResult<()> {
        self.record(GpuCommand::SetLineWidth(width))
    }

    pub fn set_depth_bias(&mut self, constant_factor: f32, clamp: f32, slope_factor: f32) -> CoreResult<()> {
        self.record(GpuCommand::SetDepthBias {
            constant_factor,
            clamp,
            slope_factor,
        })
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> CoreResult<()> {
        self.record(GpuCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> CoreResult<()> {
        self.record(GpuCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transfer
    // ─────────────────────────────────────────────────────────────────────

    pub fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        src_offset: vk::DeviceSize,
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> CoreResult<()> {
        self.record(GpuCommand::CopyBuffer {
            src,
            dst,
            region: vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            },
        })
    }

    /// Record a layout barrier. Unsupported pairs fail and record nothing.
    pub fn transition_image(&mut self, image: vk::Image, old: vk::ImageLayout, new: vk::ImageLayout) -> CoreResult<()> {
        self.expect_state(StreamState::Recording, "transition_image")?;
        let policy = transition_policy(old, new).ok_or(CoreError::UnsupportedLayoutTransition { old, new })?;
        self.record(GpuCommand::ImageBarrier {
            image,
            aspect: policy.aspect,
            old_layout: old,
            new_layout: new,
            src_stage: policy.src_stage,
            dst_stage: policy.dst_stage,
            src_access: policy.src_access,
            dst_access: policy.dst_access,
        })
    }

    /// Copy tightly packed texels into a TRANSFER_DST_OPTIMAL color image
    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        src_offset: vk::DeviceSize,
        image: vk::Image,
        extent: vk::Extent2D,
    ) -> CoreResult<()> {
        self.record(GpuCommand::CopyBufferToImage {
            src,
            dst: image,
            dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            region: vk::BufferImageCopy {
                buffer_offset: src_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: color_layers(),
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            },
        })
    }

    pub fn blit_image(
        &mut self,
        src: vk::Image,
        src_extent: vk::Extent2D,
        dst: vk::Image,
        dst_extent: vk::Extent2D,
        filter: vk::Filter,
    ) -> CoreResult<()> {
        let origin = vk::Offset3D { x: 0, y: 0, z: 0 };
        self.record(GpuCommand::BlitImage {
            src,
            src_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            region: vk::ImageBlit {
                src_subresource: color_layers(),
                src_offsets: [origin, far_corner(src_extent)],
                dst_subresource: color_layers(),
                dst_offsets: [origin, far_corner(dst_extent)],
            },
            filter,
        })
    }
}

/// FIFO pool of command streams backed by one command pool
pub struct CommandPool {
    gpu: Arc<dyn Gpu>,
    pool: vk::CommandPool,
    streams: Vec<CommandStream>,
    free: VecDeque<usize>,
}

impl CommandPool {
    pub fn new(gpu: Arc<dyn Gpu>) -> CoreResult<Self> {
        let pool = gpu.create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        Ok(Self {
            gpu,
            pool,
            streams: Vec::new(),
            free: VecDeque::new(),
        })
    }

    /// Take the oldest free stream, allocating a new one when none is free
    pub fn acquire(&mut self) -> CoreResult<(usize, &mut CommandStream)> {
        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                let buffer = self
                    .gpu
                    .allocate_command_buffers(self.pool, 1)?
                    .into_iter()
                    .next()
                    .ok_or(CoreError::Api(vk::Result::ERROR_UNKNOWN))?;
                self.streams.push(CommandStream::new(self.gpu.clone(), buffer));
                log::trace!("Command pool grew to {} streams", self.streams.len());
                self.streams.len() - 1
            }
        };
        Ok((index, &mut self.streams[index]))
    }

    /// Return a stream to the back of the free list
    pub fn release(&mut self, index: usize) -> CoreResult<()> {
        let stream = self
            .streams
            .get_mut(index)
            .ok_or_else(|| CoreError::invalid("release of an unknown command stream"))?;
        if self.free.contains(&index) {
            return Err(CoreError::invalid("command stream released twice"));
        }
        match stream.state() {
            StreamState::Idle => {}
            StreamState::Executable => stream.reset()?,
            other => {
                return Err(CoreError::invalid(format!("release of a {:?} command stream", other)));
            }
        }
        self.free.push_back(index);
        Ok(())
    }

    /// Mark every submitted stream complete (after the covering fence wait)
    pub fn complete_submitted(&mut self) {
        for stream in &mut self.streams {
            if stream.state() == StreamState::Submitted {
                stream.state = StreamState::Idle;
            }
        }
    }

    /// Reset the whole pool; every stream becomes free and Idle
    pub fn reset(&mut self) -> CoreResult<()> {
        if self.streams.iter().any(|s| s.state() == StreamState::Submitted) {
            return Err(CoreError::invalid("command pool reset while a stream is submitted"));
        }
        self.gpu.reset_command_pool(self.pool)?;
        for stream in &mut self.streams {
            stream.state = StreamState::Idle;
            stream.in_render_pass = false;
        }
        self.free = (0..self.streams.len()).collect();
        Ok(())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Frees every command buffer allocated from it
        self.gpu.destroy_command_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessGpu;

    fn stream() -> (Arc<HeadlessGpu>, CommandPool) {
        let gpu = Arc::new(HeadlessGpu::new());
        let pool = CommandPool::new(gpu.clone()).unwrap();
        (gpu, pool)
    }

    #[test]
    fn test_stream_lifecycle() {
        let (gpu, mut pool) = stream();
        let fence = gpu.create_fence(false).unwrap();
        let (_, stream) = pool.acquire().unwrap();
        assert_eq!(stream.state(), StreamState::Idle);

        stream.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        assert_eq!(stream.state(), StreamState::Recording);
        stream.end().unwrap();
        assert_eq!(stream.state(), StreamState::Executable);
        stream.submit(&[], &[], fence).unwrap();
        assert_eq!(stream.state(), StreamState::Submitted);

        gpu.wait_for_fence(fence, u64::MAX).unwrap();
        stream.mark_complete().unwrap();
        assert_eq!(stream.state(), StreamState::Idle);

        // Reusable after completion
        stream.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        stream.end().unwrap();
        gpu.destroy_fence(fence);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let (_gpu, mut pool) = stream();
        let (_, stream) = pool.acquire().unwrap();
        assert!(matches!(stream.end(), Err(CoreError::InvalidOperation { .. })));
        assert!(matches!(stream.draw(3, 1, 0, 0), Err(CoreError::InvalidOperation { .. })));
        assert!(matches!(stream.mark_complete(), Err(CoreError::InvalidOperation { .. })));

        stream.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        assert!(matches!(
            stream.begin(vk::CommandBufferUsageFlags::empty()),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(stream.reset(), Err(CoreError::InvalidOperation { .. })));
    }

    /// Draws need an open pass; copies need it closed
    #[test]
    fn test_render_pass_scoping() {
        let (gpu, mut pool) = stream();
        let (_, stream) = pool.acquire().unwrap();
        stream.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        assert!(matches!(stream.draw(3, 1, 0, 0), Err(CoreError::InvalidOperation { .. })));
        assert!(matches!(stream.end_pass(), Err(CoreError::InvalidOperation { .. })));

        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width: 4, height: 4 },
        };
        stream
            .begin_pass(vk::RenderPass::null(), vk::Framebuffer::null(), area, &[])
            .unwrap();
        assert!(matches!(
            stream.copy_buffer(vk::Buffer::null(), 0, vk::Buffer::null(), 0, 4),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(stream.end(), Err(CoreError::InvalidOperation { .. })));
        stream.set_full_viewport(area.extent).unwrap();
        stream.draw(3, 1, 0, 0).unwrap();
        stream.end_pass().unwrap();
        stream.end().unwrap();
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    /// Only the three table entries are accepted
    #[test]
    fn test_transition_table() {
        use vk::ImageLayout as L;
        let layouts = [
            L::UNDEFINED,
            L::GENERAL,
            L::COLOR_ATTACHMENT_OPTIMAL,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            L::TRANSFER_SRC_OPTIMAL,
            L::TRANSFER_DST_OPTIMAL,
            L::PRESENT_SRC_KHR,
        ];
        let mut accepted = Vec::new();
        for old in layouts {
            for new in layouts {
                if transition_policy(old, new).is_some() {
                    accepted.push((old, new));
                }
            }
        }
        assert_eq!(
            accepted,
            vec![
                (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
                (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
                (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            ]
        );

        let depth = transition_policy(L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL).unwrap();
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
        assert_eq!(depth.aspect, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn test_unsupported_transition_keeps_recording() {
        let (_gpu, mut pool) = stream();
        let (_, stream) = pool.acquire().unwrap();
        stream.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        let result = stream.transition_image(
            vk::Image::null(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );
        assert_eq!(
            result,
            Err(CoreError::UnsupportedLayoutTransition {
                old: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                new: vk::ImageLayout::GENERAL,
            })
        );
        assert_eq!(stream.state(), StreamState::Recording);
    }

    /// Released streams come back in release order
    #[test]
    fn test_pool_is_fifo() {
        let (_gpu, mut pool) = stream();
        let (a, _) = pool.acquire().unwrap();
        let (b, _) = pool.acquire().unwrap();
        let (c, _) = pool.acquire().unwrap();
        assert_eq!(pool.stream_count(), 3);

        pool.release(b).unwrap();
        pool.release(a).unwrap();
        assert!(matches!(pool.release(a), Err(CoreError::InvalidOperation { .. })));
        assert_eq!(pool.acquire().unwrap().0, b);
        assert_eq!(pool.acquire().unwrap().0, a);
        // Nothing free: a fresh stream is allocated
        let (d, _) = pool.acquire().unwrap();
        assert!(d != a && d != b && d != c);
    }

    #[test]
    fn test_pool_reset_waits_for_completion() {
        let (gpu, mut pool) = stream();
        let fence = gpu.create_fence(false).unwrap();
        {
            let (_, stream) = pool.acquire().unwrap();
            stream.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
            stream.end().unwrap();
            stream.submit(&[], &[], fence).unwrap();
        }
        assert!(matches!(pool.reset(), Err(CoreError::InvalidOperation { .. })));

        gpu.wait_for_fence(fence, u64::MAX).unwrap();
        pool.complete_submitted();
        pool.reset().unwrap();
        assert_eq!(pool.free_count(), 1);
        gpu.destroy_fence(fence);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_failed_submit_stays_executable() {
        let (gpu, mut pool) = stream();
        gpu.fail_next_submit(vk::Result::ERROR_INITIALIZATION_FAILED);
        let (_, stream) = pool.acquire().unwrap();
        stream.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        stream.end().unwrap();
        assert_eq!(
            stream.submit(&[], &[], vk::Fence::null()),
            Err(CoreError::SubmitFailed(vk::Result::ERROR_INITIALIZATION_FAILED))
        );
        assert_eq!(stream.state(), StreamState::Executable);
    }

    /// Dynamic state and blits reach the device and run against real images
    #[test]
    fn test_dynamic_state_and_blit_are_accepted() {
        use crate::backend::gpu::ImageDesc;

        let (gpu, mut pool) = stream();
        let extent = vk::Extent2D { width: 8, height: 8 };
        let make_image = |usage| {
            let image = gpu
                .create_image(&ImageDesc {
                    extent,
                    format: vk::Format::R8G8B8A8_UNORM,
                    usage,
                })
                .unwrap();
            let memory = gpu.allocate_memory(gpu.image_memory_requirements(image).size, 0).unwrap();
            gpu.bind_image_memory(image, memory, 0).unwrap();
            (image, memory)
        };
        let (src, src_memory) = make_image(vk::ImageUsageFlags::TRANSFER_SRC);
        let (dst, dst_memory) = make_image(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED);
        gpu.set_image_layout(src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        let fence = gpu.create_fence(false).unwrap();
        let (_, stream) = pool.acquire().unwrap();
        stream.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        stream.set_line_width(1.0).unwrap();
        stream.set_depth_bias(1.25, 0.0, 1.75).unwrap();
        stream
            .transition_image(dst, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .unwrap();
        stream
            .blit_image(src, extent, dst, vk::Extent2D { width: 4, height: 4 }, vk::Filter::LINEAR)
            .unwrap();
        stream.end().unwrap();
        stream.submit(&[], &[], fence).unwrap();
        gpu.wait_for_fence(fence, u64::MAX).unwrap();
        stream.mark_complete().unwrap();

        assert_eq!(gpu.stats().blits, 1);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());

        // A blit into an image that was never made a transfer destination is caught
        let (_, stream) = pool.acquire().unwrap();
        stream.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        stream.blit_image(dst, extent, src, extent, vk::Filter::NEAREST).unwrap();
        stream.end().unwrap();
        gpu.reset_fence(fence).unwrap();
        stream.submit(&[], &[], fence).unwrap();
        gpu.wait_for_fence(fence, u64::MAX).unwrap();
        assert_eq!(gpu.stats().blits, 1);
        assert!(!gpu.violations().is_empty());

        drop(pool);
        gpu.destroy_fence(fence);
        for (image, memory) in [(src, src_memory), (dst, dst_memory)] {
            gpu.destroy_image(image);
            gpu.free_memory(memory);
        }
    }
}
