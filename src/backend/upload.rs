// Staging uploads
//
// Host -> device transfers through a temporary host-visible buffer:
// staging alloc -> memcpy -> record copy -> submit -> fence wait -> release.
// The staging allocation is released on every path, and the destination
// is only written by a submission that completed.

use super::buffer::{out_of_range, BufferAllocator, BufferId, BufferType};
use super::command::{CommandPool, CommandStream, StreamState};
use super::gpu::Gpu;
use super::sync::Fence;
use crate::error::{CoreError, CoreResult};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Releases a staging allocation when dropped
struct StagingGuard<'a> {
    allocator: &'a BufferAllocator,
    id: BufferId,
}

impl<'a> StagingGuard<'a> {
    fn new(allocator: &'a BufferAllocator, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> CoreResult<Self> {
        // Dedicated, never pooled: pools do not reclaim freed ranges
        let id = allocator.allocate(BufferType::Staging, size, usage, BufferType::Staging.memory_properties())?;
        Ok(Self { allocator, id })
    }
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.deallocate(self.id) {
            log::warn!("Failed to release staging buffer: {}", e);
        }
    }
}

struct UploadContext {
    commands: CommandPool,
    fence: Fence,
}

pub struct StagingUploader {
    gpu: Arc<dyn Gpu>,
    allocator: Arc<BufferAllocator>,
    context: Mutex<UploadContext>,
}

impl StagingUploader {
    pub fn new(gpu: Arc<dyn Gpu>, allocator: Arc<BufferAllocator>) -> CoreResult<Self> {
        let commands = CommandPool::new(gpu.clone())?;
        let fence = Fence::new(gpu.clone(), false)?;
        Ok(Self {
            gpu,
            allocator,
            context: Mutex::new(UploadContext { commands, fence }),
        })
    }

    /// Copy `payload` into `dest` at `offset`
    pub fn upload(&self, dest: BufferId, offset: vk::DeviceSize, payload: &[u8]) -> CoreResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let size = payload.len() as vk::DeviceSize;
        let target = self.allocator.get(dest)?;
        if !target.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(CoreError::invalid(format!(
                "upload destination ({:?} buffer) lacks TRANSFER_DST usage",
                target.ty
            )));
        }
        if out_of_range(offset, size, target.size) {
            return Err(CoreError::invalid(format!(
                "upload of {} bytes at {} overruns {} byte buffer",
                size, offset, target.size
            )));
        }

        let staging = StagingGuard::new(&self.allocator, size, vk::BufferUsageFlags::TRANSFER_SRC)?;
        self.allocator.write(staging.id, 0, payload)?;
        let source = self.allocator.get(staging.id)?;

        self.submit_and_wait(|stream| {
            stream.copy_buffer(source.buffer, source.offset, target.buffer, target.offset + offset, size)
        })?;
        log::trace!("Uploaded {} bytes into {:?} buffer", size, target.ty);
        Ok(())
    }

    /// Create a typed buffer holding `bytes`. Device-local types are filled
    /// through staging, host-visible ones are written directly.
    pub fn create_buffer_with_data(&self, ty: BufferType, bytes: &[u8]) -> CoreResult<BufferId> {
        let size = bytes.len() as vk::DeviceSize;
        let dest = self.allocator.create_typed(ty, size)?;

        let filled = if ty.memory_properties().contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            self.allocator.write(dest, 0, bytes)
        } else if !ty.usage().contains(vk::BufferUsageFlags::TRANSFER_DST) {
            Err(CoreError::invalid(format!("{:?} buffers cannot be transfer destinations", ty)))
        } else {
            self.fill_through_staging(dest, bytes)
        };

        if let Err(e) = filled {
            let _ = self.allocator.deallocate(dest);
            return Err(e);
        }
        Ok(dest)
    }

    fn fill_through_staging(&self, dest: BufferId, bytes: &[u8]) -> CoreResult<()> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = StagingGuard::new(&self.allocator, size, vk::BufferUsageFlags::TRANSFER_SRC)?;
        self.allocator.write(staging.id, 0, bytes)?;
        self.submit_and_wait(|stream| self.allocator.record_copy(stream, staging.id, dest, size))
    }

    /// Fill a color image with tightly packed 4-byte texels and leave it
    /// ready for sampling
    pub fn upload_to_image(&self, image: vk::Image, extent: vk::Extent2D, bytes: &[u8]) -> CoreResult<()> {
        let expected = extent.width as usize * extent.height as usize * 4;
        if expected == 0 || bytes.len() != expected {
            return Err(CoreError::invalid(format!(
                "image upload of {} bytes for a {}x{} image (expected {})",
                bytes.len(),
                extent.width,
                extent.height,
                expected
            )));
        }

        let staging = StagingGuard::new(&self.allocator, bytes.len() as vk::DeviceSize, vk::BufferUsageFlags::TRANSFER_SRC)?;
        self.allocator.write(staging.id, 0, bytes)?;
        let source = self.allocator.get(staging.id)?;

        self.submit_and_wait(|stream| {
            stream.transition_image(image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
            stream.copy_buffer_to_image(source.buffer, source.offset, image, extent)?;
            stream.transition_image(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
        })
    }

    /// Read `size` bytes of a TRANSFER_SRC buffer back to the host
    pub fn download(&self, src: BufferId, offset: vk::DeviceSize, size: vk::DeviceSize) -> CoreResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let source = self.allocator.get(src)?;
        if !source.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            return Err(CoreError::invalid(format!(
                "download source ({:?} buffer) lacks TRANSFER_SRC usage",
                source.ty
            )));
        }
        if out_of_range(offset, size, source.size) {
            return Err(CoreError::invalid("download range exceeds the source buffer"));
        }

        let readback = StagingGuard::new(&self.allocator, size, vk::BufferUsageFlags::TRANSFER_DST)?;
        let target = self.allocator.get(readback.id)?;
        self.submit_and_wait(|stream| {
            stream.copy_buffer(source.buffer, source.offset + offset, target.buffer, target.offset, size)
        })?;
        self.allocator.read(readback.id, 0, size as usize)
    }

    /// Record with `record`, submit, and block until the queue has run it
    fn submit_and_wait(&self, record: impl FnOnce(&mut CommandStream) -> CoreResult<()>) -> CoreResult<()> {
        let mut context = self.context.lock();
        let UploadContext { commands, fence } = &mut *context;

        let (index, stream) = commands.acquire()?;
        let result = run_one_time(stream, fence, record);
        if result.is_err() {
            match stream.state() {
                // Leave the stream reusable if it never reached the queue
                StreamState::Recording => {
                    let _ = stream.end();
                }
                // The fence wait failed; the copy may still be running and
                // the staging buffer is freed once this returns
                StreamState::Submitted => {
                    if let Err(e) = self.gpu.device_wait_idle() {
                        log::error!("Device wait after failed upload wait: {:?}", e);
                        return result;
                    }
                    stream.mark_complete()?;
                }
                _ => {}
            }
        }
        if stream.state() != StreamState::Submitted {
            commands.release(index)?;
        }
        result
    }
}

fn run_one_time(
    stream: &mut CommandStream,
    fence: &Fence,
    record: impl FnOnce(&mut CommandStream) -> CoreResult<()>,
) -> CoreResult<()> {
    stream.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    record(stream)?;
    stream.end()?;
    fence.reset()?;
    stream.submit(&[], &[], fence.handle())?;
    fence.wait(u64::MAX)?;
    stream.mark_complete()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffer::AllocatorSettings;
    use crate::backend::gpu::ImageDesc;
    use crate::backend::headless::HeadlessGpu;
    use crate::backend::memory::DeviceMemoryPool;

    struct Fixture {
        gpu: Arc<HeadlessGpu>,
        allocator: Arc<BufferAllocator>,
        uploader: StagingUploader,
    }

    fn fixture() -> Fixture {
        fixture_with(AllocatorSettings::default())
    }

    fn fixture_with(settings: AllocatorSettings) -> Fixture {
        let gpu = Arc::new(HeadlessGpu::new());
        let memory = Arc::new(DeviceMemoryPool::new(gpu.clone()));
        let allocator = Arc::new(BufferAllocator::new(gpu.clone(), memory, settings));
        let uploader = StagingUploader::new(gpu.clone(), allocator.clone()).unwrap();
        Fixture { gpu, allocator, uploader }
    }

    #[test]
    fn test_upload_lands_in_device_local_buffer() {
        let f = fixture();
        let dest = f.allocator.create_index_buffer(64).unwrap();
        let payload: Vec<u8> = (0..32).collect();
        f.uploader.upload(dest, 16, &payload).unwrap();

        let buffer = f.allocator.get(dest).unwrap().buffer;
        assert_eq!(f.gpu.peek_buffer(buffer, 16, 32).unwrap(), payload);
        assert_eq!(f.gpu.peek_buffer(buffer, 0, 16).unwrap(), vec![0u8; 16]);
        // Staging released, only the destination remains
        assert_eq!(f.allocator.allocation_count(), 1);
        assert_eq!(f.gpu.pending_submissions(), 0);
        assert!(f.gpu.violations().is_empty(), "{:?}", f.gpu.violations());
    }

    /// Failed uploads release staging and leave the destination untouched
    #[test]
    fn test_failed_upload_releases_staging() {
        let f = fixture();
        let dest = f.allocator.create_vertex_buffer(64).unwrap();
        f.gpu.fail_next_submit(vk::Result::ERROR_INITIALIZATION_FAILED);
        let result = f.uploader.upload(dest, 0, &[0xAB; 64]);
        assert_eq!(result, Err(CoreError::SubmitFailed(vk::Result::ERROR_INITIALIZATION_FAILED)));
        assert_eq!(f.allocator.allocation_count(), 1);

        let buffer = f.allocator.get(dest).unwrap().buffer;
        assert_eq!(f.gpu.peek_buffer(buffer, 0, 64).unwrap(), vec![0u8; 64]);

        // The uploader stays usable
        f.uploader.upload(dest, 0, &[0xCD; 64]).unwrap();
        assert_eq!(f.gpu.peek_buffer(buffer, 0, 64).unwrap(), vec![0xCD; 64]);
        assert!(f.gpu.violations().is_empty(), "{:?}", f.gpu.violations());
    }

    /// A failed fence wait still drains the copy before staging is freed
    #[test]
    fn test_failed_fence_wait_drains_queue() {
        let f = fixture();
        let dest = f.allocator.create_vertex_buffer(64).unwrap();
        f.gpu.fail_next_fence_wait(vk::Result::TIMEOUT);
        assert_eq!(f.uploader.upload(dest, 0, &[0x5A; 64]), Err(CoreError::Api(vk::Result::TIMEOUT)));

        assert_eq!(f.gpu.pending_submissions(), 0);
        assert_eq!(f.allocator.allocation_count(), 1);
        let buffer = f.allocator.get(dest).unwrap().buffer;
        assert_eq!(f.gpu.peek_buffer(buffer, 0, 64).unwrap(), vec![0x5A; 64]);

        // The stream went back to the pool
        f.uploader.upload(dest, 0, &[0x11; 64]).unwrap();
        assert_eq!(f.gpu.peek_buffer(buffer, 0, 64).unwrap(), vec![0x11; 64]);
        assert!(f.gpu.violations().is_empty(), "{:?}", f.gpu.violations());
    }

    #[test]
    fn test_upload_rejects_bad_destinations() {
        let f = fixture();
        let storage = f.allocator.create_storage_buffer(64).unwrap();
        assert!(matches!(
            f.uploader.upload(storage, 0, &[1; 16]),
            Err(CoreError::InvalidOperation { .. })
        ));
        let vertex = f.allocator.create_vertex_buffer(64).unwrap();
        assert!(matches!(
            f.uploader.upload(vertex, 60, &[1; 16]),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert_eq!(f.allocator.allocation_count(), 2);
    }

    #[test]
    fn test_create_buffer_with_data() {
        let f = fixture();
        let bytes = [7u8; 48];
        let vertex = f.uploader.create_buffer_with_data(BufferType::Vertex, &bytes).unwrap();
        let buffer = f.allocator.get(vertex).unwrap().buffer;
        assert_eq!(f.gpu.peek_buffer(buffer, 0, 48).unwrap(), bytes.to_vec());

        let uniform = f.uploader.create_buffer_with_data(BufferType::Uniform, &bytes).unwrap();
        assert_eq!(f.allocator.read(uniform, 0, 48).unwrap(), bytes.to_vec());

        assert!(matches!(
            f.uploader.create_buffer_with_data(BufferType::Storage, &bytes),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert_eq!(f.allocator.allocation_count(), 2);
        assert!(f.gpu.violations().is_empty(), "{:?}", f.gpu.violations());
    }

    #[test]
    fn test_download_round_trip() {
        let f = fixture();
        let src = f
            .allocator
            .allocate(
                BufferType::Storage,
                128,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        let payload: Vec<u8> = (0..128u32).map(|i| (i * 3) as u8).collect();
        f.uploader.upload(src, 0, &payload).unwrap();
        assert_eq!(f.uploader.download(src, 32, 64).unwrap(), payload[32..96].to_vec());

        let vertex = f.allocator.create_vertex_buffer(64).unwrap();
        assert!(matches!(
            f.uploader.download(vertex, 0, 64),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(f.gpu.violations().is_empty(), "{:?}", f.gpu.violations());
    }

    #[test]
    fn test_upload_to_image_transitions() {
        let f = fixture();
        let extent = vk::Extent2D { width: 4, height: 4 };
        let image = f
            .gpu
            .create_image(&ImageDesc {
                extent,
                format: vk::Format::R8G8B8A8_UNORM,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            })
            .unwrap();
        let requirements = f.gpu.image_memory_requirements(image);
        let memory = f.gpu.allocate_memory(requirements.size, 0).unwrap();
        f.gpu.bind_image_memory(image, memory, 0).unwrap();

        assert!(matches!(
            f.uploader.upload_to_image(image, extent, &[0; 10]),
            Err(CoreError::InvalidOperation { .. })
        ));
        f.uploader.upload_to_image(image, extent, &[0xFF; 64]).unwrap();
        assert_eq!(f.gpu.image_layout(image), Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        assert_eq!(f.gpu.stats().copies, 1);
        assert!(f.gpu.violations().is_empty(), "{:?}", f.gpu.violations());

        f.gpu.destroy_image(image);
        f.gpu.free_memory(memory);
    }

    /// Pooled sources are read from their sub-range, not the pool start
    #[test]
    fn test_download_from_pooled_child() {
        let f = fixture_with(AllocatorSettings {
            enable_pool_allocator: true,
        });
        let first = f.allocator.create_staging_buffer(64, Some(&[0xEE; 64])).unwrap();
        let payload: Vec<u8> = (0..64).collect();
        let second = f.allocator.create_staging_buffer(64, Some(&payload)).unwrap();
        let child = f.allocator.get(second).unwrap();
        assert!(child.pool.is_some());
        assert!(child.offset > 0);
        assert_eq!(child.buffer, f.allocator.get(first).unwrap().buffer);

        assert_eq!(f.uploader.download(second, 8, 32).unwrap(), payload[8..40].to_vec());
        assert_eq!(f.uploader.download(first, 0, 4).unwrap(), vec![0xEE; 4]);
        assert!(f.gpu.violations().is_empty(), "{:?}", f.gpu.violations());
    }

    #[test]
    fn test_offsets_near_the_limit_are_rejected() {
        let f = fixture();
        let dest = f.allocator.create_vertex_buffer(64).unwrap();
        assert!(matches!(
            f.uploader.upload(dest, u64::MAX, &[1]),
            Err(CoreError::InvalidOperation { .. })
        ));
        let src = f
            .allocator
            .allocate(
                BufferType::Storage,
                64,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        assert!(matches!(
            f.uploader.download(src, u64::MAX - 2, 4),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert_eq!(f.allocator.allocation_count(), 2);
        assert_eq!(f.gpu.stats().submissions, 0);
    }
}

