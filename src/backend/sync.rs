// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync, plus the frame
// synchronizer that bounds how many frames are in flight:
// - one slot per in-flight frame: fence (created signaled),
//   image-available and render-finished semaphores
// - the cursor walks the slots modulo F
// - a slot's fence is waited on before the slot is reused, so frame i
//   and frame i+F never overlap on the GPU

use super::gpu::Gpu;
use crate::error::{CoreError, CoreResult};
use ash::vk;
use std::sync::Arc;

/// Owned fence, destroyed on drop
pub struct Fence {
    gpu: Arc<dyn Gpu>,
    handle: vk::Fence,
}

impl Fence {
    pub fn new(gpu: Arc<dyn Gpu>, signaled: bool) -> CoreResult<Self> {
        let handle = gpu.create_fence(signaled)?;
        Ok(Self { gpu, handle })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    pub fn wait(&self, timeout: u64) -> CoreResult<()> {
        self.gpu.wait_for_fence(self.handle, timeout).map_err(CoreError::from)
    }

    pub fn reset(&self) -> CoreResult<()> {
        self.gpu.reset_fence(self.handle).map_err(CoreError::from)
    }

    pub fn is_signaled(&self) -> CoreResult<bool> {
        self.gpu.fence_signaled(self.handle).map_err(CoreError::from)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.gpu.destroy_fence(self.handle);
    }
}

/// Owned binary semaphore, destroyed on drop
pub struct Semaphore {
    gpu: Arc<dyn Gpu>,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(gpu: Arc<dyn Gpu>) -> CoreResult<Self> {
        let handle = gpu.create_semaphore()?;
        Ok(Self { gpu, handle })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.gpu.destroy_semaphore(self.handle);
    }
}

/// Frame synchronization - one per frame in flight
pub struct FrameSlot {
    pub in_flight: Fence,
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    /// Fence was reset for this slot and not yet waited on
    pending: bool,
}

impl FrameSlot {
    fn new(gpu: &Arc<dyn Gpu>) -> CoreResult<Self> {
        Ok(Self {
            in_flight: Fence::new(gpu.clone(), true)?,
            image_available: Semaphore::new(gpu.clone())?,
            render_finished: Semaphore::new(gpu.clone())?,
            pending: false,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

pub struct FrameSynchronizer {
    gpu: Arc<dyn Gpu>,
    slots: Vec<FrameSlot>,
    current: usize,
    in_flight: usize,
    /// Replaced image-available semaphores that may still have a pending
    /// signal from an acquire; released once the device is idle
    retired: Vec<Semaphore>,
}

impl FrameSynchronizer {
    pub fn new(gpu: Arc<dyn Gpu>, max_frames_in_flight: usize) -> CoreResult<Self> {
        if max_frames_in_flight == 0 {
            return Err(CoreError::Initialization(
                "max_frames_in_flight must be at least 1".to_string(),
            ));
        }
        let slots = (0..max_frames_in_flight)
            .map(|_| FrameSlot::new(&gpu))
            .collect::<CoreResult<Vec<_>>>()?;
        log::info!("Frame synchronizer: {} frames in flight", max_frames_in_flight);
        Ok(Self {
            gpu,
            slots,
            current: 0,
            in_flight: 0,
            retired: Vec::new(),
        })
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn image_available(&self) -> vk::Semaphore {
        self.current_slot().image_available.handle()
    }

    pub fn render_finished(&self) -> vk::Semaphore {
        self.current_slot().render_finished.handle()
    }

    pub fn in_flight_fence(&self) -> vk::Fence {
        self.current_slot().in_flight.handle()
    }

    /// Block until the current slot's previous submission has completed
    pub fn wait_for_frame(&mut self) -> CoreResult<()> {
        let slot = &mut self.slots[self.current];
        if self.in_flight > 0 || slot.pending {
            slot.in_flight.wait(u64::MAX)?;
            slot.pending = false;
        }
        Ok(())
    }

    /// Wait for the slot, then reset its fence for this frame's submission
    pub fn begin_frame(&mut self) -> CoreResult<()> {
        if self.in_flight >= self.slots.len() {
            return Err(CoreError::invalid("begin_frame with every slot already in flight"));
        }
        self.wait_for_frame()?;
        let slot = &mut self.slots[self.current];
        slot.in_flight.reset()?;
        slot.pending = true;
        self.in_flight += 1;
        log::trace!("Frame slot {} begun ({} in flight)", self.current, self.in_flight);
        Ok(())
    }

    pub fn end_frame(&mut self) -> CoreResult<()> {
        if self.in_flight == 0 {
            return Err(CoreError::invalid("end_frame without begin_frame"));
        }
        self.in_flight -= 1;
        Ok(())
    }

    pub fn next_frame(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Drop a frame that was begun but never submitted.
    ///
    /// The slot fence was reset by begin_frame and nothing will signal it,
    /// so it is replaced by a signaled one. The image-available semaphore is
    /// replaced too, since an acquire may have signaled it with no consumer.
    /// The old semaphore is kept until `release_retired` runs on an idle device.
    pub fn abandon_frame(&mut self) -> CoreResult<()> {
        self.end_frame()?;
        let fence = Fence::new(self.gpu.clone(), true)?;
        let semaphore = Semaphore::new(self.gpu.clone())?;
        let slot = &mut self.slots[self.current];
        slot.in_flight = fence;
        let old = std::mem::replace(&mut slot.image_available, semaphore);
        self.retired.push(old);
        slot.pending = false;
        log::debug!("Frame slot {} abandoned", self.current);
        Ok(())
    }

    /// Semaphores replaced by `abandon_frame` and not yet destroyed
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Destroy retired semaphores. Only call after `device_wait_idle`.
    pub fn release_retired(&mut self) {
        if !self.retired.is_empty() {
            log::debug!("Releasing {} retired semaphores", self.retired.len());
            self.retired.clear();
        }
    }

    /// Non-blocking check of the current slot's fence
    pub fn is_frame_complete(&self) -> CoreResult<bool> {
        self.current_slot().in_flight.is_signaled()
    }

    /// Slots whose submitted work has not completed yet
    pub fn pending_slots(&self) -> CoreResult<usize> {
        let mut count = 0;
        for slot in &self.slots {
            if slot.pending && !slot.in_flight.is_signaled()? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Wait for every pending slot (shutdown and swapchain recreate paths)
    pub fn wait_all(&mut self) -> CoreResult<()> {
        for slot in &mut self.slots {
            if slot.pending {
                slot.in_flight.wait(u64::MAX)?;
                slot.pending = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::gpu::Submission;
    use crate::backend::headless::HeadlessGpu;

    fn submit_with_fence(gpu: &HeadlessGpu, fence: vk::Fence) {
        gpu.queue_submit(&Submission {
            command_buffers: &[],
            wait_semaphores: &[],
            wait_stages: &[],
            signal_semaphores: &[],
            fence,
        })
        .unwrap();
    }

    fn run_frame(gpu: &HeadlessGpu, sync: &mut FrameSynchronizer) {
        sync.begin_frame().unwrap();
        submit_with_fence(gpu, sync.in_flight_fence());
        sync.end_frame().unwrap();
        sync.next_frame();
    }

    #[test]
    fn test_zero_frames_rejected() {
        let gpu = Arc::new(HeadlessGpu::new());
        assert!(matches!(
            FrameSynchronizer::new(gpu, 0),
            Err(CoreError::Initialization(_))
        ));
    }

    /// New slots start signaled so the first wait never blocks
    #[test]
    fn test_slots_start_signaled() {
        let gpu = Arc::new(HeadlessGpu::new());
        let sync = FrameSynchronizer::new(gpu.clone(), 2).unwrap();
        assert_eq!(gpu.unsignaled_fences(), 0);
        assert!(sync.is_frame_complete().unwrap());
        assert_eq!(sync.in_flight_count(), 0);
        assert_eq!(gpu.live_objects().semaphores, 4);
    }

    #[test]
    fn test_cursor_wraps_and_bounds_in_flight() {
        let gpu = Arc::new(HeadlessGpu::new());
        let mut sync = FrameSynchronizer::new(gpu.clone(), 3).unwrap();
        let mut cursors = Vec::new();
        for _ in 0..7 {
            cursors.push(sync.current_frame());
            run_frame(&gpu, &mut sync);
            assert!(gpu.unsignaled_fences() <= 3);
            assert!(sync.pending_slots().unwrap() <= 3);
        }
        assert_eq!(cursors, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(gpu.stats().max_pending_submissions, 3);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    /// F = 1 retires each frame before the next one is begun
    #[test]
    fn test_single_frame_in_flight_serializes() {
        let gpu = Arc::new(HeadlessGpu::new());
        let mut sync = FrameSynchronizer::new(gpu.clone(), 1).unwrap();
        for _ in 0..4 {
            run_frame(&gpu, &mut sync);
            assert_eq!(sync.current_frame(), 0);
        }
        assert_eq!(gpu.stats().max_pending_submissions, 1);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_begin_frame_respects_bound() {
        let gpu = Arc::new(HeadlessGpu::new());
        let mut sync = FrameSynchronizer::new(gpu, 1).unwrap();
        sync.begin_frame().unwrap();
        assert!(matches!(sync.begin_frame(), Err(CoreError::InvalidOperation { .. })));
        sync.abandon_frame().unwrap();
        assert!(matches!(sync.end_frame(), Err(CoreError::InvalidOperation { .. })));
    }

    /// An abandoned slot can be reused without waiting on a fence nobody signals
    #[test]
    fn test_abandon_frame_rearms_slot() {
        let gpu = Arc::new(HeadlessGpu::new());
        let mut sync = FrameSynchronizer::new(gpu.clone(), 1).unwrap();
        sync.begin_frame().unwrap();
        assert!(!sync.is_frame_complete().unwrap());
        sync.abandon_frame().unwrap();
        assert!(sync.is_frame_complete().unwrap());
        assert_eq!(sync.pending_slots().unwrap(), 0);
        assert_eq!(sync.retired_count(), 1);

        run_frame(&gpu, &mut sync);
        run_frame(&gpu, &mut sync);
        assert_eq!(gpu.live_objects().fences, 1);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_wait_all_retires_everything() {
        let gpu = Arc::new(HeadlessGpu::new());
        let mut sync = FrameSynchronizer::new(gpu.clone(), 2).unwrap();
        run_frame(&gpu, &mut sync);
        run_frame(&gpu, &mut sync);
        assert_eq!(gpu.pending_submissions(), 2);
        sync.wait_all().unwrap();
        assert_eq!(gpu.pending_submissions(), 0);
        assert_eq!(sync.pending_slots().unwrap(), 0);
    }

    /// The replaced image-available semaphore outlives the abandon call
    /// and is destroyed only once released on an idle device
    #[test]
    fn test_abandoned_semaphore_released_after_idle() {
        let gpu = Arc::new(HeadlessGpu::new());
        let mut sync = FrameSynchronizer::new(gpu.clone(), 2).unwrap();
        let old = sync.image_available();
        sync.begin_frame().unwrap();
        sync.abandon_frame().unwrap();

        assert_ne!(sync.image_available(), old);
        assert_eq!(sync.retired_count(), 1);
        assert_eq!(gpu.live_objects().semaphores, 5);

        gpu.device_wait_idle().unwrap();
        sync.release_retired();
        assert_eq!(sync.retired_count(), 0);
        assert_eq!(gpu.live_objects().semaphores, 4);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }
}
