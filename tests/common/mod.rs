//! In-memory stand-ins for the driver and the frame consumer.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use vk_headless_present::{
    DeviceContext, DeviceDriver, FrameDisposition, FrameSink, FrameView, ImageDesc, LayerError, LayerResult,
    ReadbackCopy, Submission,
};

/// Queue handed to every swapchain built on a [`FakeDriver`].
pub const FAKE_QUEUE: u64 = 0x0051_0000;
pub const DEVICE_LOCAL_TYPE: u32 = 0;
pub const HOST_VISIBLE_TYPE: u32 = 1;

/// Teardown-relevant calls in the order they happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    DeviceWaitIdle,
    QueueWaitIdle,
    DestroyCommandPool(u64),
    DestroyFence(u64),
    DestroyBuffer(u64),
    DestroyImage(u64),
    FreeMemory(u64),
}

/// A submission as the driver saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub waits: Vec<u64>,
    pub signals: Vec<u64>,
    pub command_buffers: usize,
    pub fence: u64,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    images: HashMap<u64, (ImageDesc, [u8; 4])>,
    image_memory: HashMap<u64, u64>,
    buffers: HashMap<u64, vk::DeviceSize>,
    buffer_memory: HashMap<u64, u64>,
    memory: HashMap<u64, Vec<u8>>,
    pools: HashSet<u64>,
    fences: HashSet<u64>,
    recorded: HashMap<u64, ReadbackCopy>,
    mapped: usize,
    images_created: usize,
    events: Vec<Event>,
    submissions: Vec<RecordedSubmission>,
}

impl FakeState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        0x1000 + self.next_handle
    }
}

/// A [`DeviceDriver`] backed by host memory.
///
/// Images carry a single fill color. Submitting a recorded readback copies that
/// color into every pixel of the destination buffer's memory.
pub struct FakeDriver {
    state: Mutex<FakeState>,
    /// Zero-based `create_image` calls that fail with out-of-memory.
    fail_images: HashSet<usize>,
    readback_supported: bool,
    /// Fails every fence wait with `ERROR_UNKNOWN`.
    fail_fence_waits: AtomicBool,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_options(HashSet::new(), true))
    }

    /// A driver whose `create_image` fails on the given attempts.
    pub fn failing_images(attempts: &[usize]) -> Arc<Self> {
        Arc::new(Self::with_options(attempts.iter().copied().collect(), true))
    }

    /// A driver missing the entry points readback needs.
    pub fn without_readback() -> Arc<Self> {
        Arc::new(Self::with_options(HashSet::new(), false))
    }

    fn with_options(fail_images: HashSet<usize>, readback_supported: bool) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            fail_images,
            readback_supported,
            fail_fence_waits: AtomicBool::new(false),
        }
    }

    /// Lets submissions through but fails the fence wait that follows a copy.
    pub fn fail_fence_waits(&self) {
        self.fail_fence_waits.store(true, Ordering::SeqCst);
    }

    /// Fills `image` with one BGRA color, as if the application rendered it.
    pub fn paint(&self, image: vk::Image, color: [u8; 4]) {
        if let Some((_, fill)) = self.state.lock().images.get_mut(&image.as_raw()) {
            *fill = color;
        }
    }

    pub fn image_desc(&self, image: vk::Image) -> Option<ImageDesc> {
        self.state.lock().images.get(&image.as_raw()).map(|(desc, _)| *desc)
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_memory(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_pools(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn mapped(&self) -> usize {
        self.state.lock().mapped
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.state.lock().submissions.clone()
    }

    /// Contents of the memory bound to `buffer`, if any.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let memory = state.buffer_memory.get(&buffer.as_raw())?;
        state.memory.get(memory).cloned()
    }

    /// Everything allocated through this driver has been released.
    pub fn is_clean(&self) -> bool {
        let state = self.state.lock();
        state.images.is_empty()
            && state.buffers.is_empty()
            && state.memory.is_empty()
            && state.pools.is_empty()
            && state.fences.is_empty()
            && state.mapped == 0
    }
}

impl DeviceDriver for FakeDriver {
    fn create_image(&self, desc: &ImageDesc) -> LayerResult<vk::Image> {
        let mut state = self.state.lock();
        let attempt = state.images_created;
        state.images_created += 1;
        if self.fail_images.contains(&attempt) {
            return Err(LayerError::vulkan("vkCreateImage", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let handle = state.handle();
        state.images.insert(handle, (*desc, [0, 0, 0, 0]));
        Ok(vk::Image::from_raw(handle))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        state.images.remove(&image.as_raw());
        state.image_memory.remove(&image.as_raw());
        state.events.push(Event::DestroyImage(image.as_raw()));
    }

    fn image_memory_requirements(&self, image: vk::Image) -> LayerResult<vk::MemoryRequirements> {
        let state = self.state.lock();
        let (desc, _) = state
            .images
            .get(&image.as_raw())
            .ok_or(LayerError::vulkan("vkGetImageMemoryRequirements", vk::Result::ERROR_UNKNOWN))?;
        Ok(vk::MemoryRequirements {
            size: desc.extent.width as u64 * desc.extent.height as u64 * 4,
            alignment: 256,
            memory_type_bits: 0b11,
        })
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> LayerResult<()> {
        self.state.lock().image_memory.insert(image.as_raw(), memory.as_raw());
        Ok(())
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> LayerResult<vk::Buffer> {
        let mut state = self.state.lock();
        let handle = state.handle();
        state.buffers.insert(handle, size);
        Ok(vk::Buffer::from_raw(handle))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.as_raw());
        state.buffer_memory.remove(&buffer.as_raw());
        state.events.push(Event::DestroyBuffer(buffer.as_raw()));
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> LayerResult<vk::MemoryRequirements> {
        let state = self.state.lock();
        let size = state
            .buffers
            .get(&buffer.as_raw())
            .ok_or(LayerError::vulkan("vkGetBufferMemoryRequirements", vk::Result::ERROR_UNKNOWN))?;
        Ok(vk::MemoryRequirements {
            size: *size,
            alignment: 4,
            memory_type_bits: 0b11,
        })
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> LayerResult<()> {
        self.state.lock().buffer_memory.insert(buffer.as_raw(), memory.as_raw());
        Ok(())
    }

    fn allocate_memory(&self, size: vk::DeviceSize, _memory_type_index: u32) -> LayerResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        let handle = state.handle();
        state.memory.insert(handle, vec![0u8; size as usize]);
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        state.memory.remove(&memory.as_raw());
        state.events.push(Event::FreeMemory(memory.as_raw()));
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> LayerResult<NonNull<u8>> {
        let mut state = self.state.lock();
        let bytes = state
            .memory
            .get_mut(&memory.as_raw())
            .filter(|bytes| bytes.len() as u64 >= size)
            .ok_or(LayerError::vulkan("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        let ptr = NonNull::new(bytes.as_mut_ptr())
            .ok_or(LayerError::vulkan("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        state.mapped += 1;
        Ok(ptr)
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        state.mapped = state.mapped.saturating_sub(1);
    }

    fn invalidate_memory(&self, _memory: vk::DeviceMemory) -> LayerResult<()> {
        Ok(())
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> LayerResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let handle = state.handle();
        state.pools.insert(handle);
        Ok(vk::CommandPool::from_raw(handle))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool.as_raw());
        state.events.push(Event::DestroyCommandPool(pool.as_raw()));
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> LayerResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let handle = state.handle();
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn record_readback(&self, command_buffer: vk::CommandBuffer, copy: &ReadbackCopy) -> LayerResult<()> {
        self.state.lock().recorded.insert(command_buffer.as_raw(), *copy);
        Ok(())
    }

    fn create_fence(&self) -> LayerResult<vk::Fence> {
        let mut state = self.state.lock();
        let handle = state.handle();
        state.fences.insert(handle);
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.as_raw());
        state.events.push(Event::DestroyFence(fence.as_raw()));
    }

    fn wait_and_reset_fence(&self, _fence: vk::Fence) -> LayerResult<()> {
        if self.fail_fence_waits.load(Ordering::SeqCst) {
            return Err(LayerError::vulkan("vkWaitForFences", vk::Result::ERROR_UNKNOWN));
        }
        Ok(())
    }

    fn submit(&self, _queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> LayerResult<()> {
        let mut state = self.state.lock();
        for command_buffer in submission.command_buffers {
            let Some(copy) = state.recorded.get(&command_buffer.as_raw()).copied() else {
                continue;
            };
            let color = state.images.get(&copy.image.as_raw()).map(|(_, color)| *color);
            let memory = state.buffer_memory.get(&copy.buffer.as_raw()).copied();
            if let (Some(color), Some(memory)) = (color, memory) {
                let pixels = copy.extent.width as usize * copy.extent.height as usize;
                if let Some(bytes) = state.memory.get_mut(&memory) {
                    for pixel in bytes.chunks_exact_mut(4).take(pixels) {
                        pixel.copy_from_slice(&color);
                    }
                }
            }
        }
        state.submissions.push(RecordedSubmission {
            waits: submission.wait_semaphores.iter().map(|s| s.as_raw()).collect(),
            signals: submission.signal_semaphores.iter().map(|s| s.as_raw()).collect(),
            command_buffers: submission.command_buffers.len(),
            fence: fence.as_raw(),
        });
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> LayerResult<()> {
        self.state.lock().events.push(Event::QueueWaitIdle);
        Ok(())
    }

    fn device_wait_idle(&self) -> LayerResult<()> {
        self.state.lock().events.push(Event::DeviceWaitIdle);
        Ok(())
    }

    fn supports_readback(&self) -> bool {
        self.readback_supported
    }
}

/// Two memory types: device local, and host visible + coherent.
pub fn memory_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut properties = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: 2,
        memory_heap_count: 1,
        ..Default::default()
    };
    properties.memory_types[DEVICE_LOCAL_TYPE as usize].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    properties.memory_types[HOST_VISIBLE_TYPE as usize].property_flags =
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    properties
}

/// Device context a swapchain on `driver` is created in.
pub fn device_context(driver: &Arc<FakeDriver>, device_key: usize) -> DeviceContext {
    DeviceContext {
        driver: driver.clone() as Arc<dyn DeviceDriver>,
        device_key,
        queue: vk::Queue::from_raw(FAKE_QUEUE),
        queue_family_index: 0,
        memory_properties: memory_properties(),
    }
}

/// A frame as a sink received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A [`FrameSink`] that records frames into shared storage.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub frames: Arc<Mutex<Vec<ReceivedFrame>>>,
    pub flushes: Arc<Mutex<Vec<Duration>>>,
}

impl FrameSink for RecordingSink {
    fn consume(&mut self, frame: &FrameView<'_>) -> FrameDisposition {
        let mut pixels = Vec::new();
        frame.write_packed(&mut pixels);
        self.frames.lock().push(ReceivedFrame {
            width: frame.width(),
            height: frame.height(),
            pixels,
        });
        FrameDisposition::Delivered
    }

    fn flush(&mut self, timeout: Duration) -> bool {
        self.flushes.lock().push(timeout);
        true
    }
}
