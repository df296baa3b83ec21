//! The seam between the swapchain emulator and the driver below the layer.
//!
//! [`DeviceDriver`] covers exactly the device-level work the emulator performs:
//! allocating images and staging memory, recording the readback copy, and
//! submitting it. [`DeviceDispatch`](crate::dispatch::DeviceDispatch) implements
//! it over the next layer's function pointers; tests implement it in memory.

use std::ptr::NonNull;

use ash::vk;

use crate::error::{LayerError, LayerResult};

/// Parameters of one presentable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
}

/// A full-image copy from a presentable image into the staging buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadbackCopy {
    pub image: vk::Image,
    pub buffer: vk::Buffer,
    pub extent: vk::Extent2D,
    /// Layout the image is in when presented, and is returned to afterwards.
    pub present_layout: vk::ImageLayout,
}

/// One queue submission. Wait semaphores wait at the transfer stage.
#[derive(Clone, Copy, Debug, Default)]
pub struct Submission<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Device-level driver operations used by virtual swapchains.
///
/// Destroy/free methods never fail; implementations log and ignore a missing
/// entry point.
pub trait DeviceDriver: Send + Sync {
    /// Creates an optimally tiled 2D image.
    fn create_image(&self, desc: &ImageDesc) -> LayerResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> LayerResult<vk::MemoryRequirements>;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> LayerResult<()>;

    /// Creates an exclusive buffer of `size` bytes.
    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> LayerResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> LayerResult<vk::MemoryRequirements>;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> LayerResult<()>;

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> LayerResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Maps `size` bytes from the start of `memory`.
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> LayerResult<NonNull<u8>>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// Makes device writes visible to a mapping of non-coherent memory.
    fn invalidate_memory(&self, memory: vk::DeviceMemory) -> LayerResult<()>;

    /// Creates a resettable command pool on `queue_family_index`.
    fn create_command_pool(&self, queue_family_index: u32) -> LayerResult<vk::CommandPool>;
    /// Destroys the pool and every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> LayerResult<vk::CommandBuffer>;
    /// Resets `command_buffer` and records the layout transitions and copy of
    /// `copy` into it.
    fn record_readback(&self, command_buffer: vk::CommandBuffer, copy: &ReadbackCopy) -> LayerResult<()>;

    fn create_fence(&self) -> LayerResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Blocks until `fence` signals, then resets it.
    fn wait_and_reset_fence(&self, fence: vk::Fence) -> LayerResult<()>;

    /// Submits one batch; `fence` may be null.
    fn submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> LayerResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> LayerResult<()>;
    fn device_wait_idle(&self) -> LayerResult<()>;

    /// Whether every entry point the readback path needs is available.
    fn supports_readback(&self) -> bool;
}

/// Chooses a memory type for a resource.
///
/// Types carrying all of `preferred` win; otherwise the first allowed type
/// carrying `required` is used. Returns the index and the chosen type's flags.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    preferred: vk::MemoryPropertyFlags,
    required: vk::MemoryPropertyFlags,
) -> LayerResult<(u32, vk::MemoryPropertyFlags)> {
    let count = (properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    let candidates = || {
        properties.memory_types[..count]
            .iter()
            .enumerate()
            .filter(|(index, _)| type_bits & (1u32 << index) != 0)
            .map(|(index, ty)| (index as u32, ty.property_flags))
    };

    candidates()
        .find(|(_, flags)| flags.contains(preferred | required))
        .or_else(|| candidates().find(|(_, flags)| flags.contains(required)))
        .ok_or(LayerError::NoCompatibleMemory {
            type_bits,
            required,
        })
}
