//! GPU to CPU readback of presented images.
//!
//! Each swapchain owns one [`CaptureResources`]: a command pool with a single
//! command buffer, a fence, and a host-visible staging buffer sized for one
//! tightly packed frame. On present the image is copied into the staging
//! buffer on the device, the host waits for the fence, and the mapped bytes are
//! handed to the frame sink through a [`MappedFrame`].

use std::ptr::NonNull;

use ash::vk;
use ash::vk::Handle;
use log::{debug, warn};

use crate::driver::{DeviceDriver, ReadbackCopy, Submission, find_memory_type};
use crate::error::{LayerError, LayerResult};
use crate::frame::{BYTES_PER_PIXEL, FrameView, is_capturable_format};

/// Byte the staging buffer is filled with before any copy runs, so a frame
/// that was never written is distinguishable from a black one.
pub const STAGING_SENTINEL: u8 = 0xAB;

/// Host-visible copy target for one frame.
#[derive(Debug)]
pub struct StagingBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    /// Whether the memory is host coherent; otherwise it is invalidated after
    /// every copy.
    pub coherent: bool,
}

/// Per-swapchain objects used to read presented images back.
#[derive(Debug)]
pub struct CaptureResources {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub staging: StagingBuffer,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

impl CaptureResources {
    /// Creates the readback objects for frames of `extent`.
    ///
    /// Fails with [`LayerError::UnsupportedFormat`] before touching the driver
    /// when `format` is not four bytes per texel. Anything created before a
    /// later failure is released again.
    pub fn create(
        driver: &dyn DeviceDriver,
        queue_family_index: u32,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> LayerResult<Self> {
        if !is_capturable_format(format) {
            return Err(LayerError::UnsupportedFormat { format });
        }
        let mut resources = Self {
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            staging: StagingBuffer {
                buffer: vk::Buffer::null(),
                memory: vk::DeviceMemory::null(),
                size: extent.width as vk::DeviceSize * extent.height as vk::DeviceSize * BYTES_PER_PIXEL as vk::DeviceSize,
                coherent: true,
            },
            extent,
            format,
        };
        match resources.init(driver, queue_family_index, memory_properties) {
            Ok(()) => Ok(resources),
            Err(err) => {
                resources.release(driver);
                Err(err)
            }
        }
    }

    fn init(
        &mut self,
        driver: &dyn DeviceDriver,
        queue_family_index: u32,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> LayerResult<()> {
        self.command_pool = driver.create_command_pool(queue_family_index)?;
        self.command_buffer = driver.allocate_command_buffer(self.command_pool)?;
        self.fence = driver.create_fence()?;

        let staging = &mut self.staging;
        staging.buffer = driver.create_buffer(staging.size, vk::BufferUsageFlags::TRANSFER_DST)?;
        let requirements = driver.buffer_memory_requirements(staging.buffer)?;
        let (type_index, flags) = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;
        staging.coherent = flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        staging.memory = driver.allocate_memory(requirements.size, type_index)?;
        driver.bind_buffer_memory(staging.buffer, staging.memory)?;

        let mapped = driver.map_memory(staging.memory, staging.size)?;
        unsafe { std::ptr::write_bytes(mapped.as_ptr(), STAGING_SENTINEL, staging.size as usize) };
        driver.unmap_memory(staging.memory);

        debug!(
            "staging buffer {:#x}: {} bytes, memory type {type_index} ({flags:?})",
            staging.buffer.as_raw(),
            staging.size
        );
        Ok(())
    }

    /// Records and submits the copy of `image` into the staging buffer.
    ///
    /// The submission waits on `wait_semaphores`, so once this returns `Ok` the
    /// application's present waits have been consumed.
    pub fn submit_copy(
        &self,
        driver: &dyn DeviceDriver,
        queue: vk::Queue,
        image: vk::Image,
        wait_semaphores: &[vk::Semaphore],
    ) -> LayerResult<()> {
        let copy = ReadbackCopy {
            image,
            buffer: self.staging.buffer,
            extent: self.extent,
            present_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        };
        driver.record_readback(self.command_buffer, &copy)?;
        let submission = Submission {
            wait_semaphores,
            command_buffers: std::slice::from_ref(&self.command_buffer),
            signal_semaphores: &[],
        };
        driver.submit(queue, &submission, self.fence)
    }

    /// Blocks until the copy from [`submit_copy`](Self::submit_copy) finishes,
    /// then maps the staging memory.
    pub fn collect<'d>(&self, driver: &'d dyn DeviceDriver) -> LayerResult<MappedFrame<'d>> {
        driver.wait_and_reset_fence(self.fence)?;

        if !self.staging.coherent {
            driver.invalidate_memory(self.staging.memory)?;
        }
        let data = driver.map_memory(self.staging.memory, self.staging.size)?;
        Ok(MappedFrame {
            driver,
            memory: self.staging.memory,
            data,
            len: self.staging.size as usize,
            extent: self.extent,
            format: self.format,
        })
    }

    /// Destroys everything [`create`](Self::create) made, skipping null
    /// handles: command pool, fence, then staging buffer before its memory.
    pub fn release(&mut self, driver: &dyn DeviceDriver) {
        if !self.command_pool.is_null() {
            driver.destroy_command_pool(self.command_pool);
            self.command_pool = vk::CommandPool::null();
            self.command_buffer = vk::CommandBuffer::null();
        }
        if !self.fence.is_null() {
            driver.destroy_fence(self.fence);
            self.fence = vk::Fence::null();
        }
        if !self.staging.buffer.is_null() {
            driver.destroy_buffer(self.staging.buffer);
            self.staging.buffer = vk::Buffer::null();
        }
        if !self.staging.memory.is_null() {
            driver.free_memory(self.staging.memory);
            self.staging.memory = vk::DeviceMemory::null();
        }
    }
}

/// Staging memory mapped for reading; unmapped on drop.
pub struct MappedFrame<'d> {
    driver: &'d dyn DeviceDriver,
    memory: vk::DeviceMemory,
    data: NonNull<u8>,
    len: usize,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl MappedFrame<'_> {
    /// The mapped bytes as a tightly packed frame.
    pub fn view(&self) -> Option<FrameView<'_>> {
        let bytes = unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) };
        let view = FrameView::new(
            self.extent.width,
            self.extent.height,
            self.extent.width as usize * BYTES_PER_PIXEL,
            self.format,
            bytes,
        );
        if view.is_none() {
            warn!("mapped staging memory is smaller than one frame");
        }
        view
    }
}

impl Drop for MappedFrame<'_> {
    fn drop(&mut self) {
        self.driver.unmap_memory(self.memory);
    }
}
