//! Software swapchains.
//!
//! A [`VirtualSwapchain`] owns GPU-resident images the application renders
//! into, plus the [`CaptureResources`] that read a presented image back. There
//! is no presentation engine behind it: acquire hands out images round-robin
//! and present copies the image out and gives it to a [`FrameSink`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;
use ash::vk::Handle;
use log::{debug, error, info, warn};

use crate::capture::CaptureResources;
use crate::driver::{DeviceDriver, ImageDesc, Submission, find_memory_type};
use crate::error::{LayerError, LayerResult};
use crate::frame::{FrameDisposition, FrameSink};
use crate::surface::{HandleAllocator, Ownership, RetiredHandles};

/// Most images a virtual swapchain holds.
pub const MAX_SWAPCHAIN_IMAGES: u32 = 8;

/// What the application asked for in `vkCreateSwapchainKHR`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainRequest {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
}

impl SwapchainRequest {
    pub fn from_create_info(info: &vk::SwapchainCreateInfoKHR<'_>) -> Self {
        Self {
            surface: info.surface,
            min_image_count: info.min_image_count,
            format: info.image_format,
            extent: info.image_extent,
            array_layers: info.image_array_layers,
            usage: info.image_usage,
        }
    }

    /// Image count after clamping into `1..=MAX_SWAPCHAIN_IMAGES`.
    pub fn image_count(&self) -> u32 {
        self.min_image_count.clamp(1, MAX_SWAPCHAIN_IMAGES)
    }
}

/// The device-side context a swapchain is created in.
#[derive(Clone)]
pub struct DeviceContext {
    pub driver: Arc<dyn DeviceDriver>,
    /// Dispatch key of the owning device.
    pub device_key: usize,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

/// One presentable image and its memory. Null handles mark a slot whose
/// allocation failed.
#[derive(Clone, Copy, Debug, Default)]
struct ImageSlot {
    image: vk::Image,
    memory: vk::DeviceMemory,
}

impl ImageSlot {
    fn is_usable(&self) -> bool {
        !self.image.is_null() && !self.memory.is_null()
    }
}

/// Why a present skipped readback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The driver lacks an entry point the copy needs.
    ReadbackUnavailable,
    /// The image slot could not be allocated.
    DegradedSlot,
    /// The copy or map failed; the error was logged.
    ReadbackFailed,
}

/// Result of presenting one image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Captured(FrameDisposition),
    Skipped(SkipReason),
}

/// An emulated swapchain.
pub struct VirtualSwapchain {
    device: DeviceContext,
    surface: vk::SurfaceKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    slots: Vec<ImageSlot>,
    capture: Option<CaptureResources>,
    cursor: AtomicU32,
}

impl VirtualSwapchain {
    /// Allocates images and readback resources for `request`.
    ///
    /// Individual image slots that fail to allocate are logged and left empty;
    /// creation only fails when no slot could be allocated at all.
    pub fn create(device: DeviceContext, request: &SwapchainRequest) -> LayerResult<Self> {
        let count = request.image_count();
        if count != request.min_image_count {
            debug!(
                "clamped swapchain image count {} to {count}",
                request.min_image_count
            );
        }
        let desc = ImageDesc {
            format: request.format,
            extent: request.extent,
            array_layers: request.array_layers.max(1),
            usage: request.usage | vk::ImageUsageFlags::TRANSFER_SRC,
        };

        let mut slots = Vec::with_capacity(count as usize);
        let mut last_error = None;
        for index in 0..count {
            match allocate_slot(&*device.driver, &device.memory_properties, &desc) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    warn!("swapchain image {index} unusable: {err}");
                    slots.push(ImageSlot::default());
                    last_error = Some(err);
                }
            }
        }
        if !slots.iter().any(ImageSlot::is_usable) {
            let err = last_error.unwrap_or(LayerError::vulkan(
                "vkCreateImage",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ));
            error!("no swapchain image could be allocated: {err}");
            return Err(err);
        }

        let capture = if device.driver.supports_readback() {
            match CaptureResources::create(
                &*device.driver,
                device.queue_family_index,
                &device.memory_properties,
                request.extent,
                request.format,
            ) {
                Ok(capture) => Some(capture),
                Err(err) => {
                    warn!("frame readback disabled for this swapchain: {err}");
                    None
                }
            }
        } else {
            warn!("driver lacks readback entry points; presents will not be captured");
            None
        };

        info!(
            "virtual swapchain: {count} images, {}x{}, {:?}",
            request.extent.width, request.extent.height, request.format
        );
        Ok(Self {
            device,
            surface: request.surface,
            format: request.format,
            extent: request.extent,
            slots,
            capture,
            cursor: AtomicU32::new(0),
        })
    }

    pub fn image_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Backing image handles in index order.
    pub fn images(&self) -> Vec<vk::Image> {
        self.slots.iter().map(|slot| slot.image).collect()
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn device_key(&self) -> usize {
        self.device.device_key
    }

    pub fn can_capture(&self) -> bool {
        self.capture.is_some()
    }

    /// Hands out the next image round-robin.
    ///
    /// Never waits. `semaphore` and `fence` (either may be null) are signalled
    /// through an empty queue submission so the application's next submit can
    /// wait on them as usual.
    pub fn acquire(&self, semaphore: vk::Semaphore, fence: vk::Fence) -> LayerResult<u32> {
        let count = self.image_count();
        let index = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                Some((cursor + 1) % count)
            }) {
            Ok(previous) | Err(previous) => previous,
        };

        if semaphore.is_null() && fence.is_null() {
            return Ok(index);
        }
        let signal = [semaphore];
        let submission = Submission {
            signal_semaphores: if semaphore.is_null() { &[] } else { &signal },
            ..Default::default()
        };
        match self.device.driver.submit(self.device.queue, &submission, fence) {
            Ok(()) => Ok(index),
            Err(err @ LayerError::MissingEntryPoint { .. }) => {
                warn!("cannot signal acquire: {err}");
                Ok(index)
            }
            Err(err) => Err(err),
        }
    }

    /// Presents image `index`: reads it back and gives it to `sink`.
    ///
    /// `wait_semaphores` are consumed exactly once whatever the outcome: by the
    /// readback submission, or by an empty submission when readback is skipped
    /// or the index is out of range. Device loss is the one exception.
    pub fn present(
        &self,
        index: u32,
        wait_semaphores: &[vk::Semaphore],
        sink: &mut dyn FrameSink,
    ) -> LayerResult<PresentOutcome> {
        let count = self.image_count();
        let Some(slot) = self.slots.get(index as usize).copied() else {
            self.consume_waits(wait_semaphores);
            return Err(LayerError::InvalidImageIndex { index, count });
        };

        let (skip, pending_waits) = match &self.capture {
            None => (SkipReason::ReadbackUnavailable, wait_semaphores),
            Some(_) if !slot.is_usable() => (SkipReason::DegradedSlot, wait_semaphores),
            Some(capture) => {
                let driver = &*self.device.driver;
                match capture.submit_copy(driver, self.device.queue, slot.image, wait_semaphores) {
                    Err(err) if is_device_lost(&err) => return Err(err),
                    Err(err) => {
                        warn!("readback of image {index} could not be submitted: {err}");
                        (SkipReason::ReadbackFailed, wait_semaphores)
                    }
                    Ok(()) => match capture.collect(driver) {
                        Ok(mapped) => {
                            let disposition = match mapped.view() {
                                Some(frame) => sink.consume(&frame),
                                None => FrameDisposition::Dropped(crate::frame::DropReason::Io),
                            };
                            return Ok(PresentOutcome::Captured(disposition));
                        }
                        Err(err) if is_device_lost(&err) => return Err(err),
                        Err(err) => {
                            // The copy went in, so its waits are already spent.
                            warn!("readback of image {index} failed: {err}");
                            (SkipReason::ReadbackFailed, &[][..])
                        }
                    },
                }
            }
        };

        self.drain_without_readback(pending_waits);
        Ok(PresentOutcome::Skipped(skip))
    }

    /// Waits on `wait_semaphores` in a submission that carries no work.
    /// Returns whether they were consumed.
    fn consume_waits(&self, wait_semaphores: &[vk::Semaphore]) -> bool {
        if wait_semaphores.is_empty() {
            return true;
        }
        if self.device.queue.is_null() {
            warn!("no queue to consume {} present wait(s) on", wait_semaphores.len());
            return false;
        }
        let submission = Submission {
            wait_semaphores,
            ..Default::default()
        };
        match self.device.driver.submit(self.device.queue, &submission, vk::Fence::null()) {
            Ok(()) => true,
            Err(err) => {
                warn!("present waits not consumed: {err}");
                false
            }
        }
    }

    /// Consumes the present's wait semaphores and waits for the GPU without
    /// copying anything.
    fn drain_without_readback(&self, wait_semaphores: &[vk::Semaphore]) {
        let driver = &*self.device.driver;
        let queue = self.device.queue;
        if !queue.is_null() && self.consume_waits(wait_semaphores) && driver.queue_wait_idle(queue).is_ok() {
            return;
        }
        if let Err(err) = driver.device_wait_idle() {
            warn!("degraded present could not wait for idle: {err}");
        }
    }
}

fn is_device_lost(err: &LayerError) -> bool {
    matches!(
        err,
        LayerError::Vulkan {
            result: vk::Result::ERROR_DEVICE_LOST,
            ..
        }
    )
}

impl Drop for VirtualSwapchain {
    fn drop(&mut self) {
        let driver = &*self.device.driver;
        if let Err(err) = driver.device_wait_idle() {
            warn!("wait-idle before swapchain teardown failed: {err}");
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.release(driver);
        }
        for slot in self.slots.drain(..) {
            if !slot.image.is_null() {
                driver.destroy_image(slot.image);
            }
            if !slot.memory.is_null() {
                driver.free_memory(slot.memory);
            }
        }
        debug!("virtual swapchain resources released");
    }
}

fn allocate_slot(
    driver: &dyn DeviceDriver,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    desc: &ImageDesc,
) -> LayerResult<ImageSlot> {
    let image = driver.create_image(desc)?;
    let bound = (|| {
        let requirements = driver.image_memory_requirements(image)?;
        let (type_index, _) = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )?;
        let memory = driver.allocate_memory(requirements.size, type_index)?;
        if let Err(err) = driver.bind_image_memory(image, memory) {
            driver.free_memory(memory);
            return Err(err);
        }
        Ok(memory)
    })();
    match bound {
        Ok(memory) => Ok(ImageSlot { image, memory }),
        Err(err) => {
            driver.destroy_image(image);
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const SWAPCHAIN_HANDLE_BASE: u64 = 0x5c5f_0000_0000_0001;

/// Every virtual swapchain in the process.
pub struct SwapchainRegistry {
    allocator: HandleAllocator,
    live: HashMap<u64, Arc<VirtualSwapchain>>,
    retired: RetiredHandles,
}

impl Default for SwapchainRegistry {
    fn default() -> Self {
        Self {
            allocator: HandleAllocator::new(SWAPCHAIN_HANDLE_BASE),
            live: HashMap::new(),
            retired: RetiredHandles::default(),
        }
    }
}

impl SwapchainRegistry {
    pub fn insert(&mut self, swapchain: VirtualSwapchain) -> vk::SwapchainKHR {
        let raw = self.allocator.allocate();
        self.live.insert(raw, Arc::new(swapchain));
        vk::SwapchainKHR::from_raw(raw)
    }

    pub fn get(&self, swapchain: vk::SwapchainKHR) -> Option<Arc<VirtualSwapchain>> {
        self.live.get(&swapchain.as_raw()).cloned()
    }

    pub fn ownership(&self, swapchain: vk::SwapchainKHR) -> Ownership {
        let raw = swapchain.as_raw();
        if self.live.contains_key(&raw) {
            Ownership::Live
        } else if self.retired.contains(raw) {
            Ownership::Retired
        } else {
            Ownership::Foreign
        }
    }

    pub fn is_known(&self, swapchain: vk::SwapchainKHR) -> bool {
        self.ownership(swapchain) == Ownership::Live
    }

    /// Unregisters a swapchain. Its resources are released when the returned
    /// reference is dropped and no present still holds it.
    pub fn remove(&mut self, swapchain: vk::SwapchainKHR) -> Option<Arc<VirtualSwapchain>> {
        let raw = swapchain.as_raw();
        let removed = self.live.remove(&raw)?;
        self.retired.insert(raw);
        Some(removed)
    }

    /// Unregisters every swapchain created on the device with `device_key`.
    pub fn remove_for_device(&mut self, device_key: usize) -> Vec<Arc<VirtualSwapchain>> {
        let doomed: Vec<u64> = self
            .live
            .iter()
            .filter(|(_, swapchain)| swapchain.device_key() == device_key)
            .map(|(raw, _)| *raw)
            .collect();
        doomed
            .into_iter()
            .filter_map(|raw| self.remove(vk::SwapchainKHR::from_raw(raw)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Destroyed swapchains still reported as [`Ownership::Retired`].
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
