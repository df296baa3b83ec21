//! Device level entry points: swapchains and presentation.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use log::{debug, info, warn};

use super::{context, fail, raw_slice, write_enumeration};
use crate::chain::dispatch_key;
use crate::dispatch::DeviceDispatch;
use crate::driver::{DeviceDriver, Submission};
use crate::error::LayerError;
use crate::surface::Ownership;
use crate::swapchain::{DeviceContext, SwapchainRequest};

fn device_for<H: vk::Handle>(handle: H) -> Option<Arc<DeviceDispatch>> {
    let key = unsafe { dispatch_key(handle) };
    context().state().devices.get_or_active(key).cloned()
}

pub(super) unsafe extern "system" fn destroy_device(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if device == vk::Device::null() {
        return;
    }
    let ctx = context();
    let key = unsafe { dispatch_key(device) };
    ctx.destroy_swapchains_for_device(key);
    let dispatch = ctx.state().devices.remove(key);
    match dispatch.and_then(|dispatch| dispatch.destroy_device) {
        Some(destroy) => unsafe { destroy(device, p_allocator) },
        None => warn!("vkDestroyDevice on a device the layer never saw"),
    }
    info!("device destroyed (key {key:#x})");
}

pub(super) unsafe extern "system" fn create_swapchain(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let ctx = context();
    let (Some(create_info), Some(out)) = (unsafe { p_create_info.as_ref() }, unsafe { p_swapchain.as_mut() })
    else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(dispatch) = device_for(device) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };

    match ctx.surface_ownership(create_info.surface) {
        Ownership::Live => {}
        Ownership::Retired => return vk::Result::ERROR_SURFACE_LOST_KHR,
        Ownership::Foreign => {
            return match dispatch.create_swapchain {
                Some(next) => unsafe { next(device, p_create_info, p_allocator, p_swapchain) },
                None => vk::Result::ERROR_SURFACE_LOST_KHR,
            };
        }
    }

    let request = SwapchainRequest::from_create_info(create_info);
    let device_context = DeviceContext {
        device_key: unsafe { dispatch_key(device) },
        queue: dispatch.queue,
        queue_family_index: dispatch.queue_family_index,
        memory_properties: dispatch.memory_properties,
        driver: dispatch as Arc<dyn DeviceDriver>,
    };
    match ctx.create_swapchain(device_context, &request) {
        Ok(swapchain) => {
            *out = swapchain;
            vk::Result::SUCCESS
        }
        Err(err) => fail("vkCreateSwapchainKHR", err),
    }
}

pub(super) unsafe extern "system" fn destroy_swapchain(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if swapchain == vk::SwapchainKHR::null() {
        return;
    }
    match context().destroy_swapchain(swapchain) {
        Ownership::Live => {}
        Ownership::Retired => debug!("ignoring second destroy of a virtual swapchain"),
        Ownership::Foreign => {
            if let Some(next) = device_for(device).and_then(|dispatch| dispatch.destroy_swapchain) {
                unsafe { next(device, swapchain, p_allocator) };
            }
        }
    }
}

pub(super) unsafe extern "system" fn get_swapchain_images(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_count: *mut u32,
    p_images: *mut vk::Image,
) -> vk::Result {
    let ctx = context();
    match ctx.swapchain_ownership(swapchain) {
        Ownership::Live => match ctx.swapchain_images(swapchain) {
            Ok(images) => unsafe { write_enumeration(&images, p_count, p_images) },
            Err(err) => fail("vkGetSwapchainImagesKHR", err),
        },
        Ownership::Retired => vk::Result::ERROR_SURFACE_LOST_KHR,
        Ownership::Foreign => match device_for(device).and_then(|dispatch| dispatch.get_swapchain_images) {
            Some(next) => unsafe { next(device, swapchain, p_count, p_images) },
            None => vk::Result::ERROR_SURFACE_LOST_KHR,
        },
    }
}

fn acquire_virtual(
    swapchain: vk::SwapchainKHR,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    let Some(out) = (unsafe { p_image_index.as_mut() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    match context().acquire(swapchain, semaphore, fence) {
        Ok(index) => {
            *out = index;
            log::trace!("acquired image {index}");
            vk::Result::SUCCESS
        }
        Err(err) => fail("vkAcquireNextImageKHR", err),
    }
}

/// Never blocks: an image is always available, so `timeout` is irrelevant.
pub(super) unsafe extern "system" fn acquire_next_image(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    match context().swapchain_ownership(swapchain) {
        Ownership::Live => acquire_virtual(swapchain, semaphore, fence, p_image_index),
        Ownership::Retired => vk::Result::ERROR_OUT_OF_DATE_KHR,
        Ownership::Foreign => match device_for(device).and_then(|dispatch| dispatch.acquire_next_image) {
            Some(next) => unsafe { next(device, swapchain, timeout, semaphore, fence, p_image_index) },
            None => vk::Result::ERROR_SURFACE_LOST_KHR,
        },
    }
}

pub(super) unsafe extern "system" fn acquire_next_image2(
    device: vk::Device,
    p_acquire_info: *const vk::AcquireNextImageInfoKHR<'_>,
    p_image_index: *mut u32,
) -> vk::Result {
    let Some(acquire) = (unsafe { p_acquire_info.as_ref() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    match context().swapchain_ownership(acquire.swapchain) {
        Ownership::Live => acquire_virtual(acquire.swapchain, acquire.semaphore, acquire.fence, p_image_index),
        Ownership::Retired => vk::Result::ERROR_OUT_OF_DATE_KHR,
        Ownership::Foreign => match device_for(device).and_then(|dispatch| dispatch.acquire_next_image2) {
            Some(next) => unsafe { next(device, p_acquire_info, p_image_index) },
            None => vk::Result::ERROR_SURFACE_LOST_KHR,
        },
    }
}

pub(super) unsafe extern "system" fn queue_present(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let ctx = context();
    let Some(present) = (unsafe { p_present_info.as_ref() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let swapchains = unsafe { raw_slice(present.p_swapchains, present.swapchain_count) };
    let indices = unsafe { raw_slice(present.p_image_indices, present.swapchain_count) };
    let waits = unsafe { raw_slice(present.p_wait_semaphores, present.wait_semaphore_count) };
    if indices.len() != swapchains.len() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    let (virtual_slots, foreign_slots): (Vec<usize>, Vec<usize>) =
        (0..swapchains.len()).partition(|&i| ctx.swapchain_ownership(swapchains[i]) != Ownership::Foreign);

    let forward = || device_for(queue).and_then(|dispatch| dispatch.queue_present);
    if virtual_slots.is_empty() {
        return match forward() {
            Some(next) => unsafe { next(queue, p_present_info) },
            None => vk::Result::ERROR_SURFACE_LOST_KHR,
        };
    }

    let mut results = vec![vk::Result::SUCCESS; swapchains.len()];
    let targets: Vec<_> = virtual_slots.iter().map(|&i| (swapchains[i], indices[i])).collect();
    let report = ctx.present(&targets, waits);
    let pending_waits: &[vk::Semaphore] = if report.waits_pending { waits } else { &[] };
    for (&slot, outcome) in virtual_slots.iter().zip(report.results) {
        results[slot] = match outcome {
            Ok(_) => vk::Result::SUCCESS,
            Err(err) => fail("vkQueuePresentKHR", err),
        };
    }

    if !foreign_slots.is_empty() {
        let foreign_swapchains: Vec<_> = foreign_slots.iter().map(|&i| swapchains[i]).collect();
        let foreign_indices: Vec<_> = foreign_slots.iter().map(|&i| indices[i]).collect();
        let mut foreign_results = vec![vk::Result::SUCCESS; foreign_slots.len()];
        let reduced = vk::PresentInfoKHR::default()
            .wait_semaphores(pending_waits)
            .swapchains(&foreign_swapchains)
            .image_indices(&foreign_indices)
            .results(&mut foreign_results);
        let overall = match forward() {
            Some(next) => unsafe { next(queue, &reduced) },
            None => vk::Result::ERROR_SURFACE_LOST_KHR,
        };
        for (&slot, &result) in foreign_slots.iter().zip(&foreign_results) {
            results[slot] = if overall.as_raw() < 0 && result == vk::Result::SUCCESS {
                overall
            } else {
                result
            };
        }
    } else if !pending_waits.is_empty() {
        consume_waits(queue, pending_waits);
    }

    if !present.p_results.is_null() {
        unsafe { std::ptr::copy_nonoverlapping(results.as_ptr(), present.p_results, results.len()) };
    }
    combine(&results)
}

/// Waits on `waits` in an empty submission when no virtual present did.
fn consume_waits(queue: vk::Queue, waits: &[vk::Semaphore]) {
    let submission = Submission {
        wait_semaphores: waits,
        ..Default::default()
    };
    let consumed = match device_for(queue) {
        Some(dispatch) => dispatch.submit(queue, &submission, vk::Fence::null()),
        None => Err(LayerError::UnknownHandle {
            kind: "queue",
            handle: queue.as_raw(),
        }),
    };
    if let Err(err) = consumed {
        warn!("present waits left unconsumed: {err}");
    }
}

/// The single code returned for a multi-swapchain present: the first error,
/// else the first non-success status, else success.
fn combine(results: &[vk::Result]) -> vk::Result {
    results
        .iter()
        .copied()
        .find(|result| result.as_raw() < 0)
        .or_else(|| results.iter().copied().find(|&result| result != vk::Result::SUCCESS))
        .unwrap_or(vk::Result::SUCCESS)
}
