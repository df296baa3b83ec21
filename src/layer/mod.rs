//! The loader-facing surface of the crate.
//!
//! Everything here is `extern "system"` and talks raw pointers. Entry points
//! translate into calls on the process-wide [`LayerContext`] and turn every
//! [`LayerError`](crate::LayerError) back into a `VkResult`; nothing unwinds
//! across the boundary.

use std::ffi::{CStr, c_char};
use std::ptr;

use ash::vk;
use log::{error, info};
use once_cell::sync::Lazy;

use crate::chain::{LAYER_INTERFACE_VERSION, LAYER_NEGOTIATE_INTERFACE_STRUCT, NegotiateLayerInterface, dispatch_key};
use crate::config::{LayerConfig, init_logging};
use crate::context::LayerContext;

/// Resolves `$name` through a next-layer proc-addr function as `$ty`.
macro_rules! next_fn {
    ($gpa:expr, $handle:expr, $name:literal as $ty:ty) => {
        unsafe { ($gpa)($handle, $name.as_ptr()) }
            .map(|f| unsafe { std::mem::transmute::<unsafe extern "system" fn(), $ty>(f) })
    };
}

mod device;
mod instance;

/// Name the loader manifest registers the layer under.
pub const LAYER_NAME: &CStr = c"VK_LAYER_HEADLESS_present";

static CONTEXT: Lazy<LayerContext> = Lazy::new(|| {
    let config = LayerConfig::from_env();
    init_logging(&config);
    info!(
        "{} {} loaded ({})",
        LAYER_NAME.to_string_lossy(),
        env!("CARGO_PKG_VERSION"),
        if config.enabled { "enabled" } else { "pass-through" }
    );
    LayerContext::new(config)
});

fn context() -> &'static LayerContext {
    &CONTEXT
}

/// Loader entry point: agrees on interface version 2 and hands out the
/// layer's proc-addr functions.
///
/// # Safety
///
/// `p_version_struct` must be null or point at a loader-owned negotiation
/// structure.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    p_version_struct: *mut NegotiateLayerInterface,
) -> vk::Result {
    let Some(negotiate) = (unsafe { p_version_struct.as_mut() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if negotiate.s_type != LAYER_NEGOTIATE_INTERFACE_STRUCT
        || negotiate.loader_layer_interface_version < LAYER_INTERFACE_VERSION
    {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    Lazy::force(&CONTEXT);

    negotiate.loader_layer_interface_version = LAYER_INTERFACE_VERSION;
    negotiate.pfn_get_instance_proc_addr = Some(get_instance_proc_addr);
    negotiate.pfn_get_device_proc_addr = Some(get_device_proc_addr);
    negotiate.pfn_get_physical_device_proc_addr = Some(get_physical_device_proc_addr);
    vk::Result::SUCCESS
}

// ---------------------------------------------------------------------------
// Proc-addr routing
// ---------------------------------------------------------------------------

unsafe fn name_of<'a>(p_name: *const c_char) -> Option<&'a [u8]> {
    if p_name.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(p_name) }.to_bytes())
}

fn void_fn(f: *const ()) -> vk::PFN_vkVoidFunction {
    Some(unsafe { std::mem::transmute::<*const (), unsafe extern "system" fn()>(f) })
}

/// Entry points intercepted even when the layer is disabled.
fn plumbing_proc(name: &[u8]) -> Option<*const ()> {
    Some(match name {
        b"vkGetInstanceProcAddr" => get_instance_proc_addr as *const (),
        b"vkGetDeviceProcAddr" => get_device_proc_addr as *const (),
        b"vkCreateInstance" => instance::create_instance as *const (),
        b"vkDestroyInstance" => instance::destroy_instance as *const (),
        b"vkCreateDevice" => instance::create_device as *const (),
        b"vkDestroyDevice" => device::destroy_device as *const (),
        _ => return None,
    })
}

/// Physical-device level functions the layer implements.
fn physical_device_proc(name: &[u8]) -> Option<*const ()> {
    Some(match name {
        b"vkEnumerateDeviceExtensionProperties" => {
            instance::enumerate_device_extension_properties as *const ()
        }
        b"vkGetPhysicalDeviceFeatures" => instance::get_physical_device_features as *const (),
        b"vkGetPhysicalDeviceFeatures2" | b"vkGetPhysicalDeviceFeatures2KHR" => {
            instance::get_physical_device_features2 as *const ()
        }
        b"vkGetPhysicalDeviceFormatProperties" => {
            instance::get_physical_device_format_properties as *const ()
        }
        b"vkGetPhysicalDeviceFormatProperties2" | b"vkGetPhysicalDeviceFormatProperties2KHR" => {
            instance::get_physical_device_format_properties2 as *const ()
        }
        b"vkGetPhysicalDeviceSurfaceSupportKHR" => instance::get_surface_support as *const (),
        b"vkGetPhysicalDeviceSurfaceCapabilitiesKHR" => {
            instance::get_surface_capabilities as *const ()
        }
        b"vkGetPhysicalDeviceSurfaceFormatsKHR" => instance::get_surface_formats as *const (),
        b"vkGetPhysicalDeviceSurfacePresentModesKHR" => {
            instance::get_surface_present_modes as *const ()
        }
        b"vkGetPhysicalDeviceSurfaceCapabilities2KHR" => {
            instance::get_surface_capabilities2 as *const ()
        }
        b"vkGetPhysicalDeviceSurfaceFormats2KHR" => instance::get_surface_formats2 as *const (),
        b"vkGetPhysicalDeviceXcbPresentationSupportKHR" => {
            instance::get_xcb_presentation_support as *const ()
        }
        b"vkGetPhysicalDeviceXlibPresentationSupportKHR" => {
            instance::get_xlib_presentation_support as *const ()
        }
        _ => return None,
    })
}

/// Instance level functions the layer implements.
fn instance_proc(name: &[u8]) -> Option<*const ()> {
    Some(match name {
        b"vkEnumerateInstanceExtensionProperties" => {
            instance::enumerate_instance_extension_properties as *const ()
        }
        b"vkCreateXcbSurfaceKHR" | b"vkCreateXlibSurfaceKHR" | b"vkCreateHeadlessSurfaceEXT" => {
            instance::create_surface as *const ()
        }
        b"vkDestroySurfaceKHR" => instance::destroy_surface as *const (),
        _ => return physical_device_proc(name),
    })
}

/// Device level functions the layer implements.
fn device_proc(name: &[u8]) -> Option<*const ()> {
    Some(match name {
        b"vkCreateSwapchainKHR" => device::create_swapchain as *const (),
        b"vkDestroySwapchainKHR" => device::destroy_swapchain as *const (),
        b"vkGetSwapchainImagesKHR" => device::get_swapchain_images as *const (),
        b"vkAcquireNextImageKHR" => device::acquire_next_image as *const (),
        b"vkAcquireNextImage2KHR" => device::acquire_next_image2 as *const (),
        b"vkQueuePresentKHR" => device::queue_present as *const (),
        _ => return None,
    })
}

unsafe extern "system" fn get_instance_proc_addr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = unsafe { name_of(p_name) }?;
    let ctx = context();
    if let Some(f) = plumbing_proc(name) {
        return void_fn(f);
    }
    if ctx.is_enabled() {
        if let Some(f) = instance_proc(name).or_else(|| device_proc(name)) {
            return void_fn(f);
        }
    }
    if instance == vk::Instance::null() {
        return None;
    }
    let key = unsafe { dispatch_key(instance) };
    let dispatch = ctx.state().instances.get(key).cloned()?;
    dispatch.forward(unsafe { CStr::from_ptr(p_name) })
}

unsafe extern "system" fn get_device_proc_addr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = unsafe { name_of(p_name) }?;
    let ctx = context();
    match name {
        b"vkGetDeviceProcAddr" => return void_fn(get_device_proc_addr as *const ()),
        b"vkDestroyDevice" => return void_fn(device::destroy_device as *const ()),
        _ => {}
    }
    if ctx.is_enabled() {
        if let Some(f) = device_proc(name) {
            return void_fn(f);
        }
    }
    if device == vk::Device::null() {
        return None;
    }
    let key = unsafe { dispatch_key(device) };
    let dispatch = ctx.state().devices.get(key).cloned()?;
    dispatch.forward(unsafe { CStr::from_ptr(p_name) })
}

unsafe extern "system" fn get_physical_device_proc_addr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = unsafe { name_of(p_name) }?;
    let ctx = context();
    if ctx.is_enabled() {
        if let Some(f) = physical_device_proc(name) {
            return void_fn(f);
        }
    }
    if instance == vk::Instance::null() {
        return None;
    }
    let key = unsafe { dispatch_key(instance) };
    let next = ctx
        .state()
        .instances
        .get(key)
        .and_then(|dispatch| dispatch.get_physical_device_proc_addr)?;
    unsafe { next(instance, p_name) }
}

// ---------------------------------------------------------------------------
// Helpers shared by the entry points
// ---------------------------------------------------------------------------

/// Implements the two-call enumeration idiom.
///
/// With a null `p_items` the count is written. Otherwise up to `*p_count`
/// items are copied, `*p_count` is set to the number written, and
/// `VK_INCOMPLETE` reports truncation.
///
/// # Safety
///
/// `p_count` must be valid for reads and writes; `p_items` must be null or
/// valid for `*p_count` writes.
pub(crate) unsafe fn write_enumeration<T: Copy>(items: &[T], p_count: *mut u32, p_items: *mut T) -> vk::Result {
    let Some(count) = (unsafe { p_count.as_mut() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if p_items.is_null() {
        *count = items.len() as u32;
        return vk::Result::SUCCESS;
    }
    let written = (*count as usize).min(items.len());
    unsafe { ptr::copy_nonoverlapping(items.as_ptr(), p_items, written) };
    *count = written as u32;
    if written < items.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

/// Logs a failed entry point and converts the error for the application.
fn fail(call: &str, err: crate::LayerError) -> vk::Result {
    error!("{call}: {err}");
    err.to_vk_result()
}

/// Reads a `count`/pointer pair as a slice, treating null as empty.
///
/// # Safety
///
/// A non-null `items` must be valid for `count` reads for the returned
/// lifetime.
unsafe fn raw_slice<'a, T>(items: *const T, count: u32) -> &'a [T] {
    if items.is_null() || count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(items, count as usize) }
    }
}
