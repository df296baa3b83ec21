//! Instance and physical-device level entry points.

use std::ffi::{CStr, c_char, c_void};
use std::sync::Arc;

use ash::vk;
use log::{debug, error, info, warn};

use super::{LAYER_NAME, context, fail, raw_slice, write_enumeration};
use crate::adapter::{
    LAYER_DEVICE_EXTENSIONS, LAYER_INSTANCE_EXTENSIONS, extension_properties, filter_instance_extensions,
    patch_device_create_info, spoof_features, spoof_features2, spoof_format_properties,
};
use crate::chain::{device_loader_data_callback, dispatch_key, take_device_link, take_instance_link};
use crate::dispatch::{DeviceDispatch, DeviceLoad, InstanceDispatch};
use crate::surface::{Ownership, PRESENT_MODES, SURFACE_FORMAT};

unsafe fn names<'a>(names: *const *const c_char, count: u32) -> Vec<&'a CStr> {
    unsafe { raw_slice(names, count) }
        .iter()
        .filter(|name| !name.is_null())
        .map(|&name| unsafe { CStr::from_ptr(name) })
        .collect()
}

fn instance_for(physical_device: vk::PhysicalDevice) -> Option<Arc<InstanceDispatch>> {
    let key = unsafe { dispatch_key(physical_device) };
    context().state().instances.get_or_active(key).cloned()
}

// ---------------------------------------------------------------------------
// Instance lifetime
// ---------------------------------------------------------------------------

pub(super) unsafe extern "system" fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    let ctx = context();
    let link = match unsafe { take_instance_link(p_create_info) } {
        Ok(link) => link,
        Err(err) => return fail("vkCreateInstance", err),
    };
    let Some(create) = next_fn!(
        link.get_instance_proc_addr,
        vk::Instance::null(),
        c"vkCreateInstance" as vk::PFN_vkCreateInstance
    ) else {
        error!("next layer does not provide vkCreateInstance");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let mut info = unsafe { *p_create_info };
    let requested = unsafe { names(info.pp_enabled_extension_names, info.enabled_extension_count) };
    let filter = filter_instance_extensions(&requested);
    let kept: Vec<*const c_char> = filter.kept.iter().map(|name| name.as_ptr()).collect();
    if ctx.is_enabled() && !filter.removed.is_empty() {
        info!("providing instance extensions {:?} in the layer", filter.removed);
        info.enabled_extension_count = kept.len() as u32;
        info.pp_enabled_extension_names = kept.as_ptr();
    }

    let result = unsafe { create(&info, p_allocator, p_instance) };
    if result != vk::Result::SUCCESS {
        return result;
    }
    let instance = unsafe { *p_instance };
    let dispatch = unsafe {
        InstanceDispatch::load(instance, link.get_instance_proc_addr, link.get_physical_device_proc_addr)
    };
    let destroy = dispatch.destroy_instance;
    let key = unsafe { dispatch_key(instance) };
    match ctx.state().instances.insert(key, Arc::new(dispatch)) {
        Ok(_) => {
            info!("instance created (key {key:#x})");
            vk::Result::SUCCESS
        }
        Err(err) => {
            if let Some(destroy) = destroy {
                unsafe { destroy(instance, p_allocator) };
            }
            fail("vkCreateInstance", err)
        }
    }
}

pub(super) unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if instance == vk::Instance::null() {
        return;
    }
    let key = unsafe { dispatch_key(instance) };
    let dispatch = {
        let mut state = context().state();
        let dropped = state.surfaces.destroy_for_instance(key);
        if dropped > 0 {
            debug!("dropped {dropped} surface(s) with their instance");
        }
        state.instances.remove(key)
    };
    match dispatch.and_then(|dispatch| dispatch.destroy_instance) {
        Some(destroy) => unsafe { destroy(instance, p_allocator) },
        None => warn!("vkDestroyInstance on an instance the layer never saw"),
    }
    info!("instance destroyed (key {key:#x})");
}

// ---------------------------------------------------------------------------
// Extensions, features, formats
// ---------------------------------------------------------------------------

pub(super) unsafe extern "system" fn enumerate_instance_extension_properties(
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if p_layer_name.is_null() || unsafe { CStr::from_ptr(p_layer_name) } != LAYER_NAME {
        return vk::Result::ERROR_LAYER_NOT_PRESENT;
    }
    let provided: Vec<_> = LAYER_INSTANCE_EXTENSIONS
        .iter()
        .map(|ext| extension_properties(ext.name, ext.spec_version))
        .collect();
    unsafe { write_enumeration(&provided, p_property_count, p_properties) }
}

pub(super) unsafe extern "system" fn enumerate_device_extension_properties(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    let Some(instance) = instance_for(physical_device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if !p_layer_name.is_null() {
        if unsafe { CStr::from_ptr(p_layer_name) } == LAYER_NAME {
            let provided: Vec<_> = LAYER_DEVICE_EXTENSIONS
                .iter()
                .map(|ext| extension_properties(ext.name, ext.spec_version))
                .collect();
            return unsafe { write_enumeration(&provided, p_property_count, p_properties) };
        }
        return match instance.enumerate_device_extension_properties {
            Some(next) => unsafe { next(physical_device, p_layer_name, p_property_count, p_properties) },
            None => vk::Result::ERROR_LAYER_NOT_PRESENT,
        };
    }

    let real = match instance.device_extensions(physical_device) {
        Ok(real) => real,
        Err(err) => return fail("vkEnumerateDeviceExtensionProperties", err),
    };
    let advertised = context().policy().advertised(&real);
    if p_properties.is_null() {
        debug!(
            "advertising {} device extensions ({} from the driver)",
            advertised.len(),
            real.len()
        );
    }
    unsafe { write_enumeration(&advertised, p_property_count, p_properties) }
}

pub(super) unsafe extern "system" fn get_physical_device_features(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures,
) {
    let Some(instance) = instance_for(physical_device) else {
        return;
    };
    if let Some(next) = instance.get_physical_device_features {
        unsafe { next(physical_device, p_features) };
    }
    if let Some(features) = unsafe { p_features.as_mut() } {
        spoof_features(features);
    }
}

pub(super) unsafe extern "system" fn get_physical_device_features2(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures2<'_>,
) {
    let Some(instance) = instance_for(physical_device) else {
        return;
    };
    if let Some(next) = instance.get_physical_device_features2 {
        unsafe { next(physical_device, p_features) };
    }
    if !p_features.is_null() {
        let patched = unsafe { spoof_features2(p_features) };
        if patched > 0 {
            debug!("spoofed {patched} feature structure(s)");
        }
    }
}

pub(super) unsafe extern "system" fn get_physical_device_format_properties(
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    p_properties: *mut vk::FormatProperties,
) {
    let Some(instance) = instance_for(physical_device) else {
        return;
    };
    if let Some(next) = instance.get_physical_device_format_properties {
        unsafe { next(physical_device, format, p_properties) };
    }
    if let Some(properties) = unsafe { p_properties.as_mut() } {
        spoof_format_properties(format, properties);
    }
}

pub(super) unsafe extern "system" fn get_physical_device_format_properties2(
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    p_properties: *mut vk::FormatProperties2<'_>,
) {
    let Some(instance) = instance_for(physical_device) else {
        return;
    };
    if let Some(next) = instance.get_physical_device_format_properties2 {
        unsafe { next(physical_device, format, p_properties) };
    }
    if let Some(properties) = unsafe { p_properties.as_mut() } {
        spoof_format_properties(format, &mut properties.format_properties);
    }
}

// ---------------------------------------------------------------------------
// Device creation
// ---------------------------------------------------------------------------

pub(super) unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    let ctx = context();
    let link = match unsafe { take_device_link(p_create_info) } {
        Ok(link) => link,
        Err(err) => return fail("vkCreateDevice", err),
    };
    let set_device_loader_data = unsafe { device_loader_data_callback(p_create_info) };
    let Some(instance) = instance_for(physical_device) else {
        error!("vkCreateDevice on a physical device of an unknown instance");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(create) = next_fn!(
        link.get_instance_proc_addr,
        instance.instance,
        c"vkCreateDevice" as vk::PFN_vkCreateDevice
    ) else {
        error!("next layer does not provide vkCreateDevice");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let mut info = unsafe { *p_create_info };
    let queue_family_index = unsafe { raw_slice(info.p_queue_create_infos, info.queue_create_info_count) }
        .first()
        .map_or(0, |queue| queue.queue_family_index);

    // Storage the patched create-info points into; must outlive the call.
    let kept: Vec<*const c_char>;
    let mut enabled_features = vk::PhysicalDeviceFeatures::default();
    let patch = if ctx.is_enabled() {
        let requested = unsafe { names(info.pp_enabled_extension_names, info.enabled_extension_count) };
        let driver_extensions = instance.device_extensions(physical_device).unwrap_or_else(|err| {
            warn!("cannot list driver extensions, assuming none: {err}");
            Vec::new()
        });
        let filter = ctx.policy().filter_for_driver(&requested, &driver_extensions);
        if !filter.removed.is_empty() {
            info!("not passing {:?} to the driver", filter.removed);
        }
        kept = filter.kept.iter().map(|name| name.as_ptr()).collect();
        info.enabled_extension_count = kept.len() as u32;
        info.pp_enabled_extension_names = kept.as_ptr();

        let driver_features = instance.real_features(physical_device, &driver_extensions);
        Some(unsafe {
            patch_device_create_info(&mut info, &filter.removed, driver_features.as_ref(), &mut enabled_features)
        })
    } else {
        None
    };

    let result = unsafe { create(physical_device, &info, p_allocator, p_device) };
    drop(patch);
    if result != vk::Result::SUCCESS {
        error!("driver vkCreateDevice failed: {result}");
        return result;
    }

    let device = unsafe { *p_device };
    let memory_properties = instance.memory_properties(physical_device).unwrap_or_else(|err| {
        warn!("memory properties unavailable, readback will be disabled: {err}");
        vk::PhysicalDeviceMemoryProperties::default()
    });
    let dispatch = unsafe {
        DeviceDispatch::load(DeviceLoad {
            device,
            physical_device,
            instance: instance.instance,
            instance_key: dispatch_key(instance.instance),
            gipa: link.get_instance_proc_addr,
            gdpa: link.get_device_proc_addr,
            set_device_loader_data,
            queue_family_index,
            memory_properties,
        })
    };
    let destroy = dispatch.destroy_device;
    let key = unsafe { dispatch_key(device) };
    match ctx.state().devices.insert(key, Arc::new(dispatch)) {
        Ok(_) => {
            info!("device created (key {key:#x}, queue family {queue_family_index})");
            vk::Result::SUCCESS
        }
        Err(err) => {
            if let Some(destroy) = destroy {
                unsafe { destroy(device, p_allocator) };
            }
            fail("vkCreateDevice", err)
        }
    }
}

// ---------------------------------------------------------------------------
// Surfaces
// ---------------------------------------------------------------------------

/// Shared by `vkCreateXcbSurfaceKHR`, `vkCreateXlibSurfaceKHR` and
/// `vkCreateHeadlessSurfaceEXT`; the platform create-info is ignored.
pub(super) unsafe extern "system" fn create_surface(
    instance: vk::Instance,
    _p_create_info: *const c_void,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let Some(out) = (unsafe { p_surface.as_mut() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let key = unsafe { dispatch_key(instance) };
    *out = context().create_surface(key);
    vk::Result::SUCCESS
}

pub(super) unsafe extern "system" fn get_xcb_presentation_support(
    _physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    _connection: *mut c_void,
    _visual_id: u32,
) -> vk::Bool32 {
    vk::TRUE
}

pub(super) unsafe extern "system" fn get_xlib_presentation_support(
    _physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    _display: *mut c_void,
    _visual_id: std::ffi::c_ulong,
) -> vk::Bool32 {
    vk::TRUE
}

pub(super) unsafe extern "system" fn destroy_surface(
    instance: vk::Instance,
    surface: vk::SurfaceKHR,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if surface == vk::SurfaceKHR::null() {
        return;
    }
    match context().destroy_surface(surface) {
        Ownership::Live => {}
        Ownership::Retired => debug!("ignoring second destroy of a virtual surface"),
        Ownership::Foreign => {
            let key = unsafe { dispatch_key(instance) };
            let next = context()
                .state()
                .instances
                .get_or_active(key)
                .and_then(|dispatch| dispatch.destroy_surface);
            if let Some(next) = next {
                unsafe { next(instance, surface, p_allocator) };
            }
        }
    }
}

pub(super) unsafe extern "system" fn get_surface_support(
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    surface: vk::SurfaceKHR,
    p_supported: *mut vk::Bool32,
) -> vk::Result {
    match context().surface_ownership(surface) {
        Ownership::Live => {
            if let Some(supported) = unsafe { p_supported.as_mut() } {
                *supported = vk::TRUE;
            }
            vk::Result::SUCCESS
        }
        Ownership::Retired => vk::Result::ERROR_SURFACE_LOST_KHR,
        Ownership::Foreign => match instance_for(physical_device)
            .and_then(|dispatch| dispatch.get_physical_device_surface_support)
        {
            Some(next) => unsafe { next(physical_device, queue_family_index, surface, p_supported) },
            None => vk::Result::ERROR_SURFACE_LOST_KHR,
        },
    }
}

pub(super) unsafe extern "system" fn get_surface_capabilities(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_capabilities: *mut vk::SurfaceCapabilitiesKHR,
) -> vk::Result {
    if let Some(capabilities) = context().surface_capabilities(surface) {
        return match unsafe { p_capabilities.as_mut() } {
            Some(out) => {
                *out = capabilities;
                vk::Result::SUCCESS
            }
            None => vk::Result::ERROR_INITIALIZATION_FAILED,
        };
    }
    match foreign_surface_query(physical_device, surface, |dispatch| {
        dispatch.get_physical_device_surface_capabilities
    }) {
        Ok(next) => unsafe { next(physical_device, surface, p_capabilities) },
        Err(result) => result,
    }
}

pub(super) unsafe extern "system" fn get_surface_formats(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_count: *mut u32,
    p_formats: *mut vk::SurfaceFormatKHR,
) -> vk::Result {
    if context().surface_ownership(surface) == Ownership::Live {
        return unsafe { write_enumeration(&[SURFACE_FORMAT], p_count, p_formats) };
    }
    match foreign_surface_query(physical_device, surface, |dispatch| {
        dispatch.get_physical_device_surface_formats
    }) {
        Ok(next) => unsafe { next(physical_device, surface, p_count, p_formats) },
        Err(result) => result,
    }
}

pub(super) unsafe extern "system" fn get_surface_present_modes(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_count: *mut u32,
    p_modes: *mut vk::PresentModeKHR,
) -> vk::Result {
    if context().surface_ownership(surface) == Ownership::Live {
        return unsafe { write_enumeration(&PRESENT_MODES, p_count, p_modes) };
    }
    match foreign_surface_query(physical_device, surface, |dispatch| {
        dispatch.get_physical_device_surface_present_modes
    }) {
        Ok(next) => unsafe { next(physical_device, surface, p_count, p_modes) },
        Err(result) => result,
    }
}

pub(super) unsafe extern "system" fn get_surface_capabilities2(
    physical_device: vk::PhysicalDevice,
    p_surface_info: *const vk::PhysicalDeviceSurfaceInfo2KHR<'_>,
    p_capabilities: *mut vk::SurfaceCapabilities2KHR<'_>,
) -> vk::Result {
    let Some(surface_info) = (unsafe { p_surface_info.as_ref() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if let Some(capabilities) = context().surface_capabilities(surface_info.surface) {
        return match unsafe { p_capabilities.as_mut() } {
            Some(out) => {
                out.surface_capabilities = capabilities;
                vk::Result::SUCCESS
            }
            None => vk::Result::ERROR_INITIALIZATION_FAILED,
        };
    }
    match foreign_surface_query(physical_device, surface_info.surface, |dispatch| {
        dispatch.get_physical_device_surface_capabilities2
    }) {
        Ok(next) => unsafe { next(physical_device, p_surface_info, p_capabilities) },
        Err(result) => result,
    }
}

pub(super) unsafe extern "system" fn get_surface_formats2(
    physical_device: vk::PhysicalDevice,
    p_surface_info: *const vk::PhysicalDeviceSurfaceInfo2KHR<'_>,
    p_count: *mut u32,
    p_formats: *mut vk::SurfaceFormat2KHR<'_>,
) -> vk::Result {
    let Some(surface_info) = (unsafe { p_surface_info.as_ref() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if context().surface_ownership(surface_info.surface) == Ownership::Live {
        let Some(count) = (unsafe { p_count.as_mut() }) else {
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };
        if p_formats.is_null() {
            *count = 1;
            return vk::Result::SUCCESS;
        }
        if *count == 0 {
            return vk::Result::INCOMPLETE;
        }
        // Only the payload is written; the application owns sType and pNext.
        unsafe { (*p_formats).surface_format = SURFACE_FORMAT };
        *count = 1;
        return vk::Result::SUCCESS;
    }
    match foreign_surface_query(physical_device, surface_info.surface, |dispatch| {
        dispatch.get_physical_device_surface_formats2
    }) {
        Ok(next) => unsafe { next(physical_device, p_surface_info, p_count, p_formats) },
        Err(result) => result,
    }
}

/// Finds the driver's implementation of a surface query for a surface the
/// layer does not own.
fn foreign_surface_query<F>(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    select: impl FnOnce(&InstanceDispatch) -> Option<F>,
) -> Result<F, vk::Result> {
    if context().surface_ownership(surface) == Ownership::Retired {
        return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
    }
    instance_for(physical_device)
        .and_then(|dispatch| select(&dispatch))
        .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
}
