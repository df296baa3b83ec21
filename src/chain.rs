//! Loader/layer chain ABI.
//!
//! These mirror the structures from `vk_layer.h` that the loader splices into
//! `VkInstanceCreateInfo::pNext` and `VkDeviceCreateInfo::pNext`. Each layer
//! reads the link addressed to it and advances the chain for the layer below.

use std::ffi::{c_char, c_void};

use ash::vk;
use ash::vk::Handle;

use crate::error::{LayerError, LayerResult};

pub const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
pub const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

/// `VkLayerFunction::VK_LAYER_LINK_INFO`
pub const LAYER_LINK_INFO: u32 = 0;
/// `VkLayerFunction::VK_LOADER_DATA_CALLBACK`
pub const LOADER_DATA_CALLBACK: u32 = 1;

/// `VkNegotiateLayerStructType::LAYER_NEGOTIATE_INTERFACE_STRUCT`
pub const LAYER_NEGOTIATE_INTERFACE_STRUCT: u32 = 1;
/// Highest loader/layer interface version this layer speaks.
pub const LAYER_INTERFACE_VERSION: u32 = 2;

pub type PfnGetPhysicalDeviceProcAddr =
    unsafe extern "system" fn(vk::Instance, *const c_char) -> vk::PFN_vkVoidFunction;
pub type PfnSetDeviceLoaderData = unsafe extern "system" fn(vk::Device, *mut c_void) -> vk::Result;

#[repr(C)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

#[repr(C)]
pub union LayerInstanceInfo {
    pub layer_info: *mut LayerInstanceLink,
    pub set_instance_loader_data: *const c_void,
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: u32,
    pub u: LayerInstanceInfo,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub union LayerDeviceInfo {
    pub layer_info: *mut LayerDeviceLink,
    pub set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: u32,
    pub u: LayerDeviceInfo,
}

#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: u32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

/// Next-layer entry points taken from an instance link.
#[derive(Clone, Copy)]
pub struct InstanceLink {
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

/// Next-layer entry points taken from a device link.
#[derive(Clone, Copy)]
pub struct DeviceLink {
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

/// Reads the first word of a dispatchable handle: the loader's dispatch
/// pointer, shared by an instance and its physical devices, and by a device and
/// its queues and command buffers.
///
/// # Safety
///
/// `handle` must be null or a live dispatchable Vulkan handle.
pub unsafe fn dispatch_key<H: Handle>(handle: H) -> usize {
    let raw = handle.as_raw() as usize;
    if raw == 0 {
        return 0;
    }
    unsafe { *(raw as *const usize) }
}

/// Walks `p_next` looking for a loader structure of `s_type` with `function`.
unsafe fn find_loader_info<T>(
    mut p_next: *const c_void,
    s_type: vk::StructureType,
    function: u32,
) -> Option<*mut T> {
    while !p_next.is_null() {
        let base = p_next.cast::<vk::BaseInStructure>();
        let header = unsafe { &*base };
        if header.s_type == s_type {
            // `function` follows `s_type` and `p_next` in both loader structures.
            let candidate = p_next.cast::<LayerInstanceCreateInfo>();
            if unsafe { (*candidate).function } == function {
                return Some(p_next.cast_mut().cast::<T>());
            }
        }
        p_next = header.p_next.cast();
    }
    None
}

/// Takes this layer's link out of an instance create-info chain and advances
/// the chain so the next layer finds its own link.
///
/// # Safety
///
/// `create_info` must point at a valid `VkInstanceCreateInfo` whose chain was
/// built by the loader.
pub unsafe fn take_instance_link(
    create_info: *const vk::InstanceCreateInfo<'_>,
) -> LayerResult<InstanceLink> {
    let missing = LayerError::MissingChainLink {
        call: "vkCreateInstance",
    };
    if create_info.is_null() {
        return Err(missing);
    }
    let info = unsafe {
        find_loader_info::<LayerInstanceCreateInfo>(
            (*create_info).p_next,
            LOADER_INSTANCE_CREATE_INFO,
            LAYER_LINK_INFO,
        )
    }
    .ok_or(missing.clone())?;

    unsafe {
        let link = (*info).u.layer_info;
        if link.is_null() {
            return Err(missing);
        }
        let taken = InstanceLink {
            get_instance_proc_addr: (*link).pfn_next_get_instance_proc_addr,
            get_physical_device_proc_addr: (*link).pfn_next_get_physical_device_proc_addr,
        };
        (*info).u.layer_info = (*link).p_next;
        Ok(taken)
    }
}

/// Device counterpart of [`take_instance_link`].
///
/// # Safety
///
/// `create_info` must point at a valid `VkDeviceCreateInfo` whose chain was
/// built by the loader.
pub unsafe fn take_device_link(
    create_info: *const vk::DeviceCreateInfo<'_>,
) -> LayerResult<DeviceLink> {
    let missing = LayerError::MissingChainLink {
        call: "vkCreateDevice",
    };
    if create_info.is_null() {
        return Err(missing);
    }
    let info = unsafe {
        find_loader_info::<LayerDeviceCreateInfo>(
            (*create_info).p_next,
            LOADER_DEVICE_CREATE_INFO,
            LAYER_LINK_INFO,
        )
    }
    .ok_or(missing.clone())?;

    unsafe {
        let link = (*info).u.layer_info;
        if link.is_null() {
            return Err(missing);
        }
        let taken = DeviceLink {
            get_instance_proc_addr: (*link).pfn_next_get_instance_proc_addr,
            get_device_proc_addr: (*link).pfn_next_get_device_proc_addr,
        };
        (*info).u.layer_info = (*link).p_next;
        Ok(taken)
    }
}

/// Finds the loader's `vkSetDeviceLoaderData` callback, if the loader sent one.
///
/// # Safety
///
/// Same requirements as [`take_device_link`].
pub unsafe fn device_loader_data_callback(
    create_info: *const vk::DeviceCreateInfo<'_>,
) -> Option<PfnSetDeviceLoaderData> {
    if create_info.is_null() {
        return None;
    }
    unsafe {
        let info = find_loader_info::<LayerDeviceCreateInfo>(
            (*create_info).p_next,
            LOADER_DEVICE_CREATE_INFO,
            LOADER_DATA_CALLBACK,
        )?;
        (*info).u.set_device_loader_data
    }
}
