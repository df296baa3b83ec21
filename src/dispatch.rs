//! Per-instance and per-device tables of next-layer entry points.
//!
//! Every pointer here is resolved through the *next* layer's proc-addr
//! functions at creation time and called directly afterwards. Nothing in this
//! module ever resolves through the layer's own `vkGetInstanceProcAddr`, which
//! is what keeps enumerate-and-post-process calls from recursing into
//! themselves.

use std::collections::HashMap;
use std::ffi::{CStr, c_void};
use std::ptr::{self, NonNull};

use ash::vk;
use ash::vk::Handle;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::adapter::{DriverFeatures, query_driver_features};
use crate::chain::{PfnGetPhysicalDeviceProcAddr, PfnSetDeviceLoaderData};
use crate::driver::{DeviceDriver, ImageDesc, ReadbackCopy, Submission};
use crate::error::{LayerError, LayerResult, check};

/// Resolves `$name` through a next-layer proc-addr function into the
/// function-pointer type inferred from the assignment target.
macro_rules! resolve {
    ($gpa:expr, $handle:expr, $name:literal) => {{
        let raw = unsafe { ($gpa)($handle, $name.as_ptr()) };
        raw.map(|f| unsafe { std::mem::transmute::<unsafe extern "system" fn(), _>(f) })
    }};
}

/// Unwraps an optional entry point or reports it as missing.
macro_rules! entry {
    ($self:ident . $field:ident, $name:literal) => {
        $self.$field.ok_or(LayerError::MissingEntryPoint { name: $name })?
    };
}

/// Fixed-capacity map from dispatch key to a table.
///
/// Insertion order is kept so the most recently created live entry can answer
/// lookups that carry no usable handle.
pub struct DispatchRegistry<T> {
    entries: Vec<(usize, T)>,
    capacity: usize,
}

/// Slots per registry; a process rarely holds more than a probe and a real
/// device at once.
pub const REGISTRY_CAPACITY: usize = 8;

impl<T> Default for DispatchRegistry<T> {
    fn default() -> Self {
        Self::with_capacity(REGISTRY_CAPACITY)
    }
}

impl<T> DispatchRegistry<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Registers `value` under `key`, replacing and returning a stale entry
    /// with the same key.
    pub fn insert(&mut self, key: usize, value: T) -> LayerResult<Option<T>> {
        let stale = self.remove(key);
        if self.entries.len() >= self.capacity {
            return Err(LayerError::RegistryFull {
                capacity: self.capacity,
            });
        }
        self.entries.push((key, value));
        Ok(stale)
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Looks up `key`, falling back to the most recently inserted entry.
    pub fn get_or_active(&self, key: usize) -> Option<&T> {
        self.get(key).or_else(|| self.active())
    }

    /// The most recently inserted entry that is still live.
    pub fn active(&self) -> Option<&T> {
        self.entries.last().map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: usize) -> Option<T> {
        let index = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Instance level
// ---------------------------------------------------------------------------

/// Next-layer entry points recorded for one instance.
pub struct InstanceDispatch {
    pub instance: vk::Instance,
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
    pub destroy_instance: Option<vk::PFN_vkDestroyInstance>,
    pub enumerate_device_extension_properties: Option<vk::PFN_vkEnumerateDeviceExtensionProperties>,
    pub get_physical_device_features: Option<vk::PFN_vkGetPhysicalDeviceFeatures>,
    pub get_physical_device_features2: Option<vk::PFN_vkGetPhysicalDeviceFeatures2>,
    pub get_physical_device_format_properties: Option<vk::PFN_vkGetPhysicalDeviceFormatProperties>,
    pub get_physical_device_format_properties2: Option<vk::PFN_vkGetPhysicalDeviceFormatProperties2>,
    pub get_physical_device_memory_properties: Option<vk::PFN_vkGetPhysicalDeviceMemoryProperties>,
    pub destroy_surface: Option<vk::PFN_vkDestroySurfaceKHR>,
    pub get_physical_device_surface_support: Option<vk::PFN_vkGetPhysicalDeviceSurfaceSupportKHR>,
    pub get_physical_device_surface_capabilities:
        Option<vk::PFN_vkGetPhysicalDeviceSurfaceCapabilitiesKHR>,
    pub get_physical_device_surface_formats: Option<vk::PFN_vkGetPhysicalDeviceSurfaceFormatsKHR>,
    pub get_physical_device_surface_present_modes:
        Option<vk::PFN_vkGetPhysicalDeviceSurfacePresentModesKHR>,
    pub get_physical_device_surface_capabilities2:
        Option<vk::PFN_vkGetPhysicalDeviceSurfaceCapabilities2KHR>,
    pub get_physical_device_surface_formats2: Option<vk::PFN_vkGetPhysicalDeviceSurfaceFormats2KHR>,
    /// Memory properties per physical device, queried once.
    memory_properties: Mutex<HashMap<u64, vk::PhysicalDeviceMemoryProperties>>,
}

impl InstanceDispatch {
    /// Resolves the instance table from the next layer.
    ///
    /// # Safety
    ///
    /// `instance` must be the handle the next layer just created and `gipa` the
    /// next layer's `vkGetInstanceProcAddr`.
    pub unsafe fn load(
        instance: vk::Instance,
        gipa: vk::PFN_vkGetInstanceProcAddr,
        gpdpa: Option<PfnGetPhysicalDeviceProcAddr>,
    ) -> Self {
        Self {
            instance,
            get_instance_proc_addr: gipa,
            get_physical_device_proc_addr: gpdpa,
            destroy_instance: resolve!(gipa, instance, c"vkDestroyInstance"),
            enumerate_device_extension_properties: resolve!(
                gipa,
                instance,
                c"vkEnumerateDeviceExtensionProperties"
            ),
            get_physical_device_features: resolve!(gipa, instance, c"vkGetPhysicalDeviceFeatures"),
            get_physical_device_features2: resolve!(gipa, instance, c"vkGetPhysicalDeviceFeatures2")
                .or_else(|| resolve!(gipa, instance, c"vkGetPhysicalDeviceFeatures2KHR")),
            get_physical_device_format_properties: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceFormatProperties"
            ),
            get_physical_device_format_properties2: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceFormatProperties2"
            )
            .or_else(|| resolve!(gipa, instance, c"vkGetPhysicalDeviceFormatProperties2KHR")),
            get_physical_device_memory_properties: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceMemoryProperties"
            ),
            destroy_surface: resolve!(gipa, instance, c"vkDestroySurfaceKHR"),
            get_physical_device_surface_support: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceSurfaceSupportKHR"
            ),
            get_physical_device_surface_capabilities: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceSurfaceCapabilitiesKHR"
            ),
            get_physical_device_surface_formats: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceSurfaceFormatsKHR"
            ),
            get_physical_device_surface_present_modes: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceSurfacePresentModesKHR"
            ),
            get_physical_device_surface_capabilities2: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceSurfaceCapabilities2KHR"
            ),
            get_physical_device_surface_formats2: resolve!(
                gipa,
                instance,
                c"vkGetPhysicalDeviceSurfaceFormats2KHR"
            ),
            memory_properties: Mutex::new(HashMap::new()),
        }
    }

    /// Forwards a lookup for a function this layer does not implement.
    pub fn forward(&self, name: &CStr) -> vk::PFN_vkVoidFunction {
        unsafe { (self.get_instance_proc_addr)(self.instance, name.as_ptr()) }
    }

    /// Queries the driver's real device extension list.
    pub fn device_extensions(&self, physical_device: vk::PhysicalDevice) -> LayerResult<Vec<vk::ExtensionProperties>> {
        let enumerate = entry!(self.enumerate_device_extension_properties, "vkEnumerateDeviceExtensionProperties");
        let call = "vkEnumerateDeviceExtensionProperties";
        loop {
            let mut count = 0u32;
            check(call, unsafe { enumerate(physical_device, ptr::null(), &mut count, ptr::null_mut()) })?;
            let mut properties = vec![vk::ExtensionProperties::default(); count as usize];
            let result =
                unsafe { enumerate(physical_device, ptr::null(), &mut count, properties.as_mut_ptr()) };
            match result {
                vk::Result::SUCCESS => {
                    properties.truncate(count as usize);
                    return Ok(properties);
                }
                // The list grew between the two calls.
                vk::Result::INCOMPLETE => continue,
                other => return Err(LayerError::vulkan(call, other)),
            }
        }
    }

    /// Queries the driver's feature bits without any spoofing applied: core
    /// features, plus the spoofed structures of every extension in
    /// `driver_extensions`.
    pub fn real_features(
        &self,
        physical_device: vk::PhysicalDevice,
        driver_extensions: &[vk::ExtensionProperties],
    ) -> Option<DriverFeatures> {
        let get = self.get_physical_device_features?;
        let mut core = vk::PhysicalDeviceFeatures::default();
        unsafe { get(physical_device, &mut core) };
        let get2 = self.get_physical_device_features2;
        Some(query_driver_features(core, driver_extensions, |chain| match get2 {
            Some(get2) => {
                unsafe { get2(physical_device, chain) };
                true
            }
            None => false,
        }))
    }

    /// Memory heaps and types of `physical_device`, cached for the lifetime of
    /// the instance.
    pub fn memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> LayerResult<vk::PhysicalDeviceMemoryProperties> {
        let mut cache = self.memory_properties.lock();
        if let Some(properties) = cache.get(&physical_device.as_raw()) {
            return Ok(*properties);
        }
        let get = entry!(self.get_physical_device_memory_properties, "vkGetPhysicalDeviceMemoryProperties");
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        unsafe { get(physical_device, &mut properties) };
        debug!(
            "physical device {:#x}: {} memory types, {} heaps",
            physical_device.as_raw(),
            properties.memory_type_count,
            properties.memory_heap_count
        );
        cache.insert(physical_device.as_raw(), properties);
        Ok(properties)
    }
}

// ---------------------------------------------------------------------------
// Device level
// ---------------------------------------------------------------------------

/// Next-layer entry points and per-device facts recorded for one device.
pub struct DeviceDispatch {
    pub device: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    /// Dispatch key of the owning instance.
    pub instance_key: usize,
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub instance: vk::Instance,
    set_device_loader_data: Option<PfnSetDeviceLoaderData>,
    /// Queue used for acquire signalling and readback copies.
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub destroy_device: Option<vk::PFN_vkDestroyDevice>,
    get_device_queue: Option<vk::PFN_vkGetDeviceQueue>,
    create_image: Option<vk::PFN_vkCreateImage>,
    destroy_image: Option<vk::PFN_vkDestroyImage>,
    get_image_memory_requirements: Option<vk::PFN_vkGetImageMemoryRequirements>,
    bind_image_memory: Option<vk::PFN_vkBindImageMemory>,
    create_buffer: Option<vk::PFN_vkCreateBuffer>,
    destroy_buffer: Option<vk::PFN_vkDestroyBuffer>,
    get_buffer_memory_requirements: Option<vk::PFN_vkGetBufferMemoryRequirements>,
    bind_buffer_memory: Option<vk::PFN_vkBindBufferMemory>,
    allocate_memory: Option<vk::PFN_vkAllocateMemory>,
    free_memory: Option<vk::PFN_vkFreeMemory>,
    map_memory: Option<vk::PFN_vkMapMemory>,
    unmap_memory: Option<vk::PFN_vkUnmapMemory>,
    invalidate_mapped_memory_ranges: Option<vk::PFN_vkInvalidateMappedMemoryRanges>,
    create_command_pool: Option<vk::PFN_vkCreateCommandPool>,
    destroy_command_pool: Option<vk::PFN_vkDestroyCommandPool>,
    allocate_command_buffers: Option<vk::PFN_vkAllocateCommandBuffers>,
    reset_command_buffer: Option<vk::PFN_vkResetCommandBuffer>,
    begin_command_buffer: Option<vk::PFN_vkBeginCommandBuffer>,
    end_command_buffer: Option<vk::PFN_vkEndCommandBuffer>,
    cmd_pipeline_barrier: Option<vk::PFN_vkCmdPipelineBarrier>,
    cmd_copy_image_to_buffer: Option<vk::PFN_vkCmdCopyImageToBuffer>,
    create_fence: Option<vk::PFN_vkCreateFence>,
    destroy_fence: Option<vk::PFN_vkDestroyFence>,
    wait_for_fences: Option<vk::PFN_vkWaitForFences>,
    reset_fences: Option<vk::PFN_vkResetFences>,
    queue_submit: Option<vk::PFN_vkQueueSubmit>,
    queue_wait_idle: Option<vk::PFN_vkQueueWaitIdle>,
    device_wait_idle: Option<vk::PFN_vkDeviceWaitIdle>,

    pub create_swapchain: Option<vk::PFN_vkCreateSwapchainKHR>,
    pub destroy_swapchain: Option<vk::PFN_vkDestroySwapchainKHR>,
    pub get_swapchain_images: Option<vk::PFN_vkGetSwapchainImagesKHR>,
    pub acquire_next_image: Option<vk::PFN_vkAcquireNextImageKHR>,
    pub acquire_next_image2: Option<vk::PFN_vkAcquireNextImage2KHR>,
    pub queue_present: Option<vk::PFN_vkQueuePresentKHR>,
}

/// Facts about a freshly created device needed to build its table.
pub struct DeviceLoad {
    pub device: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: vk::Instance,
    pub instance_key: usize,
    pub gipa: vk::PFN_vkGetInstanceProcAddr,
    pub gdpa: vk::PFN_vkGetDeviceProcAddr,
    pub set_device_loader_data: Option<PfnSetDeviceLoaderData>,
    pub queue_family_index: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceDispatch {
    /// Resolves the device table from the next layer and fetches the queue the
    /// layer submits on.
    ///
    /// # Safety
    ///
    /// `load.device` must be the handle the next layer just created and the
    /// proc-addr functions must belong to the next layer.
    pub unsafe fn load(load: DeviceLoad) -> Self {
        let DeviceLoad {
            device,
            physical_device,
            instance,
            instance_key,
            gipa,
            gdpa,
            set_device_loader_data,
            queue_family_index,
            memory_properties,
        } = load;

        // Some driver stacks only hand out device functions through the
        // instance-level lookup.
        macro_rules! device_fn {
            ($name:literal) => {
                resolve!(gdpa, device, $name).or_else(|| resolve!(gipa, instance, $name))
            };
        }

        let mut dispatch = Self {
            device,
            physical_device,
            instance_key,
            get_device_proc_addr: gdpa,
            get_instance_proc_addr: gipa,
            instance,
            set_device_loader_data,
            queue: vk::Queue::null(),
            queue_family_index,
            memory_properties,
            destroy_device: device_fn!(c"vkDestroyDevice"),
            get_device_queue: device_fn!(c"vkGetDeviceQueue"),
            create_image: device_fn!(c"vkCreateImage"),
            destroy_image: device_fn!(c"vkDestroyImage"),
            get_image_memory_requirements: device_fn!(c"vkGetImageMemoryRequirements"),
            bind_image_memory: device_fn!(c"vkBindImageMemory"),
            create_buffer: device_fn!(c"vkCreateBuffer"),
            destroy_buffer: device_fn!(c"vkDestroyBuffer"),
            get_buffer_memory_requirements: device_fn!(c"vkGetBufferMemoryRequirements"),
            bind_buffer_memory: device_fn!(c"vkBindBufferMemory"),
            allocate_memory: device_fn!(c"vkAllocateMemory"),
            free_memory: device_fn!(c"vkFreeMemory"),
            map_memory: device_fn!(c"vkMapMemory"),
            unmap_memory: device_fn!(c"vkUnmapMemory"),
            invalidate_mapped_memory_ranges: device_fn!(c"vkInvalidateMappedMemoryRanges"),
            create_command_pool: device_fn!(c"vkCreateCommandPool"),
            destroy_command_pool: device_fn!(c"vkDestroyCommandPool"),
            allocate_command_buffers: device_fn!(c"vkAllocateCommandBuffers"),
            reset_command_buffer: device_fn!(c"vkResetCommandBuffer"),
            begin_command_buffer: device_fn!(c"vkBeginCommandBuffer"),
            end_command_buffer: device_fn!(c"vkEndCommandBuffer"),
            cmd_pipeline_barrier: device_fn!(c"vkCmdPipelineBarrier"),
            cmd_copy_image_to_buffer: device_fn!(c"vkCmdCopyImageToBuffer"),
            create_fence: device_fn!(c"vkCreateFence"),
            destroy_fence: device_fn!(c"vkDestroyFence"),
            wait_for_fences: device_fn!(c"vkWaitForFences"),
            reset_fences: device_fn!(c"vkResetFences"),
            queue_submit: device_fn!(c"vkQueueSubmit"),
            queue_wait_idle: device_fn!(c"vkQueueWaitIdle"),
            device_wait_idle: device_fn!(c"vkDeviceWaitIdle"),
            create_swapchain: device_fn!(c"vkCreateSwapchainKHR"),
            destroy_swapchain: device_fn!(c"vkDestroySwapchainKHR"),
            get_swapchain_images: device_fn!(c"vkGetSwapchainImagesKHR"),
            acquire_next_image: device_fn!(c"vkAcquireNextImageKHR"),
            acquire_next_image2: device_fn!(c"vkAcquireNextImage2KHR"),
            queue_present: device_fn!(c"vkQueuePresentKHR"),
        };
        dispatch.queue = dispatch.fetch_queue();
        dispatch
    }

    fn fetch_queue(&self) -> vk::Queue {
        let Some(get_device_queue) = self.get_device_queue else {
            warn!("vkGetDeviceQueue unavailable; presents will skip readback");
            return vk::Queue::null();
        };
        let mut queue = vk::Queue::null();
        unsafe { get_device_queue(self.device, self.queue_family_index, 0, &mut queue) };
        if !queue.is_null() {
            self.adopt_dispatchable(queue.as_raw() as *mut c_void);
        }
        queue
    }

    /// Gives an object created below the layer the device's loader dispatch.
    fn adopt_dispatchable(&self, object: *mut c_void) {
        if let Some(set_loader_data) = self.set_device_loader_data {
            let result = unsafe { set_loader_data(self.device, object) };
            if result != vk::Result::SUCCESS {
                warn!("vkSetDeviceLoaderData failed: {result}");
            }
        }
    }

    /// Forwards a lookup for a function this layer does not implement.
    pub fn forward(&self, name: &CStr) -> vk::PFN_vkVoidFunction {
        unsafe { (self.get_device_proc_addr)(self.device, name.as_ptr()) }
            .or_else(|| unsafe { (self.get_instance_proc_addr)(self.instance, name.as_ptr()) })
    }

    fn wait_fence(&self, fence: vk::Fence) -> LayerResult<()> {
        let wait = entry!(self.wait_for_fences, "vkWaitForFences");
        check("vkWaitForFences", unsafe {
            wait(self.device, 1, &fence, vk::TRUE, u64::MAX)
        })
    }
}

impl DeviceDriver for DeviceDispatch {
    fn create_image(&self, desc: &ImageDesc) -> LayerResult<vk::Image> {
        let create = entry!(self.create_image, "vkCreateImage");
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.array_layers.max(1))
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let mut image = vk::Image::null();
        check("vkCreateImage", unsafe {
            create(self.device, &info, ptr::null(), &mut image)
        })?;
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        match self.destroy_image {
            Some(destroy) => unsafe { destroy(self.device, image, ptr::null()) },
            None => debug!("vkDestroyImage unavailable; leaking {:#x}", image.as_raw()),
        }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> LayerResult<vk::MemoryRequirements> {
        let get = entry!(self.get_image_memory_requirements, "vkGetImageMemoryRequirements");
        let mut requirements = vk::MemoryRequirements::default();
        unsafe { get(self.device, image, &mut requirements) };
        Ok(requirements)
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> LayerResult<()> {
        let bind = entry!(self.bind_image_memory, "vkBindImageMemory");
        check("vkBindImageMemory", unsafe { bind(self.device, image, memory, 0) })
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> LayerResult<vk::Buffer> {
        let create = entry!(self.create_buffer, "vkCreateBuffer");
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut buffer = vk::Buffer::null();
        check("vkCreateBuffer", unsafe {
            create(self.device, &info, ptr::null(), &mut buffer)
        })?;
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        match self.destroy_buffer {
            Some(destroy) => unsafe { destroy(self.device, buffer, ptr::null()) },
            None => debug!("vkDestroyBuffer unavailable; leaking {:#x}", buffer.as_raw()),
        }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> LayerResult<vk::MemoryRequirements> {
        let get = entry!(self.get_buffer_memory_requirements, "vkGetBufferMemoryRequirements");
        let mut requirements = vk::MemoryRequirements::default();
        unsafe { get(self.device, buffer, &mut requirements) };
        Ok(requirements)
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> LayerResult<()> {
        let bind = entry!(self.bind_buffer_memory, "vkBindBufferMemory");
        check("vkBindBufferMemory", unsafe { bind(self.device, buffer, memory, 0) })
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> LayerResult<vk::DeviceMemory> {
        let allocate = entry!(self.allocate_memory, "vkAllocateMemory");
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let mut memory = vk::DeviceMemory::null();
        check("vkAllocateMemory", unsafe {
            allocate(self.device, &info, ptr::null(), &mut memory)
        })?;
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        match self.free_memory {
            Some(free) => unsafe { free(self.device, memory, ptr::null()) },
            None => debug!("vkFreeMemory unavailable; leaking {:#x}", memory.as_raw()),
        }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> LayerResult<NonNull<u8>> {
        let map = entry!(self.map_memory, "vkMapMemory");
        let mut data: *mut c_void = ptr::null_mut();
        check("vkMapMemory", unsafe {
            map(self.device, memory, 0, size, vk::MemoryMapFlags::empty(), &mut data)
        })?;
        NonNull::new(data.cast::<u8>()).ok_or(LayerError::vulkan("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(unmap) = self.unmap_memory {
            unsafe { unmap(self.device, memory) };
        }
    }

    fn invalidate_memory(&self, memory: vk::DeviceMemory) -> LayerResult<()> {
        let invalidate = entry!(self.invalidate_mapped_memory_ranges, "vkInvalidateMappedMemoryRanges");
        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        check("vkInvalidateMappedMemoryRanges", unsafe {
            invalidate(self.device, 1, &range)
        })
    }

    fn create_command_pool(&self, queue_family_index: u32) -> LayerResult<vk::CommandPool> {
        let create = entry!(self.create_command_pool, "vkCreateCommandPool");
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let mut pool = vk::CommandPool::null();
        check("vkCreateCommandPool", unsafe {
            create(self.device, &info, ptr::null(), &mut pool)
        })?;
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if let Some(destroy) = self.destroy_command_pool {
            unsafe { destroy(self.device, pool, ptr::null()) };
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> LayerResult<vk::CommandBuffer> {
        let allocate = entry!(self.allocate_command_buffers, "vkAllocateCommandBuffers");
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let mut command_buffer = vk::CommandBuffer::null();
        check("vkAllocateCommandBuffers", unsafe {
            allocate(self.device, &info, &mut command_buffer)
        })?;
        self.adopt_dispatchable(command_buffer.as_raw() as *mut c_void);
        Ok(command_buffer)
    }

    fn record_readback(&self, command_buffer: vk::CommandBuffer, copy: &ReadbackCopy) -> LayerResult<()> {
        let reset = entry!(self.reset_command_buffer, "vkResetCommandBuffer");
        let begin = entry!(self.begin_command_buffer, "vkBeginCommandBuffer");
        let end = entry!(self.end_command_buffer, "vkEndCommandBuffer");
        let barrier = entry!(self.cmd_pipeline_barrier, "vkCmdPipelineBarrier");
        let copy_to_buffer = entry!(self.cmd_copy_image_to_buffer, "vkCmdCopyImageToBuffer");

        let color = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let to_transfer = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .old_layout(copy.present_layout)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(copy.image)
            .subresource_range(color);
        let to_present = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(copy.present_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(copy.image)
            .subresource_range(color);
        let to_host = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(copy.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: copy.extent.width,
                height: copy.extent.height,
                depth: 1,
            },
        };
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            check(
                "vkResetCommandBuffer",
                reset(command_buffer, vk::CommandBufferResetFlags::empty()),
            )?;
            check("vkBeginCommandBuffer", begin(command_buffer, &begin_info))?;
            barrier(
                command_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                1,
                &to_transfer,
            );
            copy_to_buffer(
                command_buffer,
                copy.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                copy.buffer,
                1,
                &region,
            );
            barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                0,
                ptr::null(),
                1,
                &to_host,
                1,
                &to_present,
            );
            check("vkEndCommandBuffer", end(command_buffer))
        }
    }

    fn create_fence(&self) -> LayerResult<vk::Fence> {
        let create = entry!(self.create_fence, "vkCreateFence");
        let info = vk::FenceCreateInfo::default();
        let mut fence = vk::Fence::null();
        check("vkCreateFence", unsafe {
            create(self.device, &info, ptr::null(), &mut fence)
        })?;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if let Some(destroy) = self.destroy_fence {
            unsafe { destroy(self.device, fence, ptr::null()) };
        }
    }

    fn wait_and_reset_fence(&self, fence: vk::Fence) -> LayerResult<()> {
        self.wait_fence(fence)?;
        let reset = entry!(self.reset_fences, "vkResetFences");
        check("vkResetFences", unsafe { reset(self.device, 1, &fence) })
    }

    fn submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> LayerResult<()> {
        let submit = entry!(self.queue_submit, "vkQueueSubmit");
        let stages = vec![vk::PipelineStageFlags::TRANSFER; submission.wait_semaphores.len()];
        let info = vk::SubmitInfo::default()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(&stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores);
        check("vkQueueSubmit", unsafe { submit(queue, 1, &info, fence) })
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> LayerResult<()> {
        let wait = entry!(self.queue_wait_idle, "vkQueueWaitIdle");
        check("vkQueueWaitIdle", unsafe { wait(queue) })
    }

    fn device_wait_idle(&self) -> LayerResult<()> {
        let wait = entry!(self.device_wait_idle, "vkDeviceWaitIdle");
        check("vkDeviceWaitIdle", unsafe { wait(self.device) })
    }

    fn supports_readback(&self) -> bool {
        !self.queue.is_null()
            && self.reset_command_buffer.is_some()
            && self.begin_command_buffer.is_some()
            && self.end_command_buffer.is_some()
            && self.cmd_pipeline_barrier.is_some()
            && self.cmd_copy_image_to_buffer.is_some()
            && self.queue_submit.is_some()
            && self.wait_for_fences.is_some()
            && self.reset_fences.is_some()
            && self.map_memory.is_some()
            && self.unmap_memory.is_some()
    }
}
