//! Virtual presentation targets.
//!
//! A virtual surface is nothing but a size. The registry hands out handles from
//! its own allocator and decides ownership by membership, never by inspecting
//! bit patterns, so a handle the driver issued is always forwarded.

use std::collections::{HashMap, HashSet, VecDeque};

use ash::vk;
use ash::vk::Handle;
use log::{debug, info};

/// Largest extent advertised for a virtual surface.
pub const MAX_EXTENT: u32 = 16384;
/// Image-count bounds advertised for a virtual surface.
pub const MIN_IMAGE_COUNT: u32 = 2;
pub const MAX_IMAGE_COUNT: u32 = 8;

/// The one format every virtual surface supports.
pub const SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Presentation modes every virtual surface supports.
pub const PRESENT_MODES: [vk::PresentModeKHR; 2] =
    [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];

/// Usage flags swapchain images on a virtual surface may request.
pub const SUPPORTED_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::TRANSFER_SRC.as_raw()
        | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// Allocates handle values for layer-owned non-dispatchable objects.
///
/// Values start high in the 64-bit range where drivers do not place their own
/// handles in practice; ownership is still decided by registry membership.
#[derive(Debug)]
pub struct HandleAllocator {
    next: u64,
}

impl HandleAllocator {
    pub const fn new(first: u64) -> Self {
        Self { next: first }
    }

    pub fn allocate(&mut self) -> u64 {
        let handle = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        handle
    }
}

/// Destroyed handles a registry still recognises.
pub const RETIRED_HANDLE_LIMIT: usize = 1024;

/// Handles of destroyed objects, so late calls on them are answered by the
/// layer instead of reaching the driver. Holds at most
/// [`RETIRED_HANDLE_LIMIT`] entries and forgets the oldest first.
#[derive(Debug, Default)]
pub struct RetiredHandles {
    order: VecDeque<u64>,
    members: HashSet<u64>,
}

impl RetiredHandles {
    pub fn insert(&mut self, raw: u64) {
        if !self.members.insert(raw) {
            return;
        }
        self.order.push_back(raw);
        while self.order.len() > RETIRED_HANDLE_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, raw: u64) -> bool {
        self.members.contains(&raw)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Where a surface or swapchain handle belongs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// A live handle owned by the layer.
    Live,
    /// A layer handle that was already destroyed.
    Retired,
    /// A handle the driver issued; forward it.
    Foreign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualSurface {
    /// Dispatch key of the instance the surface was created on.
    pub instance_key: usize,
    pub extent: vk::Extent2D,
}

/// Every virtual surface in the process.
#[derive(Debug)]
pub struct SurfaceRegistry {
    allocator: HandleAllocator,
    surfaces: HashMap<u64, VirtualSurface>,
    retired: RetiredHandles,
}

const SURFACE_HANDLE_BASE: u64 = 0x5e5f_0000_0000_0001;

impl Default for SurfaceRegistry {
    fn default() -> Self {
        Self {
            allocator: HandleAllocator::new(SURFACE_HANDLE_BASE),
            surfaces: HashMap::new(),
            retired: RetiredHandles::default(),
        }
    }
}

impl SurfaceRegistry {
    /// Creates a surface of `extent` owned by the instance with `instance_key`.
    pub fn create(&mut self, instance_key: usize, extent: vk::Extent2D) -> vk::SurfaceKHR {
        let raw = self.allocator.allocate();
        self.surfaces.insert(raw, VirtualSurface { instance_key, extent });
        info!(
            "created virtual surface {raw:#x} ({}x{})",
            extent.width, extent.height
        );
        vk::SurfaceKHR::from_raw(raw)
    }

    /// Removes a surface. Returns `false` when the handle is not a live
    /// virtual surface.
    pub fn destroy(&mut self, surface: vk::SurfaceKHR) -> bool {
        let raw = surface.as_raw();
        if self.surfaces.remove(&raw).is_some() {
            self.retired.insert(raw);
            debug!("destroyed virtual surface {raw:#x}");
            true
        } else {
            false
        }
    }

    /// Drops every surface created on an instance that is going away.
    pub fn destroy_for_instance(&mut self, instance_key: usize) -> usize {
        let doomed: Vec<u64> = self
            .surfaces
            .iter()
            .filter(|(_, surface)| surface.instance_key == instance_key)
            .map(|(raw, _)| *raw)
            .collect();
        for raw in &doomed {
            self.surfaces.remove(raw);
            self.retired.insert(*raw);
        }
        doomed.len()
    }

    pub fn ownership(&self, surface: vk::SurfaceKHR) -> Ownership {
        let raw = surface.as_raw();
        if self.surfaces.contains_key(&raw) {
            Ownership::Live
        } else if self.retired.contains(raw) {
            Ownership::Retired
        } else {
            Ownership::Foreign
        }
    }

    pub fn is_known(&self, surface: vk::SurfaceKHR) -> bool {
        self.ownership(surface) == Ownership::Live
    }

    pub fn get(&self, surface: vk::SurfaceKHR) -> Option<VirtualSurface> {
        self.surfaces.get(&surface.as_raw()).copied()
    }

    /// Resizes a surface, typically to the extent of a new swapchain.
    pub fn set_extent(&mut self, surface: vk::SurfaceKHR, extent: vk::Extent2D) -> bool {
        match self.surfaces.get_mut(&surface.as_raw()) {
            Some(entry) => {
                entry.extent = extent;
                true
            }
            None => false,
        }
    }

    /// Synthetic capabilities of a live surface.
    pub fn capabilities(&self, surface: vk::SurfaceKHR) -> Option<vk::SurfaceCapabilitiesKHR> {
        self.get(surface).map(|entry| surface_capabilities(entry.extent))
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    /// Destroyed surfaces still reported as [`Ownership::Retired`].
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

/// Capabilities reported for a virtual surface of `extent`.
pub fn surface_capabilities(extent: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: MIN_IMAGE_COUNT,
        max_image_count: MAX_IMAGE_COUNT,
        current_extent: extent,
        min_image_extent: vk::Extent2D {
            width: 1,
            height: 1,
        },
        max_image_extent: vk::Extent2D {
            width: MAX_EXTENT,
            height: MAX_EXTENT,
        },
        max_image_array_layers: 1,
        supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
        current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        supported_usage_flags: SUPPORTED_USAGE,
    }
}
