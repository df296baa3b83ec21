//! Extension and feature adaptation.
//!
//! Applications targeted by this layer probe for a fixed set of extensions and
//! feature bits before they agree to run. The adapter makes the driver's answer
//! match: it injects missing device extensions into enumeration, flips named
//! feature bits from false to true after the real query, and keeps every
//! spoofed item away from the driver when the device is actually created.
//! Genuine support is never downgraded: every query calls the driver first and
//! only ever turns `FALSE` into `TRUE`.

use std::ffi::{CStr, c_char};
use std::{mem, ptr};

use ash::vk;
use log::{debug, info};

// ---------------------------------------------------------------------------
// Extension tables
// ---------------------------------------------------------------------------

/// An extension name with the spec version the layer reports for it.
#[derive(Clone, Copy, Debug)]
pub struct ProvidedExtension {
    pub name: &'static CStr,
    pub spec_version: u32,
}

/// A feature structure whose leading `VkBool32` members get spoofed.
#[derive(Clone, Copy, Debug)]
pub struct FeatureSpoof {
    pub s_type: vk::StructureType,
    /// Number of consecutive `VkBool32` members directly after the header.
    pub bool_count: usize,
}

/// A device extension the layer advertises when the driver does not.
#[derive(Clone, Copy, Debug)]
pub struct SpoofedExtension {
    pub extension: ProvidedExtension,
    pub features: Option<FeatureSpoof>,
}

/// Instance extensions implemented entirely by the layer's surface registry.
pub const LAYER_INSTANCE_EXTENSIONS: &[ProvidedExtension] = &[
    ProvidedExtension {
        name: c"VK_KHR_surface",
        spec_version: 25,
    },
    ProvidedExtension {
        name: c"VK_KHR_xcb_surface",
        spec_version: 6,
    },
    ProvidedExtension {
        name: c"VK_KHR_xlib_surface",
        spec_version: 6,
    },
    ProvidedExtension {
        name: c"VK_EXT_headless_surface",
        spec_version: 1,
    },
];

/// Device extensions the layer itself implements.
pub const LAYER_DEVICE_EXTENSIONS: &[ProvidedExtension] = &[ProvidedExtension {
    name: c"VK_KHR_swapchain",
    spec_version: 70,
}];

const fn spoof(name: &'static CStr, spec_version: u32, features: Option<FeatureSpoof>) -> SpoofedExtension {
    SpoofedExtension {
        extension: ProvidedExtension { name, spec_version },
        features,
    }
}

const fn bools(s_type: vk::StructureType, bool_count: usize) -> Option<FeatureSpoof> {
    Some(FeatureSpoof { s_type, bool_count })
}

/// Device extensions injected into enumeration when missing.
pub const SPOOFED_DEVICE_EXTENSIONS: &[SpoofedExtension] = &[
    spoof(c"VK_KHR_swapchain", 70, None),
    spoof(
        c"VK_EXT_depth_clip_enable",
        1,
        bools(vk::StructureType::PHYSICAL_DEVICE_DEPTH_CLIP_ENABLE_FEATURES_EXT, 1),
    ),
    // customBorderColors, customBorderColorWithoutFormat
    spoof(
        c"VK_EXT_custom_border_color",
        12,
        bools(vk::StructureType::PHYSICAL_DEVICE_CUSTOM_BORDER_COLOR_FEATURES_EXT, 2),
    ),
    // transformFeedback, geometryStreams
    spoof(
        c"VK_EXT_transform_feedback",
        1,
        bools(vk::StructureType::PHYSICAL_DEVICE_TRANSFORM_FEEDBACK_FEATURES_EXT, 2),
    ),
    // robustBufferAccess2, robustImageAccess2, nullDescriptor
    spoof(
        c"VK_EXT_robustness2",
        1,
        bools(vk::StructureType::PHYSICAL_DEVICE_ROBUSTNESS_2_FEATURES_EXT, 3),
    ),
    spoof(
        c"VK_KHR_maintenance5",
        1,
        bools(vk::StructureType::from_raw(1_000_470_000), 1),
    ),
    spoof(
        c"VK_KHR_maintenance6",
        1,
        bools(vk::StructureType::from_raw(1_000_545_000), 1),
    ),
    spoof(c"VK_KHR_pipeline_library", 1, None),
    spoof(
        c"VK_EXT_non_seamless_cube_map",
        1,
        bools(vk::StructureType::PHYSICAL_DEVICE_NON_SEAMLESS_CUBE_MAP_FEATURES_EXT, 1),
    ),
    spoof(c"VK_EXT_graphics_pipeline_library", 1, None),
];

/// Builds a `VkExtensionProperties` for `name`.
pub fn extension_properties(name: &CStr, spec_version: u32) -> vk::ExtensionProperties {
    let mut properties = vk::ExtensionProperties {
        spec_version,
        ..Default::default()
    };
    let bytes = name.to_bytes();
    let len = bytes.len().min(vk::MAX_EXTENSION_NAME_SIZE - 1);
    for (dst, src) in properties.extension_name.iter_mut().zip(&bytes[..len]) {
        *dst = *src as c_char;
    }
    properties
}

/// Name stored in a `VkExtensionProperties`.
pub fn extension_name(properties: &vk::ExtensionProperties) -> &CStr {
    let raw = &properties.extension_name;
    let bytes = unsafe { std::slice::from_raw_parts(raw.as_ptr().cast::<u8>(), raw.len()) };
    CStr::from_bytes_until_nul(bytes).unwrap_or_default()
}

pub fn is_layer_instance_extension(name: &CStr) -> bool {
    LAYER_INSTANCE_EXTENSIONS.iter().any(|ext| ext.name == name)
}

fn spoofed(name: &CStr) -> Option<&'static SpoofedExtension> {
    SPOOFED_DEVICE_EXTENSIONS
        .iter()
        .find(|spoof| spoof.extension.name == name)
}

/// Splits requested instance extensions into those forwarded to the driver and
/// those the layer provides itself.
pub fn filter_instance_extensions<'a>(requested: &[&'a CStr]) -> ExtensionFilter<'a> {
    let (removed, kept): (Vec<&'a CStr>, Vec<&'a CStr>) = requested
        .iter()
        .copied()
        .partition(|name| is_layer_instance_extension(name));
    ExtensionFilter { kept, removed }
}

/// Outcome of filtering an extension list before it reaches the driver.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExtensionFilter<'a> {
    pub kept: Vec<&'a CStr>,
    pub removed: Vec<&'a CStr>,
}

// ---------------------------------------------------------------------------
// Device extension policy
// ---------------------------------------------------------------------------

/// Decides which device extensions the application sees and which ones reach
/// the driver.
#[derive(Clone, Debug, Default)]
pub struct ExtensionPolicy {
    masked: Vec<Vec<u8>>,
}

impl ExtensionPolicy {
    /// A policy that additionally hides the named extensions everywhere.
    pub fn new<I, S>(masked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            masked: masked
                .into_iter()
                .map(|name| name.as_ref().as_bytes().to_vec())
                .collect(),
        }
    }

    pub fn is_masked(&self, name: &CStr) -> bool {
        self.masked.iter().any(|masked| masked.as_slice() == name.to_bytes())
    }

    /// The extension list reported to the application: the driver's list minus
    /// masked entries, plus every spoofed extension the driver lacks.
    pub fn advertised(&self, real: &[vk::ExtensionProperties]) -> Vec<vk::ExtensionProperties> {
        let mut advertised: Vec<vk::ExtensionProperties> = real
            .iter()
            .filter(|props| !self.is_masked(extension_name(props)))
            .copied()
            .collect();
        for spoof in SPOOFED_DEVICE_EXTENSIONS {
            let name = spoof.extension.name;
            if self.is_masked(name) || real.iter().any(|props| extension_name(props) == name) {
                continue;
            }
            advertised.push(extension_properties(name, spoof.extension.spec_version));
        }
        advertised
    }

    /// Splits a device's requested extensions into those the driver will be
    /// asked for and those removed because the layer only pretends to have
    /// them (or the user masked them).
    pub fn filter_for_driver<'a>(
        &self,
        requested: &[&'a CStr],
        driver: &[vk::ExtensionProperties],
    ) -> ExtensionFilter<'a> {
        let mut filter = ExtensionFilter::default();
        for &name in requested {
            let advertised = driver.iter().any(|props| extension_name(props) == name);
            if self.is_masked(name) || (!advertised && spoofed(name).is_some()) {
                filter.removed.push(name);
            } else {
                filter.kept.push(name);
            }
        }
        filter
    }
}

// ---------------------------------------------------------------------------
// Feature and format spoofing
// ---------------------------------------------------------------------------

/// Byte offset of the first member after `sType`/`pNext`.
const FIRST_MEMBER_OFFSET: usize = mem::size_of::<vk::BaseOutStructure<'static>>();

/// Turns on core features the layer promises. Returns whether anything changed.
pub fn spoof_features(features: &mut vk::PhysicalDeviceFeatures) -> bool {
    if features.texture_compression_bc == vk::FALSE {
        features.texture_compression_bc = vk::TRUE;
        return true;
    }
    false
}

unsafe fn bool_members(node: *mut vk::BaseOutStructure<'_>) -> *mut vk::Bool32 {
    unsafe { node.cast::<u8>().add(FIRST_MEMBER_OFFSET).cast::<vk::Bool32>() }
}

/// Patches a `VkPhysicalDeviceFeatures2` and every recognised structure in its
/// chain. Unrecognised structures are left untouched. Returns the number of
/// bits that were turned on.
///
/// # Safety
///
/// `features` must point at a valid feature structure chain, as filled in by
/// the driver.
pub unsafe fn spoof_features2(features: *mut vk::PhysicalDeviceFeatures2<'_>) -> usize {
    if features.is_null() {
        return 0;
    }
    let mut flipped = usize::from(spoof_features(unsafe { &mut (*features).features }));
    let mut node = unsafe { (*features).p_next.cast::<vk::BaseOutStructure<'_>>() };
    while !node.is_null() {
        let s_type = unsafe { (*node).s_type };
        if let Some(spoof) = feature_spoof_for(s_type) {
            let members = unsafe { bool_members(node) };
            for index in 0..spoof.bool_count {
                let member = unsafe { &mut *members.add(index) };
                if *member == vk::FALSE {
                    *member = vk::TRUE;
                    flipped += 1;
                }
            }
        }
        node = unsafe { (*node).p_next };
    }
    if flipped > 0 {
        debug!("spoofed {flipped} feature bits");
    }
    flipped
}

fn feature_spoof_for(s_type: vk::StructureType) -> Option<FeatureSpoof> {
    SPOOFED_DEVICE_EXTENSIONS
        .iter()
        .filter_map(|spoof| spoof.features)
        .find(|features| features.s_type == s_type)
}

/// Room for every member of a spoofed feature structure, with headroom for
/// drivers that write newer, longer versions.
const RAW_FEATURE_MEMBERS: usize = 32;

#[repr(C)]
struct RawFeatures {
    header: vk::BaseOutStructure<'static>,
    members: [vk::Bool32; RAW_FEATURE_MEMBERS],
}

/// Feature bits as the driver reports them, before any spoofing.
#[derive(Clone, Debug, Default)]
pub struct DriverFeatures {
    pub core: vk::PhysicalDeviceFeatures,
    /// Real values of the spoofed members, for every spoofed structure whose
    /// extension the driver advertises.
    pub extended: Vec<(vk::StructureType, Vec<vk::Bool32>)>,
}

impl DriverFeatures {
    /// Only core features are known; chained structures are left alone.
    pub fn from_core(core: vk::PhysicalDeviceFeatures) -> Self {
        Self {
            core,
            extended: Vec::new(),
        }
    }

    /// The driver's value for member `index` of `s_type`, if it was queried.
    pub fn member(&self, s_type: vk::StructureType, index: usize) -> Option<vk::Bool32> {
        self.extended
            .iter()
            .find(|(queried, _)| *queried == s_type)
            .and_then(|(_, members)| members.get(index).copied())
    }
}

/// Asks the driver for the real values of every spoofed feature structure of
/// an extension in `driver_extensions`.
///
/// `query` receives a `VkPhysicalDeviceFeatures2` with those structures
/// chained, calls the driver's `vkGetPhysicalDeviceFeatures2` and returns
/// whether it could. A structure the driver leaves untouched reads as
/// unsupported.
pub fn query_driver_features(
    core: vk::PhysicalDeviceFeatures,
    driver_extensions: &[vk::ExtensionProperties],
    query: impl FnOnce(&mut vk::PhysicalDeviceFeatures2<'_>) -> bool,
) -> DriverFeatures {
    let spoofs: Vec<FeatureSpoof> = SPOOFED_DEVICE_EXTENSIONS
        .iter()
        .filter(|spoof| {
            driver_extensions
                .iter()
                .any(|props| extension_name(props) == spoof.extension.name)
        })
        .filter_map(|spoof| spoof.features)
        .collect();
    if spoofs.is_empty() {
        return DriverFeatures::from_core(core);
    }

    let mut nodes: Vec<RawFeatures> = spoofs
        .iter()
        .map(|spoof| RawFeatures {
            header: vk::BaseOutStructure {
                s_type: spoof.s_type,
                ..Default::default()
            },
            members: [vk::FALSE; RAW_FEATURE_MEMBERS],
        })
        .collect();
    let mut next: *mut vk::BaseOutStructure<'static> = ptr::null_mut();
    for node in nodes.iter_mut().rev() {
        node.header.p_next = next;
        next = ptr::from_mut(node).cast();
    }
    let mut features2 = vk::PhysicalDeviceFeatures2 {
        p_next: next.cast(),
        ..Default::default()
    };
    if !query(&mut features2) {
        debug!("vkGetPhysicalDeviceFeatures2 unavailable; chained features stay as requested");
        return DriverFeatures::from_core(core);
    }

    let extended = spoofs
        .iter()
        .zip(&nodes)
        .map(|(spoof, node)| (spoof.s_type, node.members[..spoof.bool_count].to_vec()))
        .collect();
    DriverFeatures { core, extended }
}

/// True for the BC1 through BC7 block-compressed formats.
pub fn is_bc_format(format: vk::Format) -> bool {
    (vk::Format::BC1_RGB_UNORM_BLOCK.as_raw()..=vk::Format::BC7_SRGB_BLOCK.as_raw())
        .contains(&format.as_raw())
}

/// Features reported for BC formats the driver leaves empty.
pub const SPOOFED_BC_FEATURES: vk::FormatFeatureFlags = vk::FormatFeatureFlags::from_raw(
    vk::FormatFeatureFlags::SAMPLED_IMAGE.as_raw()
        | vk::FormatFeatureFlags::BLIT_SRC.as_raw()
        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR.as_raw()
        | vk::FormatFeatureFlags::TRANSFER_SRC.as_raw()
        | vk::FormatFeatureFlags::TRANSFER_DST.as_raw(),
);

/// Fills in optimal-tiling features for BC formats the driver reports as
/// unsupported. Returns whether anything changed.
pub fn spoof_format_properties(format: vk::Format, properties: &mut vk::FormatProperties) -> bool {
    if is_bc_format(format) && properties.optimal_tiling_features.is_empty() {
        properties.optimal_tiling_features = SPOOFED_BC_FEATURES;
        return true;
    }
    false
}

// ---------------------------------------------------------------------------
// Device creation
// ---------------------------------------------------------------------------

enum Undo {
    Relink {
        prev: *mut vk::BaseOutStructure<'static>,
        node: *mut vk::BaseOutStructure<'static>,
    },
    Restore {
        member: *mut vk::Bool32,
        value: vk::Bool32,
    },
}

/// Temporary edits to an application's device create-info chain.
///
/// Dropping the patch restores every structure it touched, so the
/// application's own structures come back exactly as it built them.
#[must_use = "dropping the patch immediately restores the chain"]
pub struct ChainPatch {
    undo: Vec<Undo>,
}

impl ChainPatch {
    /// Number of edits currently applied.
    pub fn edits(&self) -> usize {
        self.undo.len()
    }
}

impl Drop for ChainPatch {
    fn drop(&mut self) {
        for undo in self.undo.drain(..).rev() {
            match undo {
                Undo::Relink { prev, node } => unsafe { (*prev).p_next = node },
                Undo::Restore { member, value } => unsafe { *member = value },
            }
        }
    }
}

/// Prepares a copy of the application's `VkDeviceCreateInfo` for the driver.
///
/// Feature structures of `removed` extensions are unlinked from the chain.
/// Spoofed core features the driver lacks are cleared in `enabled_copy` (which
/// replaces `pEnabledFeatures`) and in any `VkPhysicalDeviceFeatures2` in the
/// chain. Spoofed members of the remaining structures are cleared wherever
/// `driver` reports them unsupported. The returned [`ChainPatch`] undoes the
/// chain edits when dropped and must outlive the driver call.
///
/// # Safety
///
/// `info` must be a copy of a valid `VkDeviceCreateInfo` whose chain stays
/// alive until the returned patch is dropped, and `enabled_copy` must outlive
/// every use of `info`.
pub unsafe fn patch_device_create_info(
    info: &mut vk::DeviceCreateInfo<'_>,
    removed: &[&CStr],
    driver: Option<&DriverFeatures>,
    enabled_copy: &mut vk::PhysicalDeviceFeatures,
) -> ChainPatch {
    let mut patch = ChainPatch { undo: Vec::new() };
    let lacks_bc = driver.is_some_and(|real| real.core.texture_compression_bc == vk::FALSE);
    let mut cleared = 0;

    if !info.p_enabled_features.is_null() {
        *enabled_copy = unsafe { *info.p_enabled_features };
        if lacks_bc && enabled_copy.texture_compression_bc == vk::TRUE {
            info!("not requesting textureCompressionBC from a driver without it");
            enabled_copy.texture_compression_bc = vk::FALSE;
        }
        info.p_enabled_features = enabled_copy;
    }

    let removed_types: Vec<vk::StructureType> = removed
        .iter()
        .filter_map(|name| spoofed(name))
        .filter_map(|spoof| spoof.features)
        .map(|features| features.s_type)
        .collect();

    let head = ptr::from_mut(info).cast::<vk::BaseOutStructure<'static>>();
    let mut prev = head;
    let mut node = unsafe { (*prev).p_next };
    while !node.is_null() {
        let s_type = unsafe { (*node).s_type };
        let next = unsafe { (*node).p_next };
        if removed_types.contains(&s_type) {
            debug!("unlinking {s_type:?} from device create info");
            unsafe { (*prev).p_next = next };
            // The create-info itself is our copy and needs no restoring.
            if prev != head {
                patch.undo.push(Undo::Relink { prev, node });
            }
            node = next;
            continue;
        }
        if s_type == vk::StructureType::PHYSICAL_DEVICE_FEATURES_2 && lacks_bc {
            let features = node.cast::<vk::PhysicalDeviceFeatures2<'static>>();
            let member = unsafe { &raw mut (*features).features.texture_compression_bc };
            let value = unsafe { *member };
            if value == vk::TRUE {
                unsafe { *member = vk::FALSE };
                patch.undo.push(Undo::Restore { member, value });
            }
        }
        if let (Some(spoof), Some(real)) = (feature_spoof_for(s_type), driver) {
            let members = unsafe { bool_members(node) };
            for index in 0..spoof.bool_count {
                if real.member(s_type, index) != Some(vk::FALSE) {
                    continue;
                }
                let member = unsafe { members.add(index) };
                let value = unsafe { *member };
                if value == vk::TRUE {
                    unsafe { *member = vk::FALSE };
                    patch.undo.push(Undo::Restore { member, value });
                    cleared += 1;
                }
            }
        }
        prev = node;
        node = next;
    }
    if cleared > 0 {
        info!("not requesting {cleared} spoofed feature bit(s) the driver lacks");
    }
    patch
}
