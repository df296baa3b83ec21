//! Unit-level tests for vk-headless-present
//!
//! These tests cover the pieces that need no device: configuration, the
//! extension and feature adapter, the registries, the frame format, pacing and
//! dump-mode diagnostics.

use std::collections::HashMap;
use std::ffi::CStr;
use std::io::Cursor;
use std::ptr;
use std::time::{Duration, Instant};

use ash::vk;
use ash::vk::Handle;
use vk_headless_present::adapter::{
    SPOOFED_BC_FEATURES, SPOOFED_DEVICE_EXTENSIONS, extension_name, extension_properties,
    filter_instance_extensions, is_bc_format, patch_device_create_info, query_driver_features, spoof_features,
    spoof_features2, spoof_format_properties,
};
use vk_headless_present::config::DEFAULT_FRAME_INTERVAL;
use vk_headless_present::dispatch::DispatchRegistry;
use vk_headless_present::surface::{MAX_EXTENT, RETIRED_HANDLE_LIMIT, RetiredHandles, SURFACE_FORMAT};
use vk_headless_present::{
    DriverFeatures, DropReason, DumpConfig, ExtensionPolicy, FrameDisposition, FrameDump, FrameHeader, FramePacer,
    FrameSink, FrameSummary, FrameView, LayerConfig, LayerError, Ownership, STAGING_SENTINEL, SurfaceRegistry,
    read_frame,
};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

fn names(properties: &[vk::ExtensionProperties]) -> Vec<String> {
    properties
        .iter()
        .map(|p| extension_name(p).to_string_lossy().into_owned())
        .collect()
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Test that an empty environment yields the documented defaults
#[test]
fn test_config_defaults() {
    let config = LayerConfig::from_lookup(|_| None);

    assert!(config.enabled, "Layer should be enabled by default");
    assert_eq!(
        config.endpoint.to_string(),
        "127.0.0.1:19850",
        "Default endpoint should be the loopback consumer port"
    );
    assert_eq!(
        config.frame_interval,
        Some(DEFAULT_FRAME_INTERVAL),
        "Pacing should default to about 120 FPS"
    );
    assert_eq!(config.surface_extent.width, 1920);
    assert_eq!(config.surface_extent.height, 1080);
    assert_eq!(config.dump, None, "Dump mode should be off by default");
    assert!(config.masked_device_extensions.is_empty());
    assert_eq!(config.log_filter, "info");
}

/// Test that every variable overrides its default
#[test]
fn test_config_overrides() {
    let config = LayerConfig::from_lookup(lookup(&[
        ("HEADLESS_LAYER_HOST", "127.0.0.2"),
        ("HEADLESS_LAYER_PORT", "4000"),
        ("HEADLESS_LAYER_FPS", "60"),
        ("HEADLESS_LAYER_WIDTH", "1280"),
        ("HEADLESS_LAYER_HEIGHT", "720"),
        ("HEADLESS_LAYER_DUMP_FRAMES", "5"),
        ("HEADLESS_LAYER_DUMP_DIR", "/tmp/frames-here"),
        ("HEADLESS_LAYER_MASK_EXTENSIONS", "VK_EXT_robustness2, VK_KHR_maintenance6,,"),
        ("HEADLESS_LAYER_LOG", "debug"),
    ]));

    assert_eq!(config.endpoint.to_string(), "127.0.0.2:4000");
    assert_eq!(config.frame_interval, Some(Duration::from_nanos(16_666_666)));
    assert_eq!(config.surface_extent.width, 1280);
    assert_eq!(config.surface_extent.height, 720);
    assert_eq!(
        config.dump,
        Some(DumpConfig {
            frames: 5,
            directory: "/tmp/frames-here".into(),
        })
    );
    assert_eq!(
        config.masked_device_extensions,
        vec!["VK_EXT_robustness2".to_string(), "VK_KHR_maintenance6".to_string()],
        "Mask list should be trimmed and skip empty entries"
    );
    assert_eq!(config.log_filter, "debug");
}

/// Test that invalid values fall back to defaults instead of failing
#[test]
fn test_config_invalid_values_keep_defaults() {
    let config = LayerConfig::from_lookup(lookup(&[
        ("HEADLESS_LAYER_PORT", "not-a-port"),
        ("HEADLESS_LAYER_FPS", "fast"),
        ("HEADLESS_LAYER_WIDTH", "0"),
        ("HEADLESS_LAYER_HEIGHT", "99999"),
        ("HEADLESS_LAYER_DUMP_FRAMES", "-3"),
    ]));

    assert_eq!(config.endpoint.port(), 19850, "Invalid port should keep the default");
    assert_eq!(
        config.frame_interval,
        Some(DEFAULT_FRAME_INTERVAL),
        "Invalid FPS should keep pacing at the default"
    );
    assert_eq!(config.surface_extent.width, 1920, "Zero width should keep the default");
    assert_eq!(config.surface_extent.height, MAX_EXTENT, "Oversized height should be clamped");
    assert_eq!(config.dump, None);
}

/// Test pacing and pass-through switches
#[test]
fn test_config_switches() {
    let config = LayerConfig::from_lookup(lookup(&[("HEADLESS_LAYER_FPS", "0")]));
    assert_eq!(config.frame_interval, None, "FPS 0 should disable pacing");

    let config = LayerConfig::from_lookup(lookup(&[("DISABLE_HEADLESS_LAYER", "1")]));
    assert!(!config.enabled, "DISABLE_HEADLESS_LAYER=1 should disable interception");

    let config = LayerConfig::from_lookup(lookup(&[("DISABLE_HEADLESS_LAYER", "0")]));
    assert!(config.enabled);

    let config = LayerConfig::from_lookup(lookup(&[("HEADLESS_LAYER_DUMP_FRAMES", "2")]));
    assert_eq!(
        config.dump.map(|dump| dump.directory),
        Some("/tmp/headless-layer-frames".into()),
        "Dump directory should default when only a frame count is given"
    );
}

// ============================================================================
// EXTENSION ADAPTER
// ============================================================================

/// Test that missing spoofed extensions are injected exactly once
#[test]
fn test_advertised_extensions_inject_missing() {
    let real = vec![
        extension_properties(c"VK_KHR_swapchain", 70),
        extension_properties(c"VK_EXT_robustness2", 3),
        extension_properties(c"VK_KHR_timeline_semaphore", 2),
    ];
    let advertised = ExtensionPolicy::default().advertised(&real);
    let advertised_names = names(&advertised);

    for spoof in SPOOFED_DEVICE_EXTENSIONS {
        let name = spoof.extension.name.to_string_lossy();
        assert_eq!(
            advertised_names.iter().filter(|n| **n == name).count(),
            1,
            "{name} should be advertised exactly once"
        );
    }
    assert!(advertised_names.contains(&"VK_KHR_timeline_semaphore".to_string()));

    let robustness = advertised
        .iter()
        .find(|p| extension_name(p) == c"VK_EXT_robustness2")
        .map(|p| p.spec_version);
    assert_eq!(robustness, Some(3), "Driver's own version should win over the spoofed one");
}

/// Test that masked extensions disappear from enumeration and device creation
#[test]
fn test_masked_extensions() {
    let policy = ExtensionPolicy::new(["VK_EXT_transform_feedback", "VK_KHR_timeline_semaphore"]);
    let real = vec![
        extension_properties(c"VK_KHR_timeline_semaphore", 2),
        extension_properties(c"VK_KHR_swapchain", 70),
    ];
    let advertised = names(&policy.advertised(&real));
    assert!(!advertised.contains(&"VK_KHR_timeline_semaphore".to_string()));
    assert!(!advertised.contains(&"VK_EXT_transform_feedback".to_string()));

    let requested = [c"VK_KHR_timeline_semaphore", c"VK_KHR_swapchain"];
    let filter = policy.filter_for_driver(&requested, &real);
    assert_eq!(filter.kept, vec![c"VK_KHR_swapchain"]);
    assert_eq!(filter.removed, vec![c"VK_KHR_timeline_semaphore"]);
}

/// Test that only spoofed extensions the driver lacks are withheld from it
#[test]
fn test_filter_for_driver() {
    let driver = vec![extension_properties(c"VK_EXT_depth_clip_enable", 1)];
    let requested: [&CStr; 4] = [
        c"VK_EXT_depth_clip_enable",
        c"VK_EXT_custom_border_color",
        c"VK_KHR_pipeline_library",
        c"VK_KHR_unknown_to_layer",
    ];
    let filter = ExtensionPolicy::default().filter_for_driver(&requested, &driver);

    assert_eq!(
        filter.kept,
        vec![c"VK_EXT_depth_clip_enable", c"VK_KHR_unknown_to_layer"],
        "Supported and unknown extensions should reach the driver"
    );
    assert_eq!(
        filter.removed,
        vec![c"VK_EXT_custom_border_color", c"VK_KHR_pipeline_library"]
    );
}

/// Test that layer-provided instance extensions are never forwarded
#[test]
fn test_instance_extension_filter() {
    let requested = [
        c"VK_KHR_surface",
        c"VK_KHR_get_physical_device_properties2",
        c"VK_KHR_xcb_surface",
        c"VK_EXT_headless_surface",
    ];
    let filter = filter_instance_extensions(&requested);
    assert_eq!(filter.kept, vec![c"VK_KHR_get_physical_device_properties2"]);
    assert_eq!(filter.removed.len(), 3);
}

/// Test that feature spoofing only turns bits on and is idempotent
#[test]
fn test_spoof_core_features() {
    let mut features = vk::PhysicalDeviceFeatures::default();
    assert!(spoof_features(&mut features), "First spoof should change the struct");
    assert_eq!(features.texture_compression_bc, vk::TRUE);
    assert!(!spoof_features(&mut features), "Second spoof should be a no-op");

    let mut genuine = vk::PhysicalDeviceFeatures {
        texture_compression_bc: vk::TRUE,
        geometry_shader: vk::TRUE,
        ..Default::default()
    };
    assert!(!spoof_features(&mut genuine));
    assert_eq!(genuine.geometry_shader, vk::TRUE, "Unrelated features must not change");
}

/// Test that chained feature structures are spoofed and unknown ones untouched
#[test]
fn test_spoof_feature_chain() {
    let mut robustness = vk::PhysicalDeviceRobustness2FeaturesEXT::default();
    robustness.robust_image_access2 = vk::TRUE;
    let mut border = vk::PhysicalDeviceCustomBorderColorFeaturesEXT::default();
    let mut unrelated = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut unrelated)
        .push_next(&mut border)
        .push_next(&mut robustness);

    let flipped = unsafe { spoof_features2(&mut features2) };
    assert_eq!(flipped, 1 + 2 + 2, "BC, two border bits and two robustness bits");
    assert_eq!(features2.features.texture_compression_bc, vk::TRUE);
    drop(features2);

    assert_eq!(robustness.robust_buffer_access2, vk::TRUE);
    assert_eq!(robustness.robust_image_access2, vk::TRUE);
    assert_eq!(robustness.null_descriptor, vk::TRUE);
    assert_eq!(border.custom_border_colors, vk::TRUE);
    assert_eq!(border.custom_border_color_without_format, vk::TRUE);
    assert_eq!(unrelated.timeline_semaphore, vk::FALSE, "Unknown structs must not change");
    assert_eq!(unrelated.sampler_mirror_clamp_to_edge, vk::FALSE);
}

/// Test that BC formats get optimal tiling features only when empty
#[test]
fn test_bc_format_spoofing() {
    assert!(is_bc_format(vk::Format::BC1_RGB_UNORM_BLOCK));
    assert!(is_bc_format(vk::Format::BC7_SRGB_BLOCK));
    assert!(!is_bc_format(vk::Format::ETC2_R8G8B8_UNORM_BLOCK));
    assert!(!is_bc_format(vk::Format::R8G8B8A8_UNORM));

    let mut empty = vk::FormatProperties::default();
    assert!(spoof_format_properties(vk::Format::BC3_UNORM_BLOCK, &mut empty));
    assert_eq!(empty.optimal_tiling_features, SPOOFED_BC_FEATURES);
    assert!(empty.optimal_tiling_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR));

    let mut genuine = vk::FormatProperties {
        optimal_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE,
        ..Default::default()
    };
    assert!(!spoof_format_properties(vk::Format::BC3_UNORM_BLOCK, &mut genuine));
    assert_eq!(genuine.optimal_tiling_features, vk::FormatFeatureFlags::SAMPLED_IMAGE);

    let mut other = vk::FormatProperties::default();
    assert!(!spoof_format_properties(vk::Format::R8_UNORM, &mut other));
}

/// Test that device-creation patching is undone when the patch is dropped
#[test]
fn test_chain_patch_restores_application_structs() {
    let mut border = vk::PhysicalDeviceCustomBorderColorFeaturesEXT::default().custom_border_colors(true);
    let mut depth_clip = vk::PhysicalDeviceDepthClipEnableFeaturesEXT::default().depth_clip_enable(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default().features(
        vk::PhysicalDeviceFeatures::default()
            .texture_compression_bc(true)
            .sampler_anisotropy(true),
    );
    let original = vk::DeviceCreateInfo::default()
        .push_next(&mut features2)
        .push_next(&mut depth_clip)
        .push_next(&mut border);
    // Chain order after push_next: info -> border -> depth_clip -> features2.
    let border_ptr = original.p_next;

    let mut info = original;
    let removed = [c"VK_EXT_custom_border_color"];
    let driver_features = DriverFeatures::from_core(vk::PhysicalDeviceFeatures::default());
    let mut enabled_copy = vk::PhysicalDeviceFeatures::default();
    {
        let patch = unsafe { patch_device_create_info(&mut info, &removed, Some(&driver_features), &mut enabled_copy) };
        assert_eq!(patch.edits(), 1, "Only the BC bit in Features2 needs restoring");

        let mut seen = Vec::new();
        let mut node = info.p_next.cast::<vk::BaseOutStructure<'_>>();
        while !node.is_null() {
            let s_type = unsafe { (*node).s_type };
            if s_type == vk::StructureType::PHYSICAL_DEVICE_FEATURES_2 {
                let patched = unsafe { &*node.cast::<vk::PhysicalDeviceFeatures2<'_>>() };
                assert_eq!(patched.features.texture_compression_bc, vk::FALSE);
                assert_eq!(patched.features.sampler_anisotropy, vk::TRUE);
            }
            seen.push(s_type);
            node = unsafe { (*node).p_next };
        }
        assert_eq!(
            seen,
            vec![
                vk::StructureType::PHYSICAL_DEVICE_DEPTH_CLIP_ENABLE_FEATURES_EXT,
                vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
            ],
            "Border color struct should be unlinked for the driver"
        );
    }

    assert_eq!(original.p_next, border_ptr, "Application's create info is untouched");
    let border_next = unsafe { (*border_ptr.cast::<vk::BaseOutStructure<'_>>()).p_next };
    assert!(!border_next.is_null(), "Border struct still links to the rest of the chain");
    assert_eq!(
        features2.features.texture_compression_bc,
        vk::TRUE,
        "Dropped patch should restore the BC bit"
    );
}

/// Test that a pEnabledFeatures request the driver cannot honour is cleared in a copy
#[test]
fn test_chain_patch_copies_enabled_features() {
    let requested = vk::PhysicalDeviceFeatures::default()
        .texture_compression_bc(true)
        .geometry_shader(true);
    let mut info = vk::DeviceCreateInfo::default().enabled_features(&requested);
    let driver_features = DriverFeatures::from_core(vk::PhysicalDeviceFeatures::default().geometry_shader(true));
    let mut enabled_copy = vk::PhysicalDeviceFeatures::default();

    let patch = unsafe { patch_device_create_info(&mut info, &[], Some(&driver_features), &mut enabled_copy) };
    assert_eq!(patch.edits(), 0);
    drop(patch);

    assert_eq!(enabled_copy.texture_compression_bc, vk::FALSE);
    assert_eq!(enabled_copy.geometry_shader, vk::TRUE);
    assert!(ptr::eq(info.p_enabled_features, &enabled_copy), "Driver should see the copy");
    assert_eq!(requested.texture_compression_bc, vk::TRUE, "Application copy is untouched");
}

/// Test that spoofed bits the driver lacks are withheld even when it has the extension
#[test]
fn test_chain_patch_clears_unsupported_spoofed_bits() {
    let driver_extensions = [
        extension_properties(c"VK_EXT_robustness2", 1),
        extension_properties(c"VK_KHR_swapchain", 70),
    ];
    let mut queried = Vec::new();
    let driver = query_driver_features(vk::PhysicalDeviceFeatures::default(), &driver_extensions, |chain| {
        // Stands in for a driver that has robustness2 without nullDescriptor.
        let mut node = chain.p_next.cast::<vk::BaseOutStructure<'_>>();
        while !node.is_null() {
            let s_type = unsafe { (*node).s_type };
            queried.push(s_type);
            if s_type == vk::StructureType::PHYSICAL_DEVICE_ROBUSTNESS_2_FEATURES_EXT {
                let robustness = unsafe { &mut *node.cast::<vk::PhysicalDeviceRobustness2FeaturesEXT<'_>>() };
                robustness.robust_buffer_access2 = vk::TRUE;
                robustness.robust_image_access2 = vk::TRUE;
            }
            node = unsafe { (*node).p_next };
        }
        true
    });
    assert_eq!(
        queried,
        vec![vk::StructureType::PHYSICAL_DEVICE_ROBUSTNESS_2_FEATURES_EXT],
        "Only structures of extensions the driver has are queried"
    );
    let robustness2 = vk::StructureType::PHYSICAL_DEVICE_ROBUSTNESS_2_FEATURES_EXT;
    assert_eq!(driver.member(robustness2, 1), Some(vk::TRUE));
    assert_eq!(driver.member(robustness2, 2), Some(vk::FALSE));
    assert_eq!(
        driver.member(vk::StructureType::PHYSICAL_DEVICE_DEPTH_CLIP_ENABLE_FEATURES_EXT, 0),
        None
    );

    // The application enables what the spoofed query promised it.
    let mut robustness = vk::PhysicalDeviceRobustness2FeaturesEXT::default()
        .robust_buffer_access2(true)
        .null_descriptor(true);
    let mut depth_clip = vk::PhysicalDeviceDepthClipEnableFeaturesEXT::default().depth_clip_enable(true);
    let mut info = vk::DeviceCreateInfo::default()
        .push_next(&mut depth_clip)
        .push_next(&mut robustness);
    let mut enabled_copy = vk::PhysicalDeviceFeatures::default();
    {
        let patch = unsafe { patch_device_create_info(&mut info, &[], Some(&driver), &mut enabled_copy) };
        assert_eq!(patch.edits(), 1, "Only nullDescriptor is unsupported and requested");
        let patched = unsafe { &*info.p_next.cast::<vk::PhysicalDeviceRobustness2FeaturesEXT<'_>>() };
        assert_eq!(patched.null_descriptor, vk::FALSE, "Driver must not be asked for nullDescriptor");
        assert_eq!(patched.robust_buffer_access2, vk::TRUE, "Genuine support is passed through");
    }
    assert_eq!(robustness.null_descriptor, vk::TRUE, "Dropped patch should restore the request");
    assert_eq!(depth_clip.depth_clip_enable, vk::TRUE, "Unqueried structures are left alone");
}

/// Test that a driver without vkGetPhysicalDeviceFeatures2 leaves chained bits alone
#[test]
fn test_driver_features_without_query() {
    let driver_extensions = [extension_properties(c"VK_EXT_custom_border_color", 12)];
    let core = vk::PhysicalDeviceFeatures::default().texture_compression_bc(true);
    let driver = query_driver_features(core, &driver_extensions, |_| false);
    assert!(driver.extended.is_empty(), "Nothing chained is known without the query");
    assert_eq!(driver.core.texture_compression_bc, vk::TRUE);
    assert_eq!(
        driver.member(vk::StructureType::PHYSICAL_DEVICE_CUSTOM_BORDER_COLOR_FEATURES_EXT, 0),
        None
    );
}

// ============================================================================
// SURFACES AND REGISTRIES
// ============================================================================

/// Test surface ownership through create, destroy and foreign handles
#[test]
fn test_surface_registry_ownership() {
    let mut registry = SurfaceRegistry::default();
    let extent = vk::Extent2D {
        width: 800,
        height: 600,
    };
    let surface = registry.create(1, extent);

    assert_eq!(registry.ownership(surface), Ownership::Live);
    assert_eq!(registry.len(), 1);
    let foreign = vk::SurfaceKHR::from_raw(0x1234);
    assert_eq!(registry.ownership(foreign), Ownership::Foreign);

    assert!(registry.destroy(surface), "First destroy should remove the surface");
    assert_eq!(registry.ownership(surface), Ownership::Retired);
    assert!(!registry.destroy(surface), "Second destroy should be a no-op");
    assert!(registry.is_empty());
}

/// Test synthetic surface capabilities and resizing
#[test]
fn test_surface_capabilities() {
    let mut registry = SurfaceRegistry::default();
    let surface = registry.create(
        1,
        vk::Extent2D {
            width: 1920,
            height: 1080,
        },
    );
    let caps = registry
        .capabilities(surface)
        .expect("Live surface should report capabilities");
    assert_eq!(caps.min_image_count, 2);
    assert_eq!(caps.max_image_count, 8);
    assert_eq!(caps.current_extent.width, 1920);
    assert_eq!(caps.max_image_extent.width, 16384);
    assert_eq!(caps.max_image_array_layers, 1);
    assert!(caps.supported_usage_flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    assert!(caps.supported_usage_flags.contains(vk::ImageUsageFlags::TRANSFER_SRC));

    assert!(registry.set_extent(
        surface,
        vk::Extent2D {
            width: 640,
            height: 480,
        }
    ));
    assert_eq!(registry.capabilities(surface).map(|c| c.current_extent.height), Some(480));
    assert_eq!(SURFACE_FORMAT.format, vk::Format::B8G8R8A8_UNORM);
}

/// Test that destroying an instance drops only its own surfaces
#[test]
fn test_surfaces_follow_their_instance() {
    let mut registry = SurfaceRegistry::default();
    let extent = vk::Extent2D {
        width: 1,
        height: 1,
    };
    let a = registry.create(1, extent);
    let b = registry.create(1, extent);
    let c = registry.create(2, extent);
    assert_ne!(a, b, "Handles must be unique");

    assert_eq!(registry.destroy_for_instance(1), 2);
    assert_eq!(registry.ownership(a), Ownership::Retired);
    assert_eq!(registry.ownership(b), Ownership::Retired);
    assert_eq!(registry.ownership(c), Ownership::Live);
}

/// Test that destroyed surfaces are remembered only up to the limit
#[test]
fn test_retired_surfaces_are_bounded() {
    let mut registry = SurfaceRegistry::default();
    let extent = vk::Extent2D {
        width: 1,
        height: 1,
    };
    let surfaces: Vec<_> = (0..RETIRED_HANDLE_LIMIT + 10)
        .map(|_| registry.create(1, extent))
        .collect();
    for &surface in &surfaces {
        assert!(registry.destroy(surface));
    }

    assert_eq!(registry.retired_len(), RETIRED_HANDLE_LIMIT, "Retired memory must not grow forever");
    assert_eq!(registry.ownership(surfaces[0]), Ownership::Foreign, "Oldest entries are forgotten");
    assert_eq!(registry.ownership(surfaces[9]), Ownership::Foreign);
    assert_eq!(registry.ownership(surfaces[10]), Ownership::Retired);
    assert_eq!(registry.ownership(surfaces[surfaces.len() - 1]), Ownership::Retired);
}

/// Test that retiring a handle twice keeps a single entry
#[test]
fn test_retired_handles_deduplicate() {
    let mut retired = RetiredHandles::default();
    assert!(retired.is_empty());
    retired.insert(7);
    retired.insert(7);
    retired.insert(8);
    assert_eq!(retired.len(), 2);
    assert!(retired.contains(7) && retired.contains(8));
    assert!(!retired.contains(9));
}

/// Test dispatch registry capacity and the most-recent fallback
#[test]
fn test_dispatch_registry() {
    let mut registry = DispatchRegistry::with_capacity(2);
    assert!(registry.active().is_none());

    assert_eq!(registry.insert(10, "first"), Ok(None));
    assert_eq!(registry.insert(20, "second"), Ok(None));
    assert_eq!(
        registry.insert(30, "third"),
        Err(LayerError::RegistryFull { capacity: 2 }),
        "Full registry should reject new keys"
    );
    assert_eq!(registry.insert(10, "replaced"), Ok(Some("first")), "Same key replaces");

    assert_eq!(registry.get(20), Some(&"second"));
    assert_eq!(registry.get_or_active(99), Some(&"replaced"), "Unknown key falls back to newest");
    assert_eq!(registry.remove(10), Some("replaced"));
    assert_eq!(registry.get_or_active(99), Some(&"second"));
    assert_eq!(registry.len(), 1);
}

/// Test the error to VkResult mapping
#[test]
fn test_error_result_mapping() {
    assert_eq!(
        LayerError::MissingChainLink { call: "vkCreateDevice" }.to_vk_result(),
        vk::Result::ERROR_INITIALIZATION_FAILED
    );
    assert_eq!(
        LayerError::RegistryFull { capacity: 8 }.to_vk_result(),
        vk::Result::ERROR_TOO_MANY_OBJECTS
    );
    assert_eq!(
        LayerError::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST).to_vk_result(),
        vk::Result::ERROR_DEVICE_LOST
    );
    let message = LayerError::InvalidImageIndex { index: 9, count: 3 }.to_string();
    assert!(message.contains('9') && message.contains('3'), "Message should name index and count");
}

// ============================================================================
// FRAME FORMAT
// ============================================================================

/// Test the little-endian frame header layout
#[test]
fn test_frame_header_layout() {
    let header = FrameHeader {
        width: 1920,
        height: 1080,
    };
    let bytes = header.to_bytes();
    assert_eq!(&bytes[..4], &1920u32.to_le_bytes());
    assert_eq!(&bytes[4..], &1080u32.to_le_bytes());
    assert_eq!(header.payload_len(), 1920 * 1080 * 4);
}

/// Test decoding consecutive frames and a truncated stream
#[test]
fn test_read_frame() {
    let mut wire = Vec::new();
    for (w, h, fill) in [(2u32, 1u32, 7u8), (1, 3, 9)] {
        wire.extend_from_slice(&FrameHeader { width: w, height: h }.to_bytes());
        wire.extend(std::iter::repeat_n(fill, (w * h * 4) as usize));
    }
    wire.extend_from_slice(&FrameHeader { width: 4, height: 4 }.to_bytes());
    wire.extend_from_slice(&[0u8; 10]);

    let mut reader = Cursor::new(wire);
    let (first, pixels) = read_frame(&mut reader).expect("First frame should decode");
    assert_eq!((first.width, first.height), (2, 1));
    assert_eq!(pixels, vec![7u8; 8]);

    let (second, pixels) = read_frame(&mut reader).expect("Second frame should decode");
    assert_eq!((second.width, second.height), (1, 3));
    assert!(pixels.iter().all(|&b| b == 9));

    let err = read_frame(&mut reader).expect_err("Truncated frame should fail");
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

/// Test de-striding of padded rows
#[test]
fn test_frame_view_destrides() {
    // 2x2 pixels with 4 bytes of row padding.
    let data: Vec<u8> = vec![
        1, 1, 1, 1, 2, 2, 2, 2, 0xEE, 0xEE, 0xEE, 0xEE, //
        3, 3, 3, 3, 4, 4, 4, 4,
    ];
    let view = FrameView::new(2, 2, 12, vk::Format::B8G8R8A8_UNORM, &data).expect("View should fit");
    assert!(!view.is_packed());
    assert_eq!(view.pixel(1, 1), [4, 4, 4, 4]);

    let mut packed = Vec::new();
    view.write_packed(&mut packed);
    assert_eq!(packed, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]);

    assert!(FrameView::new(2, 2, 4, vk::Format::B8G8R8A8_UNORM, &data).is_none(), "Pitch below row length");
    assert!(FrameView::packed(4, 4, &data).is_none(), "Data shorter than the frame");
}

// ============================================================================
// PACING
// ============================================================================

/// Test that a disabled pacer never sleeps
#[test]
fn test_pacer_disabled() {
    let mut pacer = FramePacer::new(None);
    let start = Instant::now();
    for _ in 0..100 {
        assert_eq!(pacer.pace(), Duration::ZERO);
    }
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(FramePacer::new(Some(Duration::ZERO)).interval(), None, "Zero interval disables pacing");
}

/// Test that consecutive presents are held to the interval
#[test]
fn test_pacer_holds_interval() {
    let interval = Duration::from_millis(20);
    let mut pacer = FramePacer::new(Some(interval));
    assert_eq!(pacer.pace(), Duration::ZERO, "First present should not wait");

    let start = Instant::now();
    pacer.pace();
    pacer.pace();
    assert!(
        start.elapsed() >= interval * 2 - Duration::from_millis(2),
        "Two paced presents should take about two intervals, took {:?}",
        start.elapsed()
    );
    assert_eq!(pacer.delay_at(Instant::now() + interval), Duration::ZERO);
}

// ============================================================================
// DIAGNOSTICS
// ============================================================================

fn solid(width: u32, height: u32, pixel: [u8; 4]) -> Vec<u8> {
    pixel.repeat((width * height) as usize)
}

/// Test frame summaries for black, sentinel and drawn frames
#[test]
fn test_frame_summary() {
    let black = solid(4, 4, [0, 0, 0, 255]);
    let summary = FrameSummary::compute(0, &FrameView::packed(4, 4, &black).expect("fits"));
    assert!(summary.is_black(), "Alpha alone should not count as content");
    assert!(!summary.untouched);

    let sentinel = vec![STAGING_SENTINEL; 4 * 4 * 4];
    let summary = FrameSummary::compute(1, &FrameView::packed(4, 4, &sentinel).expect("fits"));
    assert!(summary.untouched, "Sentinel-only buffer means no copy landed");
    assert!(summary.to_string().contains("UNTOUCHED"));

    let mut drawn = black.clone();
    drawn[..8].copy_from_slice(&[255, 0, 0, 255, 255, 0, 0, 255]);
    let summary = FrameSummary::compute(2, &FrameView::packed(4, 4, &drawn).expect("fits"));
    assert!((summary.non_black_ratio - 2.0 / 16.0).abs() < f64::EPSILON);
    assert_eq!(summary.samples[0], [255, 0, 0, 255], "Top-left sample");
    assert_eq!(summary.samples[4], [0, 0, 0, 255], "Bottom-right sample");
    assert!(summary.to_string().starts_with("frame 0002 4x4"));
}

/// Test that dump mode writes PNGs and a summary, then stops at the limit
#[test]
fn test_frame_dump() {
    let dir = tempfile::tempdir().expect("Temp dir should be creatable");
    let directory = dir.path().join("frames");
    let mut dump = FrameDump::new(&DumpConfig {
        frames: 2,
        directory: directory.clone(),
    });

    // Pure blue in BGRA.
    let pixels = solid(3, 2, [255, 0, 0, 255]);
    let frame = FrameView::packed(3, 2, &pixels).expect("fits");
    assert_eq!(dump.consume(&frame), FrameDisposition::Delivered);
    assert_eq!(dump.consume(&frame), FrameDisposition::Delivered);
    assert_eq!(
        dump.consume(&frame),
        FrameDisposition::Dropped(DropReason::DumpLimitReached),
        "Frames past the limit should be discarded"
    );
    assert!(dump.is_finished());

    let png = image::open(directory.join("frame_0000.png"))
        .expect("PNG should decode")
        .to_rgba8();
    assert_eq!(png.dimensions(), (3, 2));
    assert_eq!(png.get_pixel(0, 0).0, [0, 0, 255, 255], "BGRA should be swizzled to RGBA");
    assert!(directory.join("frame_0001.png").exists());
    assert!(!directory.join("frame_0002.png").exists());

    let summary = std::fs::read_to_string(directory.join("summary.txt")).expect("Summary should exist");
    assert_eq!(summary.lines().count(), 2);
    assert!(summary.lines().all(|line| line.contains("3x2 non_black=100.00%")));
}
