//! Error taxonomy shared by every part of the layer.
//!
//! Chain-protocol problems surface as [`LayerError`] and fail the creation call
//! that hit them. Capability mismatches never reach this type (the adapter
//! resolves them), and transport problems are reported as
//! [`FrameDisposition`](crate::frame::FrameDisposition) values instead of errors.

use ash::vk;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type LayerResult<T> = Result<T, LayerError>;

/// Errors raised while intercepting, emulating or forwarding Vulkan calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    /// The create-info chain did not carry the loader's link structure.
    ///
    /// This means the layer was loaded by something other than a conformant
    /// loader, or a layer above advanced the chain incorrectly.
    ///
    /// **Recovery**: None. The creation call fails with
    /// `VK_ERROR_INITIALIZATION_FAILED` so the problem is visible immediately.
    #[error("loader link info missing from {call} create-info chain")]
    MissingChainLink {
        /// The creation call whose chain was malformed.
        call: &'static str,
    },

    /// The next layer returned no implementation for a required entry point.
    ///
    /// **Recovery**: During creation this is fatal. During present the layer
    /// degrades to a wait-idle without readback.
    #[error("next layer does not provide {name}")]
    MissingEntryPoint {
        /// Name of the Vulkan command that could not be resolved.
        name: &'static str,
    },

    /// A dispatch registry already tracks its maximum number of live handles.
    ///
    /// **Recovery**: Destroy an instance or device before creating another.
    #[error("dispatch registry is full ({capacity} live entries)")]
    RegistryFull {
        /// Number of slots in the registry.
        capacity: usize,
    },

    /// A handle was not found in the registry that should own it.
    ///
    /// **Recovery**: Usually an application bug (use after destroy). The call
    /// is rejected without touching the driver.
    #[error("unknown {kind} handle {handle:#x}")]
    UnknownHandle {
        /// Kind of object the handle was expected to name.
        kind: &'static str,
        /// Raw handle value.
        handle: u64,
    },

    /// A driver call returned a failure code.
    ///
    /// **Recovery**: Depends on the code. Allocation failures leave a degraded
    /// swapchain slot; device loss is passed back to the application.
    #[error("{call} failed: {result}")]
    Vulkan {
        /// The Vulkan command that failed.
        call: &'static str,
        /// The code the driver returned.
        result: vk::Result,
    },

    /// No memory type satisfies an allocation's requirements.
    ///
    /// **Recovery**: The affected image slot or staging buffer is skipped and
    /// presents on it degrade to a wait-idle.
    #[error("no memory type in mask {type_bits:#x} has properties {required:?}")]
    NoCompatibleMemory {
        /// Memory type bits from the resource's requirements.
        type_bits: u32,
        /// Property flags that every candidate had to carry.
        required: vk::MemoryPropertyFlags,
    },

    /// An acquire or present named an image index outside the swapchain.
    ///
    /// **Recovery**: Application bug. The present for that swapchain fails.
    #[error("image index {index} out of range for {count} images")]
    InvalidImageIndex {
        /// Index supplied by the application.
        index: u32,
        /// Number of images the swapchain owns.
        count: u32,
    },

    /// A swapchain format whose texels are not four bytes wide.
    ///
    /// **Recovery**: The swapchain is still created; its presents skip readback
    /// because the wire format only carries four-byte pixels.
    #[error("format {format:?} cannot be captured")]
    UnsupportedFormat {
        /// The swapchain's image format.
        format: vk::Format,
    },
}

impl LayerError {
    /// Builds a [`LayerError::Vulkan`] from a failed call.
    pub fn vulkan(call: &'static str, result: vk::Result) -> Self {
        LayerError::Vulkan { call, result }
    }

    /// Maps the error to the code handed back to the application.
    pub fn to_vk_result(&self) -> vk::Result {
        match self {
            LayerError::MissingChainLink { .. } | LayerError::MissingEntryPoint { .. } => {
                vk::Result::ERROR_INITIALIZATION_FAILED
            }
            LayerError::RegistryFull { .. } => vk::Result::ERROR_TOO_MANY_OBJECTS,
            LayerError::UnknownHandle { .. } | LayerError::InvalidImageIndex { .. } => {
                vk::Result::ERROR_UNKNOWN
            }
            LayerError::Vulkan { result, .. } => *result,
            LayerError::NoCompatibleMemory { .. } => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            LayerError::UnsupportedFormat { .. } => vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        }
    }
}

/// Converts a raw driver return code into a [`LayerResult`].
pub(crate) fn check(call: &'static str, result: vk::Result) -> LayerResult<()> {
    match result {
        vk::Result::SUCCESS => Ok(()),
        other => Err(LayerError::vulkan(call, other)),
    }
}
