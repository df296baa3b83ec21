//! Headless presentation for Vulkan applications on Linux.
//!
//! This crate builds a Vulkan loader layer that lets an unmodified application
//! believe it is presenting to a window while no window system exists. Surface
//! and swapchain calls are emulated inside the layer; every presented image is
//! copied back from the GPU and streamed to a local TCP consumer.
//!
//! # Features
//!
//! - **Virtual Surfaces**: Xcb, Xlib and headless surface creation all yield
//!   layer-owned surfaces with synthetic capabilities
//! - **Software Swapchains**: GPU-resident images, round-robin acquire, and a
//!   readback of every presented image
//! - **Frame Streaming**: Non-blocking TCP delivery that drops frames instead
//!   of stalling the application
//! - **Extension Adapter**: Advertises device extensions and feature bits some
//!   drivers lack, and keeps them away from the driver at device creation
//! - **Frame Pacing**: Caps the present rate, 120 presents per second by default
//! - **Dump Mode**: Writes the first frames as PNG files with a content summary
//!
//! # Platform Requirements
//!
//! - Linux with a Vulkan loader supporting layer interface version 2
//! - A driver that can render off-screen; no display server is needed
//!
//! # Quick Start
//!
//! Build the `cdylib`, point the loader at `layer/VkLayer_headless_present.json`
//! and enable the layer:
//!
//! ```text
//! VK_LAYER_PATH=/path/to/layer HEADLESS_LAYER=1 HEADLESS_LAYER_FPS=60 ./game
//! ```
//!
//! A consumer accepts the connection and reads frames in the wire format:
//!
//! ```rust,no_run
//! use std::net::TcpListener;
//! use vk_headless_present::read_frame;
//!
//! fn main() -> std::io::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:19850")?;
//!     let (mut stream, _) = listener.accept()?;
//!     loop {
//!         let (header, pixels) = read_frame(&mut stream)?;
//!         println!("{}x{} frame, {} bytes of BGRA", header.width, header.height, pixels.len());
//!     }
//! }
//! ```
//!
//! # Configuration
//!
//! All settings come from environment variables read once when the loader
//! negotiates with the layer; see [`LayerConfig`]. Invalid values are logged
//! and replaced by defaults, so configuration never breaks the application.
//!
//! # Error Handling
//!
//! Internally every fallible operation returns a [`LayerResult`]. At the
//! Vulkan boundary a [`LayerError`] is logged and mapped to a `VkResult` with
//! [`LayerError::to_vk_result`]. What happens to a frame after readback is not
//! an error at all but a [`FrameDisposition`]:
//!
//! ```rust
//! use vk_headless_present::{DropReason, FrameDisposition, FrameSink, FrameTransport, FrameView};
//!
//! let mut transport = FrameTransport::new("127.0.0.1:9".parse().unwrap());
//! let pixels = vec![0u8; 4 * 4 * 4];
//! let frame = FrameView::packed(4, 4, &pixels).unwrap();
//!
//! match transport.consume(&frame) {
//!     FrameDisposition::Delivered | FrameDisposition::Queued => { /* on its way */ }
//!     FrameDisposition::Dropped(DropReason::NotConnected) => { /* nobody listening */ }
//!     FrameDisposition::Dropped(reason) => eprintln!("frame dropped: {reason:?}"),
//! }
//! ```
//!
//! # Thread Safety
//!
//! The layer's shared state lives in one [`LayerContext`]. Registries sit
//! behind a single lock; presentation, which owns the frame sink and the
//! pacer, takes a second lock so presents from several threads are
//! serialized without blocking unrelated lookups.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod adapter;
pub mod capture;
pub mod chain;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod frame;
mod layer;
pub mod pacing;
pub mod surface;
pub mod swapchain;
pub mod transport;

pub use adapter::{ChainPatch, DriverFeatures, ExtensionFilter, ExtensionPolicy};
pub use capture::{CaptureResources, STAGING_SENTINEL};
pub use config::{DumpConfig, LayerConfig};
pub use context::{LayerContext, PresentReport};
pub use diagnostics::{FrameDump, FrameSummary};
pub use driver::{DeviceDriver, ImageDesc, ReadbackCopy, Submission};
pub use error::{LayerError, LayerResult};
pub use frame::{
    BYTES_PER_PIXEL, DropReason, FRAME_HEADER_LEN, FrameDisposition, FrameHeader, FrameSink, FrameView,
    is_capturable_format, read_frame,
};
pub use layer::{LAYER_NAME, vkNegotiateLoaderLayerInterfaceVersion};
pub use pacing::FramePacer;
pub use surface::{Ownership, SurfaceRegistry};
pub use swapchain::{
    DeviceContext, MAX_SWAPCHAIN_IMAGES, PresentOutcome, SkipReason, SwapchainRegistry, SwapchainRequest,
    VirtualSwapchain,
};
pub use transport::{FrameTransport, TransportStats};
