//! Process-wide layer state.
//!
//! [`LayerContext`] is everything the entry points share: the configuration,
//! the extension policy, the registries, and the presenter that owns the frame
//! sink and the pacer. The registries sit behind one coarse lock; presentation
//! work happens under a second lock so a slow readback never blocks
//! unrelated lookups.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::adapter::ExtensionPolicy;
use crate::config::LayerConfig;
use crate::diagnostics::FrameDump;
use crate::dispatch::{DeviceDispatch, DispatchRegistry, InstanceDispatch};
use crate::error::{LayerError, LayerResult};
use crate::frame::FrameSink;
use crate::pacing::FramePacer;
use crate::surface::{Ownership, SurfaceRegistry};
use crate::swapchain::{
    DeviceContext, PresentOutcome, SwapchainRegistry, SwapchainRequest, VirtualSwapchain,
};
use crate::transport::FrameTransport;

/// How long the last swapchain's teardown waits for a frame still in flight.
pub const TEARDOWN_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Registries guarded by the state lock.
#[derive(Default)]
pub struct LayerState {
    pub instances: DispatchRegistry<Arc<InstanceDispatch>>,
    pub devices: DispatchRegistry<Arc<DeviceDispatch>>,
    pub surfaces: SurfaceRegistry,
    pub swapchains: SwapchainRegistry,
}

/// What one `vkQueuePresentKHR` did on the virtual swapchains it named.
#[derive(Debug, PartialEq, Eq)]
pub struct PresentReport {
    /// One result per target, in target order.
    pub results: Vec<LayerResult<PresentOutcome>>,
    /// No target was live, so nothing waited on the present's semaphores and
    /// the caller still has to consume them.
    pub waits_pending: bool,
}

struct Presenter {
    sink: Box<dyn FrameSink>,
    pacer: FramePacer,
}

/// Shared state of one loaded layer.
pub struct LayerContext {
    config: LayerConfig,
    policy: ExtensionPolicy,
    state: Mutex<LayerState>,
    presenter: Mutex<Presenter>,
}

impl LayerContext {
    /// Builds the context, streaming frames over TCP or dumping them to disk
    /// depending on `config`.
    pub fn new(config: LayerConfig) -> Self {
        let sink: Box<dyn FrameSink> = match &config.dump {
            Some(dump) => {
                info!(
                    "dump mode: writing {} frames to {}",
                    dump.frames,
                    dump.directory.display()
                );
                Box::new(FrameDump::new(dump))
            }
            None => {
                info!("streaming frames to {}", config.endpoint);
                Box::new(FrameTransport::new(config.endpoint))
            }
        };
        Self::with_sink(config, sink)
    }

    /// Builds the context around an arbitrary frame sink.
    pub fn with_sink(config: LayerConfig, sink: Box<dyn FrameSink>) -> Self {
        let policy = ExtensionPolicy::new(&config.masked_device_extensions);
        let pacer = FramePacer::new(config.frame_interval);
        Self {
            config,
            policy,
            state: Mutex::new(LayerState::default()),
            presenter: Mutex::new(Presenter { sink, pacer }),
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn policy(&self) -> &ExtensionPolicy {
        &self.policy
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Locks the registries.
    pub fn state(&self) -> MutexGuard<'_, LayerState> {
        self.state.lock()
    }

    // -- surfaces ----------------------------------------------------------

    /// Creates a virtual surface of the configured default size.
    pub fn create_surface(&self, instance_key: usize) -> vk::SurfaceKHR {
        self.state
            .lock()
            .surfaces
            .create(instance_key, self.config.surface_extent)
    }

    /// Destroys a surface, reporting who owned it beforehand.
    pub fn destroy_surface(&self, surface: vk::SurfaceKHR) -> Ownership {
        let mut state = self.state.lock();
        let ownership = state.surfaces.ownership(surface);
        if ownership == Ownership::Live {
            state.surfaces.destroy(surface);
        }
        ownership
    }

    pub fn surface_ownership(&self, surface: vk::SurfaceKHR) -> Ownership {
        self.state.lock().surfaces.ownership(surface)
    }

    pub fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> Option<vk::SurfaceCapabilitiesKHR> {
        self.state.lock().surfaces.capabilities(surface)
    }

    // -- swapchains --------------------------------------------------------

    /// Creates a virtual swapchain and resizes its surface to match.
    ///
    /// GPU allocation runs without the registry lock held.
    pub fn create_swapchain(
        &self,
        device: DeviceContext,
        request: &SwapchainRequest,
    ) -> LayerResult<vk::SwapchainKHR> {
        let swapchain = VirtualSwapchain::create(device, request)?;
        let mut state = self.state.lock();
        if !state.surfaces.set_extent(request.surface, request.extent) {
            debug!("swapchain created on a surface the layer does not own");
        }
        Ok(state.swapchains.insert(swapchain))
    }

    pub fn swapchain(&self, swapchain: vk::SwapchainKHR) -> Option<Arc<VirtualSwapchain>> {
        self.state.lock().swapchains.get(swapchain)
    }

    pub fn swapchain_ownership(&self, swapchain: vk::SwapchainKHR) -> Ownership {
        self.state.lock().swapchains.ownership(swapchain)
    }

    pub fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> LayerResult<Vec<vk::Image>> {
        self.swapchain(swapchain)
            .map(|swapchain| swapchain.images())
            .ok_or_else(|| unknown_swapchain(swapchain))
    }

    /// Acquires the next image of a virtual swapchain.
    pub fn acquire(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> LayerResult<u32> {
        let target = self
            .swapchain(swapchain)
            .ok_or_else(|| unknown_swapchain(swapchain))?;
        target.acquire(semaphore, fence)
    }

    /// Presents images of virtual swapchains, then paces.
    ///
    /// Targets are captured in order. The first target that is still live
    /// consumes `wait_semaphores`, even when its own present fails; the rest
    /// submit without waits.
    pub fn present(
        &self,
        targets: &[(vk::SwapchainKHR, u32)],
        wait_semaphores: &[vk::Semaphore],
    ) -> PresentReport {
        let resolved: Vec<_> = {
            let state = self.state.lock();
            targets
                .iter()
                .map(|&(handle, index)| (handle, state.swapchains.get(handle), index))
                .collect()
        };

        let mut presenter = self.presenter.lock();
        let mut waits = wait_semaphores;
        let results: Vec<_> = resolved
            .into_iter()
            .map(|(handle, swapchain, index)| {
                let swapchain = swapchain.ok_or_else(|| unknown_swapchain(handle))?;
                let outcome = swapchain.present(index, waits, presenter.sink.as_mut());
                waits = &[];
                if let Ok(outcome) = &outcome {
                    debug!("present of image {index}: {outcome:?}");
                }
                outcome
            })
            .collect();
        let slept = presenter.pacer.pace();
        if !slept.is_zero() {
            log::trace!("paced present by {slept:?}");
        }
        PresentReport {
            results,
            waits_pending: !waits.is_empty(),
        }
    }

    /// Destroys a virtual swapchain, reporting who owned it beforehand.
    ///
    /// When the last virtual swapchain goes away the sink gets a bounded chance
    /// to deliver a frame still in flight.
    pub fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) -> Ownership {
        let (ownership, removed, now_empty) = {
            let mut state = self.state.lock();
            let ownership = state.swapchains.ownership(swapchain);
            let removed = state.swapchains.remove(swapchain);
            (ownership, removed, state.swapchains.is_empty())
        };
        if let Some(removed) = removed {
            self.release(vec![removed], now_empty);
        }
        ownership
    }

    /// Destroys every virtual swapchain still alive on a device.
    pub fn destroy_swapchains_for_device(&self, device_key: usize) -> usize {
        let (removed, now_empty) = {
            let mut state = self.state.lock();
            let removed = state.swapchains.remove_for_device(device_key);
            (removed, state.swapchains.is_empty())
        };
        let count = removed.len();
        if count > 0 {
            warn!("device destroyed with {count} live swapchain(s); releasing them");
            self.release(removed, now_empty);
        }
        count
    }

    fn release(&self, swapchains: Vec<Arc<VirtualSwapchain>>, flush: bool) {
        // A present in progress holds its own reference; the last one out
        // frees the GPU resources.
        let mut presenter = self.presenter.lock();
        drop(swapchains);
        if flush && !presenter.sink.flush(TEARDOWN_FLUSH_TIMEOUT) {
            debug!("frame in flight was not delivered before teardown");
        }
    }
}

fn unknown_swapchain(swapchain: vk::SwapchainKHR) -> LayerError {
    use ash::vk::Handle;
    LayerError::UnknownHandle {
        kind: "swapchain",
        handle: swapchain.as_raw(),
    }
}
