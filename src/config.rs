//! Environment-driven configuration.
//!
//! The layer is loaded into someone else's process, so configuration can never
//! fail: unparsable values are logged and replaced by their defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use ash::vk;
use log::warn;

/// Set to `1` by the loader manifest's `enable_environment`.
pub const ENABLE_ENV: &str = "HEADLESS_LAYER";
/// Set to `1` to make the layer a pure pass-through.
pub const DISABLE_ENV: &str = "DISABLE_HEADLESS_LAYER";
pub const HOST_ENV: &str = "HEADLESS_LAYER_HOST";
pub const PORT_ENV: &str = "HEADLESS_LAYER_PORT";
pub const FPS_ENV: &str = "HEADLESS_LAYER_FPS";
pub const WIDTH_ENV: &str = "HEADLESS_LAYER_WIDTH";
pub const HEIGHT_ENV: &str = "HEADLESS_LAYER_HEIGHT";
pub const DUMP_FRAMES_ENV: &str = "HEADLESS_LAYER_DUMP_FRAMES";
pub const DUMP_DIR_ENV: &str = "HEADLESS_LAYER_DUMP_DIR";
pub const MASK_EXTENSIONS_ENV: &str = "HEADLESS_LAYER_MASK_EXTENSIONS";
pub const LOG_ENV: &str = "HEADLESS_LAYER_LOG";

/// Default frame consumer port on the loopback interface.
pub const DEFAULT_PORT: u16 = 19850;
/// Default pacing target, roughly 120 presents per second.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_nanos(8_333_333);
/// Size given to surfaces before any swapchain resizes them.
pub const DEFAULT_SURFACE_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1920,
    height: 1080,
};
const DEFAULT_DUMP_DIR: &str = "/tmp/headless-layer-frames";
const DEFAULT_LOG_FILTER: &str = "info";

/// Diagnostic mode: write frames to disk instead of streaming them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpConfig {
    /// Number of frames written before further frames are discarded.
    pub frames: u32,
    /// Directory receiving `frame_NNNN.png` files and `summary.txt`.
    pub directory: PathBuf,
}

/// Runtime configuration of the layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerConfig {
    /// When false, only the chain plumbing is intercepted.
    pub enabled: bool,
    /// Frame consumer address.
    pub endpoint: SocketAddr,
    /// Minimum time between presents; `None` disables pacing.
    pub frame_interval: Option<Duration>,
    /// Initial size of every virtual surface.
    pub surface_extent: vk::Extent2D,
    /// Dump mode settings, if enabled.
    pub dump: Option<DumpConfig>,
    /// Device extensions hidden from the application and the driver.
    pub masked_device_extensions: Vec<String>,
    /// `env_logger` filter directive.
    pub log_filter: String,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            frame_interval: Some(DEFAULT_FRAME_INTERVAL),
            surface_extent: DEFAULT_SURFACE_EXTENT,
            dump: None,
            masked_device_extensions: Vec::new(),
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
        }
    }
}

impl LayerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup.
    ///
    /// # Examples
    ///
    /// ```
    /// use vk_headless_present::LayerConfig;
    ///
    /// let config = LayerConfig::from_lookup(|name| match name {
    ///     "HEADLESS_LAYER_PORT" => Some("20000".to_owned()),
    ///     "HEADLESS_LAYER_FPS" => Some("0".to_owned()),
    ///     _ => None,
    /// });
    /// assert_eq!(config.endpoint.port(), 20000);
    /// assert_eq!(config.frame_interval, None);
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let enabled = !var(DISABLE_ENV).is_some_and(|v| is_truthy(&v));

        let host = parse_or(var(HOST_ENV), HOST_ENV, defaults.endpoint.ip());
        let port = parse_or(var(PORT_ENV), PORT_ENV, defaults.endpoint.port());

        let frame_interval = match var(FPS_ENV).map(|raw| (raw.parse::<u32>(), raw)) {
            None => defaults.frame_interval,
            Some((Ok(0), _)) => None,
            Some((Ok(fps), _)) => Some(Duration::from_nanos(1_000_000_000 / u64::from(fps))),
            Some((Err(_), raw)) => {
                warn!("ignoring {FPS_ENV}={raw:?}: not a valid value");
                defaults.frame_interval
            }
        };

        let surface_extent = vk::Extent2D {
            width: parse_extent(var(WIDTH_ENV), WIDTH_ENV, defaults.surface_extent.width),
            height: parse_extent(var(HEIGHT_ENV), HEIGHT_ENV, defaults.surface_extent.height),
        };

        let dump = match parse_or(var(DUMP_FRAMES_ENV), DUMP_FRAMES_ENV, 0u32) {
            0 => None,
            frames => Some(DumpConfig {
                frames,
                directory: var(DUMP_DIR_ENV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DUMP_DIR)),
            }),
        };

        let masked_device_extensions = var(MASK_EXTENSIONS_ENV)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            enabled,
            endpoint: SocketAddr::new(host, port),
            frame_interval,
            surface_extent,
            dump,
            masked_device_extensions,
            log_filter: var(LOG_ENV).unwrap_or(defaults.log_filter),
        }
    }
}

/// Installs the global `env_logger` once; later calls are ignored.
pub fn init_logging(config: &LayerConfig) {
    let _ = env_logger::Builder::new()
        .parse_filters(&config.log_filter)
        .format_timestamp_millis()
        .target(env_logger::Target::Stderr)
        .try_init();
}

fn is_truthy(raw: &str) -> bool {
    raw == "1"
        || raw.eq_ignore_ascii_case("true")
        || raw.eq_ignore_ascii_case("yes")
        || raw.eq_ignore_ascii_case("on")
}

fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring {name}={raw:?}: not a valid value");
            default
        }),
    }
}

fn parse_extent(raw: Option<String>, name: &str, default: u32) -> u32 {
    match parse_or(raw, name, default) {
        0 => {
            warn!("ignoring {name}=0: surfaces need a non-zero extent");
            default
        }
        value => value.min(crate::surface::MAX_EXTENT),
    }
}
