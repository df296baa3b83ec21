//! Frames as they leave the GPU and as they travel on the wire.
//!
//! Wire format, per frame: `width: u32 LE`, `height: u32 LE`, then
//! `width * height * 4` bytes of pixels, row-major with no row padding, in the
//! byte order of the swapchain format (BGRA for the advertised surface format).

use std::fmt;
use std::io::{self, Read};

use ash::vk;

/// Bytes per pixel in every captured frame.
pub const BYTES_PER_PIXEL: usize = 4;
/// Size of the per-frame header.
pub const FRAME_HEADER_LEN: usize = 8;

/// Whether texels of `format` are exactly [`BYTES_PER_PIXEL`] bytes, the only
/// size a staging copy and the wire format can carry.
pub fn is_capturable_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::B8G8R8A8_UNORM
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::B8G8R8A8_SNORM
            | vk::Format::B8G8R8A8_UINT
            | vk::Format::B8G8R8A8_SINT
            | vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::R8G8B8A8_SNORM
            | vk::Format::R8G8B8A8_UINT
            | vk::Format::R8G8B8A8_SINT
            | vk::Format::A8B8G8R8_UNORM_PACK32
            | vk::Format::A8B8G8R8_SRGB_PACK32
            | vk::Format::A2R10G10B10_UNORM_PACK32
            | vk::Format::A2B10G10R10_UNORM_PACK32
            | vk::Format::B10G11R11_UFLOAT_PACK32
            | vk::Format::E5B9G9R9_UFLOAT_PACK32
    )
}

/// The fixed header in front of every frame payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let mut bytes = [0u8; FRAME_HEADER_LEN];
        bytes[..4].copy_from_slice(&self.width.to_le_bytes());
        bytes[4..].copy_from_slice(&self.height.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; FRAME_HEADER_LEN]) -> Self {
        let [w0, w1, w2, w3, h0, h1, h2, h3] = bytes;
        Self {
            width: u32::from_le_bytes([w0, w1, w2, w3]),
            height: u32::from_le_bytes([h0, h1, h2, h3]),
        }
    }

    /// Number of payload bytes following the header.
    pub fn payload_len(self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// Reads one frame from a consumer-side stream.
///
/// # Errors
///
/// Any I/O error from `reader`, including `UnexpectedEof` when the stream ends
/// inside a frame.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<(FrameHeader, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let header = FrameHeader::from_bytes(header);
    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload)?;
    Ok((header, payload))
}

/// A borrowed view of captured pixels, possibly with padded rows.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    width: u32,
    height: u32,
    row_pitch: usize,
    format: vk::Format,
    data: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Wraps `data` whose rows start every `row_pitch` bytes.
    ///
    /// Returns `None` if the pitch is shorter than a row or `data` does not
    /// cover the last row.
    pub fn new(width: u32, height: u32, row_pitch: usize, format: vk::Format, data: &'a [u8]) -> Option<Self> {
        let row_len = width as usize * BYTES_PER_PIXEL;
        if row_pitch < row_len {
            return None;
        }
        let needed = match height as usize {
            0 => 0,
            rows => row_pitch * (rows - 1) + row_len,
        };
        (data.len() >= needed).then_some(Self {
            width,
            height,
            row_pitch,
            format,
            data,
        })
    }

    /// Wraps tightly packed BGRA pixels.
    pub fn packed(width: u32, height: u32, data: &'a [u8]) -> Option<Self> {
        Self::new(
            width,
            height,
            width as usize * BYTES_PER_PIXEL,
            vk::Format::B8G8R8A8_UNORM,
            data,
        )
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            width: self.width,
            height: self.height,
        }
    }

    pub fn row_len(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn is_packed(&self) -> bool {
        self.row_pitch == self.row_len()
    }

    /// Pixel bytes of row `y` without padding.
    pub fn row(&self, y: u32) -> &'a [u8] {
        let start = y as usize * self.row_pitch;
        &self.data[start..start + self.row_len()]
    }

    pub fn rows(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.height).map(move |y| self.row(y))
    }

    /// The four bytes of pixel `(x, y)` in memory order.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = y as usize * self.row_pitch + x as usize * BYTES_PER_PIXEL;
        let mut pixel = [0u8; 4];
        pixel.copy_from_slice(&self.data[offset..offset + BYTES_PER_PIXEL]);
        pixel
    }

    /// Appends the tightly packed payload to `out`, de-striding if needed.
    pub fn write_packed(&self, out: &mut Vec<u8>) {
        if self.is_packed() {
            out.extend_from_slice(&self.data[..self.header().payload_len()]);
        } else {
            out.reserve(self.header().payload_len());
            for row in self.rows() {
                out.extend_from_slice(row);
            }
        }
    }
}

impl fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_pitch", &self.row_pitch)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Why a frame did not reach its consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// No consumer is listening yet.
    NotConnected,
    /// The previous frame is still draining into the socket.
    Backpressure,
    /// The connection failed while writing; it will be re-established.
    ConnectionLost,
    /// Dump mode already wrote its configured number of frames.
    DumpLimitReached,
    /// Writing the frame to disk failed.
    Io,
}

/// What a sink did with a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Fully handed over.
    Delivered,
    /// Accepted; the rest is written on later sends or flushes.
    Queued,
    Dropped(DropReason),
}

/// Destination of captured frames.
pub trait FrameSink: Send {
    /// Takes one frame. Must not block on a slow consumer.
    fn consume(&mut self, frame: &FrameView<'_>) -> FrameDisposition;

    /// Gives queued data up to `timeout` to drain. Returns whether nothing is
    /// left pending.
    fn flush(&mut self, timeout: std::time::Duration) -> bool {
        let _ = timeout;
        true
    }
}
