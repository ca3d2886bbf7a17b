//! Frame and sample types passed between pipeline stages

use bytes::Bytes;
use std::time::Duration;

use super::format::{PixelFormat, Resolution};

/// One raw frame as delivered by a capture device.
///
/// Borrowed from the device's buffer; it is only valid for the duration of
/// the sample callback.
#[derive(Debug, Clone, Copy)]
pub struct CapturedSample<'a> {
    /// Capture-domain timestamp reported by the device
    pub timestamp: Duration,
    pub data: &'a [u8],
    pub frame_id: u64,
}

impl CapturedSample<'_> {
    pub fn byte_count(&self) -> usize {
        self.data.len()
    }
}

/// Geometry of the raw frames a device produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Bytes per row of the first plane
    pub stride: usize,
}

impl FrameGeometry {
    /// Geometry with rows packed tightly
    pub fn packed(resolution: Resolution, format: PixelFormat) -> Self {
        let bpp = format.bytes_per_pixel().unwrap_or(0);
        Self {
            resolution,
            format,
            stride: resolution.width as usize * bpp,
        }
    }
}

/// One encoded access unit ready for broadcast
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub data: Bytes,
    pub frame_id: u64,
    /// Timestamp of the raw frame this was encoded from
    pub captured_at: Duration,
}

/// Pixel layouts an encoder staging frame can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingLayout {
    /// Encoder input layout
    Nv12,
    /// Intermediate layout awaiting colorspace conversion
    Bgra,
}

impl StagingLayout {
    fn row_bytes(&self, width: u32) -> usize {
        match self {
            StagingLayout::Nv12 => width as usize,
            StagingLayout::Bgra => width as usize * 4,
        }
    }
}

/// Reusable frame buffer with a row pitch that may exceed the visible width.
///
/// NV12 frames store the UV plane directly after `height` luma rows, using
/// the same pitch.
#[derive(Debug, Clone)]
pub struct StagingFrame {
    layout: StagingLayout,
    resolution: Resolution,
    stride: usize,
    data: Vec<u8>,
}

impl StagingFrame {
    /// Allocate with rows padded up to a multiple of `row_alignment` bytes.
    pub fn new(layout: StagingLayout, resolution: Resolution, row_alignment: usize) -> Self {
        let row = layout.row_bytes(resolution.width);
        let align = row_alignment.max(1);
        let stride = row.div_ceil(align) * align;
        Self::with_stride(layout, resolution, stride)
    }

    /// Allocate with an explicit row pitch; pitches narrower than a row are widened.
    pub fn with_stride(layout: StagingLayout, resolution: Resolution, stride: usize) -> Self {
        let stride = stride.max(layout.row_bytes(resolution.width));
        let height = resolution.height as usize;
        let rows = match layout {
            StagingLayout::Nv12 => height + height.div_ceil(2),
            StagingLayout::Bgra => height,
        };
        Self {
            layout,
            resolution,
            stride,
            data: vec![0u8; stride * rows],
        }
    }

    pub fn layout(&self) -> StagingLayout {
        self.layout
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Visible bytes per row
    pub fn row_bytes(&self) -> usize {
        self.layout.row_bytes(self.resolution.width)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Luma plane (NV12) or the whole image (BGRA)
    pub fn plane(&self) -> &[u8] {
        &self.data[..self.stride * self.resolution.height as usize]
    }

    /// Interleaved UV plane; empty for BGRA
    pub fn uv_plane(&self) -> &[u8] {
        match self.layout {
            StagingLayout::Nv12 => &self.data[self.stride * self.resolution.height as usize..],
            StagingLayout::Bgra => &[],
        }
    }

    /// Split into (luma, uv) planes for simultaneous writes
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let offset = self.stride * self.resolution.height as usize;
        self.data.split_at_mut(offset)
    }
}
