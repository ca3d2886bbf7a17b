//! Pixel layouts, frame geometry and frame rates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use v4l::format::fourcc::FourCC;

use super::timing::MediaTime;

/// Raw pixel layouts the capture side may hand us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// NV12 semi-planar (Y plane + interleaved UV at half resolution)
    Nv12,
    /// 32-bit packed B, G, R, A
    Bgra,
    /// 24-bit packed, three channel bytes per pixel
    Rgb24,
    /// Anything the frame adapter does not know how to normalize
    Unknown,
}

impl PixelFormat {
    /// Layout the encoder consumes
    pub const ENCODER_INPUT: PixelFormat = PixelFormat::Nv12;

    pub fn to_fourcc(&self) -> Option<FourCC> {
        match self {
            PixelFormat::Nv12 => Some(FourCC::new(b"NV12")),
            PixelFormat::Bgra => Some(FourCC::new(b"BGR4")),
            PixelFormat::Rgb24 => Some(FourCC::new(b"RGB3")),
            PixelFormat::Unknown => None,
        }
    }

    /// Map a V4L2 FourCC. Unrecognized codes become `Unknown` rather than an error:
    /// the device is still usable for enumeration, the adapter drops its frames.
    pub fn from_fourcc(fourcc: FourCC) -> Self {
        match &fourcc.repr {
            b"NV12" => PixelFormat::Nv12,
            b"BGR4" | b"XR24" | b"AR24" => PixelFormat::Bgra,
            b"RGB3" => PixelFormat::Rgb24,
            _ => PixelFormat::Unknown,
        }
    }

    /// Bytes per pixel of the first (or only) plane
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Nv12 => Some(1),
            PixelFormat::Bgra => Some(4),
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Unknown => None,
        }
    }

    /// Tightly packed frame size, if the layout is known
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = resolution.width as usize * resolution.height as usize;
        match self {
            PixelFormat::Nv12 => Some(pixels * 3 / 2),
            PixelFormat::Bgra => Some(pixels * 4),
            PixelFormat::Rgb24 => Some(pixels * 3),
            PixelFormat::Unknown => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NV12" => Ok(PixelFormat::Nv12),
            "BGRA" | "BGR32" | "BGR4" => Ok(PixelFormat::Bgra),
            "RGB24" | "RGB3" => Ok(PixelFormat::Rgb24),
            "UNKNOWN" => Ok(PixelFormat::Unknown),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// H.264 4:2:0 needs even dimensions; anything else is rejected at startup.
    pub fn is_valid(&self) -> bool {
        self.width >= 16
            && self.height >= 16
            && self.width <= 7680
            && self.height <= 4320
            && self.width % 2 == 0
            && self.height % 2 == 0
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Frames per second as an exact ratio (e.g. 30000/1001)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub const fn from_fps(fps: u32) -> Self {
        Self::new(fps, 1)
    }

    pub fn is_valid(&self) -> bool {
        self.numerator > 0 && self.denominator > 0
    }

    /// Exact duration of one frame
    pub fn frame_duration(&self) -> MediaTime {
        MediaTime::new(self.denominator as u128, self.numerator.max(1) as u128)
    }

    /// Rounded frame interval, for sleeping
    pub fn interval(&self) -> Duration {
        self.frame_duration().to_duration()
    }

    pub fn as_f32(&self) -> f32 {
        self.numerator as f32 / self.denominator.max(1) as f32
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::from_fps(30)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{} fps", self.numerator)
        } else {
            write!(f, "{}/{} fps", self.numerator, self.denominator)
        }
    }
}
