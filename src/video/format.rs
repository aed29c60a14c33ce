//! Pixel format definitions and conversions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l2r::PixelFormat as V4l2rPixelFormat;

/// Supported pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// H.264 elementary stream (hardware encoder output)
    H264,
    /// MJPEG compressed format
    Mjpeg,
    /// JPEG compressed format
    Jpeg,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// UYVY 4:2:2 packed format
    Uyvy,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar format (I420)
    Yuv420,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// BGR24 format (3 bytes per pixel)
    Bgr24,
    /// Grayscale format
    Grey,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC bytes
    pub fn to_fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::H264 => *b"H264",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Jpeg => *b"JPEG",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Yuv420 => *b"YU12",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Grey => *b"GREY",
        }
    }

    /// Try to convert from V4L2 FourCC bytes
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"H264" => Some(PixelFormat::H264),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"JPEG" => Some(PixelFormat::Jpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"NV12" | b"NM12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"GREY" | b"Y800" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    pub fn to_v4l2r(&self) -> V4l2rPixelFormat {
        V4l2rPixelFormat::from(&self.to_fourcc())
    }

    pub fn from_v4l2r(format: V4l2rPixelFormat) -> Option<Self> {
        Self::from_fourcc(&u32::from(format).to_le_bytes())
    }

    /// Check if format is compressed (variable frame size)
    pub fn is_compressed(&self) -> bool {
        matches!(
            self,
            PixelFormat::H264 | PixelFormat::Mjpeg | PixelFormat::Jpeg
        )
    }

    /// Inter-frame coded formats need a keyframe before anything is decodable
    pub fn needs_keyframe(&self) -> bool {
        matches!(self, PixelFormat::H264)
    }

    /// Get bytes per pixel for packed formats
    /// Returns None for compressed and planar formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Grey => Some(1),
            _ => None,
        }
    }

    /// Calculate expected frame size for a given resolution
    /// Returns None for compressed formats (variable size)
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = (resolution.width * resolution.height) as usize;
        match self {
            PixelFormat::H264 | PixelFormat::Mjpeg | PixelFormat::Jpeg => None,
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(pixels * 2),
            PixelFormat::Nv12 | PixelFormat::Yuv420 => Some(pixels * 3 / 2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
            PixelFormat::Grey => Some(pixels),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::H264 => "H264",
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Jpeg => "JPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Grey => "GREY",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "H264" => Ok(PixelFormat::H264),
            "MJPEG" | "MJPG" => Ok(PixelFormat::Mjpeg),
            "JPEG" => Ok(PixelFormat::Jpeg),
            "YUYV" => Ok(PixelFormat::Yuyv),
            "UYVY" => Ok(PixelFormat::Uyvy),
            "NV12" => Ok(PixelFormat::Nv12),
            "YUV420" | "I420" => Ok(PixelFormat::Yuv420),
            "RGB24" => Ok(PixelFormat::Rgb24),
            "BGR24" => Ok(PixelFormat::Bgr24),
            "GREY" | "GRAY" => Ok(PixelFormat::Grey),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Render a raw fourcc for logs, e.g. `YUYV`
pub fn fourcc_str(fourcc: &[u8; 4]) -> String {
    fourcc
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
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

    /// `0x0` asks the driver to keep whatever size it already has
    pub fn is_unspecified(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Common resolutions
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
