use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::actuator::uart::validate_baud_rate;
use crate::error::{AppError, Result};
use crate::video::capture::CaptureConfig;
use crate::video::codec::CodecConfig;
use crate::video::format::{PixelFormat, Resolution};
use crate::webrtc::config::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Video capture settings
    pub video: VideoConfig,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
    /// Drive actuator settings
    pub actuator: ActuatorConfig,
    /// Recording lookup settings
    pub recording: RecordingConfig,
    /// Signaling endpoint settings
    pub signaling: SignalingConfig,
}

impl AppConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Reject values the hardware cannot be asked for
    pub fn validate(&self) -> Result<()> {
        self.video.validate()?;
        if self.actuator.enabled {
            validate_baud_rate(self.actuator.baud_rate)?;
        }
        if self.webrtc.peer_timeout_secs == 0 {
            return Err(AppError::Config("peer_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    /// Video device path (e.g., /dev/video0)
    pub device: String,
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
    /// Video pixel format (e.g., "YUYV", "NV12", "H264")
    pub format: String,
    /// Number of capture buffers
    pub buffer_count: u32,
    /// Rotation in degrees
    pub rotation: i32,
    /// Hardware M2M encoder for raw sources (e.g., /dev/video11)
    pub encoder_device: Option<String>,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Export DMA-BUF handles for zero-copy hand-off
    pub dma_export: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            format: "YUYV".to_string(),
            buffer_count: 4,
            rotation: 0,
            encoder_device: None,
            bitrate: 10_000_000,
            dma_export: false,
        }
    }
}

impl VideoConfig {
    pub fn pixel_format(&self) -> Result<PixelFormat> {
        self.format
            .parse()
            .map_err(|e: String| AppError::Config(format!("video.format: {}", e)))
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AppError::Config(format!(
                "video size {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(AppError::Config("video.buffer_count must be positive".into()));
        }
        if self.rotation % 90 != 0 {
            return Err(AppError::Config(format!(
                "video.rotation {} is not a multiple of 90",
                self.rotation
            )));
        }
        self.pixel_format()?;
        Ok(())
    }

    /// Capture engine settings
    pub fn capture_config(&self) -> Result<CaptureConfig> {
        Ok(CaptureConfig {
            device_path: PathBuf::from(&self.device),
            resolution: self.resolution(),
            format: self.pixel_format()?,
            fps: self.fps,
            buffer_count: self.buffer_count,
            rotation: self.rotation,
            bitrate: self.bitrate,
            dma_export: self.dma_export,
        })
    }

    /// Encoder settings for raw capture, when an encoder is configured
    pub fn encoder_config(&self) -> Result<Option<(PathBuf, CodecConfig)>> {
        let Some(device) = &self.encoder_device else {
            return Ok(None);
        };
        let format = self.pixel_format()?;
        if format.is_compressed() {
            return Ok(None);
        }
        Ok(Some((
            PathBuf::from(device),
            CodecConfig::encoder(format, self.resolution(), self.bitrate, self.fps),
        )))
    }
}

/// Drive actuator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Open the serial motor controller at startup
    pub enabled: bool,
    /// Serial port path
    pub device: String,
    /// Serial baud rate
    pub baud_rate: u32,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
        }
    }
}

/// Recording lookup configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory of `.mp4` recordings with `.jpg` thumbnails beside them
    pub record_path: Option<PathBuf>,
}

/// Signaling endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// TCP listen address
    pub listen: SocketAddr,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8765)),
        }
    }
}
