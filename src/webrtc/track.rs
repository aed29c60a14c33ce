//! H.264 video track fed from the capture broadcast

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::video::format::PixelFormat;
use crate::video::frame::FrameBuffer;

/// Video track configuration
#[derive(Debug, Clone)]
pub struct VideoTrackConfig {
    /// Track ID
    pub track_id: String,
    /// Stream ID
    pub stream_id: String,
    /// Clock rate
    pub clock_rate: u32,
    /// Nominal frame rate, used until two frame timestamps are known
    pub fps: u32,
}

impl Default for VideoTrackConfig {
    fn default() -> Self {
        Self {
            track_id: "video0".to_string(),
            stream_id: "camstream".to_string(),
            clock_rate: 90000,
            fps: 30,
        }
    }
}

/// H.264 codec capability offered on the track
pub fn h264_capability(clock_rate: u32) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    }
}

/// Video track for WebRTC streaming
pub struct VideoTrack {
    config: VideoTrackConfig,
    track: Arc<TrackLocalStaticSample>,
    running: Arc<watch::Sender<bool>>,
}

impl VideoTrack {
    /// Create a new video track
    pub fn new(config: VideoTrackConfig) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            h264_capability(config.clock_rate),
            config.track_id.clone(),
            config.stream_id.clone(),
        ));
        let (running_tx, _) = watch::channel(false);

        Self {
            config,
            track,
            running: Arc::new(running_tx),
        }
    }

    /// Underlying sample track, for attaching to a peer connection
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Start forwarding frames from a broadcast receiver
    pub fn start_sending(&self, mut frame_rx: broadcast::Receiver<FrameBuffer>) {
        if self.running.send_replace(true) {
            debug!("Video track already sending");
            return;
        }
        let track = self.track.clone();
        let fps = self.config.fps.max(1);
        let mut running_rx = self.running.subscribe();

        info!("Starting video track sender");

        tokio::spawn(async move {
            let mut last_timestamp: Option<Duration> = None;
            let mut skipped: u64 = 0;
            loop {
                tokio::select! {
                    result = frame_rx.recv() => {
                        match result {
                            Ok(frame) => {
                                if frame.format != PixelFormat::H264 {
                                    skipped += 1;
                                    if skipped == 1 {
                                        warn!("Video track skips {} frames, only H264 is sent", frame.format);
                                    }
                                    continue;
                                }
                                let duration = frame_duration(last_timestamp, frame.timestamp, fps);
                                last_timestamp = Some(frame.timestamp);
                                let sample = Sample {
                                    data: frame.data_bytes(),
                                    duration,
                                    ..Default::default()
                                };
                                if let Err(e) = track.write_sample(&sample).await {
                                    debug!("Failed to write sample: {}", e);
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!("Video track lagged by {} frames", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Frame channel closed");
                                break;
                            }
                        }
                    }
                    _ = running_rx.changed() => {
                        if !*running_rx.borrow() {
                            debug!("Video track stopped");
                            break;
                        }
                    }
                }
            }

            info!("Video track sender stopped");
        });
    }

    /// Stop sending
    pub fn stop(&self) {
        let _ = self.running.send(false);
    }
}

/// Sample duration from consecutive capture timestamps, falling back to 1/fps
fn frame_duration(previous: Option<Duration>, current: Duration, fps: u32) -> Duration {
    let nominal = Duration::from_secs(1) / fps;
    match previous {
        Some(prev) if current > prev => {
            let delta = current - prev;
            // A stall should not stretch one sample across seconds
            if delta > nominal * 10 {
                nominal
            } else {
                delta
            }
        }
        _ => nominal,
    }
}
