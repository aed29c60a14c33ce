//! JPEG snapshots of captured frames
//!
//! Raw frames are repacked into tightly packed planar YUV and handed to
//! turbojpeg's YUV encoder, which skips its own color conversion.
//! MJPEG and JPEG frames are already snapshots and pass through.

use bytes::Bytes;
use turbojpeg::{Compressor, Image, PixelFormat as TJPixelFormat, Subsamp, YuvImage};

use super::format::PixelFormat;
use super::frame::FrameBuffer;
use crate::error::{AppError, Result};

/// Encode `frame` as JPEG at `quality` (clamped to 1-100)
pub fn encode_jpeg(frame: &FrameBuffer, quality: u32) -> Result<Bytes> {
    if matches!(frame.format, PixelFormat::Mjpeg | PixelFormat::Jpeg) {
        return Ok(frame.data_bytes());
    }

    let width = frame.width() as usize;
    let height = frame.height() as usize;
    if width == 0 || height == 0 {
        return Err(AppError::Snapshot("frame has no size".to_string()));
    }

    let mut compressor = Compressor::new()
        .map_err(|e| AppError::Snapshot(format!("Failed to create turbojpeg compressor: {}", e)))?;
    compressor
        .set_quality(quality.clamp(1, 100) as i32)
        .map_err(|e| AppError::Snapshot(format!("Failed to set JPEG quality: {}", e)))?;

    let jpeg = match frame.format {
        PixelFormat::Yuyv | PixelFormat::Uyvy => {
            let planar = packed422_to_planar(frame, width, height)?;
            compress_yuv(&mut compressor, &planar, width, height, Subsamp::Sub2x1)?
        }
        PixelFormat::Nv12 => {
            let planar = nv12_to_i420(frame, width, height)?;
            compress_yuv(&mut compressor, &planar, width, height, Subsamp::Sub2x2)?
        }
        PixelFormat::Yuv420 => {
            let planar = i420_tight(frame, width, height)?;
            compress_yuv(&mut compressor, &planar, width, height, Subsamp::Sub2x2)?
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Grey => {
            let (format, bpp) = match frame.format {
                PixelFormat::Rgb24 => (TJPixelFormat::RGB, 3),
                PixelFormat::Bgr24 => (TJPixelFormat::BGR, 3),
                _ => (TJPixelFormat::GRAY, 1),
            };
            let pitch = row_stride(frame, width * bpp);
            require_len(frame, pitch * (height - 1) + width * bpp)?;
            if frame.format == PixelFormat::Grey {
                compressor
                    .set_subsamp(Subsamp::Gray)
                    .map_err(|e| AppError::Snapshot(format!("Failed to set subsampling: {}", e)))?;
            }
            let image = Image {
                pixels: frame.data(),
                width,
                pitch,
                height,
                format,
            };
            compressor
                .compress_to_vec(image)
                .map_err(|e| AppError::Snapshot(format!("JPEG compression failed: {}", e)))?
        }
        other => {
            return Err(AppError::Snapshot(format!(
                "Unsupported snapshot format: {}",
                other
            )))
        }
    };

    Ok(Bytes::from(jpeg))
}

fn compress_yuv(
    compressor: &mut Compressor,
    pixels: &[u8],
    width: usize,
    height: usize,
    subsamp: Subsamp,
) -> Result<Vec<u8>> {
    let image = YuvImage {
        pixels,
        width,
        height,
        align: 1,
        subsamp,
    };
    compressor
        .compress_yuv_to_vec(image)
        .map_err(|e| AppError::Snapshot(format!("JPEG compression failed: {}", e)))
}

fn row_stride(frame: &FrameBuffer, min: usize) -> usize {
    (frame.stride as usize).max(min)
}

fn require_len(frame: &FrameBuffer, needed: usize) -> Result<()> {
    if frame.len() < needed {
        return Err(AppError::Snapshot(format!(
            "{} frame too small: {} < {}",
            frame.format,
            frame.len(),
            needed
        )));
    }
    Ok(())
}

/// YUYV/UYVY -> planar 4:2:2
fn packed422_to_planar(frame: &FrameBuffer, width: usize, height: usize) -> Result<Vec<u8>> {
    let stride = row_stride(frame, width * 2);
    require_len(frame, stride * (height - 1) + width * 2)?;

    let (y_at, u_at, v_at) = match frame.format {
        PixelFormat::Uyvy => (1, 0, 2),
        _ => (0, 1, 3),
    };
    let cw = width.div_ceil(2);
    let mut out = vec![0u8; width * height + 2 * cw * height];
    let (y_plane, chroma) = out.split_at_mut(width * height);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * height);
    let data = frame.data();

    for row in 0..height {
        let src = &data[row * stride..];
        for x in 0..width {
            y_plane[row * width + x] = src[(x / 2) * 4 + y_at + (x % 2) * 2];
        }
        for cx in 0..cw {
            u_plane[row * cw + cx] = src[cx * 4 + u_at];
            v_plane[row * cw + cx] = src[cx * 4 + v_at];
        }
    }
    Ok(out)
}

/// NV12 -> I420
fn nv12_to_i420(frame: &FrameBuffer, width: usize, height: usize) -> Result<Vec<u8>> {
    let stride = row_stride(frame, width);
    let cw = width.div_ceil(2);
    let ch = height.div_ceil(2);
    let uv_base = stride * height;
    require_len(frame, uv_base + stride * (ch - 1) + cw * 2)?;

    let data = frame.data();
    let mut out = Vec::with_capacity(width * height + 2 * cw * ch);
    for row in 0..height {
        out.extend_from_slice(&data[row * stride..row * stride + width]);
    }
    let mut v = Vec::with_capacity(cw * ch);
    for row in 0..ch {
        let src = &data[uv_base + row * stride..];
        for cx in 0..cw {
            out.push(src[cx * 2]);
            v.push(src[cx * 2 + 1]);
        }
    }
    out.extend_from_slice(&v);
    Ok(out)
}

/// I420 with padded rows -> tightly packed I420
fn i420_tight(frame: &FrameBuffer, width: usize, height: usize) -> Result<Vec<u8>> {
    let cw = width.div_ceil(2);
    let ch = height.div_ceil(2);
    let stride = row_stride(frame, width);
    let cstride = stride.div_ceil(2);
    let tight = width * height + 2 * cw * ch;

    if stride == width {
        require_len(frame, tight)?;
        return Ok(frame.data()[..tight].to_vec());
    }

    let u_base = stride * height;
    let v_base = u_base + cstride * ch;
    require_len(frame, v_base + cstride * (ch - 1) + cw)?;

    let data = frame.data();
    let mut out = Vec::with_capacity(tight);
    for row in 0..height {
        out.extend_from_slice(&data[row * stride..row * stride + width]);
    }
    for base in [u_base, v_base] {
        for row in 0..ch {
            let at = base + row * cstride;
            out.extend_from_slice(&data[at..at + cw]);
        }
    }
    Ok(out)
}
