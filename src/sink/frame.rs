//! Decoded input frames and their layout

use crate::assets::{FALLBACK_CAPS_FRAME_RATE, INPUT_STRIDE_ALIGN};
use crate::buffer::allocator::align_up;
use crate::error::{Result, SinkError};
use bytes::Bytes;
use drm_fourcc::DrmFourcc;
use std::str::FromStr;

/// Planar layouts accepted from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Luma plane followed by one interleaved UV plane
    Nv12,
    /// Luma plane followed by separate U and V planes
    I420,
}

impl PixelLayout {
    pub fn fourcc(&self) -> DrmFourcc {
        match self {
            PixelLayout::Nv12 => DrmFourcc::Nv12,
            PixelLayout::I420 => DrmFourcc::Yuv420,
        }
    }
}

impl FromStr for PixelLayout {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NV12" | "nv12" => Ok(PixelLayout::Nv12),
            "I420" | "i420" => Ok(PixelLayout::I420),
            other => Err(SinkError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelLayout::Nv12 => write!(f, "NV12"),
            PixelLayout::I420 => write!(f, "I420"),
        }
    }
}

/// Stream description negotiated upstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub frame_rate: f64,
}

impl VideoInfo {
    /// A zero or negative frame rate is replaced by 60 fps.
    pub fn new(width: u32, height: u32, layout: PixelLayout, frame_rate: f64) -> Self {
        let frame_rate = if frame_rate > 0.0 {
            frame_rate
        } else {
            FALLBACK_CAPS_FRAME_RATE
        };
        Self {
            width,
            height,
            layout,
            frame_rate,
        }
    }

    /// Row stride of the input luma plane.
    pub fn input_stride(&self) -> usize {
        align_up(self.width, INPUT_STRIDE_ALIGN) as usize
    }

    /// Bytes one input frame occupies.
    pub fn frame_size(&self) -> usize {
        let stride = self.input_stride();
        let rows = self.height as usize;
        match self.layout {
            PixelLayout::Nv12 => stride * rows + stride * (rows / 2),
            PixelLayout::I420 => stride * rows + 2 * (stride / 2) * (rows / 2),
        }
    }
}

/// One decoded frame from upstream.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    /// Presentation time in nanoseconds.
    pub pts: Option<u64>,
    /// Set when upstream flagged a timestamp discontinuity.
    pub discontinuity: bool,
}

impl VideoFrame {
    pub fn new(data: impl Into<Bytes>, pts: Option<u64>) -> Self {
        Self {
            data: data.into(),
            pts,
            discontinuity: false,
        }
    }

    pub fn with_discontinuity(mut self, discontinuity: bool) -> Self {
        self.discontinuity = discontinuity;
        self
    }
}

/// Destination plane for [`copy_planes`].
pub struct PlaneTarget<'a> {
    pub data: &'a mut [u8],
    pub pitch: usize,
}

fn copy_rows(src: &[u8], src_stride: usize, dst: &mut PlaneTarget<'_>, rows: usize) {
    let len = src_stride.min(dst.pitch);
    for (src_row, dst_row) in src
        .chunks(src_stride)
        .zip(dst.data.chunks_mut(dst.pitch))
        .take(rows)
    {
        let n = len.min(src_row.len()).min(dst_row.len());
        dst_row[..n].copy_from_slice(&src_row[..n]);
    }
}

/// Copies an input frame into an NV12 luma plane and an interleaved chroma
/// plane, honoring the destination pitches.
pub fn copy_planes(
    info: &VideoInfo,
    src: &[u8],
    luma: &mut PlaneTarget<'_>,
    chroma: &mut PlaneTarget<'_>,
) -> Result<()> {
    let expected = info.frame_size();
    if src.len() < expected {
        return Err(SinkError::ShortFrame {
            got: src.len(),
            expected,
        });
    }

    let stride = info.input_stride();
    let rows = info.height as usize;
    let chroma_rows = rows / 2;
    let (y, uv) = src.split_at(stride * rows);

    copy_rows(y, stride, luma, rows);

    match info.layout {
        PixelLayout::Nv12 => copy_rows(uv, stride, chroma, chroma_rows),
        PixelLayout::I420 => {
            let uv_stride = stride / 2;
            let (u, v) = uv.split_at(uv_stride * chroma_rows);
            let cols = (info.width as usize / 2).min(chroma.pitch / 2);

            for (row, dst_row) in chroma.data.chunks_mut(chroma.pitch).take(chroma_rows).enumerate() {
                let u_row = &u[row * uv_stride..];
                let v_row = &v[row * uv_stride..];
                for (col, pair) in dst_row.chunks_exact_mut(2).take(cols).enumerate() {
                    pair[0] = u_row[col];
                    pair[1] = v_row[col];
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_names() {
        assert_eq!("NV12".parse::<PixelLayout>().unwrap(), PixelLayout::Nv12);
        assert_eq!("I420".parse::<PixelLayout>().unwrap(), PixelLayout::I420);
        assert!(matches!(
            "YUY2".parse::<PixelLayout>(),
            Err(SinkError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_zero_rate_falls_back() {
        let info = VideoInfo::new(1280, 720, PixelLayout::Nv12, 0.0);
        assert_eq!(info.frame_rate, 60.0);
    }

    #[test]
    fn test_frame_sizes() {
        let nv12 = VideoInfo::new(6, 4, PixelLayout::Nv12, 30.0);
        assert_eq!(nv12.input_stride(), 8);
        assert_eq!(nv12.frame_size(), 8 * 4 + 8 * 2);

        let i420 = VideoInfo::new(6, 4, PixelLayout::I420, 30.0);
        assert_eq!(i420.frame_size(), 8 * 4 + 2 * 4 * 2);
    }

    #[test]
    fn test_nv12_copy_respects_pitch() {
        let info = VideoInfo::new(4, 2, PixelLayout::Nv12, 30.0);
        let src: Vec<u8> = (0..12).collect();
        let mut y = vec![0xFF; 16];
        let mut uv = vec![0xFF; 8];

        copy_planes(
            &info,
            &src,
            &mut PlaneTarget { data: &mut y, pitch: 8 },
            &mut PlaneTarget { data: &mut uv, pitch: 8 },
        )
        .unwrap();

        assert_eq!(&y[..4], &[0, 1, 2, 3]);
        assert_eq!(&y[4..8], &[0xFF; 4]);
        assert_eq!(&y[8..12], &[4, 5, 6, 7]);
        assert_eq!(&uv[..4], &[8, 9, 10, 11]);
        assert_eq!(&uv[4..], &[0xFF; 4]);
    }

    #[test]
    fn test_i420_chroma_is_interleaved() {
        let info = VideoInfo::new(4, 2, PixelLayout::I420, 30.0);
        // Y: 8 bytes, U: 2 bytes, V: 2 bytes
        let src = [0, 0, 0, 0, 0, 0, 0, 0, 10, 11, 20, 21];
        let mut y = vec![0; 8];
        let mut uv = vec![0; 4];

        copy_planes(
            &info,
            &src,
            &mut PlaneTarget { data: &mut y, pitch: 4 },
            &mut PlaneTarget { data: &mut uv, pitch: 4 },
        )
        .unwrap();

        assert_eq!(uv, vec![10, 20, 11, 21]);
    }

    #[test]
    fn test_short_input_rejected() {
        let info = VideoInfo::new(64, 64, PixelLayout::Nv12, 30.0);
        let mut y = vec![0; 64 * 64];
        let mut uv = vec![0; 64 * 32];
        let result = copy_planes(
            &info,
            &[0; 100],
            &mut PlaneTarget { data: &mut y, pitch: 64 },
            &mut PlaneTarget { data: &mut uv, pitch: 64 },
        );
        assert!(matches!(result, Err(SinkError::ShortFrame { got: 100, .. })));
    }
}
