//! Pixel layouts and color conversion for the video pipeline.
//!
//! Every raw frame is normalised to **NV21** on intake (full-resolution
//! Y plane followed by an interleaved V/U plane at quarter resolution).
//! The scheduler then converts the working NV21 buffer into whatever
//! layout the active encoder asked for.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

// ── ColorFormat ──────────────────────────────────────────────────

/// Planar YUV 4:2:0 layouts understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    /// Y plane, then interleaved V/U (camera default).
    Nv21,
    /// Y plane, then interleaved U/V (a.k.a. NV12).
    Yuv420SemiPlanar,
    /// Y plane, then a U plane, then a V plane (a.k.a. I420).
    Yuv420Planar,
}

impl ColorFormat {
    /// Bytes needed for a `width × height` frame in this layout.
    pub const fn buffer_size(self, width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        luma + luma / 2
    }
}

// ── Camera orientation ───────────────────────────────────────────

/// Which physical camera is feeding the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

bitflags! {
    /// Orientation fix-ups applied while a raw frame is copied into its slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CameraDirection: u32 {
        const FLIP_HORIZONTAL = 0b0001;
        const FLIP_VERTICAL   = 0b0010;
        const ROTATE_180      = Self::FLIP_HORIZONTAL.bits() | Self::FLIP_VERTICAL.bits();
    }
}

// ── Intake ───────────────────────────────────────────────────────

/// Copy a raw camera frame into an NV21 slot buffer, applying `direction`.
///
/// `format` describes `src`; only the semi-planar layouts can come out
/// of a camera, so [`ColorFormat::Yuv420Planar`] is rejected.
pub fn accept_frame(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    format: ColorFormat,
    direction: CameraDirection,
) -> Result<(), StreamError> {
    let expected = format.buffer_size(width, height);
    if src.len() < expected {
        return Err(StreamError::FrameSize {
            expected,
            actual: src.len(),
        });
    }
    if dst.len() < expected {
        return Err(StreamError::FrameSize {
            expected,
            actual: dst.len(),
        });
    }
    let swap_chroma = match format {
        ColorFormat::Nv21 => false,
        ColorFormat::Yuv420SemiPlanar => true,
        ColorFormat::Yuv420Planar => {
            return Err(StreamError::UnsupportedFormat(
                "planar camera input".into(),
            ));
        }
    };

    let (w, h) = (width as usize, height as usize);
    let flip_h = direction.contains(CameraDirection::FLIP_HORIZONTAL);
    let flip_v = direction.contains(CameraDirection::FLIP_VERTICAL);

    if direction.is_empty() {
        dst[..w * h].copy_from_slice(&src[..w * h]);
    } else {
        for row in 0..h {
            let src_row = if flip_v { h - 1 - row } else { row };
            let s = &src[src_row * w..(src_row + 1) * w];
            let d = &mut dst[row * w..(row + 1) * w];
            if flip_h {
                for (o, i) in d.iter_mut().zip(s.iter().rev()) {
                    *o = *i;
                }
            } else {
                d.copy_from_slice(s);
            }
        }
    }

    // Chroma: (w/2 × h/2) pairs.
    let luma = w * h;
    let (cw, ch) = (w / 2, h / 2);
    for row in 0..ch {
        let src_row = if flip_v { ch - 1 - row } else { row };
        for col in 0..cw {
            let src_col = if flip_h { cw - 1 - col } else { col };
            let s = luma + (src_row * cw + src_col) * 2;
            let d = luma + (row * cw + col) * 2;
            let (a, b) = (src[s], src[s + 1]);
            if swap_chroma {
                dst[d] = b;
                dst[d + 1] = a;
            } else {
                dst[d] = a;
                dst[d + 1] = b;
            }
        }
    }
    Ok(())
}

// ── Encoder-side conversion ──────────────────────────────────────

/// Convert an NV21 frame into `target`.
///
/// `pixels` is `width * height`.
pub fn convert_nv21(src: &[u8], dst: &mut [u8], pixels: usize, target: ColorFormat) {
    match target {
        ColorFormat::Nv21 => {
            let len = pixels * 3 / 2;
            dst[..len].copy_from_slice(&src[..len]);
        }
        ColorFormat::Yuv420SemiPlanar => nv21_to_yuv420sp(src, dst, pixels),
        ColorFormat::Yuv420Planar => nv21_to_yuv420p(src, dst, pixels),
    }
}

/// NV21 → NV12: copy luma, swap each chroma pair.
pub fn nv21_to_yuv420sp(src: &[u8], dst: &mut [u8], pixels: usize) {
    dst[..pixels].copy_from_slice(&src[..pixels]);
    let chroma = &src[pixels..pixels * 3 / 2];
    for (out, pair) in dst[pixels..pixels * 3 / 2]
        .chunks_exact_mut(2)
        .zip(chroma.chunks_exact(2))
    {
        out[0] = pair[1];
        out[1] = pair[0];
    }
}

/// NV21 → I420: copy luma, de-interleave chroma into U then V planes.
pub fn nv21_to_yuv420p(src: &[u8], dst: &mut [u8], pixels: usize) {
    dst[..pixels].copy_from_slice(&src[..pixels]);
    let quarter = pixels / 4;
    let chroma = &src[pixels..pixels * 3 / 2];
    let (u_plane, v_plane) = dst[pixels..pixels + quarter * 2].split_at_mut(quarter);
    for (i, pair) in chroma.chunks_exact(2).enumerate() {
        v_plane[i] = pair[0];
        u_plane[i] = pair[1];
    }
}

/// NV21 → packed ARGB (`0xAARRGGBB`) using BT.601 limited-range maths.
pub fn nv21_to_argb(src: &[u8], width: u32, height: u32) -> Vec<u32> {
    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    let mut out = Vec::with_capacity(luma);
    for row in 0..h {
        for col in 0..w {
            let y = src[row * w + col] as i32;
            let c = luma + (row / 2) * w + (col & !1);
            let v = src[c] as i32 - 128;
            let u = src[c + 1] as i32 - 128;
            let y = (y - 16).max(0) * 1192;
            let r = (y + 1634 * v).clamp(0, 262_143) >> 10;
            let g = (y - 833 * v - 400 * u).clamp(0, 262_143) >> 10;
            let b = (y + 2066 * u).clamp(0, 262_143) >> 10;
            out.push(0xFF00_0000 | ((r as u32) << 16) | ((g as u32) << 8) | b as u32);
        }
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// 4×2 NV21 frame: luma 0..8, chroma pairs (V, U) = (100, 200), (101, 201).
    fn tiny_nv21() -> Vec<u8> {
        vec![0, 1, 2, 3, 4, 5, 6, 7, 100, 200, 101, 201]
    }

    #[test]
    fn buffer_size_is_one_and_a_half_planes() {
        assert_eq!(ColorFormat::Nv21.buffer_size(640, 480), 640 * 480 * 3 / 2);
    }

    #[test]
    fn nv21_to_nv12_swaps_pairs() {
        let src = tiny_nv21();
        let mut dst = vec![0; src.len()];
        nv21_to_yuv420sp(&src, &mut dst, 8);
        assert_eq!(&dst[..8], &src[..8]);
        assert_eq!(&dst[8..], &[200, 100, 201, 101]);
    }

    #[test]
    fn nv21_to_i420_splits_planes() {
        let src = tiny_nv21();
        let mut dst = vec![0; src.len()];
        nv21_to_yuv420p(&src, &mut dst, 8);
        assert_eq!(&dst[8..], &[200, 201, 100, 101]);
    }

    #[test]
    fn accept_without_direction_is_a_copy() {
        let src = tiny_nv21();
        let mut dst = vec![0; src.len()];
        accept_frame(&src, &mut dst, 4, 2, ColorFormat::Nv21, CameraDirection::empty()).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn accept_flips_horizontally() {
        let src = tiny_nv21();
        let mut dst = vec![0; src.len()];
        accept_frame(
            &src,
            &mut dst,
            4,
            2,
            ColorFormat::Nv21,
            CameraDirection::FLIP_HORIZONTAL,
        )
        .unwrap();
        assert_eq!(&dst[..8], &[3, 2, 1, 0, 7, 6, 5, 4]);
        assert_eq!(&dst[8..], &[101, 201, 100, 200]);
    }

    #[test]
    fn accept_rotate_180_reverses_luma() {
        let src = tiny_nv21();
        let mut dst = vec![0; src.len()];
        accept_frame(&src, &mut dst, 4, 2, ColorFormat::Nv21, CameraDirection::ROTATE_180)
            .unwrap();
        assert_eq!(&dst[..8], &[7, 6, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn accept_rejects_short_frames() {
        let mut dst = vec![0; 12];
        let err = accept_frame(&[0; 4], &mut dst, 4, 2, ColorFormat::Nv21, CameraDirection::empty());
        assert!(matches!(err, Err(StreamError::FrameSize { .. })));
    }

    #[test]
    fn argb_of_mid_grey() {
        // Y = 126, neutral chroma → roughly grey.
        let src = vec![126, 126, 126, 126, 128, 128];
        let argb = nv21_to_argb(&src, 2, 2);
        assert_eq!(argb.len(), 4);
        let px = argb[0];
        assert_eq!(px >> 24, 0xFF);
        let (r, g, b) = ((px >> 16) & 0xFF, (px >> 8) & 0xFF, px & 0xFF);
        assert_eq!(r, g);
        assert_eq!(g, b);
    }
}
