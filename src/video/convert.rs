//! Colorspace conversion into the encoder layout
//!
//! BT.601 limited range, integer fixed-point. Chroma is subsampled by
//! averaging each 2x2 block.

use crate::error::{AppError, Result};

use super::format::Resolution;
use super::frame::{StagingFrame, StagingLayout};

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Converts BGRA staging frames into an NV12 frame it owns
pub struct ColorConverter {
    output: StagingFrame,
}

impl ColorConverter {
    pub fn new(resolution: Resolution, row_alignment: usize) -> Self {
        Self {
            output: StagingFrame::new(StagingLayout::Nv12, resolution, row_alignment),
        }
    }

    /// Convert `src` (BGRA) into the owned NV12 frame
    pub fn convert(&mut self, src: &StagingFrame) -> Result<&StagingFrame> {
        bgra_to_nv12(src, &mut self.output)?;
        Ok(&self.output)
    }
}

/// BGRA → NV12 between two staging frames of equal resolution
pub fn bgra_to_nv12(src: &StagingFrame, dst: &mut StagingFrame) -> Result<()> {
    if src.layout() != StagingLayout::Bgra || dst.layout() != StagingLayout::Nv12 {
        return Err(AppError::Format(format!(
            "cannot convert {:?} into {:?}",
            src.layout(),
            dst.layout()
        )));
    }
    if src.resolution() != dst.resolution() {
        return Err(AppError::Format(format!(
            "resolution mismatch: {} vs {}",
            src.resolution(),
            dst.resolution()
        )));
    }

    let width = src.resolution().width as usize;
    let height = src.resolution().height as usize;
    let src_stride = src.stride();
    let dst_stride = dst.stride();
    let bgra = src.plane();
    let (y_plane, uv_plane) = dst.planes_mut();

    let pixel = |x: usize, y: usize| -> (i32, i32, i32) {
        let off = y * src_stride + x * 4;
        (
            bgra[off + 2] as i32,
            bgra[off + 1] as i32,
            bgra[off] as i32,
        )
    };

    for y in 0..height {
        let row = &mut y_plane[y * dst_stride..y * dst_stride + width];
        for (x, out) in row.iter_mut().enumerate() {
            let (r, g, b) = pixel(x, y);
            *out = luma(r, g, b);
        }
    }

    for cy in 0..height.div_ceil(2) {
        let row = &mut uv_plane[cy * dst_stride..];
        for cx in 0..width.div_ceil(2) {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for y in (cy * 2)..(cy * 2 + 2).min(height) {
                for x in (cx * 2)..(cx * 2 + 2).min(width) {
                    let (pr, pg, pb) = pixel(x, y);
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
            }
            let (u, v) = chroma(r / n, g / n, b / n);
            row[cx * 2] = u;
            row[cx * 2 + 1] = v;
        }
    }
    Ok(())
}

/// Repack an NV12 staging frame into tightly packed planar I420
pub fn nv12_to_i420(src: &StagingFrame) -> Result<Vec<u8>> {
    if src.layout() != StagingLayout::Nv12 {
        return Err(AppError::Format(format!(
            "expected NV12 staging frame, got {:?}",
            src.layout()
        )));
    }
    let width = src.resolution().width as usize;
    let height = src.resolution().height as usize;
    let chroma_w = width.div_ceil(2);
    let chroma_h = height.div_ceil(2);
    let stride = src.stride();

    let mut out = vec![0u8; width * height + 2 * chroma_w * chroma_h];
    let (y_out, uv_out) = out.split_at_mut(width * height);
    let (u_out, v_out) = uv_out.split_at_mut(chroma_w * chroma_h);

    for (y, dst_row) in y_out.chunks_exact_mut(width).enumerate() {
        dst_row.copy_from_slice(&src.plane()[y * stride..y * stride + width]);
    }

    let uv = src.uv_plane();
    for cy in 0..chroma_h {
        let src_row = &uv[cy * stride..cy * stride + chroma_w * 2];
        for (cx, pair) in src_row.chunks_exact(2).enumerate() {
            u_out[cy * chroma_w + cx] = pair[0];
            v_out[cy * chroma_w + cx] = pair[1];
        }
    }
    Ok(out)
}
