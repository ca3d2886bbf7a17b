//! Frame format adapter
//!
//! Normalizes whatever layout the capture device produces into a staging
//! frame the encode stage can work with:
//!
//! - NV12 is already the encoder layout and is copied plane by plane.
//! - BGRA is copied as is and flagged for colorspace conversion.
//! - RGB24 is expanded to four bytes per pixel, then flagged for conversion.
//!
//! Any other layout is an error for that frame only.

use crate::error::{AppError, Result};

use super::format::PixelFormat;
use super::frame::{FrameGeometry, StagingFrame, StagingLayout};

/// What the encode stage must do with the staging frame after an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upload {
    /// Staging frame is in encoder layout
    Ready,
    /// Staging frame holds BGRA and must be converted first
    NeedsConversion,
}

/// Staging layout a source layout uploads into, if it is supported
pub fn staging_layout_for(format: PixelFormat) -> Option<StagingLayout> {
    match format {
        PixelFormat::Nv12 => Some(StagingLayout::Nv12),
        PixelFormat::Bgra | PixelFormat::Rgb24 => Some(StagingLayout::Bgra),
        PixelFormat::Unknown => None,
    }
}

/// Copy `rows` rows of `row_bytes` each between buffers with different pitches.
fn copy_rows(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
) {
    if rows == 0 {
        return;
    }
    if src_stride == dst_stride {
        let len = src_stride * (rows - 1) + row_bytes;
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    for (src_row, dst_row) in src
        .chunks(src_stride)
        .zip(dst.chunks_mut(dst_stride))
        .take(rows)
    {
        dst_row[..row_bytes].copy_from_slice(&src_row[..row_bytes]);
    }
}

/// Expand packed 3-byte pixels into the first three bytes of 4-byte pixels.
/// The fourth byte and any row padding keep whatever the destination held.
fn expand_rgb24_rows(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: usize,
    rows: usize,
) {
    for (src_row, dst_row) in src
        .chunks(src_stride)
        .zip(dst.chunks_mut(dst_stride))
        .take(rows)
    {
        for (src_px, dst_px) in src_row[..width * 3]
            .chunks_exact(3)
            .zip(dst_row[..width * 4].chunks_exact_mut(4))
        {
            dst_px[..3].copy_from_slice(src_px);
        }
    }
}

fn required_len(stride: usize, row_bytes: usize, rows: usize) -> usize {
    if rows == 0 {
        0
    } else {
        stride * (rows - 1) + row_bytes
    }
}

/// Upload one raw frame described by `geometry` into `dst`.
///
/// `dst` must use the staging layout that [`staging_layout_for`] picks for
/// the source format and the same resolution; its pitch may differ from the
/// source pitch.
pub fn upload(src: &[u8], geometry: &FrameGeometry, dst: &mut StagingFrame) -> Result<Upload> {
    let Some(layout) = staging_layout_for(geometry.format) else {
        return Err(AppError::UnsupportedFormat(geometry.format.to_string()));
    };
    if dst.layout() != layout || dst.resolution() != geometry.resolution {
        return Err(AppError::Format(format!(
            "staging frame {:?} {} does not match source {} {}",
            dst.layout(),
            dst.resolution(),
            geometry.format,
            geometry.resolution
        )));
    }

    let width = geometry.resolution.width as usize;
    let height = geometry.resolution.height as usize;
    if width == 0 || height == 0 {
        return Err(AppError::Format(format!(
            "empty frame geometry {}",
            geometry.resolution
        )));
    }
    let src_stride = geometry.stride;
    let dst_stride = dst.stride();

    match geometry.format {
        PixelFormat::Nv12 => {
            let chroma_rows = height.div_ceil(2);
            let luma_len = src_stride * height;
            let needed = luma_len + required_len(src_stride, width, chroma_rows);
            if src_stride < width || src.len() < needed {
                return Err(short_source(src.len(), needed));
            }
            let (dst_y, dst_uv) = dst.planes_mut();
            copy_rows(src, src_stride, dst_y, dst_stride, width, height);
            copy_rows(
                &src[luma_len..],
                src_stride,
                dst_uv,
                dst_stride,
                width,
                chroma_rows,
            );
            Ok(Upload::Ready)
        }
        PixelFormat::Bgra => {
            let row_bytes = width * 4;
            let needed = required_len(src_stride, row_bytes, height);
            if src_stride < row_bytes || src.len() < needed {
                return Err(short_source(src.len(), needed));
            }
            copy_rows(src, src_stride, dst.as_bytes_mut(), dst_stride, row_bytes, height);
            Ok(Upload::NeedsConversion)
        }
        PixelFormat::Rgb24 => {
            let needed = required_len(src_stride, width * 3, height);
            if src_stride < width * 3 || src.len() < needed {
                return Err(short_source(src.len(), needed));
            }
            expand_rgb24_rows(src, src_stride, dst.as_bytes_mut(), dst_stride, width, height);
            Ok(Upload::NeedsConversion)
        }
        PixelFormat::Unknown => Err(AppError::UnsupportedFormat(geometry.format.to_string())),
    }
}

fn short_source(len: usize, needed: usize) -> AppError {
    AppError::Format(format!(
        "raw frame too short: {} bytes, need {}",
        len, needed
    ))
}

/// Owns the staging frame for one capture geometry and uploads into it
pub struct FrameFormatAdapter {
    geometry: FrameGeometry,
    staging: Option<StagingFrame>,
}

impl FrameFormatAdapter {
    /// An adapter for an unsupported layout is still constructed: every frame
    /// it sees is rejected, which keeps the capture loop alive.
    pub fn new(geometry: FrameGeometry, row_alignment: usize) -> Self {
        let staging = staging_layout_for(geometry.format)
            .map(|layout| StagingFrame::new(layout, geometry.resolution, row_alignment));
        Self { geometry, staging }
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    pub fn upload(&mut self, src: &[u8]) -> Result<(&StagingFrame, Upload)> {
        let Some(staging) = self.staging.as_mut() else {
            return Err(AppError::UnsupportedFormat(self.geometry.format.to_string()));
        };
        let upload = upload(src, &self.geometry, staging)?;
        Ok((staging, upload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    #[test]
    fn test_rgb24_expands_into_padded_row() {
        let src = [1u8, 2, 3, 4, 5, 6];
        let geometry = FrameGeometry {
            resolution: Resolution::new(2, 1),
            format: PixelFormat::Rgb24,
            stride: 6,
        };
        let mut dst = StagingFrame::with_stride(StagingLayout::Bgra, Resolution::new(2, 1), 16);

        let result = upload(&src, &geometry, &mut dst).unwrap();

        assert_eq!(result, Upload::NeedsConversion);
        assert_eq!(
            dst.as_bytes(),
            &[1, 2, 3, 0, 4, 5, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_rgb24_leaves_fourth_byte_untouched() {
        let src = [10u8, 20, 30];
        let geometry = FrameGeometry::packed(Resolution::new(1, 1), PixelFormat::Rgb24);
        let mut dst = StagingFrame::with_stride(StagingLayout::Bgra, Resolution::new(1, 1), 4);
        dst.as_bytes_mut()[3] = 0xAA;

        upload(&src, &geometry, &mut dst).unwrap();
        assert_eq!(dst.as_bytes(), &[10, 20, 30, 0xAA]);
    }

    #[test]
    fn test_bgra_copy_with_different_strides() {
        let res = Resolution::new(2, 2);
        // source pitch 12: 8 visible bytes + 4 padding
        let src: Vec<u8> = (0..24).collect();
        let geometry = FrameGeometry {
            resolution: res,
            format: PixelFormat::Bgra,
            stride: 12,
        };
        let mut dst = StagingFrame::with_stride(StagingLayout::Bgra, res, 8);

        assert_eq!(upload(&src, &geometry, &mut dst).unwrap(), Upload::NeedsConversion);
        assert_eq!(
            dst.as_bytes(),
            &[0, 1, 2, 3, 4, 5, 6, 7, 12, 13, 14, 15, 16, 17, 18, 19]
        );
    }

    #[test]
    fn test_nv12_copies_both_planes() {
        let res = Resolution::new(2, 2);
        // Y: 4 bytes, UV: 2 bytes, tightly packed
        let src = [1u8, 2, 3, 4, 50, 60];
        let geometry = FrameGeometry::packed(res, PixelFormat::Nv12);
        let mut dst = StagingFrame::with_stride(StagingLayout::Nv12, res, 4);

        assert_eq!(upload(&src, &geometry, &mut dst).unwrap(), Upload::Ready);
        assert_eq!(dst.plane(), &[1, 2, 0, 0, 3, 4, 0, 0]);
        assert_eq!(dst.uv_plane(), &[50, 60, 0, 0]);
    }

    #[test]
    fn test_nv12_same_stride_block_copy() {
        let res = Resolution::new(2, 2);
        let src = [9u8, 8, 7, 6, 5, 4];
        let geometry = FrameGeometry::packed(res, PixelFormat::Nv12);
        let mut dst = StagingFrame::with_stride(StagingLayout::Nv12, res, 2);

        upload(&src, &geometry, &mut dst).unwrap();
        assert_eq!(dst.as_bytes(), &src);
    }

    #[test]
    fn test_unknown_layout_is_rejected() {
        let geometry = FrameGeometry {
            resolution: Resolution::new(2, 2),
            format: PixelFormat::Unknown,
            stride: 4,
        };
        let mut adapter = FrameFormatAdapter::new(geometry, 16);
        let err = adapter.upload(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_short_source_is_rejected() {
        let geometry = FrameGeometry::packed(Resolution::new(4, 4), PixelFormat::Bgra);
        let mut adapter = FrameFormatAdapter::new(geometry, 16);
        assert!(matches!(
            adapter.upload(&[0u8; 10]),
            Err(AppError::Format(_))
        ));
        // A full frame afterwards still goes through
        assert!(adapter.upload(&[0u8; 64]).is_ok());
    }

    #[test]
    fn test_mismatched_staging_frame_is_rejected() {
        let geometry = FrameGeometry::packed(Resolution::new(2, 2), PixelFormat::Nv12);
        let mut dst = StagingFrame::new(StagingLayout::Bgra, Resolution::new(2, 2), 1);
        assert!(upload(&[0u8; 6], &geometry, &mut dst).is_err());
    }
}
