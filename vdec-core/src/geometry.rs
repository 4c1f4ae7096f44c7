//! Frame geometry resolution from a negotiated output format.
//!
//! Hardware decoders pad output rows for alignment, so the row stride can
//! exceed the coded width and plane addressing must always go through the
//! resolved stride. The display crop can also be narrower than the coded
//! frame (e.g. 1920x1088 coded, 1920x1080 displayed).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transform::MediaFormat;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("negotiated output format unusable: {0}")]
    Unsupported(&'static str),
}

/// Display cropping rectangle inside the coded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Resolved output geometry, cached on the session between format changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub coded_width: u32,
    pub coded_height: u32,
    pub crop: CropRect,
    /// Luma row stride; chroma rows use half of it.
    pub stride_bytes: u32,
}

/// Derive geometry from a negotiated output format.
///
/// The coded frame size is required. A missing crop falls back to the full
/// coded frame and a missing stride to the coded width, but reported values
/// are validated as-is: a crop escaping the coded frame or a stride below
/// the coded width fails rather than being clamped.
pub fn resolve(format: &MediaFormat) -> Result<FrameGeometry, GeometryError> {
    let (coded_width, coded_height) = format
        .frame_size
        .ok_or(GeometryError::Unsupported("no frame size attribute"))?;
    if coded_width == 0 || coded_height == 0 {
        return Err(GeometryError::Unsupported("zero frame dimension"));
    }

    let crop = format.crop.unwrap_or(CropRect {
        x: 0,
        y: 0,
        width: coded_width,
        height: coded_height,
    });
    let crop_right = crop
        .x
        .checked_add(crop.width)
        .ok_or(GeometryError::Unsupported("crop overflows"))?;
    let crop_bottom = crop
        .y
        .checked_add(crop.height)
        .ok_or(GeometryError::Unsupported("crop overflows"))?;
    if crop_right > coded_width || crop_bottom > coded_height {
        return Err(GeometryError::Unsupported("crop outside coded frame"));
    }

    let stride_bytes = format.stride.unwrap_or(coded_width);
    if stride_bytes < coded_width {
        return Err(GeometryError::Unsupported("stride below coded width"));
    }

    Ok(FrameGeometry {
        coded_width,
        coded_height,
        crop,
        stride_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::PixelFormat;

    fn format(frame_size: Option<(u32, u32)>, crop: Option<CropRect>, stride: Option<u32>) -> MediaFormat {
        MediaFormat {
            pixel_format: PixelFormat::I420,
            frame_size,
            crop,
            stride,
        }
    }

    #[test]
    fn test_resolve_with_crop_and_stride() {
        let geo = resolve(&format(
            Some((1920, 1088)),
            Some(CropRect { x: 0, y: 0, width: 1920, height: 1080 }),
            Some(2048),
        ))
        .unwrap();
        assert_eq!(geo.coded_width, 1920);
        assert_eq!(geo.coded_height, 1088);
        assert_eq!(geo.crop.height, 1080);
        assert_eq!(geo.stride_bytes, 2048);
    }

    #[test]
    fn test_missing_size_is_unsupported() {
        assert!(matches!(
            resolve(&format(None, None, Some(1920))),
            Err(GeometryError::Unsupported(_))
        ));
    }

    #[test]
    fn test_missing_crop_defaults_to_full_frame() {
        let geo = resolve(&format(Some((640, 480)), None, None)).unwrap();
        assert_eq!(geo.crop, CropRect { x: 0, y: 0, width: 640, height: 480 });
        assert_eq!(geo.stride_bytes, 640);
    }

    #[test]
    fn test_escaping_crop_is_rejected() {
        let bad = format(
            Some((640, 480)),
            Some(CropRect { x: 8, y: 0, width: 640, height: 480 }),
            None,
        );
        assert!(matches!(resolve(&bad), Err(GeometryError::Unsupported(_))));
    }

    #[test]
    fn test_undersized_stride_is_rejected() {
        let bad = format(Some((640, 480)), None, Some(320));
        assert!(matches!(resolve(&bad), Err(GeometryError::Unsupported(_))));
    }
}
