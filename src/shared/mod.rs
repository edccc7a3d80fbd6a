//! Shared frame data
//!
//! Geometry, transform and pixel-format types used by every stage of the
//! scheduler, plus the per-frame `Layer`.

pub mod layer;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use layer::{CompositionKind, Layer, LayerFlags};

/// Rectangle geometry in integer pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle anchored at the origin
    pub const fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True if the two rectangles share at least one pixel
    pub fn intersects(&self, other: &Rect) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        (self.x as i64) < other.right()
            && (other.x as i64) < self.right()
            && (self.y as i64) < other.bottom()
            && (other.y as i64) < self.bottom()
    }

    /// Source rectangle as 16.16 fixed point `[x, y, w, h]`
    pub fn to_fixed(&self) -> [i32; 4] {
        [
            self.x.saturating_mul(1 << 16),
            self.y.saturating_mul(1 << 16),
            (self.width.min(i32::MAX as u32 >> 16) as i32) << 16,
            (self.height.min(i32::MAX as u32 >> 16) as i32) << 16,
        ]
    }
}

impl From<hwcomp_ipc::RectDesc> for Rect {
    fn from(r: hwcomp_ipc::RectDesc) -> Self {
        Self::new(r.x, r.y, r.width, r.height)
    }
}

bitflags! {
    /// Layer transform: rotation and flip bits
    ///
    /// Kept as its own type so transform bits never mix with plane
    /// capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Transform: u32 {
        const FLIP_H  = 1 << 0;
        const FLIP_V  = 1 << 1;
        const ROT_90  = 1 << 2;
        const ROT_180 = Self::FLIP_H.bits() | Self::FLIP_V.bits();
        const ROT_270 = Self::ROT_180.bits() | Self::ROT_90.bits();
    }
}

impl Transform {
    pub fn rotates_90(&self) -> bool {
        self.contains(Self::ROT_90)
    }

    /// Flip part of the transform
    pub fn flips(&self) -> Self {
        *self & Self::ROT_180
    }

    /// Size of `(width, height)` after this transform is applied
    pub fn apply_to_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.rotates_90() {
            (height, width)
        } else {
            (width, height)
        }
    }
}

/// How a layer is combined with what lies beneath it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    None,
    Premultiplied,
    Coverage,
}

impl BlendMode {
    pub fn code(&self) -> u32 {
        match self {
            BlendMode::None => 0,
            BlendMode::Premultiplied => 1,
            BlendMode::Coverage => 2,
        }
    }
}

impl From<hwcomp_ipc::BlendDesc> for BlendMode {
    fn from(b: hwcomp_ipc::BlendDesc) -> Self {
        match b {
            hwcomp_ipc::BlendDesc::None => BlendMode::None,
            hwcomp_ipc::BlendDesc::Premultiplied => BlendMode::Premultiplied,
            hwcomp_ipc::BlendDesc::Coverage => BlendMode::Coverage,
        }
    }
}

/// Pixel formats understood by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8888,
    Rgbx8888,
    Bgra8888,
    Rgb565,
    Nv12,
    Nv21,
    Yv12,
    /// 10-bit 4:2:0, needs a sequential plane group
    P010,
    /// Anything the planes cannot scan out
    Unknown(u32),
}

impl PixelFormat {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Rgba8888,
            1 => Self::Rgbx8888,
            2 => Self::Bgra8888,
            3 => Self::Rgb565,
            4 => Self::Nv12,
            5 => Self::Nv21,
            6 => Self::Yv12,
            7 => Self::P010,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Rgba8888 => 0,
            Self::Rgbx8888 => 1,
            Self::Bgra8888 => 2,
            Self::Rgb565 => 3,
            Self::Nv12 => 4,
            Self::Nv21 => 5,
            Self::Yv12 => 6,
            Self::P010 => 7,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_yuv(&self) -> bool {
        matches!(self, Self::Nv12 | Self::Nv21 | Self::Yv12 | Self::P010)
    }

    /// Formats that only a chained group of planes can scan out
    pub fn needs_sequential(&self) -> bool {
        matches!(self, Self::P010)
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

/// Memory layout class of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryLayout {
    #[default]
    Linear,
    Tiled,
    Compressed,
}

impl MemoryLayout {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Tiled,
            2 => Self::Compressed,
            _ => Self::Linear,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Linear => 0,
            Self::Tiled => 1,
            Self::Compressed => 2,
        }
    }
}

/// Identifies one physical display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisplayId(pub u32);

impl std::fmt::Display for DisplayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "display{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersects_excludes_touching_edges() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(100, 0, 50, 50);
        let c = Rect::new(99, 99, 10, 10);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(!a.intersects(&Rect::new(10, 10, 0, 5)));
    }

    #[test]
    fn test_fixed_point_source() {
        let r = Rect::new(2, 3, 64, 32);
        assert_eq!(r.to_fixed(), [2 << 16, 3 << 16, 64 << 16, 32 << 16]);
    }

    #[test]
    fn test_transform_bits() {
        assert!(Transform::ROT_270.rotates_90());
        assert_eq!(Transform::ROT_270.flips(), Transform::ROT_180);
        assert_eq!(Transform::ROT_90.apply_to_size(1920, 1080), (1080, 1920));
        assert_eq!(Transform::FLIP_H.apply_to_size(1920, 1080), (1920, 1080));
    }

    #[test]
    fn test_format_codes() {
        for code in 0..8 {
            assert_eq!(PixelFormat::from_code(code).code(), code);
        }
        assert!(!PixelFormat::from_code(99).is_supported());
        assert!(PixelFormat::P010.needs_sequential());
        assert!(PixelFormat::Nv12.is_yuv());
    }
}
