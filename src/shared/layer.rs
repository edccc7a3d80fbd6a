//! Per-frame layer

use bitflags::bitflags;

use super::{BlendMode, PixelFormat, Rect, Transform};
use crate::sync::{BufferHandle, Fence};

bitflags! {
    /// Producer-supplied layer flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerFlags: u32 {
        const OPAQUE            = 1 << 0;
        const PROTECTED         = 1 << 1;
        const UNDEFINED_CONTENT = 1 << 2;
        const MUST_COMPOSITE    = 1 << 3;
    }
}

/// Where a layer ended up this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositionKind {
    /// Not yet decided (before prepare)
    #[default]
    Undecided,
    /// Dedicated hardware plane
    Device,
    /// Merged by a compositor backend into a scratch target
    Backend,
    /// Merged by the producer into the client target
    Client,
}

impl From<CompositionKind> for hwcomp_ipc::CompositionDesc {
    fn from(kind: CompositionKind) -> Self {
        match kind {
            CompositionKind::Device => hwcomp_ipc::CompositionDesc::Device,
            CompositionKind::Backend => hwcomp_ipc::CompositionDesc::Backend,
            CompositionKind::Undecided | CompositionKind::Client => {
                hwcomp_ipc::CompositionDesc::Client
            }
        }
    }
}

/// One visual element of a frame
///
/// Built fresh every frame by the scene producer. The scheduler only writes
/// `composition` (during prepare) and `release_fence` (during present).
#[derive(Debug, Default)]
pub struct Layer {
    pub buffer: Option<BufferHandle>,
    pub source: Rect,
    pub dest: Rect,
    pub transform: Transform,
    pub blend: BlendMode,
    /// Plane alpha, 0.0 - 1.0
    pub alpha: f32,
    pub flags: LayerFlags,
    /// Signals when the producer has finished writing the buffer
    pub acquire_fence: Fence,

    pub composition: CompositionKind,
    /// Signals when the display is done reading the buffer
    pub release_fence: Fence,
}

impl Layer {
    pub fn new(buffer: Option<BufferHandle>, source: Rect, dest: Rect) -> Self {
        Self {
            buffer,
            source,
            dest,
            alpha: 1.0,
            ..Default::default()
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_flags(mut self, flags: LayerFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_acquire_fence(mut self, fence: Fence) -> Self {
        self.acquire_fence = fence;
        self
    }

    pub fn format(&self) -> Option<PixelFormat> {
        self.buffer.as_ref().map(|b| b.desc().format)
    }

    pub fn is_protected(&self) -> bool {
        self.flags.contains(LayerFlags::PROTECTED)
            || self.buffer.as_ref().is_some_and(|b| b.desc().protected)
    }

    /// True if the layer needs to be blended with what lies beneath it
    pub fn is_blending(&self) -> bool {
        if self.alpha < 1.0 {
            return true;
        }
        self.blend != BlendMode::None && !self.flags.contains(LayerFlags::OPAQUE)
    }

    /// Source size once the transform has been applied
    pub fn transformed_source_size(&self) -> (u32, u32) {
        self.transform
            .apply_to_size(self.source.width, self.source.height)
    }

    /// Horizontal and vertical scale factor (destination / source)
    pub fn scale_factors(&self) -> (f32, f32) {
        let (sw, sh) = self.transformed_source_size();
        let sx = if sw == 0 { 1.0 } else { self.dest.width as f32 / sw as f32 };
        let sy = if sh == 0 { 1.0 } else { self.dest.height as f32 / sh as f32 };
        (sx, sy)
    }

    pub fn needs_scaling(&self) -> bool {
        self.transformed_source_size() != (self.dest.width, self.dest.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_factors_follow_rotation() {
        let layer = Layer::new(None, Rect::sized(100, 200), Rect::new(0, 0, 400, 100))
            .with_transform(Transform::ROT_90);
        assert_eq!(layer.transformed_source_size(), (200, 100));
        assert_eq!(layer.scale_factors(), (2.0, 1.0));
        assert!(layer.needs_scaling());
    }

    #[test]
    fn test_opaque_premultiplied_does_not_blend() {
        let layer = Layer::new(None, Rect::sized(10, 10), Rect::sized(10, 10))
            .with_blend(BlendMode::Premultiplied)
            .with_flags(LayerFlags::OPAQUE);
        assert!(!layer.is_blending());
        assert!(layer.with_alpha(0.5).is_blending());
    }
}
