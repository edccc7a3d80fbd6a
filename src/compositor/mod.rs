//! Compositor Module
//!
//! Composition contents (the layers that did not get a plane), the backend
//! interface, and the fallback chain that picks a backend per frame.

pub mod blit;
pub mod chain;

use bitflags::bitflags;
use thiserror::Error;

use crate::assign::Assignment;
use crate::scratch::BlitError;
use crate::shared::{BlendMode, Layer, LayerFlags, Rect, Transform};
use crate::sync::{BufferHandle, BufferId, Fence, SyncPolicy};

pub use blit::BlitCompositor;
pub use chain::{CompositorChain, Selection};

/// Composition errors
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("backend {backend} rejected the frame: {reason}")]
    Rejected { backend: String, reason: Rejection },
    #[error("blit failed: {0}")]
    Blit(#[from] BlitError),
    #[error("composed layer {0} is out of range")]
    MissingLayer(usize),
}

/// Why a backend cannot take this frame's contents
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("{count} layers exceed the limit of {max}")]
    TooManyLayers { count: usize, max: usize },
    #[error("scale range {min}..{max} outside {supported_min}..{supported_max}")]
    ScaleOutOfRange {
        min: f32,
        max: f32,
        supported_min: f32,
        supported_max: f32,
    },
    #[error("protected content not supported")]
    Protected,
    #[error("transformed layers not supported")]
    Transform,
}

bitflags! {
    /// Optional backend features
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BackendFeatures: u32 {
        const TRANSFORM = 1 << 0;
        const PROTECTED = 1 << 1;
    }
}

/// What a backend advertises
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCaps {
    pub max_layers: usize,
    pub features: BackendFeatures,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl BackendCaps {
    /// Validate a frame's contents against these capabilities
    pub fn check(&self, contents: &CompositionContents) -> Result<(), Rejection> {
        if contents.layers.len() > self.max_layers {
            return Err(Rejection::TooManyLayers {
                count: contents.layers.len(),
                max: self.max_layers,
            });
        }
        if contents.min_scale < self.min_scale || contents.max_scale > self.max_scale {
            return Err(Rejection::ScaleOutOfRange {
                min: contents.min_scale,
                max: contents.max_scale,
                supported_min: self.min_scale,
                supported_max: self.max_scale,
            });
        }
        if contents.has_protected && !self.features.contains(BackendFeatures::PROTECTED) {
            return Err(Rejection::Protected);
        }
        if contents.has_transform && !self.features.contains(BackendFeatures::TRANSFORM) {
            return Err(Rejection::Transform);
        }
        Ok(())
    }
}

/// One layer as the compositor sees it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComposedLayer {
    /// Index into the frame's layer list
    pub index: usize,
    pub buffer: Option<BufferId>,
    /// Write sequence of the buffer when the contents were built
    pub content_seq: u64,
    pub source: Rect,
    pub dest: Rect,
    pub transform: Transform,
    pub blend: BlendMode,
    pub alpha: f32,
    pub undefined_content: bool,
}

/// Layers left for composition this frame, bottom to top
#[derive(Debug, Clone, PartialEq)]
pub struct CompositionContents {
    pub layers: Vec<ComposedLayer>,
    /// Smallest per-axis scale factor among the layers
    pub min_scale: f32,
    /// Largest per-axis scale factor among the layers
    pub max_scale: f32,
    pub has_protected: bool,
    pub has_transform: bool,
    /// Last display composed in this refresh cycle
    pub last_pass: bool,
    pub geometry_changed: bool,
}

impl CompositionContents {
    pub fn build(
        layers: &[Layer],
        assignment: &Assignment,
        geometry_changed: bool,
        last_pass: bool,
    ) -> Self {
        Self::from_indices(layers, &assignment.composed, geometry_changed, last_pass)
    }

    pub fn from_indices(
        layers: &[Layer],
        indices: &[usize],
        geometry_changed: bool,
        last_pass: bool,
    ) -> Self {
        let mut contents = Self {
            layers: Vec::with_capacity(indices.len()),
            min_scale: 1.0,
            max_scale: 1.0,
            has_protected: false,
            has_transform: false,
            last_pass,
            geometry_changed,
        };
        let mut scale: Option<(f32, f32)> = None;
        for &index in indices {
            let Some(layer) = layers.get(index) else {
                continue;
            };
            let (sx, sy) = layer.scale_factors();
            let (lo, hi) = scale.unwrap_or((f32::MAX, f32::MIN));
            scale = Some((lo.min(sx).min(sy), hi.max(sx).max(sy)));
            contents.has_protected |= layer.is_protected();
            contents.has_transform |= !layer.transform.is_empty();
            contents.layers.push(ComposedLayer {
                index,
                buffer: layer.buffer.as_ref().map(BufferHandle::id),
                content_seq: layer.buffer.as_ref().map_or(0, BufferHandle::write_seq),
                source: layer.source,
                dest: layer.dest,
                transform: layer.transform,
                blend: layer.blend,
                alpha: layer.alpha,
                undefined_content: layer.flags.contains(LayerFlags::UNDEFINED_CONTENT),
            });
        }
        if let Some((lo, hi)) = scale {
            contents.min_scale = lo;
            contents.max_scale = hi;
        }
        contents
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }
}

/// A pluggable implementation that merges layers into one buffer
pub trait CompositorBackend: Send {
    fn name(&self) -> &str;

    fn caps(&self) -> &BackendCaps;

    /// Render `contents` into `target`
    ///
    /// Returns a fence that signals once the target holds the result. Must
    /// not block on the GPU or any copy engine.
    fn compose(
        &mut self,
        contents: &CompositionContents,
        layers: &[Layer],
        target: &BufferHandle,
        policy: &SyncPolicy,
    ) -> Result<Fence, ComposeError>;
}
