//! Framebuffer composition cache
//!
//! Remembers what the last composition pass rendered so an unchanged frame
//! can reuse the previous target instead of invoking a backend again.

use tracing::trace;

use crate::compositor::CompositionContents;
use crate::shared::{BlendMode, Rect, Transform};
use crate::sync::BufferId;

/// Layout part of a composed layer; buffer identity is compared separately
#[derive(Debug, Clone, Copy, PartialEq)]
struct Structure {
    index: usize,
    transform: Transform,
    blend: BlendMode,
    alpha: f32,
    source: Rect,
    dest: Rect,
}

/// Buffer identity plus the content generation it held
type Handle = (Option<BufferId>, u64);

/// Snapshot of one frame's composition contents
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    structure: Vec<Structure>,
    handles: Vec<Handle>,
    undefined: bool,
}

impl Signature {
    pub fn of(contents: &CompositionContents) -> Self {
        Self {
            structure: contents
                .layers
                .iter()
                .map(|l| Structure {
                    index: l.index,
                    transform: l.transform,
                    blend: l.blend,
                    alpha: l.alpha,
                    source: l.source,
                    dest: l.dest,
                })
                .collect(),
            handles: contents
                .layers
                .iter()
                .map(|l| (l.buffer, l.content_seq))
                .collect(),
            undefined: contents.layers.iter().any(|l| l.undefined_content),
        }
    }
}

/// Why the previous result cannot be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomposeReason {
    /// Nothing cached
    Empty,
    GeometryChanged,
    UndefinedContent,
    /// Layer count or some layer's layout differs
    Structure,
    /// Same layout, different buffers or buffer content
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVerdict {
    Recyclable,
    Recompose(RecomposeReason),
}

impl CacheVerdict {
    pub fn is_recyclable(&self) -> bool {
        matches!(self, CacheVerdict::Recyclable)
    }
}

/// Per-display composition cache
#[derive(Debug, Default)]
pub struct FramebufferCache {
    previous: Option<Signature>,
    hits: u64,
    misses: u64,
}

impl FramebufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `contents` with the last stored frame
    ///
    /// Pure: calling it twice with the same inputs gives the same verdict.
    pub fn check(&self, contents: &CompositionContents) -> CacheVerdict {
        let Some(previous) = &self.previous else {
            return CacheVerdict::Recompose(RecomposeReason::Empty);
        };
        if contents.geometry_changed {
            return CacheVerdict::Recompose(RecomposeReason::GeometryChanged);
        }
        let current = Signature::of(contents);
        if current.undefined || previous.undefined {
            return CacheVerdict::Recompose(RecomposeReason::UndefinedContent);
        }
        if current.structure != previous.structure {
            return CacheVerdict::Recompose(RecomposeReason::Structure);
        }
        if current.handles != previous.handles {
            return CacheVerdict::Recompose(RecomposeReason::Content);
        }
        CacheVerdict::Recyclable
    }

    /// Remember `contents` as the frame now held by the target
    pub fn store(&mut self, contents: &CompositionContents) {
        self.previous = Some(Signature::of(contents));
    }

    /// Forget the previous frame (geometry/rotation change, target lost)
    pub fn invalidate(&mut self) {
        if self.previous.take().is_some() {
            trace!("Framebuffer cache invalidated");
        }
    }

    pub fn is_valid(&self) -> bool {
        self.previous.is_some()
    }

    /// Count a verdict that was acted on
    pub fn record(&mut self, verdict: CacheVerdict) {
        if verdict.is_recyclable() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
