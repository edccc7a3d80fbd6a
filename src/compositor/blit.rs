//! Compositor backend driven by a blit engine
//!
//! Each composed layer becomes one blit into the target, chained by fences so
//! the engine applies them bottom to top.

use std::sync::Arc;
use tracing::trace;

use super::{BackendCaps, ComposeError, CompositionContents, CompositorBackend};
use crate::scratch::{BlitEngine, BlitJob};
use crate::shared::Layer;
use crate::sync::{BufferHandle, Fence, SyncPolicy};

pub struct BlitCompositor {
    name: String,
    caps: BackendCaps,
    engine: Arc<dyn BlitEngine>,
    frames: u64,
}

impl BlitCompositor {
    pub fn new(name: impl Into<String>, caps: BackendCaps, engine: Arc<dyn BlitEngine>) -> Self {
        Self {
            name: name.into(),
            caps,
            engine,
            frames: 0,
        }
    }

    pub fn frames_composed(&self) -> u64 {
        self.frames
    }
}

impl CompositorBackend for BlitCompositor {
    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> &BackendCaps {
        &self.caps
    }

    fn compose(
        &mut self,
        contents: &CompositionContents,
        layers: &[Layer],
        target: &BufferHandle,
        policy: &SyncPolicy,
    ) -> Result<Fence, ComposeError> {
        let mut write = target.acquire_write(policy.lock_timeout);
        let mut previous = write.take_wait_fence();

        for composed in &contents.layers {
            let layer = layers
                .get(composed.index)
                .ok_or(ComposeError::MissingLayer(composed.index))?;
            let Some(source) = &layer.buffer else {
                // Solid fill: nothing to read, ordering is unchanged
                trace!(backend = %self.name, layer = composed.index, "Skipping layer without buffer");
                continue;
            };

            let read = source.acquire_read(policy.lock_timeout);
            let wait = Fence::merge_all([
                previous,
                layer.acquire_fence.duplicate(),
                read.wait_fence(),
            ]);
            let done = self.engine.submit(BlitJob {
                src: source.id(),
                dst: target.id(),
                src_rect: composed.source,
                dst_rect: composed.dest,
                transform: composed.transform,
                blend: composed.blend,
                alpha: composed.alpha,
                wait,
            })?;
            read.add_fence(done.duplicate());
            previous = done;
        }

        write.add_fence(previous.duplicate());
        self.frames += 1;
        trace!(backend = %self.name, layers = contents.len(), fence = ?previous, "Composition queued");
        Ok(previous)
    }
}
