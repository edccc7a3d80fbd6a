//! Composition fallback chain

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{BackendCaps, BackendFeatures, BlitCompositor, CompositionContents, CompositorBackend};
use crate::config::CompositorConfig;
use crate::scratch::BlitEngine;

/// Who composes this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// The producer composes into its client target; never fails validation
    Client,
    /// Backend at this index in the chain
    Backend(usize),
}

/// Ordered list of compositor backends
///
/// The only state carried between frames is which backend is preferred.
pub struct CompositorChain {
    backends: Vec<Box<dyn CompositorBackend>>,
    preferred: usize,
    cross_fallback: bool,
}

impl CompositorChain {
    pub fn new(
        backends: Vec<Box<dyn CompositorBackend>>,
        preferred: Option<&str>,
        cross_fallback: bool,
    ) -> Self {
        let mut chain = Self {
            backends,
            preferred: 0,
            cross_fallback,
        };
        if let Some(name) = preferred {
            if !chain.set_preferred(name) {
                warn!(backend = name, "Preferred compositor backend not configured");
            }
        }
        chain
    }

    /// One blit-driven backend per configured entry
    pub fn from_config(config: &CompositorConfig, engine: Arc<dyn BlitEngine>) -> Self {
        let backends: Vec<Box<dyn CompositorBackend>> = config
            .backends
            .iter()
            .map(|b| {
                let mut features = BackendFeatures::empty();
                features.set(BackendFeatures::TRANSFORM, b.supports_transform);
                features.set(BackendFeatures::PROTECTED, b.supports_protected);
                let caps = BackendCaps {
                    max_layers: b.max_layers,
                    features,
                    min_scale: b.min_scale,
                    max_scale: b.max_scale,
                };
                Box::new(BlitCompositor::new(b.name.clone(), caps, Arc::clone(&engine)))
                    as Box<dyn CompositorBackend>
            })
            .collect();
        info!(
            backends = ?backends.iter().map(|b| b.name().to_string()).collect::<Vec<_>>(),
            "Compositor chain configured"
        );
        Self::new(backends, config.preferred.as_deref(), config.cross_backend_fallback)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn preferred(&self) -> Option<&str> {
        self.backends.get(self.preferred).map(|b| b.name())
    }

    /// Make `name` the first backend tried from now on
    pub fn set_preferred(&mut self, name: &str) -> bool {
        match self.backends.iter().position(|b| b.name() == name) {
            Some(index) => {
                self.preferred = index;
                true
            }
            None => false,
        }
    }

    pub fn backend_mut(&mut self, index: usize) -> Option<&mut Box<dyn CompositorBackend>> {
        self.backends.get_mut(index)
    }

    pub fn name_of(&self, selection: Selection) -> &str {
        match selection {
            Selection::Client => "client",
            Selection::Backend(i) => self.backends.get(i).map_or("?", |b| b.name()),
        }
    }

    /// Pick the backend for `contents`
    pub fn select(&self, contents: &CompositionContents) -> Selection {
        let Some(preferred) = self.backends.get(self.preferred) else {
            return Selection::Client;
        };
        match preferred.caps().check(contents) {
            Ok(()) => return Selection::Backend(self.preferred),
            Err(reason) => {
                debug!(backend = preferred.name(), %reason, "Preferred compositor rejected frame");
            }
        }
        if !self.cross_fallback {
            return Selection::Client;
        }
        for (index, backend) in self.backends.iter().enumerate() {
            if index == self.preferred {
                continue;
            }
            match backend.caps().check(contents) {
                Ok(()) => {
                    debug!(backend = backend.name(), "Falling back to compositor");
                    return Selection::Backend(index);
                }
                Err(reason) => {
                    debug!(backend = backend.name(), %reason, "Compositor rejected frame");
                }
            }
        }
        debug!("No compositor accepts the frame, using client composition");
        Selection::Client
    }
}

impl fmt::Debug for CompositorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositorChain")
            .field(
                "backends",
                &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .field("preferred", &self.preferred())
            .field("cross_fallback", &self.cross_fallback)
            .finish()
    }
}
