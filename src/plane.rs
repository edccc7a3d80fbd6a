//! Plane capability model
//!
//! Static, per-display description of the hardware overlay planes. Built once
//! from configuration and never mutated during a session.

use bitflags::bitflags;
use tracing::warn;

use crate::config::DisplayConfig;

bitflags! {
    /// What one hardware plane can do
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PlaneCaps: u32 {
        const SCALE      = 1 << 0;
        const ROTATE_90  = 1 << 1;
        const FLIP       = 1 << 2;
        const TILED      = 1 << 3;
        const COMPRESSED = 1 << 4;
        const YUV        = 1 << 5;
        /// Can be chained into a sequential multi-plane group
        const SEQUENTIAL = 1 << 6;
        /// Small dedicated plane (cursor class)
        const CURSOR     = 1 << 7;
    }
}

impl PlaneCaps {
    /// Requirements a scratch pre-transform can take off a plane's hands
    pub const RESOLVABLE: Self = Self::SCALE
        .union(Self::ROTATE_90)
        .union(Self::FLIP)
        .union(Self::TILED)
        .union(Self::COMPRESSED);

    /// Parse a capability name as used in the config file
    pub fn from_config_name(name: &str) -> Option<Self> {
        let caps = match name.trim().to_ascii_lowercase().as_str() {
            "scale" => Self::SCALE,
            "rotate" | "rotate90" | "rotate_90" => Self::ROTATE_90,
            "flip" => Self::FLIP,
            "tiled" => Self::TILED,
            "compressed" | "afbc" => Self::COMPRESSED,
            "yuv" => Self::YUV,
            "sequential" => Self::SEQUENTIAL,
            "cursor" => Self::CURSOR,
            _ => return None,
        };
        Some(caps)
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        names.iter().fold(Self::empty(), |acc, name| {
            match Self::from_config_name(name.as_ref()) {
                Some(c) => acc | c,
                None => {
                    warn!(capability = name.as_ref(), "Unknown plane capability ignored");
                    acc
                }
            }
        })
    }
}

/// One hardware plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub caps: PlaneCaps,
    /// Largest destination the plane can show, if limited
    pub max_size: Option<(u32, u32)>,
}

impl PlaneInfo {
    pub fn new(caps: PlaneCaps) -> Self {
        Self {
            caps,
            max_size: None,
        }
    }

    pub fn with_max_size(mut self, width: u32, height: u32) -> Self {
        self.max_size = Some((width, height));
        self
    }

    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.max_size
            .is_none_or(|(mw, mh)| width <= mw && height <= mh)
    }
}

/// Ordered plane table plus per-display limits
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayCaps {
    pub planes: Vec<PlaneInfo>,
    /// Planes that may be chained into sequential groups per frame
    pub max_sequential: usize,
    /// Smallest downscale factor a plane can do on its own
    pub min_scale: f32,
    /// Largest upscale factor a plane can do on its own
    pub max_scale: f32,
    /// Largest source height a plane may rotate when fed from scratch
    pub max_rotate_height_scratch: u32,
    /// Largest source height a plane may rotate straight from the client buffer
    pub max_rotate_height_direct: u32,
    /// Commits must be preceded by a bandwidth request
    pub bandwidth_negotiation: bool,
}

impl Default for DisplayCaps {
    fn default() -> Self {
        Self {
            planes: Vec::new(),
            max_sequential: 0,
            min_scale: 0.25,
            max_scale: 4.0,
            max_rotate_height_scratch: 2048,
            max_rotate_height_direct: 1088,
            bandwidth_negotiation: false,
        }
    }
}

impl DisplayCaps {
    pub fn from_config(config: &DisplayConfig) -> Self {
        let planes = config
            .planes
            .iter()
            .map(|p| {
                let info = PlaneInfo::new(PlaneCaps::from_names(&p.caps));
                match (p.max_width, p.max_height) {
                    (Some(w), Some(h)) => info.with_max_size(w, h),
                    _ => info,
                }
            })
            .collect();
        Self {
            planes,
            max_sequential: config.max_sequential,
            min_scale: config.min_scale,
            max_scale: config.max_scale,
            max_rotate_height_scratch: config.max_rotate_height_scratch,
            max_rotate_height_direct: config
                .max_rotate_height_direct
                .min(config.max_rotate_height_scratch),
            bandwidth_negotiation: config.bandwidth_negotiation,
        }
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// True if `factor` lies within what the planes can scale unaided
    pub fn scale_in_range(&self, factor: f32) -> bool {
        factor >= self.min_scale && factor <= self.max_scale
    }

    /// Rotation source-height limit for a layer fed directly or via scratch
    pub fn rotate_height_limit(&self, via_scratch: bool) -> u32 {
        if via_scratch {
            self.max_rotate_height_scratch
        } else {
            self.max_rotate_height_direct
        }
    }

    /// Union of every plane's capabilities
    pub fn all_caps(&self) -> PlaneCaps {
        self.planes
            .iter()
            .fold(PlaneCaps::empty(), |acc, p| acc | p.caps)
    }
}
