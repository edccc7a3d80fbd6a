//! Hwcomp
//!
//! Display compositing scheduler: decides per frame which layers go straight
//! to hardware planes, which are pre-transformed through scratch buffers and
//! which are merged by a compositor backend, then commits the result with
//! explicit buffer synchronization.

pub mod assign;
pub mod compositor;
pub mod config;
pub mod display;
pub mod event_thread;
pub mod fbcache;
pub mod hotplug;
pub mod hwc;
pub mod plane;
pub mod scratch;
pub mod server;
pub mod shared;
pub mod submit;
pub mod sync;
pub mod vsync;

pub use config::Config;
pub use display::{ClientTarget, Display, FrameStats, PrepareSummary};
pub use hwc::{DisplayFrame, Hwc, HwcCallbacks};
pub use shared::{CompositionKind, DisplayId, Layer};
