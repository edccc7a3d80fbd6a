//! Hotplug and mode-change thread
//!
//! Events arrive one per line:
//!
//! ```text
//! connected 1920 1080
//! disconnected
//! ```
//!
//! The display state is updated under the display-state mutex before the
//! callback runs.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::display::DisplayShared;
use crate::event_thread::{EventThread, LineSource};
use crate::shared::DisplayId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Connected { width: u32, height: u32 },
    Disconnected,
}

impl HotplugEvent {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        match words.next()? {
            "connected" => {
                let width = words.next()?.parse().ok()?;
                let height = words.next()?.parse().ok()?;
                (width > 0 && height > 0).then_some(HotplugEvent::Connected { width, height })
            }
            "disconnected" => Some(HotplugEvent::Disconnected),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, HotplugEvent::Connected { .. })
    }
}

pub type HotplugCallback = Arc<dyn Fn(DisplayId, HotplugEvent) + Send + Sync>;

/// Apply `event` to the display; true when its state changed
pub fn apply(display: &DisplayShared, event: HotplugEvent) -> bool {
    let current = display.state();
    let changed = match event {
        HotplugEvent::Connected { width, height } => display.set_connected(true, width, height),
        HotplugEvent::Disconnected => display.set_connected(false, current.width, current.height),
    };
    if changed {
        let id = display.id();
        info!(display = %id, ?event, "Display state changed");
    }
    changed
}

/// Start a hotplug thread reading `source`
pub fn spawn<R>(display: Arc<DisplayShared>, source: LineSource<R>, callback: HotplugCallback) -> Result<EventThread>
where
    R: std::io::Read + std::os::unix::io::AsRawFd + Send + 'static,
{
    let name = format!("hotplug-{}", display.id().0);
    EventThread::spawn(name, source, move |line| match HotplugEvent::parse(line) {
        Some(event) => {
            if apply(&display, event) {
                callback(display.id(), event);
            }
        }
        None => {
            let id = display.id();
            warn!(display = %id, line, "Malformed hotplug event")
        }
    })
}
