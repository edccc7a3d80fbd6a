//! Vsync notification thread
//!
//! Each line from the refresh source carries one vblank timestamp in
//! nanoseconds. The callback only runs while vsync is enabled for the
//! display; the flag is read lock-free on every refresh.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{trace, warn};

use crate::display::DisplayShared;
use crate::event_thread::{EventThread, LineSource};
use crate::shared::DisplayId;

/// Receives refresh notifications
pub type VsyncCallback = Arc<dyn Fn(DisplayId, u64) + Send + Sync>;

/// Parse one refresh line into a timestamp
fn parse_timestamp(line: &str) -> Option<u64> {
    line.split_whitespace().next()?.parse().ok()
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Start a vsync thread reading `source`
pub fn spawn<R>(display: Arc<DisplayShared>, source: LineSource<R>, callback: VsyncCallback) -> Result<EventThread>
where
    R: std::io::Read + std::os::unix::io::AsRawFd + Send + 'static,
{
    let name = format!("vsync-{}", display.id().0);
    EventThread::spawn(name, source, move |line| match parse_timestamp(line) {
        Some(timestamp) => {
            if display.vsync_enabled() {
                let id = display.id();
                trace!(display = %id, timestamp, "Vsync");
                callback(display.id(), timestamp);
            }
        }
        None => {
            let id = display.id();
            warn!(display = %id, line, "Malformed vsync event")
        }
    })
}

/// Start a software vsync at a fixed refresh period
pub fn spawn_software(display: Arc<DisplayShared>, period: Duration, callback: VsyncCallback) -> Result<EventThread> {
    let name = format!("vsync-{}", display.id().0);
    EventThread::spawn_ticker(name, period, move || {
        if display.vsync_enabled() {
            callback(display.id(), now_ns());
        }
    })
}
