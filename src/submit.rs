//! Frame submission
//!
//! Turns the finished plane table into flat attribute records and commits
//! them to the display controller as one atomic update.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, trace, warn};

use hwcomp_ipc::wire::{PlaneAttrRecord, NO_FENCE};

use crate::shared::{BlendMode, Rect, Transform};
use crate::sync::{BufferHandle, Fence, ReadGuard, SyncPolicy, Timeline};

/// Display controller errors
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("display controller unavailable: {0}")]
    Unavailable(String),
    #[error("commit rejected: {0}")]
    Rejected(String),
}

/// Driver side of a display
pub trait DisplayController: Send {
    fn name(&self) -> &str;

    /// Ask for scan-out bandwidth for this plane set
    fn negotiate_bandwidth(&mut self, _records: &[PlaneAttrRecord]) -> bool {
        true
    }

    /// Commit all planes atomically
    ///
    /// `fences[i]` is the input fence referenced by `fence_index == i`. The
    /// returned fence signals once the frame is no longer being scanned out.
    fn commit(
        &mut self,
        records: &[PlaneAttrRecord],
        fences: Vec<Fence>,
    ) -> Result<Fence, SubmitError>;
}

/// One plane's content for the commit
#[derive(Debug)]
pub struct PlaneSource<'a> {
    pub plane: usize,
    pub buffer: &'a BufferHandle,
    pub source: Rect,
    pub dest: Rect,
    pub transform: Transform,
    pub blend: BlendMode,
    pub alpha: f32,
    /// Producer or scratch-fill fence the plane must wait on
    pub acquire: Fence,
}

/// Result of one submission
#[derive(Debug, Default)]
pub struct SubmitOutcome {
    /// Frame-completion fence, invalid when the commit failed
    pub present: Fence,
    pub committed: bool,
    /// False when the controller refused the bandwidth request
    pub bandwidth_ok: bool,
}

/// Builds records and commits frames for one display
#[derive(Debug)]
pub struct FrameSubmitter {
    policy: SyncPolicy,
    bandwidth_negotiation: bool,
    commits: u64,
    failures: u64,
}

impl FrameSubmitter {
    pub fn new(policy: SyncPolicy, bandwidth_negotiation: bool) -> Self {
        Self {
            policy,
            bandwidth_negotiation,
            commits: 0,
            failures: 0,
        }
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn record(plane: &PlaneSource<'_>, fence_index: i32) -> PlaneAttrRecord {
        let [src_x, src_y, src_w, src_h] = plane.source.to_fixed();
        PlaneAttrRecord {
            buffer_id: plane.buffer.id().0,
            plane: plane.plane as u32,
            transform: plane.transform.bits(),
            blend: plane.blend.code(),
            fence_index,
            src_x,
            src_y,
            src_w,
            src_h,
            dst_x: plane.dest.x,
            dst_y: plane.dest.y,
            dst_w: plane.dest.width,
            dst_h: plane.dest.height,
            alpha: (plane.alpha.clamp(0.0, 1.0) * 65535.0).round() as u32,
            _reserved: 0,
        }
    }

    /// Commit `planes` (bottom to top) in one update
    ///
    /// Never fails: a controller error is logged and yields an invalid
    /// present fence so the next frame starts fresh.
    pub fn submit(
        &mut self,
        controller: &mut dyn DisplayController,
        planes: Vec<PlaneSource<'_>>,
    ) -> SubmitOutcome {
        let guards: Vec<ReadGuard<'_>> = planes
            .iter()
            .map(|p| p.buffer.acquire_read(self.policy.lock_timeout))
            .collect();

        let mut fences = Vec::new();
        let mut records = Vec::with_capacity(planes.len());
        for (plane, guard) in planes.iter().zip(&guards) {
            let wait = Fence::merge(plane.acquire.duplicate(), guard.wait_fence());
            let fence_index = if wait.is_valid() {
                fences.push(wait);
                (fences.len() - 1) as i32
            } else {
                NO_FENCE
            };
            records.push(Self::record(plane, fence_index));
        }

        let bandwidth_ok =
            !self.bandwidth_negotiation || controller.negotiate_bandwidth(&records);
        if !bandwidth_ok {
            // The refused plane set is never committed; the frame is dropped
            warn!(controller = controller.name(), planes = records.len(), "Bandwidth request refused, frame dropped");
            return SubmitOutcome {
                present: Fence::invalid(),
                committed: false,
                bandwidth_ok,
            };
        }

        match controller.commit(&records, fences) {
            Ok(present) => {
                for guard in &guards {
                    guard.add_fence(present.duplicate());
                }
                self.commits += 1;
                trace!(controller = controller.name(), planes = records.len(), ?present, "Frame committed");
                SubmitOutcome {
                    present,
                    committed: true,
                    bandwidth_ok,
                }
            }
            Err(e) => {
                self.failures += 1;
                error!(controller = controller.name(), "Frame submission failed: {}", e);
                SubmitOutcome {
                    present: Fence::invalid(),
                    committed: false,
                    bandwidth_ok,
                }
            }
        }
    }
}

/// In-process display controller
///
/// Each frame's present fence signals when the following frame is
/// committed, as scan-out of a frame ends when the next one latches.
#[derive(Debug)]
pub struct VirtualController {
    name: String,
    timeline: Timeline,
    last_point: u64,
    enabled: Arc<AtomicBool>,
    refuse_bandwidth: bool,
    last_commit: Vec<PlaneAttrRecord>,
    frames: u64,
}

impl VirtualController {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            timeline: Timeline::new(format!("{name}-present")),
            name,
            last_point: 0,
            enabled: Arc::new(AtomicBool::new(true)),
            refuse_bandwidth: false,
            last_commit: Vec::new(),
            frames: 0,
        }
    }

    /// Shared switch for simulating a disabled display
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    pub fn set_refuse_bandwidth(&mut self, refuse: bool) {
        self.refuse_bandwidth = refuse;
    }

    pub fn last_commit(&self) -> &[PlaneAttrRecord] {
        &self.last_commit
    }

    /// Last commit as the driver receives it
    pub fn last_commit_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.last_commit)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Release every frame committed so far
    pub fn retire_all(&self) {
        self.timeline.signal_all();
    }
}

impl DisplayController for VirtualController {
    fn name(&self) -> &str {
        &self.name
    }

    fn negotiate_bandwidth(&mut self, _records: &[PlaneAttrRecord]) -> bool {
        !self.refuse_bandwidth
    }

    fn commit(
        &mut self,
        records: &[PlaneAttrRecord],
        fences: Vec<Fence>,
    ) -> Result<Fence, SubmitError> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(SubmitError::Unavailable(format!("{} is disabled", self.name)));
        }
        if let Some(bad) = records
            .iter()
            .find(|r| r.fence_index != NO_FENCE && r.fence_index as usize >= fences.len())
        {
            return Err(SubmitError::Rejected(format!(
                "plane {} references missing fence {}",
                bad.plane, bad.fence_index
            )));
        }
        // Input fences are consumed by the hardware; nothing to keep
        drop(fences);

        self.timeline.signal(self.last_point);
        let (present, point) = self.timeline.next_fence();
        self.last_point = point;
        self.last_commit = records.to_vec();
        self.frames += 1;
        Ok(present)
    }
}
