//! Fences and sync timelines
//!
//! A `Timeline` is a monotonically increasing hardware-style counter; a
//! `Fence` is a set of (timeline, point) targets that is satisfied once every
//! timeline has reached its point. Fences are move-only: dropping one closes
//! it, and sharing requires an explicit `duplicate()`. A fence with no
//! targets is the "invalid" fence and counts as already signaled.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::lock_unpoisoned;

static NEXT_TIMELINE_ID: AtomicU64 = AtomicU64::new(1);

/// Fence errors
#[derive(Debug, Error)]
pub enum FenceError {
    #[error("fence wait timed out after {0:?}")]
    Timeout(Duration),
}

struct TimelineInner {
    id: u64,
    name: String,
    /// Highest signaled point
    value: Mutex<u64>,
    cond: Condvar,
    /// Highest point handed out
    next_point: AtomicU64,
}

/// A counter that hardware (or a worker thread) advances as work completes
#[derive(Clone)]
pub struct Timeline {
    inner: Arc<TimelineInner>,
}

impl Timeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TimelineInner {
                id: NEXT_TIMELINE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                value: Mutex::new(0),
                cond: Condvar::new(),
                next_point: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Currently signaled point
    pub fn value(&self) -> u64 {
        *lock_unpoisoned(&self.inner.value)
    }

    /// Reserve the next point and return a fence for it
    pub fn next_fence(&self) -> (Fence, u64) {
        let point = self.inner.next_point.fetch_add(1, Ordering::AcqRel) + 1;
        (self.fence_at(point), point)
    }

    /// Fence that signals once the timeline reaches `point`
    pub fn fence_at(&self, point: u64) -> Fence {
        if point <= self.value() {
            return Fence::invalid();
        }
        Fence {
            points: vec![SyncPoint {
                timeline: Arc::clone(&self.inner),
                point,
            }],
        }
    }

    /// Advance the timeline to `point`, waking every waiter it satisfies
    pub fn signal(&self, point: u64) {
        let mut value = lock_unpoisoned(&self.inner.value);
        if point > *value {
            *value = point;
            self.inner.cond.notify_all();
        }
    }

    /// Signal every point handed out so far
    pub fn signal_all(&self) {
        self.signal(self.inner.next_point.load(Ordering::Acquire));
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("value", &self.value())
            .finish()
    }
}

#[derive(Clone)]
struct SyncPoint {
    timeline: Arc<TimelineInner>,
    point: u64,
}

impl SyncPoint {
    fn is_signaled(&self) -> bool {
        *lock_unpoisoned(&self.timeline.value) >= self.point
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut value = lock_unpoisoned(&self.timeline.value);
        while *value < self.point {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            value = match self.timeline.cond.wait_timeout(value, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// Move-only fence handle
#[derive(Default)]
pub struct Fence {
    points: Vec<SyncPoint>,
}

impl Fence {
    /// The "nothing to wait on" fence
    pub const fn invalid() -> Self {
        Self { points: Vec::new() }
    }

    pub fn is_valid(&self) -> bool {
        !self.points.is_empty()
    }

    /// Second handle to the same targets
    pub fn duplicate(&self) -> Self {
        Self {
            points: self.points.clone(),
        }
    }

    /// Combine two fences into one that signals when both have
    ///
    /// Targets on the same timeline collapse to the later point, and targets
    /// that already signaled are dropped.
    pub fn merge(a: Fence, b: Fence) -> Fence {
        let mut points = a.points;
        for p in b.points {
            match points
                .iter_mut()
                .find(|q| Arc::ptr_eq(&q.timeline, &p.timeline))
            {
                Some(q) => q.point = q.point.max(p.point),
                None => points.push(p),
            }
        }
        points.retain(|p| !p.is_signaled());
        Fence { points }
    }

    /// Merge any number of fences
    pub fn merge_all(fences: impl IntoIterator<Item = Fence>) -> Fence {
        fences.into_iter().fold(Fence::invalid(), Fence::merge)
    }

    pub fn is_signaled(&self) -> bool {
        self.points.iter().all(SyncPoint::is_signaled)
    }

    /// Block until signaled or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        let deadline = Instant::now() + timeout;
        for p in &self.points {
            if !p.wait_until(deadline) {
                return Err(FenceError::Timeout(timeout));
            }
        }
        Ok(())
    }

    /// Release the handle
    pub fn close(self) {}

    /// True if both fences target exactly the same set of timelines
    pub fn same_source(&self, other: &Fence) -> bool {
        self.points.len() == other.points.len()
            && self.points.iter().all(|p| {
                other
                    .points
                    .iter()
                    .any(|q| Arc::ptr_eq(&p.timeline, &q.timeline))
            })
    }

    /// Highest targeted point on `timeline`, if any
    pub fn point_on(&self, timeline: &Timeline) -> Option<u64> {
        self.points
            .iter()
            .filter(|p| Arc::ptr_eq(&p.timeline, &timeline.inner))
            .map(|p| p.point)
            .max()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.points.is_empty() {
            return write!(f, "Fence(invalid)");
        }
        write!(f, "Fence[")?;
        for (i, p) in self.points.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", p.timeline.name, p.point)?;
        }
        write!(f, "]")
    }
}
