//! Scratch buffer resolver
//!
//! Pooled off-screen buffers for layers that need a pre-transform before a
//! plane can show them, and for the composition target itself. Copies into
//! scratch buffers run on a `BlitEngine` and are ordered purely by fences:
//! nothing here waits on the GPU or the copy thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::plane::PlaneCaps;
use crate::shared::{BlendMode, MemoryLayout, PixelFormat, Rect, Transform};
use crate::sync::{lock_unpoisoned, BufferDesc, BufferHandle, BufferId, Fence, SyncPolicy, Timeline};

/// Blit engine errors
#[derive(Debug, Error)]
pub enum BlitError {
    #[error("blit engine {engine} cannot perform {missing:?}")]
    Unsupported { engine: String, missing: PlaneCaps },
    #[error("blit engine {0} has shut down")]
    Disconnected(String),
    #[error("scratch set {0:?} does not exist")]
    UnknownScratch(ScratchId),
}

/// Scratch allocation errors
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("scratch budget exhausted: need {needed} bytes, {available} available")]
    Budget { needed: u64, available: u64 },
    #[error("cannot allocate {0:?} buffers")]
    Format(PixelFormat),
    #[error("zero-sized buffer {0}x{1}")]
    Empty(u32, u32),
}

/// What an engine can do in one pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlitCaps {
    /// Subset of `PlaneCaps::RESOLVABLE`
    pub ops: PlaneCaps,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for BlitCaps {
    fn default() -> Self {
        Self {
            ops: PlaneCaps::RESOLVABLE,
            min_scale: 0.0625,
            max_scale: 16.0,
        }
    }
}

/// One copy/convert job
#[derive(Debug)]
pub struct BlitJob {
    pub src: BufferId,
    pub dst: BufferId,
    pub src_rect: Rect,
    pub dst_rect: Rect,
    pub transform: Transform,
    pub blend: BlendMode,
    pub alpha: f32,
    /// Must signal before the engine touches either buffer
    pub wait: Fence,
}

impl BlitJob {
    /// Operations this job asks of the engine
    pub fn required_ops(&self) -> PlaneCaps {
        let mut ops = PlaneCaps::empty();
        if self.transform.rotates_90() {
            ops |= PlaneCaps::ROTATE_90;
        }
        if !self.transform.flips().is_empty() {
            ops |= PlaneCaps::FLIP;
        }
        let (w, h) = self
            .transform
            .apply_to_size(self.src_rect.width, self.src_rect.height);
        if (w, h) != (self.dst_rect.width, self.dst_rect.height) {
            ops |= PlaneCaps::SCALE;
        }
        ops
    }
}

/// A 2D/GPU engine that fills buffers asynchronously
pub trait BlitEngine: Send + Sync {
    fn name(&self) -> &str;

    fn caps(&self) -> &BlitCaps;

    /// Queue `job`; the returned fence signals once the copy has landed
    fn submit(&self, job: BlitJob) -> Result<Fence, BlitError>;
}

/// Software engine running jobs in order on a worker thread
pub struct ThreadedBlitEngine {
    name: String,
    caps: BlitCaps,
    timeline: Timeline,
    /// Point reservation and queueing happen under this lock so the timeline
    /// signals in queue order
    sender: Mutex<Option<mpsc::Sender<(BlitJob, u64)>>>,
    worker: Option<JoinHandle<()>>,
    completed: Arc<AtomicU64>,
}

impl ThreadedBlitEngine {
    pub fn spawn(name: impl Into<String>, caps: BlitCaps, fence_timeout: Duration) -> Self {
        let name = name.into();
        let timeline = Timeline::new(format!("{name}-blit"));
        let completed = Arc::new(AtomicU64::new(0));
        let (sender, receiver) = mpsc::channel::<(BlitJob, u64)>();

        let worker_timeline = timeline.clone();
        let worker_completed = Arc::clone(&completed);
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("{name}-blit"))
            .spawn(move || {
                for (job, point) in receiver {
                    if let Err(e) = job.wait.wait(fence_timeout) {
                        warn!(engine = %worker_name, src = %job.src, dst = %job.dst, "Blit input not ready: {}", e);
                    }
                    trace!(
                        engine = %worker_name,
                        src = %job.src,
                        dst = %job.dst,
                        transform = ?job.transform,
                        "Blit complete"
                    );
                    worker_completed.fetch_add(1, Ordering::Relaxed);
                    worker_timeline.signal(point);
                }
                debug!(engine = %worker_name, "Blit worker exiting");
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to spawn blit worker for {}: {}", name, e);
                None
            }
        };
        info!(engine = %name, ops = ?caps.ops, "Blit engine started");

        Self {
            name,
            caps,
            timeline,
            sender: Mutex::new(worker.as_ref().map(|_| sender)),
            worker,
            completed,
        }
    }

    /// Jobs finished so far
    pub fn jobs_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Fence covering every job queued so far
    pub fn flush_fence(&self) -> Fence {
        let sender = lock_unpoisoned(&self.sender);
        let (fence, point) = self.timeline.next_fence();
        match sender.as_ref() {
            Some(sender) => {
                let marker = BlitJob {
                    src: BufferId::default(),
                    dst: BufferId::default(),
                    src_rect: Rect::default(),
                    dst_rect: Rect::default(),
                    transform: Transform::empty(),
                    blend: BlendMode::None,
                    alpha: 1.0,
                    wait: Fence::invalid(),
                };
                if sender.send((marker, point)).is_err() {
                    self.timeline.signal(point);
                }
            }
            None => self.timeline.signal(point),
        }
        fence
    }
}

impl BlitEngine for ThreadedBlitEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> &BlitCaps {
        &self.caps
    }

    fn submit(&self, job: BlitJob) -> Result<Fence, BlitError> {
        let missing = job.required_ops() - self.caps.ops;
        if !missing.is_empty() {
            return Err(BlitError::Unsupported {
                engine: self.name.clone(),
                missing,
            });
        }
        let guard = lock_unpoisoned(&self.sender);
        let sender = guard
            .as_ref()
            .ok_or_else(|| BlitError::Disconnected(self.name.clone()))?;
        let (fence, point) = self.timeline.next_fence();
        sender
            .send((job, point))
            .map_err(|_| BlitError::Disconnected(self.name.clone()))?;
        Ok(fence)
    }
}

impl Drop for ThreadedBlitEngine {
    fn drop(&mut self) {
        lock_unpoisoned(&self.sender).take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for ThreadedBlitEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedBlitEngine")
            .field("name", &self.name)
            .field("caps", &self.caps)
            .field("completed", &self.jobs_completed())
            .finish()
    }
}

/// Source of scratch memory
pub trait BufferAllocator: Send {
    fn allocate(&mut self, desc: BufferDesc) -> Result<BufferHandle, AllocError>;

    fn free(&mut self, buffer: BufferHandle);
}

/// Process-local allocator with an optional byte budget
#[derive(Debug)]
pub struct MemoryAllocator {
    next_id: u64,
    budget: u64,
    used: u64,
}

impl MemoryAllocator {
    /// Scratch ids live above the producer id range
    const FIRST_ID: u64 = 1 << 32;

    /// `budget` of 0 means unlimited
    pub fn new(budget: u64) -> Self {
        Self {
            next_id: Self::FIRST_ID,
            budget,
            used: 0,
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

impl BufferAllocator for MemoryAllocator {
    fn allocate(&mut self, desc: BufferDesc) -> Result<BufferHandle, AllocError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(AllocError::Empty(desc.width, desc.height));
        }
        if !desc.format.is_supported() {
            return Err(AllocError::Format(desc.format));
        }
        let needed = desc.byte_size();
        if self.budget > 0 && self.used + needed > self.budget {
            return Err(AllocError::Budget {
                needed,
                available: self.budget.saturating_sub(self.used),
            });
        }
        self.used += needed;
        let id = BufferId(self.next_id);
        self.next_id += 1;

        if desc.layout == MemoryLayout::Linear {
            return Ok(BufferHandle::allocate(id, desc));
        }
        let shadow_id = BufferId(self.next_id);
        self.next_id += 1;
        let shadow = BufferHandle::allocate(shadow_id, desc.with_layout(MemoryLayout::Linear));
        Ok(BufferHandle::with_shadow(id, desc, shadow))
    }

    fn free(&mut self, buffer: BufferHandle) {
        self.used = self.used.saturating_sub(buffer.desc().byte_size());
        buffer.destroy();
    }
}

/// Pool lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchKey {
    pub transform: Transform,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub layout: MemoryLayout,
    pub protected: bool,
}

impl ScratchKey {
    pub fn desc(&self) -> BufferDesc {
        BufferDesc::new(self.width, self.height, self.format)
            .with_layout(self.layout)
            .with_protected(self.protected)
    }
}

/// Index of a set inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScratchId(pub usize);

/// Who holds a scratch set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchOwner {
    /// Pre-transform for the layer at this z-index
    Layer(usize),
    /// Composition target, double-buffered by slot
    Target(u8),
}

/// What a scratch buffer currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FillRecord {
    source: BufferId,
    write_seq: u64,
    src_rect: Rect,
    transform: Transform,
}

/// One pooled scratch buffer
#[derive(Debug)]
pub struct ScratchBufferSet {
    key: ScratchKey,
    buffer: BufferHandle,
    /// Claims this frame
    use_count: u32,
    claimed_by: Option<ScratchOwner>,
    /// Cross-frame lifetime extension
    locked_by: Option<ScratchOwner>,
    filled: Option<FillRecord>,
    /// Completion of the last fill
    content_fence: Fence,
    last_used_frame: u64,
}

impl ScratchBufferSet {
    pub fn key(&self) -> &ScratchKey {
        &self.key
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Last-known release fence: every reader still using the buffer
    pub fn release_fence(&self) -> Fence {
        self.buffer.pending_fence()
    }

    fn is_free(&self) -> bool {
        self.claimed_by.is_none() && self.locked_by.is_none()
    }
}

/// Pool of scratch buffer sets for one display
pub struct ScratchPool {
    sets: Vec<Option<ScratchBufferSet>>,
    allocator: Box<dyn BufferAllocator>,
    max_entries: usize,
    frame: u64,
}

impl ScratchPool {
    pub fn new(allocator: Box<dyn BufferAllocator>, max_entries: usize) -> Self {
        Self {
            sets: Vec::new(),
            allocator,
            max_entries: max_entries.max(1),
            frame: 0,
        }
    }

    /// Drop every per-frame claim; locks survive
    pub fn begin_frame(&mut self) {
        self.frame += 1;
        for set in self.sets.iter_mut().flatten() {
            set.claimed_by = None;
            set.use_count = 0;
        }
    }

    /// Unlock everything not claimed this frame
    pub fn end_frame(&mut self) {
        for set in self.sets.iter_mut().flatten() {
            if set.claimed_by.is_none() && set.locked_by.is_some() {
                trace!(buffer = %set.buffer.id(), "Scratch set unused this frame, unlocking");
                set.locked_by = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sets.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: ScratchId) -> Option<&ScratchBufferSet> {
        self.sets.get(id.0).and_then(Option::as_ref)
    }

    pub fn buffer(&self, id: ScratchId) -> Option<&BufferHandle> {
        self.get(id).map(|s| &s.buffer)
    }

    /// Claim a scratch set for `owner` this frame
    ///
    /// Repeated calls for the same owner and key return the same set. A set
    /// locked by `owner` in an earlier frame is handed back to it before any
    /// free set is considered. Returns `None` when nothing can be allocated.
    pub fn assign(&mut self, key: ScratchKey, owner: ScratchOwner) -> Option<ScratchId> {
        let frame = self.frame;
        let found = self
            .position(|s| s.key == key && s.claimed_by == Some(owner))
            .or_else(|| {
                self.position(|s| {
                    s.key == key && s.claimed_by.is_none() && s.locked_by == Some(owner)
                })
            })
            .or_else(|| self.position(|s| s.key == key && s.is_free()));

        let index = match found {
            Some(index) => index,
            None => self.allocate(key)?,
        };
        let set = self.sets[index].as_mut()?;
        set.claimed_by = Some(owner);
        set.use_count += 1;
        set.last_used_frame = frame;
        Some(ScratchId(index))
    }

    fn position(&self, pred: impl Fn(&ScratchBufferSet) -> bool) -> Option<usize> {
        self.sets
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| pred(s)))
    }

    fn allocate(&mut self, key: ScratchKey) -> Option<usize> {
        if self.len() >= self.max_entries && !self.evict_one() {
            debug!(?key, "Scratch pool full and nothing evictable");
            return None;
        }
        let buffer = match self.allocator.allocate(key.desc()) {
            Ok(buffer) => buffer,
            Err(AllocError::Budget { .. }) if self.evict_one() => {
                match self.allocator.allocate(key.desc()) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        debug!(?key, "Scratch allocation failed: {}", e);
                        return None;
                    }
                }
            }
            Err(e) => {
                debug!(?key, "Scratch allocation failed: {}", e);
                return None;
            }
        };
        debug!(buffer = %buffer.id(), ?key, "Allocated scratch buffer");
        let set = ScratchBufferSet {
            key,
            buffer,
            use_count: 0,
            claimed_by: None,
            locked_by: None,
            filled: None,
            content_fence: Fence::invalid(),
            last_used_frame: self.frame,
        };
        match self.sets.iter().position(Option::is_none) {
            Some(slot) => {
                self.sets[slot] = Some(set);
                Some(slot)
            }
            None => {
                self.sets.push(Some(set));
                Some(self.sets.len() - 1)
            }
        }
    }

    /// Free the least recently used set that nobody holds
    fn evict_one(&mut self) -> bool {
        let victim = self
            .sets
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|s| s.is_free()).map(|s| (i, s.last_used_frame)))
            .min_by_key(|&(_, frame)| frame)
            .map(|(i, _)| i);
        match victim.and_then(|i| self.sets[i].take()) {
            Some(set) => {
                debug!(buffer = %set.buffer.id(), key = ?set.key, "Evicting scratch buffer");
                self.allocator.free(set.buffer);
                true
            }
            None => false,
        }
    }

    /// Give back a claim made this frame
    pub fn release(&mut self, id: ScratchId) {
        if let Some(set) = self.sets.get_mut(id.0).and_then(Option::as_mut) {
            set.use_count = set.use_count.saturating_sub(1);
            if set.use_count == 0 {
                set.claimed_by = None;
            }
        }
    }

    /// Keep the set for its current owner across frames
    pub fn lock(&mut self, id: ScratchId) {
        if let Some(set) = self.sets.get_mut(id.0).and_then(Option::as_mut) {
            set.locked_by = set.claimed_by.or(set.locked_by);
        }
    }

    pub fn unlock(&mut self, id: ScratchId) {
        if let Some(set) = self.sets.get_mut(id.0).and_then(Option::as_mut) {
            set.locked_by = None;
        }
    }

    /// Geometry changed: nothing carries over
    pub fn unlock_all(&mut self) {
        for set in self.sets.iter_mut().flatten() {
            set.locked_by = None;
            set.filled = None;
        }
    }

    /// Queue a copy of `source` into the scratch set
    ///
    /// Skips the copy when the set already holds this exact content (same
    /// source, same write sequence, same region). The returned fence signals
    /// once the scratch buffer is ready to be read.
    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        &mut self,
        id: ScratchId,
        source: &BufferHandle,
        acquire: &Fence,
        src_rect: Rect,
        transform: Transform,
        engine: &dyn BlitEngine,
        policy: &SyncPolicy,
    ) -> Result<Fence, BlitError> {
        let set = self
            .sets
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(BlitError::UnknownScratch(id))?;

        let record = FillRecord {
            source: source.id(),
            write_seq: source.write_seq(),
            src_rect,
            transform,
        };
        if set.filled == Some(record) {
            trace!(scratch = %set.buffer.id(), source = %source.id(), "Scratch content unchanged, skipping copy");
            return Ok(set.content_fence.duplicate());
        }

        let read = source.acquire_read(policy.lock_timeout);
        let write = set.buffer.acquire_write(policy.lock_timeout);
        let wait = Fence::merge_all([acquire.duplicate(), read.wait_fence(), write.wait_fence()]);
        let job = BlitJob {
            src: source.id(),
            dst: set.buffer.id(),
            src_rect,
            dst_rect: Rect::sized(set.key.width, set.key.height),
            transform,
            blend: BlendMode::None,
            alpha: 1.0,
            wait,
        };
        let done = engine.submit(job)?;
        read.add_fence(done.duplicate());
        write.add_fence(done.duplicate());
        drop(write);
        drop(read);

        set.filled = Some(record);
        set.content_fence = done.duplicate();
        Ok(done)
    }
}

impl Drop for ScratchPool {
    fn drop(&mut self) {
        for set in self.sets.drain(..).flatten() {
            self.allocator.free(set.buffer);
        }
    }
}

impl fmt::Debug for ScratchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchPool")
            .field("entries", &self.len())
            .field("max_entries", &self.max_entries)
            .field("frame", &self.frame)
            .finish()
    }
}
