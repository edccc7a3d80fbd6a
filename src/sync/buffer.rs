//! Shared buffer handles
//!
//! A `BufferHandle` is one reference to a block of pixel memory. The lock word
//! and fence table live in the shared part of the buffer, so every handle
//! obtained through `register()` operates on the same physical lock. In a
//! multi-process deployment that shared part is the mapped buffer header; the
//! in-process representation keeps the same shape.
//!
//! Lock discipline:
//! - shared-read is taken by bumping the reader count in the lock word with a
//!   CAS, without touching the mutex unless a writer is waiting or holds it;
//! - exclusive-write waits on the mutex + condvar for readers and any writer
//!   to drain;
//! - both waits are bounded: on timeout the caller proceeds unlocked (a
//!   degraded guard) rather than stalling the display pipeline.
//!
//! Fence table: one write-fence slot and a bounded ring of read fences, only
//! mutated while the table mutex is held.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, trace, warn};

use hwcomp_ipc::wire::BufferHeader;

use super::fence::Fence;
use super::lock_unpoisoned;
use crate::shared::{MemoryLayout, PixelFormat};

/// Capacity of the read-fence ring
pub const READ_FENCE_SLOTS: usize = 4;

const WRITER: u32 = 1 << 31;
const READER_MASK: u32 = WRITER - 1;

/// Process-independent buffer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Geometry and memory class of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub layout: MemoryLayout,
    pub protected: bool,
}

impl BufferDesc {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            layout: MemoryLayout::Linear,
            protected: false,
        }
    }

    pub fn with_layout(mut self, layout: MemoryLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    /// Approximate allocation size in bytes
    pub fn byte_size(&self) -> u64 {
        let pixels = self.width as u64 * self.height as u64;
        match self.format {
            PixelFormat::Rgb565 => pixels * 2,
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yv12 => pixels * 3 / 2,
            PixelFormat::P010 => pixels * 3,
            _ => pixels * 4,
        }
    }
}

/// Observable lock state of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    SharedRead(u32),
    ExclusiveWrite,
}

#[derive(Default)]
struct FenceTable {
    /// Most recent writer
    write: Fence,
    /// Outstanding readers, oldest first
    reads: VecDeque<Fence>,
}

impl FenceTable {
    /// A new write supersedes every earlier read for ordering purposes
    fn add_write(&mut self, fence: Fence) {
        self.reads.clear();
        self.write = fence;
    }

    fn add_read(&mut self, id: BufferId, fence: Fence) {
        if !fence.is_valid() {
            return;
        }
        if let Some(slot) = self.reads.iter_mut().find(|f| f.same_source(&fence)) {
            let previous = std::mem::take(slot);
            *slot = Fence::merge(previous, fence);
            return;
        }
        self.reads.retain(|f| !f.is_signaled());
        if self.reads.len() >= READ_FENCE_SLOTS {
            let dropped = self.reads.pop_front();
            warn!(
                buffer = %id,
                ?dropped,
                "Read fence ring full, dropping oldest pending fence"
            );
        }
        self.reads.push_back(fence);
    }

    /// What a writer must wait for: all pending readers, else the last writer
    fn fences_for_writer(&self) -> Fence {
        let pending: Vec<Fence> = self
            .reads
            .iter()
            .filter(|f| !f.is_signaled())
            .map(Fence::duplicate)
            .collect();
        if pending.is_empty() {
            self.write.duplicate()
        } else {
            Fence::merge_all(pending)
        }
    }

    fn pending_reads(&self) -> usize {
        self.reads.iter().filter(|f| !f.is_signaled()).count()
    }
}

/// The shared part of a buffer
struct SharedBuffer {
    id: BufferId,
    desc: BufferDesc,
    lock_word: AtomicU32,
    writers_waiting: AtomicU32,
    write_seq: AtomicU64,
    handles: AtomicU32,
    destroyed: AtomicBool,
    table: Mutex<FenceTable>,
    cond: Condvar,
    /// Linear copy used for CPU access when the primary layout is not linear
    shadow: Option<BufferHandle>,
}

/// One process-local reference to a shared buffer
pub struct BufferHandle {
    shared: Arc<SharedBuffer>,
}

impl BufferHandle {
    /// Create a buffer owned by the caller
    pub fn allocate(id: BufferId, desc: BufferDesc) -> Self {
        Self::build(id, desc, None)
    }

    /// Create a buffer whose CPU-visible content lives in `shadow`
    pub fn with_shadow(id: BufferId, desc: BufferDesc, shadow: BufferHandle) -> Self {
        Self::build(id, desc, Some(shadow))
    }

    fn build(id: BufferId, desc: BufferDesc, shadow: Option<BufferHandle>) -> Self {
        Self {
            shared: Arc::new(SharedBuffer {
                id,
                desc,
                lock_word: AtomicU32::new(0),
                writers_waiting: AtomicU32::new(0),
                write_seq: AtomicU64::new(0),
                handles: AtomicU32::new(1),
                destroyed: AtomicBool::new(false),
                table: Mutex::new(FenceTable::default()),
                cond: Condvar::new(),
                shadow,
            }),
        }
    }

    /// Take another reference to the same buffer (same lock, same fences)
    pub fn register(&self) -> Self {
        self.assert_alive();
        self.shared.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drop this reference
    pub fn unregister(self) {}

    /// Owner-side teardown; any later synchronization call is a caller bug
    pub fn destroy(&self) {
        self.shared.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    pub fn id(&self) -> BufferId {
        self.shared.id
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.shared.desc
    }

    /// Number of live handles to this buffer
    pub fn handle_count(&self) -> u32 {
        self.shared.handles.load(Ordering::Acquire)
    }

    /// Monotonic count of completed exclusive writes
    pub fn write_seq(&self) -> u64 {
        self.shared.write_seq.load(Ordering::Acquire)
    }

    pub fn shadow(&self) -> Option<&BufferHandle> {
        self.shared.shadow.as_ref()
    }

    /// Handle to use for CPU access
    pub fn cpu_handle(&self) -> &BufferHandle {
        match (&self.shared.desc.layout, &self.shared.shadow) {
            (MemoryLayout::Linear, _) | (_, None) => self,
            (_, Some(shadow)) => shadow,
        }
    }

    /// True if both handles reference the same physical buffer
    pub fn same_buffer(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn lock_state(&self) -> LockState {
        let word = self.shared.lock_word.load(Ordering::Acquire);
        if word & WRITER != 0 {
            LockState::ExclusiveWrite
        } else if word & READER_MASK != 0 {
            LockState::SharedRead(word & READER_MASK)
        } else {
            LockState::Unlocked
        }
    }

    fn assert_alive(&self) {
        debug_assert!(
            !self.is_destroyed(),
            "synchronization call on destroyed buffer {}",
            self.shared.id
        );
    }

    fn try_add_reader(&self) -> bool {
        let word = &self.shared.lock_word;
        let mut current = word.load(Ordering::Acquire);
        loop {
            if current & WRITER != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Take the buffer for shared reading
    pub fn acquire_read(&self, timeout: Duration) -> ReadGuard<'_> {
        self.assert_alive();
        let shared = &*self.shared;

        if shared.writers_waiting.load(Ordering::Acquire) == 0 && self.try_add_reader() {
            return ReadGuard {
                buffer: self,
                held: true,
            };
        }

        let deadline = Instant::now() + timeout;
        let mut table = lock_unpoisoned(&shared.table);
        loop {
            if shared.writers_waiting.load(Ordering::Acquire) == 0 && self.try_add_reader() {
                return ReadGuard {
                    buffer: self,
                    held: true,
                };
            }
            let now = Instant::now();
            if now >= deadline {
                drop(table);
                error!(
                    buffer = %shared.id,
                    state = ?self.lock_state(),
                    "Timed out waiting for shared-read lock, proceeding unlocked"
                );
                return ReadGuard {
                    buffer: self,
                    held: false,
                };
            }
            table = match shared.cond.wait_timeout(table, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Take the buffer for exclusive writing
    ///
    /// The returned guard carries the fence the writer must wait on: every
    /// pending reader, or the previous writer when there are none.
    pub fn acquire_write(&self, timeout: Duration) -> WriteGuard<'_> {
        self.assert_alive();
        let shared = &*self.shared;
        shared.writers_waiting.fetch_add(1, Ordering::AcqRel);

        let deadline = Instant::now() + timeout;
        let mut table = lock_unpoisoned(&shared.table);
        let held = loop {
            if shared
                .lock_word
                .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            table = match shared.cond.wait_timeout(table, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        };
        shared.writers_waiting.fetch_sub(1, Ordering::AcqRel);
        let wait = table.fences_for_writer();
        if !held {
            // Readers may be parked behind our waiting count
            shared.cond.notify_all();
        }
        drop(table);

        if !held {
            error!(
                buffer = %shared.id,
                state = ?self.lock_state(),
                "Timed out waiting for exclusive-write lock, proceeding anyway"
            );
        }
        trace!(buffer = %shared.id, ?wait, held, "Write lock acquired");
        WriteGuard {
            buffer: self,
            held,
            wait,
        }
    }

    /// Fence a prospective writer would have to wait on right now
    pub fn pending_fence(&self) -> Fence {
        let table = lock_unpoisoned(&self.shared.table);
        match self.lock_state() {
            LockState::ExclusiveWrite => table.write.duplicate(),
            _ => table.fences_for_writer(),
        }
    }

    /// Producer-side helper: record a completed write signalled by `fence`
    pub fn mark_written(&self, fence: Fence, timeout: Duration) {
        let guard = self.acquire_write(timeout);
        guard.add_fence(fence);
    }

    /// Wire snapshot of the buffer
    pub fn header(&self) -> BufferHeader {
        let shared = &*self.shared;
        let table = lock_unpoisoned(&shared.table);
        let mut flags = 0;
        if shared.desc.protected {
            flags |= BufferHeader::FLAG_PROTECTED;
        }
        if shared.shadow.is_some() {
            flags |= BufferHeader::FLAG_SHADOW;
        }
        if self.is_destroyed() {
            flags |= BufferHeader::FLAG_DESTROYED;
        }
        BufferHeader {
            id: shared.id.0,
            write_seq: self.write_seq(),
            width: shared.desc.width,
            height: shared.desc.height,
            format: shared.desc.format.code(),
            layout: shared.desc.layout.code(),
            lock_word: shared.lock_word.load(Ordering::Acquire),
            flags,
            read_fences: table.pending_reads() as u32,
            write_fence: u32::from(table.write.is_valid()),
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.shared.handles.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.shared.id)
            .field("desc", &self.shared.desc)
            .field("lock", &self.lock_state())
            .finish()
    }
}

/// Shared-read hold on a buffer
pub struct ReadGuard<'a> {
    buffer: &'a BufferHandle,
    held: bool,
}

impl ReadGuard<'_> {
    /// True if the lock timed out and this guard holds nothing
    pub fn is_degraded(&self) -> bool {
        !self.held
    }

    /// Fence of the last writer; a reader must not start before it signals
    pub fn wait_fence(&self) -> Fence {
        lock_unpoisoned(&self.buffer.shared.table).write.duplicate()
    }

    /// Record that this reader finishes when `fence` signals
    pub fn add_fence(&self, fence: Fence) {
        let shared = &*self.buffer.shared;
        lock_unpoisoned(&shared.table).add_read(shared.id, fence);
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let shared = &*self.buffer.shared;
        let previous = shared.lock_word.fetch_sub(1, Ordering::AcqRel);
        if previous & READER_MASK == 1 {
            let _table = lock_unpoisoned(&shared.table);
            shared.cond.notify_all();
        }
    }
}

/// Exclusive-write hold on a buffer
pub struct WriteGuard<'a> {
    buffer: &'a BufferHandle,
    held: bool,
    wait: Fence,
}

impl WriteGuard<'_> {
    pub fn is_degraded(&self) -> bool {
        !self.held
    }

    /// Fence the writer must wait on before touching the memory
    pub fn wait_fence(&self) -> Fence {
        self.wait.duplicate()
    }

    pub fn take_wait_fence(&mut self) -> Fence {
        std::mem::take(&mut self.wait)
    }

    /// Record that this write completes when `fence` signals
    pub fn add_fence(&self, fence: Fence) {
        lock_unpoisoned(&self.buffer.shared.table).add_write(fence);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let shared = &*self.buffer.shared;
        let _table = lock_unpoisoned(&shared.table);
        shared.write_seq.fetch_add(1, Ordering::AcqRel);
        if self.held {
            shared.lock_word.fetch_and(!WRITER, Ordering::AcqRel);
            shared.cond.notify_all();
        }
    }
}
