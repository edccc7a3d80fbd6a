//! Per-display scheduling
//!
//! A `Display` owns everything one output needs between frames: the plane
//! assigner, its scratch pool, the compositor chain, the composition cache
//! and the controller it commits to. Each refresh runs `prepare` then
//! `present` on the caller's thread.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::assign::{Assigner, Assignment, PlaneSlot};
use crate::compositor::{CompositionContents, CompositorChain, Selection};
use crate::config::{Config, DisplayConfig};
use crate::fbcache::{CacheVerdict, FramebufferCache, RecomposeReason};
use crate::plane::DisplayCaps;
use crate::scratch::{BlitEngine, MemoryAllocator, ScratchId, ScratchKey, ScratchOwner, ScratchPool};
use crate::shared::{
    BlendMode, CompositionKind, DisplayId, Layer, MemoryLayout, PixelFormat, Rect, Transform,
};
use crate::submit::{DisplayController, FrameSubmitter, PlaneSource};
use crate::sync::{lock_unpoisoned, BufferHandle, Fence, SyncPolicy};

/// Mutable display state shared with the hotplug thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayState {
    pub connected: bool,
    pub blanked: bool,
    pub width: u32,
    pub height: u32,
}

impl DisplayState {
    pub fn is_active(&self) -> bool {
        self.connected && !self.blanked
    }
}

/// State reachable from the vsync and hotplug threads
#[derive(Debug)]
pub struct DisplayShared {
    id: DisplayId,
    name: String,
    state: Mutex<DisplayState>,
    geometry_dirty: AtomicBool,
    vsync_enabled: AtomicBool,
}

impl DisplayShared {
    pub fn new(id: DisplayId, name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id,
            name: name.into(),
            state: Mutex::new(DisplayState {
                connected: true,
                blanked: false,
                width,
                height,
            }),
            geometry_dirty: AtomicBool::new(false),
            vsync_enabled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> DisplayId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DisplayState {
        *lock_unpoisoned(&self.state)
    }

    /// Apply a connection or mode change
    ///
    /// Returns whether anything changed. A size change marks the geometry
    /// dirty so the next prepare drops all cross-frame state.
    pub fn set_connected(&self, connected: bool, width: u32, height: u32) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        let resized = connected && (state.width != width || state.height != height);
        if state.connected == connected && !resized {
            return false;
        }
        state.connected = connected;
        if resized {
            state.width = width;
            state.height = height;
        }
        self.geometry_dirty.store(true, Ordering::Release);
        true
    }

    pub fn set_blanked(&self, blanked: bool) {
        lock_unpoisoned(&self.state).blanked = blanked;
    }

    pub fn vsync_enabled(&self) -> bool {
        self.vsync_enabled.load(Ordering::Acquire)
    }

    pub fn set_vsync_enabled(&self, enabled: bool) {
        self.vsync_enabled.store(enabled, Ordering::Release);
    }

    pub fn mark_geometry_dirty(&self) {
        self.geometry_dirty.store(true, Ordering::Release);
    }

    fn take_geometry_dirty(&self) -> bool {
        self.geometry_dirty.swap(false, Ordering::AcqRel)
    }
}

/// Running counters for one display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_prepared: u64,
    pub frames_presented: u64,
    pub plane_layers: u64,
    pub composed_layers: u64,
    pub client_frames: u64,
    pub recycled_frames: u64,
    pub scratch_fills: u64,
    pub compose_failures: u64,
    pub submit_failures: u64,
    pub bandwidth_refusals: u64,
    pub hazards: u64,
    pub rollbacks: u64,
}

/// What prepare decided, as reported back to the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepareSummary {
    pub plane_layers: usize,
    pub composed_layers: usize,
    /// The producer must render its client target this frame
    pub client_composition: bool,
    /// The previous composition result is reused
    pub recycled: bool,
    /// Nothing will be shown (blanked or disconnected)
    pub skipped: bool,
}

/// Buffer the producer composed into for client composition
#[derive(Debug)]
pub struct ClientTarget<'a> {
    pub buffer: &'a BufferHandle,
    pub acquire: Fence,
}

/// State carried from prepare to present
#[derive(Debug)]
struct PreparedFrame {
    assignment: Assignment,
    contents: CompositionContents,
    selection: Option<Selection>,
    target: Option<ScratchId>,
    verdict: CacheVerdict,
    geometry_changed: bool,
    size: (u32, u32),
    skipped: bool,
}

/// Composition result kept for recycling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedTarget {
    slot: u8,
    id: ScratchId,
    /// Target write sequence right after the composition landed
    write_seq: u64,
}

/// One physical output
pub struct Display {
    shared: Arc<DisplayShared>,
    assigner: Assigner,
    pool: ScratchPool,
    chain: CompositorChain,
    cache: FramebufferCache,
    submitter: FrameSubmitter,
    controller: Box<dyn DisplayController>,
    engine: Arc<dyn BlitEngine>,
    policy: SyncPolicy,
    prepared: Option<PreparedFrame>,
    last_assignment: Option<Assignment>,
    /// Target slot holding the cached composition result
    cached_target: Option<CachedTarget>,
    /// Completion fence of the composition in `cached_target`
    target_fence: Fence,
    next_target_slot: u8,
    /// Controller refused bandwidth for the last frame
    force_next: bool,
    stats: FrameStats,
}

impl Display {
    pub fn new(
        id: DisplayId,
        display: &DisplayConfig,
        config: &Config,
        engine: Arc<dyn BlitEngine>,
        controller: Box<dyn DisplayController>,
    ) -> Self {
        let caps = DisplayCaps::from_config(display);
        let policy = config.sync.policy();
        let (name, width, height) = (&display.name, display.width, display.height);
        info!(
            %id,
            name = %name,
            planes = caps.plane_count(),
            width = width,
            height = height,
            "Display configured"
        );
        Self {
            shared: Arc::new(DisplayShared::new(id, display.name.clone(), display.width, display.height)),
            assigner: Assigner::new(caps.clone(), &config.scheduler, Some(*engine.caps())),
            pool: ScratchPool::new(
                Box::new(MemoryAllocator::new(config.scratch.budget_bytes)),
                config.scratch.max_entries,
            ),
            chain: CompositorChain::from_config(&config.compositor, Arc::clone(&engine)),
            cache: FramebufferCache::new(),
            submitter: FrameSubmitter::new(policy, caps.bandwidth_negotiation),
            controller,
            engine,
            policy,
            prepared: None,
            last_assignment: None,
            cached_target: None,
            target_fence: Fence::invalid(),
            next_target_slot: 0,
            force_next: false,
            stats: FrameStats::default(),
        }
    }

    pub fn id(&self) -> DisplayId {
        self.shared.id
    }

    pub fn shared(&self) -> Arc<DisplayShared> {
        Arc::clone(&self.shared)
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn chain_mut(&mut self) -> &mut CompositorChain {
        &mut self.chain
    }

    pub fn cache(&self) -> &FramebufferCache {
        &self.cache
    }

    pub fn set_force_composition(&mut self, force: bool) {
        self.assigner.set_force_composition(force);
    }

    pub fn blank(&self, blanked: bool) {
        info!(display = %self.shared.id, blanked, "Display blank state changed");
        self.shared.set_blanked(blanked);
    }

    fn forget_composition(&mut self) {
        self.cache.invalidate();
        self.cached_target = None;
        self.target_fence = Fence::invalid();
    }

    /// Decide how each layer is shown this frame
    ///
    /// Writes `composition` on every layer. Layers marked `Client` must be
    /// rendered by the producer into the client target passed to `present`.
    pub fn prepare(&mut self, layers: &mut [Layer], geometry_changed: bool, last_pass: bool) -> PrepareSummary {
        // Hold the display state for the whole pass so a reconfiguration
        // cannot land halfway through it
        let shared = Arc::clone(&self.shared);
        let state_lock = lock_unpoisoned(&shared.state);
        let state = *state_lock;
        let geometry_changed = shared.take_geometry_dirty() || geometry_changed;

        if self.prepared.take().is_some() {
            warn!(display = %self.shared.id, "Previous frame was prepared but never presented");
        }
        if geometry_changed {
            debug!(display = %self.shared.id, "Geometry changed, dropping cross-frame state");
            self.forget_composition();
            self.pool.unlock_all();
        }
        self.pool.begin_frame();
        self.stats.frames_prepared += 1;

        if !state.is_active() {
            for layer in layers.iter_mut() {
                layer.composition = CompositionKind::Client;
            }
            self.prepared = Some(PreparedFrame {
                assignment: Assignment::composition_only(layers.len(), 0),
                contents: CompositionContents::from_indices(layers, &[], geometry_changed, last_pass),
                selection: None,
                target: None,
                verdict: CacheVerdict::Recompose(RecomposeReason::Empty),
                geometry_changed,
                size: (state.width, state.height),
                skipped: true,
            });
            trace!(display = %self.shared.id, ?state, "Display inactive, frame skipped");
            return PrepareSummary {
                skipped: true,
                ..Default::default()
            };
        }

        self.assigner.set_display_size(state.width, state.height);
        let force = std::mem::take(&mut self.force_next);
        let mut assignment = self.assigner.assign(layers, &mut self.pool, force);
        let mut contents = CompositionContents::build(layers, &assignment, geometry_changed, last_pass);

        let mut verdict = CacheVerdict::Recompose(RecomposeReason::Empty);
        let mut target = None;
        let selection = if contents.is_empty() {
            None
        } else {
            let mut selection = self.chain.select(&contents);
            if let Selection::Backend(_) = selection {
                let key = ScratchKey {
                    transform: Transform::empty(),
                    width: state.width,
                    height: state.height,
                    format: PixelFormat::Rgba8888,
                    layout: MemoryLayout::Linear,
                    protected: contents.has_protected,
                };
                match self.claim_target(key, &contents) {
                    Some((id, v)) => {
                        target = Some(id);
                        verdict = v;
                    }
                    None => {
                        debug!(display = %self.shared.id, "No scratch target for composition, using client composition");
                        selection = Selection::Client;
                    }
                }
            }
            if selection == Selection::Client {
                self.forget_composition();
                self.revert_to_client(layers, &mut assignment, &mut contents);
            }
            Some(selection)
        };

        let composed_kind = match selection {
            Some(Selection::Backend(_)) => CompositionKind::Backend,
            _ => CompositionKind::Client,
        };
        for (index, layer) in layers.iter_mut().enumerate() {
            layer.composition = if assignment.plane_for(index).is_some() {
                CompositionKind::Device
            } else {
                composed_kind
            };
        }

        let summary = PrepareSummary {
            plane_layers: assignment.plane_layer_count(),
            composed_layers: contents.len(),
            client_composition: selection == Some(Selection::Client),
            recycled: verdict.is_recyclable(),
            skipped: false,
        };
        self.stats.plane_layers += summary.plane_layers as u64;
        self.stats.composed_layers += summary.composed_layers as u64;
        self.stats.rollbacks += assignment.rollbacks as u64;
        if assignment.hazard {
            self.stats.hazards += 1;
        }
        if summary.client_composition {
            self.stats.client_frames += 1;
        }
        debug!(
            display = %self.shared.id,
            planes = summary.plane_layers,
            composed = summary.composed_layers,
            compositor = selection.map(|s| self.chain.name_of(s)),
            recycled = summary.recycled,
            "Frame prepared"
        );

        self.prepared = Some(PreparedFrame {
            assignment,
            contents,
            selection,
            target,
            verdict,
            geometry_changed,
            size: (state.width, state.height),
            skipped: false,
        });
        drop(state_lock);
        summary
    }

    /// Composition was aborted: the client target carries every layer
    ///
    /// Plane claims and their scratch sets are dropped and the target plane
    /// is the only one left in use.
    fn revert_to_client(&mut self, layers: &[Layer], assignment: &mut Assignment, contents: &mut CompositionContents) {
        let scratch: Vec<ScratchId> = assignment.scratch_ids().collect();
        for id in scratch {
            self.pool.release(id);
        }
        let mut reverted = Assignment::composition_only(layers.len(), assignment.slots.len());
        if let Some(slot) = reverted.slots.get_mut(assignment.target_plane().unwrap_or(0)) {
            *slot = PlaneSlot::FramebufferTarget;
        }
        reverted.hazard = assignment.hazard;
        reverted.rollbacks = assignment.rollbacks;
        debug!(
            display = %self.shared.id,
            planes = assignment.plane_layer_count(),
            "Composition aborted, reverting all layers to client composition"
        );
        *contents = CompositionContents::from_indices(layers, &reverted.composed, contents.geometry_changed, contents.last_pass);
        *assignment = reverted;
    }

    /// Pick the composition target, reusing the cached one when the frame
    /// is unchanged
    fn claim_target(&mut self, key: ScratchKey, contents: &CompositionContents) -> Option<(ScratchId, CacheVerdict)> {
        if let Some(cached) = self.cached_target {
            let verdict = self.cache.check(contents);
            if verdict.is_recyclable() {
                match self.pool.assign(key, ScratchOwner::Target(cached.slot)) {
                    Some(id) if id == cached.id && self.target_intact(&cached) => return Some((id, verdict)),
                    Some(id) => {
                        // Evicted, re-keyed, or reused by a scratch fill while unlocked
                        debug!(display = %self.shared.id, target = id.0, "Cached composition target is stale");
                        self.pool.release(id);
                        self.forget_composition();
                    }
                    None => self.forget_composition(),
                }
            }
        }
        // Compose into the other slot so the scanned-out result stays intact
        let slot = self.next_target_slot;
        let id = self.pool.assign(key, ScratchOwner::Target(slot))?;
        self.next_target_slot ^= 1;
        Some((id, CacheVerdict::Recompose(self.cache_reason(contents))))
    }

    /// Nothing wrote the target since it was composed
    fn target_intact(&self, cached: &CachedTarget) -> bool {
        self.pool
            .buffer(cached.id)
            .is_some_and(|buffer| buffer.write_seq() == cached.write_seq)
    }

    fn cache_reason(&self, contents: &CompositionContents) -> RecomposeReason {
        match self.cache.check(contents) {
            CacheVerdict::Recompose(reason) => reason,
            CacheVerdict::Recyclable => RecomposeReason::Empty,
        }
    }

    /// Compose, fill scratch buffers and commit the prepared frame
    ///
    /// Sets `release_fence` on every layer and returns the frame's present
    /// fence. Never fails: degraded frames yield invalid fences.
    pub fn present(&mut self, layers: &mut [Layer], client_target: Option<ClientTarget<'_>>) -> Fence {
        let Some(frame) = self.prepared.take() else {
            warn!(display = %self.shared.id, "present called without prepare");
            return Fence::invalid();
        };
        if frame.skipped {
            for layer in layers.iter_mut() {
                layer.release_fence = Fence::invalid();
            }
            self.pool.end_frame();
            return Fence::invalid();
        }

        let target_fence = match frame.selection {
            Some(Selection::Backend(index)) => self.compose(&frame, layers, index),
            Some(Selection::Client) => client_target
                .as_ref()
                .map_or_else(Fence::invalid, |c| c.acquire.duplicate()),
            None => Fence::invalid(),
        };
        // Composed layers are free once the backend has read them
        let compose_release = match frame.selection {
            Some(Selection::Backend(_)) if !frame.verdict.is_recyclable() => target_fence.duplicate(),
            _ => Fence::invalid(),
        };

        // Scratch pre-transforms, keyed by plane
        let mut fills: Vec<(usize, Fence)> = Vec::new();
        for (plane, entry) in frame.assignment.entries() {
            let Some(plan) = entry.scratch else {
                continue;
            };
            let layer = &layers[entry.layer];
            let Some(source) = &layer.buffer else {
                continue;
            };
            match self.pool.fill(
                plan.id,
                source,
                &layer.acquire_fence,
                plan.src_rect,
                plan.transform,
                self.engine.as_ref(),
                &self.policy,
            ) {
                Ok(done) => {
                    self.stats.scratch_fills += 1;
                    fills.push((plane, done));
                }
                Err(e) => {
                    error!(display = %self.shared.id, plane, layer = entry.layer, "Scratch fill failed, dropping plane: {}", e);
                }
            }
        }

        let (width, height) = frame.size;
        let mut sources = Vec::with_capacity(frame.assignment.slots.len());
        for plane in frame.assignment.z_order() {
            match frame.assignment.slots[plane] {
                PlaneSlot::Layer(entry) => {
                    let layer = &layers[entry.layer];
                    let shown = match entry.scratch {
                        Some(plan) => self.pool.buffer(plan.id).zip(
                            fills.iter().find(|(p, _)| *p == plane).map(|(_, f)| f.duplicate()),
                        ),
                        None => layer.buffer.as_ref().map(|b| (b, layer.acquire_fence.duplicate())),
                    };
                    let Some((buffer, acquire)) = shown else {
                        continue;
                    };
                    sources.push(PlaneSource {
                        plane,
                        buffer,
                        source: entry.source,
                        dest: layer.dest,
                        transform: entry.transform,
                        blend: layer.blend,
                        alpha: layer.alpha,
                        acquire,
                    });
                }
                PlaneSlot::FramebufferTarget => {
                    let buffer = match frame.selection {
                        Some(Selection::Backend(_)) => frame.target.and_then(|id| self.pool.buffer(id)),
                        Some(Selection::Client) => client_target.as_ref().map(|c| c.buffer),
                        None => None,
                    };
                    let Some(buffer) = buffer else {
                        warn!(display = %self.shared.id, plane, "Framebuffer target has no buffer this frame");
                        continue;
                    };
                    sources.push(PlaneSource {
                        plane,
                        buffer,
                        source: Rect::sized(width, height),
                        dest: Rect::sized(width, height),
                        transform: Transform::empty(),
                        blend: BlendMode::Premultiplied,
                        alpha: 1.0,
                        acquire: target_fence.duplicate(),
                    });
                }
                PlaneSlot::Unused => {}
            }
        }

        let outcome = self.submitter.submit(self.controller.as_mut(), sources);
        if !outcome.bandwidth_ok {
            self.stats.bandwidth_refusals += 1;
            self.force_next = true;
        } else if !outcome.committed {
            self.stats.submit_failures += 1;
        }
        let present = outcome.present;

        for (index, layer) in layers.iter_mut().enumerate() {
            layer.release_fence = match layer.composition {
                CompositionKind::Device => match frame.assignment.plane_for(index) {
                    Some(plane) => fills
                        .iter()
                        .find(|(p, _)| *p == plane)
                        .map_or_else(|| present.duplicate(), |(_, f)| f.duplicate()),
                    None => Fence::invalid(),
                },
                CompositionKind::Backend => compose_release.duplicate(),
                CompositionKind::Client | CompositionKind::Undecided => Fence::invalid(),
            };
        }

        if !frame.geometry_changed {
            for id in frame.assignment.scratch_ids() {
                self.pool.lock(id);
            }
        }
        if let Some(id) = frame.target {
            self.pool.lock(id);
        }
        self.pool.end_frame();

        self.stats.frames_presented += 1;
        self.last_assignment = Some(frame.assignment);
        present
    }

    /// Run the selected backend, or reuse the cached result
    fn compose(&mut self, frame: &PreparedFrame, layers: &[Layer], index: usize) -> Fence {
        self.cache.record(frame.verdict);
        let Some(target_id) = frame.target else {
            return Fence::invalid();
        };
        if frame.verdict.is_recyclable() {
            self.stats.recycled_frames += 1;
            trace!(display = %self.shared.id, "Reusing previous composition");
            return self.target_fence.duplicate();
        }

        let (Some(target), Some(backend)) = (self.pool.buffer(target_id), self.chain.backend_mut(index)) else {
            return Fence::invalid();
        };
        match backend.compose(&frame.contents, layers, target, &self.policy) {
            Ok(done) => {
                self.cache.store(&frame.contents);
                let write_seq = target.write_seq();
                self.cached_target = Some(CachedTarget {
                    slot: self.next_target_slot ^ 1,
                    id: target_id,
                    write_seq,
                });
                self.target_fence = done.duplicate();
                done
            }
            Err(e) => {
                error!(display = %self.shared.id, backend = backend.name(), "Composition failed: {}", e);
                self.stats.compose_failures += 1;
                self.forget_composition();
                Fence::invalid()
            }
        }
    }

    /// Human-readable state report
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let state = self.shared.state();
        let _ = writeln!(
            out,
            "{} ({}): {}x{} connected={} blanked={} vsync={}",
            self.shared.id,
            self.shared.name,
            state.width,
            state.height,
            state.connected,
            state.blanked,
            self.shared.vsync_enabled()
        );
        let _ = writeln!(
            out,
            "  planes={} compositor={} cache_valid={} hits={} misses={} scratch={}",
            self.assigner.caps().plane_count(),
            self.chain.preferred().unwrap_or("client"),
            self.cache.is_valid(),
            self.cache.hits(),
            self.cache.misses(),
            self.pool.len()
        );
        if let Some(assignment) = &self.last_assignment {
            for (plane, slot) in assignment.slots.iter().enumerate() {
                match slot {
                    PlaneSlot::Unused => {
                        let _ = writeln!(out, "  plane {plane}: unused");
                    }
                    PlaneSlot::Layer(entry) => {
                        let _ = writeln!(
                            out,
                            "  plane {plane}: layer {} src={:?} transform={:?} scratch={}",
                            entry.layer,
                            entry.source,
                            entry.transform,
                            entry.scratch.is_some()
                        );
                    }
                    PlaneSlot::FramebufferTarget => {
                        let _ = writeln!(out, "  plane {plane}: framebuffer target {:?}", assignment.composed);
                    }
                }
            }
        }
        let _ = writeln!(out, "  stats: {:?}", self.stats);
        out
    }
}

impl std::fmt::Debug for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display")
            .field("id", &self.shared.id)
            .field("controller", &self.controller.name())
            .field("chain", &self.chain)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaneConfig;
    use crate::scratch::{BlitCaps, ThreadedBlitEngine};
    use crate::shared::LayerFlags;
    use crate::submit::VirtualController;
    use crate::sync::{BufferDesc, BufferId, Timeline};
    use std::time::Duration;

    fn engine() -> Arc<ThreadedBlitEngine> {
        Arc::new(ThreadedBlitEngine::spawn("display-test", BlitCaps::default(), Duration::from_secs(1)))
    }

    fn display_config(planes: usize) -> DisplayConfig {
        DisplayConfig {
            name: "panel".into(),
            width: 1920,
            height: 1080,
            planes: (0..planes).map(|_| PlaneConfig::with_caps(&["scale"])).collect(),
            ..DisplayConfig::default()
        }
    }

    fn display(planes: usize, engine: Arc<ThreadedBlitEngine>) -> Display {
        let config = Config::default();
        Display::new(
            DisplayId(0),
            &display_config(planes),
            &config,
            engine,
            Box::new(VirtualController::new("virt")),
        )
    }

    fn buffer(id: u64, width: u32, height: u32) -> BufferHandle {
        BufferHandle::allocate(BufferId(id), BufferDesc::new(width, height, PixelFormat::Rgba8888))
    }

    /// Opaque background plus two blended windows on top of each other
    fn scene(buffers: &[BufferHandle]) -> Vec<Layer> {
        vec![
            Layer::new(Some(buffers[0].register()), Rect::sized(1920, 1080), Rect::sized(1920, 1080))
                .with_flags(LayerFlags::OPAQUE),
            Layer::new(Some(buffers[1].register()), Rect::sized(400, 300), Rect::new(100, 100, 400, 300))
                .with_blend(BlendMode::Coverage),
            Layer::new(Some(buffers[2].register()), Rect::sized(400, 300), Rect::new(200, 150, 400, 300))
                .with_blend(BlendMode::Coverage),
        ]
    }

    #[test]
    fn test_all_planes_no_composition() {
        let engine = engine();
        let mut display = display(4, engine.clone());
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];
        let mut layers = scene(&buffers);

        let summary = display.prepare(&mut layers, true, true);
        assert_eq!(summary.plane_layers, 3);
        assert_eq!(summary.composed_layers, 0);
        assert!(layers.iter().all(|l| l.composition == CompositionKind::Device));

        let present = display.present(&mut layers, None);
        assert!(present.is_valid());
        assert!(layers.iter().all(|l| l.release_fence.is_valid()));
        assert_eq!(display.stats().frames_presented, 1);
    }

    #[test]
    fn test_unchanged_frame_recycles_composition() {
        let engine = engine();
        let mut display = display(2, engine.clone());
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];

        let mut first = scene(&buffers);
        let summary = display.prepare(&mut first, true, true);
        assert!(summary.composed_layers > 0);
        assert!(!summary.recycled);
        display.present(&mut first, None);
        engine.flush_fence().wait(Duration::from_secs(5)).unwrap();
        let jobs = engine.jobs_completed();

        let mut second = scene(&buffers);
        let summary = display.prepare(&mut second, false, true);
        assert!(summary.recycled);
        assert!(second.iter().any(|l| l.composition == CompositionKind::Backend));
        display.present(&mut second, None);
        engine.flush_fence().wait(Duration::from_secs(5)).unwrap();

        // Only the flush marker ran: no backend blits for the second frame
        assert_eq!(engine.jobs_completed(), jobs + 1);
        assert_eq!(display.stats().recycled_frames, 1);
        assert_eq!(display.cache().hits(), 1);
    }

    #[test]
    fn test_rewritten_buffer_recomposes() {
        let engine = engine();
        let mut display = display(2, engine.clone());
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];

        let mut first = scene(&buffers);
        display.prepare(&mut first, true, true);
        display.present(&mut first, None);

        // Producer renders a new frame into the top window
        drop(buffers[2].acquire_write(Duration::from_secs(1)));

        let mut second = scene(&buffers);
        let summary = display.prepare(&mut second, false, true);
        assert!(!summary.recycled);
        display.present(&mut second, None);
        assert_eq!(display.stats().recycled_frames, 0);
    }

    fn fullscreen(buffer: &BufferHandle) -> Vec<Layer> {
        vec![
            Layer::new(Some(buffer.register()), Rect::sized(1920, 1080), Rect::sized(1920, 1080))
                .with_flags(LayerFlags::OPAQUE),
        ]
    }

    /// Beyond plane scaling limits, so it is pre-scaled into a full-screen scratch
    fn upscaled(buffer: &BufferHandle) -> Layer {
        Layer::new(Some(buffer.register()), Rect::sized(400, 225), Rect::sized(1920, 1080))
            .with_flags(LayerFlags::OPAQUE)
    }

    #[test]
    fn test_target_reused_by_scratch_fill_is_recomposed() {
        let engine = engine();
        let mut display = display(2, engine.clone());
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];
        let small = buffer(4, 400, 225);

        let mut first = scene(&buffers);
        let summary = display.prepare(&mut first, true, true);
        assert!(summary.composed_layers > 0);
        display.present(&mut first, None);
        let target = display.cached_target.unwrap();

        // No composition: the target set is unlocked but the cache survives
        let mut second = fullscreen(&buffers[0]);
        display.prepare(&mut second, false, true);
        display.present(&mut second, None);
        assert!(display.cache().is_valid());

        // Same scratch key as the target, so the fill lands in the same set
        let mut third = vec![upscaled(&small)];
        assert_eq!(display.prepare(&mut third, false, true).plane_layers, 1);
        display.present(&mut third, None);
        let (_, entry) = display.last_assignment.as_ref().unwrap().entries().next().unwrap();
        assert_eq!(entry.scratch.unwrap().id, target.id);
        assert_ne!(display.pool.buffer(target.id).unwrap().write_seq(), target.write_seq);

        let mut fourth = fullscreen(&buffers[0]);
        display.prepare(&mut fourth, false, true);
        display.present(&mut fourth, None);

        let mut fifth = scene(&buffers);
        let summary = display.prepare(&mut fifth, false, true);
        assert!(!summary.recycled);
        display.present(&mut fifth, None);
        assert_eq!(display.stats().recycled_frames, 0);
        let cached = display.cached_target.unwrap();
        assert_eq!(cached.write_seq, display.pool.buffer(cached.id).unwrap().write_seq());
    }

    #[test]
    fn test_exhausted_chain_reverts_every_layer_to_client() {
        let engine = engine();
        let mut config = Config::default();
        for backend in &mut config.compositor.backends {
            backend.max_layers = 1;
        }
        let mut display = Display::new(
            DisplayId(0),
            &display_config(2),
            &config,
            engine,
            Box::new(VirtualController::new("virt")),
        );
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];
        let mut layers = scene(&buffers);

        let summary = display.prepare(&mut layers, true, true);
        assert!(summary.client_composition);
        assert_eq!(summary.plane_layers, 0);
        assert_eq!(summary.composed_layers, 3);
        assert!(layers.iter().all(|l| l.composition == CompositionKind::Client));

        let client = buffer(10, 1920, 1080);
        let present = display.present(
            &mut layers,
            Some(ClientTarget {
                buffer: &client,
                acquire: Fence::invalid(),
            }),
        );
        assert!(present.is_valid());
        assert!(layers.iter().all(|l| !l.release_fence.is_valid()));
        let assignment = display.last_assignment.as_ref().unwrap();
        assert_eq!(assignment.plane_layer_count(), 0);
        assert!(assignment.target_plane().is_some());
        // Only the client target is scanned out
        assert!(!client.pending_fence().is_signaled());
        assert!(buffers.iter().all(|b| b.pending_fence().is_signaled()));
    }

    #[test]
    fn test_skipped_fill_then_rollback_releases_scratch() {
        let engine = engine();
        let mut display = display(2, engine.clone());
        let small = buffer(1, 400, 225);
        let cursor = buffer(2, 64, 64);
        let frame = || {
            vec![
                upscaled(&small),
                Layer::new(Some(cursor.register()), Rect::sized(64, 64), Rect::new(10, 10, 64, 64)),
            ]
        };

        let mut first = frame();
        assert_eq!(display.prepare(&mut first, true, true).plane_layers, 2);
        display.present(&mut first, None);
        engine.flush_fence().wait(Duration::from_secs(5)).unwrap();
        assert_eq!(display.stats().scratch_fills, 1);
        let jobs = engine.jobs_completed();

        // Unchanged source: the scratch content is reused without a blit
        let mut second = frame();
        assert_eq!(display.prepare(&mut second, false, true).plane_layers, 2);
        display.present(&mut second, None);
        engine.flush_fence().wait(Duration::from_secs(5)).unwrap();
        assert_eq!(engine.jobs_completed(), jobs + 1);
        let scratch = display.last_assignment.as_ref().unwrap().scratch_ids().next().unwrap();
        assert!(display.pool.get(scratch).unwrap().is_locked());

        // Two more layers leave no plane for the target: the scratch-backed
        // commit is rolled back first
        let extra = [buffer(3, 100, 100), buffer(4, 100, 100)];
        let mut third = frame();
        third.push(Layer::new(Some(extra[0].register()), Rect::sized(100, 100), Rect::new(500, 500, 100, 100)));
        third.push(Layer::new(Some(extra[1].register()), Rect::sized(100, 100), Rect::new(800, 500, 100, 100)));
        let summary = display.prepare(&mut third, false, true);
        assert_eq!(summary.plane_layers, 0);
        assert!(display.stats().rollbacks > 0);
        display.present(&mut third, None);

        let set = display.pool.get(scratch).unwrap();
        assert!(!set.is_locked());
        assert_eq!(set.use_count(), 0);
        assert!(display.last_assignment.as_ref().unwrap().scratch_ids().next().is_none());
    }

    #[test]
    fn test_client_composition_uses_client_target() {
        let engine = engine();
        let mut config = Config::default();
        config.compositor.backends.clear();
        let mut display = Display::new(
            DisplayId(1),
            &display_config(2),
            &config,
            engine,
            Box::new(VirtualController::new("virt")),
        );
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];
        let mut layers = scene(&buffers);

        let summary = display.prepare(&mut layers, true, true);
        assert!(summary.client_composition);
        let client_layers: Vec<usize> = (0..layers.len())
            .filter(|&i| layers[i].composition == CompositionKind::Client)
            .collect();
        assert!(!client_layers.is_empty());

        let producer = Timeline::new("producer");
        let (acquire, _) = producer.next_fence();
        let client = buffer(10, 1920, 1080);
        let present = display.present(
            &mut layers,
            Some(ClientTarget {
                buffer: &client,
                acquire,
            }),
        );
        assert!(present.is_valid());
        for index in client_layers {
            assert!(!layers[index].release_fence.is_valid());
        }
        // Client target is read by the display until the next frame
        assert!(!client.pending_fence().is_signaled());
    }

    #[test]
    fn test_blanked_display_skips_submission() {
        let engine = engine();
        let mut display = display(4, engine);
        display.blank(true);
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];
        let mut layers = scene(&buffers);

        let summary = display.prepare(&mut layers, false, true);
        assert!(summary.skipped);
        let present = display.present(&mut layers, None);
        assert!(!present.is_valid());
        assert_eq!(display.stats().frames_presented, 0);
    }

    #[test]
    fn test_hotplug_resize_invalidates_cache() {
        let engine = engine();
        let mut display = display(2, engine.clone());
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];

        let mut first = scene(&buffers);
        display.prepare(&mut first, true, true);
        display.present(&mut first, None);
        assert!(display.cache().is_valid());

        assert!(display.shared().set_connected(true, 1280, 720));
        let mut second = scene(&buffers);
        let summary = display.prepare(&mut second, false, true);
        assert!(!summary.recycled);
        display.present(&mut second, None);
    }

    #[test]
    fn test_bandwidth_refusal_forces_composition_next_frame() {
        let engine = engine();
        let mut config = Config::default();
        let mut panel = display_config(4);
        panel.bandwidth_negotiation = true;
        config.displays = vec![panel.clone()];
        let mut controller = VirtualController::new("virt");
        controller.set_refuse_bandwidth(true);
        let mut display = Display::new(DisplayId(0), &panel, &config, engine, Box::new(controller));
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];

        let mut first = scene(&buffers);
        assert_eq!(display.prepare(&mut first, true, true).plane_layers, 3);
        let present = display.present(&mut first, None);
        assert!(!present.is_valid());
        assert_eq!(display.stats().bandwidth_refusals, 1);
        assert_eq!(display.stats().submit_failures, 0);
        // The refused frame never reached scan-out
        assert!(buffers.iter().all(|b| b.pending_fence().is_signaled()));

        let mut second = scene(&buffers);
        let summary = display.prepare(&mut second, false, true);
        assert_eq!(summary.plane_layers, 0);
        assert_eq!(summary.composed_layers, 3);
    }

    #[test]
    fn test_dump_lists_planes() {
        let engine = engine();
        let mut display = display(4, engine);
        let buffers = [buffer(1, 1920, 1080), buffer(2, 400, 300), buffer(3, 400, 300)];
        let mut layers = scene(&buffers);
        display.prepare(&mut layers, true, true);
        display.present(&mut layers, None);

        let report = display.dump();
        assert!(report.contains("display0 (panel): 1920x1080"));
        assert_eq!(report.matches(": layer").count(), 3);
        assert_eq!(report.matches(": unused").count(), 1);
    }
}
