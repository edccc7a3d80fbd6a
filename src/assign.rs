//! Window/plane assignment engine
//!
//! Walks one frame's layers bottom to top and gives each one a hardware plane
//! when it can, pre-transforming through a scratch buffer when a plane is
//! missing a capability the blit engine can supply. Everything else lands in
//! the composition contents, which one plane (the framebuffer target) shows.
//!
//! The pass never blocks and always terminates: every layer is either
//! committed or rejected once, and the rollback phase undoes at most one
//! commit per plane.

use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::plane::{DisplayCaps, PlaneCaps};
use crate::scratch::{BlitCaps, ScratchId, ScratchKey, ScratchOwner, ScratchPool};
use crate::shared::{BlendMode, Layer, LayerFlags, MemoryLayout, Rect, Transform};

/// Planes addressable by the free-plane mask
const MAX_PLANES: usize = u64::BITS as usize;

const TRANSFORM_CAPS: PlaneCaps = PlaneCaps::ROTATE_90.union(PlaneCaps::FLIP);

/// Scratch pre-transform feeding a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchPlan {
    pub id: ScratchId,
    /// Region of the layer's buffer to copy
    pub src_rect: Rect,
    /// Transform the blit applies
    pub transform: Transform,
}

/// One layer shown by a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneEntry {
    pub layer: usize,
    /// What the plane reads: the layer's source, or the whole scratch buffer
    pub source: Rect,
    /// Transform left for the plane to apply
    pub transform: Transform,
    pub scratch: Option<ScratchPlan>,
    /// Requirements taken over by the scratch pass
    pub residue: PlaneCaps,
}

/// What a plane shows this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaneSlot {
    #[default]
    Unused,
    Layer(PlaneEntry),
    FramebufferTarget,
}

/// Result of one assignment pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    /// One slot per hardware plane
    pub slots: Vec<PlaneSlot>,
    /// Layers left for composition, bottom to top
    pub composed: Vec<usize>,
    pub all_composition: bool,
    /// Blending-overlap hazard forced composition
    pub hazard: bool,
    /// Commits undone to make room for the target or keep composition contiguous
    pub rollbacks: usize,
}

impl Assignment {
    /// Every layer composed, no plane carries a layer
    pub fn composition_only(layer_count: usize, plane_count: usize) -> Self {
        Self {
            slots: vec![PlaneSlot::Unused; plane_count],
            composed: (0..layer_count).collect(),
            all_composition: layer_count > 0,
            hazard: false,
            rollbacks: 0,
        }
    }

    pub fn target_plane(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, PlaneSlot::FramebufferTarget))
    }

    /// Plane entries in plane order
    pub fn entries(&self) -> impl Iterator<Item = (usize, &PlaneEntry)> {
        self.slots.iter().enumerate().filter_map(|(plane, slot)| match slot {
            PlaneSlot::Layer(entry) => Some((plane, entry)),
            _ => None,
        })
    }

    pub fn plane_layer_count(&self) -> usize {
        self.entries().count()
    }

    pub fn plane_for(&self, layer: usize) -> Option<usize> {
        self.entries()
            .find(|(_, e)| e.layer == layer)
            .map(|(plane, _)| plane)
    }

    pub fn is_composed(&self, layer: usize) -> bool {
        self.composed.contains(&layer)
    }

    /// Scratch sets referenced by plane entries
    pub fn scratch_ids(&self) -> impl Iterator<Item = ScratchId> + '_ {
        self.entries().filter_map(|(_, e)| e.scratch.map(|s| s.id))
    }

    /// Occupied planes ordered bottom to top
    ///
    /// The framebuffer target sits at the z-position of the lowest composed
    /// layer.
    pub fn z_order(&self) -> Vec<usize> {
        let target_z = self.composed.first().copied().unwrap_or(usize::MAX);
        let mut planes: Vec<(usize, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(plane, slot)| match slot {
                PlaneSlot::Unused => None,
                PlaneSlot::Layer(e) => Some((e.layer, plane)),
                PlaneSlot::FramebufferTarget => Some((target_z, plane)),
            })
            .collect();
        planes.sort_unstable();
        planes.into_iter().map(|(_, plane)| plane).collect()
    }
}

/// A plane commitment that can still be undone
#[derive(Debug)]
struct Commit {
    plane: usize,
    entry: PlaneEntry,
    sequential: bool,
}

/// Mutable state of one pass
struct Pass {
    free: u64,
    seq_budget: usize,
    commits: Vec<Commit>,
    composed: BTreeSet<usize>,
    rollbacks: usize,
}

impl Pass {
    fn free_count(&self) -> usize {
        self.free.count_ones() as usize
    }

    fn is_free(&self, plane: usize) -> bool {
        self.free & (1 << plane) != 0
    }
}

/// Per-display plane assignment engine
#[derive(Debug, Clone)]
pub struct Assigner {
    caps: DisplayCaps,
    force_composition: bool,
    min_plane_extent: u32,
    contiguous: bool,
    /// `None` when no scratch pre-transform is available
    blit: Option<BlitCaps>,
    display_size: (u32, u32),
}

impl Assigner {
    pub fn new(caps: DisplayCaps, scheduler: &SchedulerConfig, blit: Option<BlitCaps>) -> Self {
        let mut caps = caps;
        if caps.planes.len() > MAX_PLANES {
            warn!(
                planes = caps.planes.len(),
                "Plane table larger than {} entries, ignoring the rest", MAX_PLANES
            );
            caps.planes.truncate(MAX_PLANES);
        }
        Self {
            caps,
            force_composition: scheduler.force_composition,
            min_plane_extent: scheduler.min_plane_extent,
            contiguous: scheduler.contiguous_composition,
            blit,
            display_size: (0, 0),
        }
    }

    pub fn caps(&self) -> &DisplayCaps {
        &self.caps
    }

    pub fn set_display_size(&mut self, width: u32, height: u32) {
        self.display_size = (width, height);
    }

    pub fn set_force_composition(&mut self, force: bool) {
        self.force_composition = force;
    }

    /// Capability bits a plane needs to show `layer` unaided
    pub fn requirements(layer: &Layer) -> PlaneCaps {
        let mut req = PlaneCaps::empty();
        if layer.transform.rotates_90() {
            req |= PlaneCaps::ROTATE_90;
        }
        if !layer.transform.flips().is_empty() {
            req |= PlaneCaps::FLIP;
        }
        if layer.needs_scaling() {
            req |= PlaneCaps::SCALE;
        }
        if let Some(buffer) = &layer.buffer {
            let desc = buffer.desc();
            if desc.format.is_yuv() {
                req |= PlaneCaps::YUV;
            }
            if desc.format.needs_sequential() {
                req |= PlaneCaps::SEQUENTIAL;
            }
            match desc.layout {
                MemoryLayout::Linear => {}
                MemoryLayout::Tiled => req |= PlaneCaps::TILED,
                MemoryLayout::Compressed => req |= PlaneCaps::COMPRESSED,
            }
        }
        req
    }

    fn ineligible_reason(&self, layer: &Layer) -> Option<&'static str> {
        let Some(buffer) = &layer.buffer else {
            return Some("no buffer");
        };
        if !buffer.desc().format.is_supported() {
            return Some("unsupported format");
        }
        if layer.flags.contains(LayerFlags::MUST_COMPOSITE) {
            return Some("must composite");
        }
        if layer.source.is_empty() || layer.dest.is_empty() {
            return Some("empty rectangle");
        }
        if layer.dest.width < self.min_plane_extent || layer.dest.height < self.min_plane_extent {
            return Some("below minimum plane extent");
        }
        None
    }

    /// Overlapping blending layers with more candidates than planes
    fn blend_hazard(&self, layers: &[Layer], eligible: &[bool]) -> bool {
        let candidates: Vec<&Layer> = layers
            .iter()
            .zip(eligible)
            .filter_map(|(l, &e)| e.then_some(l))
            .collect();
        if candidates.len() <= self.caps.plane_count() {
            return false;
        }
        candidates.iter().enumerate().any(|(i, a)| {
            a.is_blending()
                && candidates[i + 1..]
                    .iter()
                    .any(|b| b.is_blending() && a.dest.intersects(&b.dest))
        })
    }

    /// Run one assignment pass
    ///
    /// `force` adds to the configured force-composition switch for this
    /// frame only.
    pub fn assign(&self, layers: &[Layer], pool: &mut ScratchPool, force: bool) -> Assignment {
        let plane_count = self.caps.plane_count();
        let force = force || self.force_composition;
        let last = layers.len().saturating_sub(1);

        // The topmost protected layer keeps its shot at a plane even when forced
        let exempt = if force {
            layers.iter().rposition(Layer::is_protected)
        } else {
            None
        };

        let mut eligible: Vec<bool> = layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                if force && Some(i) != exempt {
                    return false;
                }
                match self.ineligible_reason(layer) {
                    Some(reason) => {
                        trace!(layer = i, reason, "Layer not eligible for a plane");
                        false
                    }
                    None => true,
                }
            })
            .collect();

        let hazard = self.blend_hazard(layers, &eligible);
        if hazard {
            debug!("Blending-overlap hazard, switching frame to composition");
            for (i, e) in eligible.iter_mut().enumerate() {
                let layer = &layers[i];
                let base_ok = i == 0
                    && matches!(layer.blend, BlendMode::None | BlendMode::Premultiplied);
                let top_ok = i == last && !layer.is_blending();
                *e = *e && (base_ok || top_ok);
            }
        }

        let mut pass = Pass {
            free: if plane_count >= MAX_PLANES {
                u64::MAX
            } else {
                (1u64 << plane_count) - 1
            },
            seq_budget: self.caps.max_sequential,
            commits: Vec::new(),
            composed: BTreeSet::new(),
            rollbacks: 0,
        };

        for (i, layer) in layers.iter().enumerate() {
            if !eligible[i] {
                pass.composed.insert(i);
                continue;
            }
            let remaining_after = eligible[i + 1..].iter().filter(|&&e| e).count();
            match self.place(i, layer, &mut pass, pool, remaining_after) {
                Some(commit) => {
                    trace!(layer = i, plane = commit.plane, residue = ?commit.entry.residue, "Layer committed to plane");
                    pass.commits.push(commit);
                }
                None => {
                    pass.composed.insert(i);
                }
            }
        }

        let target = self.settle(&mut pass, pool);
        self.finish(layers.len(), pass, target, hazard)
    }

    /// Contiguity and framebuffer-target reservation, rolling back as needed
    fn settle(&self, pass: &mut Pass, pool: &mut ScratchPool) -> Option<usize> {
        let bound = pass.commits.len();
        loop {
            self.enforce_contiguity(pass, pool);
            if pass.composed.is_empty() {
                return None;
            }
            if let Some(target) = self.pick_target(pass) {
                return Some(target);
            }
            // Cheapest to undo: the latest commit that used scratch, else the latest
            let victim = pass
                .commits
                .iter()
                .rposition(|c| c.entry.scratch.is_some())
                .or_else(|| pass.commits.len().checked_sub(1));
            let Some(victim) = victim else {
                warn!("No plane available for the framebuffer target");
                return None;
            };
            self.rollback(pass, victim, pool);
            debug_assert!(pass.rollbacks <= bound, "rollback exceeded commit count");
        }
    }

    fn enforce_contiguity(&self, pass: &mut Pass, pool: &mut ScratchPool) {
        if !self.contiguous {
            return;
        }
        let (Some(&lo), Some(&hi)) = (pass.composed.first(), pass.composed.last()) else {
            return;
        };
        while let Some(pos) = pass
            .commits
            .iter()
            .position(|c| c.entry.layer > lo && c.entry.layer < hi)
        {
            self.rollback(pass, pos, pool);
        }
    }

    fn rollback(&self, pass: &mut Pass, pos: usize, pool: &mut ScratchPool) {
        let commit = pass.commits.remove(pos);
        if let Some(scratch) = commit.entry.scratch {
            pool.release(scratch.id);
        }
        pass.free |= 1 << commit.plane;
        if commit.sequential {
            pass.seq_budget += 1;
        }
        pass.composed.insert(commit.entry.layer);
        pass.rollbacks += 1;
        debug!(layer = commit.entry.layer, plane = commit.plane, "Rolled back plane assignment");
    }

    /// Free plane able to show a full-screen composition result
    fn pick_target(&self, pass: &Pass) -> Option<usize> {
        let (width, height) = self.display_size;
        self.caps
            .planes
            .iter()
            .enumerate()
            .filter(|(i, p)| pass.is_free(*i) && p.fits(width, height))
            .min_by_key(|(i, p)| (p.caps.bits().count_ones(), *i))
            .map(|(i, _)| i)
    }

    /// Free plane whose capabilities cover `req`, smallest superset first
    fn best_fit(&self, pass: &Pass, req: PlaneCaps, dest: &Rect) -> Option<usize> {
        self.caps
            .planes
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                pass.is_free(*i) && p.fits(dest.width, dest.height) && p.caps.contains(req)
            })
            .min_by_key(|(i, p)| (p.caps.bits().count_ones(), *i))
            .map(|(i, _)| i)
    }

    /// Closest free plane when scratch can take the missing bits
    fn closest_fit(&self, pass: &Pass, req: PlaneCaps, dest: &Rect) -> Option<(usize, PlaneCaps)> {
        let resolvable = self.blit.as_ref()?.ops & PlaneCaps::RESOLVABLE;
        self.caps
            .planes
            .iter()
            .enumerate()
            .filter(|(i, p)| pass.is_free(*i) && p.fits(dest.width, dest.height))
            .map(|(i, p)| (i, p, req - p.caps))
            .filter(|(_, _, residue)| resolvable.contains(*residue))
            .min_by_key(|(i, p, residue)| {
                (residue.bits().count_ones(), p.caps.bits().count_ones(), *i)
            })
            .map(|(i, _, residue)| (i, residue))
    }

    /// Exact fit, else the closest plane plus the bits scratch must resolve
    fn choose_plane(&self, pass: &Pass, req: PlaneCaps, dest: &Rect) -> Option<(usize, PlaneCaps)> {
        match self.best_fit(pass, req, dest) {
            Some(plane) => Some((plane, PlaneCaps::empty())),
            None => self.closest_fit(pass, req, dest),
        }
    }

    /// Try to give layer `index` a plane
    fn place(
        &self,
        index: usize,
        layer: &Layer,
        pass: &mut Pass,
        pool: &mut ScratchPool,
        remaining_after: usize,
    ) -> Option<Commit> {
        let req = Self::requirements(layer);
        let mut forced = PlaneCaps::empty();

        if req.contains(PlaneCaps::SCALE) {
            let (sx, sy) = layer.scale_factors();
            if !self.caps.scale_in_range(sx) || !self.caps.scale_in_range(sy) {
                trace!(layer = index, sx, sy, "Scale beyond plane limits, pre-scaling");
                forced |= PlaneCaps::SCALE;
            }
        }
        let Some((mut plane, residue)) = self.choose_plane(pass, req - forced, &layer.dest) else {
            debug!(layer = index, ?req, "No plane fits, composing");
            return None;
        };
        forced = close_transform(req, forced | residue);

        // Which height limit applies depends on whether the plane reads scratch
        if req.contains(PlaneCaps::ROTATE_90) && !forced.contains(PlaneCaps::ROTATE_90) {
            let limit = self.caps.rotate_height_limit(!forced.is_empty());
            if layer.source.height > limit {
                trace!(layer = index, height = layer.source.height, limit, "Rotation source too tall, pre-rotating");
                forced = close_transform(req, forced | PlaneCaps::ROTATE_90);
                let Some((rechosen, residue)) = self.choose_plane(pass, req - forced, &layer.dest) else {
                    debug!(layer = index, ?req, "No plane fits after pre-rotation, composing");
                    return None;
                };
                plane = rechosen;
                forced = close_transform(req, forced | residue);
            }
        }

        let sequential = req.contains(PlaneCaps::SEQUENTIAL);
        if sequential {
            let free_after = pass.free_count() - 1;
            if pass.seq_budget == 0 || (pass.seq_budget == 1 && remaining_after > free_after) {
                debug!(layer = index, remaining_after, free_after, "Sequential group would run dry, composing");
                return None;
            }
        }

        let mut entry = PlaneEntry {
            layer: index,
            source: layer.source,
            transform: layer.transform,
            scratch: None,
            residue: forced,
        };
        if !forced.is_empty() {
            let Some(blit) = self.blit.as_ref() else {
                debug!(layer = index, ?forced, "Plane needs a pre-transform but scratch is unavailable, composing");
                return None;
            };
            if !blit.ops.contains(forced) {
                debug!(layer = index, ?forced, "Blit engine cannot resolve requirements, composing");
                return None;
            }
            if forced.contains(PlaneCaps::SCALE) {
                let (sx, sy) = layer.scale_factors();
                let in_range = |f: f32| f >= blit.min_scale && f <= blit.max_scale;
                if !in_range(sx) || !in_range(sy) {
                    debug!(layer = index, sx, sy, "Scale beyond blit limits, composing");
                    return None;
                }
            }
            self.plan_scratch(index, layer, forced, pool, &mut entry)?;
        }

        pass.free &= !(1 << plane);
        if sequential {
            pass.seq_budget -= 1;
        }
        Some(Commit {
            plane,
            entry,
            sequential,
        })
    }

    /// Claim a scratch set and rewrite the entry to read from it
    fn plan_scratch(
        &self,
        index: usize,
        layer: &Layer,
        forced: PlaneCaps,
        pool: &mut ScratchPool,
        entry: &mut PlaneEntry,
    ) -> Option<()> {
        let buffer = layer.buffer.as_ref()?;
        let by_scratch = forced.intersects(TRANSFORM_CAPS);
        let blit_transform = if by_scratch {
            layer.transform
        } else {
            Transform::empty()
        };
        let plane_transform = if by_scratch {
            Transform::empty()
        } else {
            layer.transform
        };
        let (width, height) = if forced.contains(PlaneCaps::SCALE) {
            // Plane-side rotation expects the scratch in source orientation
            plane_transform.apply_to_size(layer.dest.width, layer.dest.height)
        } else {
            blit_transform.apply_to_size(layer.source.width, layer.source.height)
        };

        let key = ScratchKey {
            transform: blit_transform,
            width,
            height,
            format: buffer.desc().format,
            layout: MemoryLayout::Linear,
            protected: layer.is_protected(),
        };
        let Some(id) = pool.assign(key, ScratchOwner::Layer(index)) else {
            debug!(layer = index, ?key, "No scratch buffer available, composing");
            return None;
        };

        entry.source = Rect::sized(width, height);
        entry.transform = plane_transform;
        entry.scratch = Some(ScratchPlan {
            id,
            src_rect: layer.source,
            transform: blit_transform,
        });
        Some(())
    }

    fn finish(&self, layer_count: usize, pass: Pass, target: Option<usize>, hazard: bool) -> Assignment {
        let mut slots = vec![PlaneSlot::Unused; self.caps.plane_count()];
        for commit in &pass.commits {
            slots[commit.plane] = PlaneSlot::Layer(commit.entry);
        }
        if let Some(target) = target {
            slots[target] = PlaneSlot::FramebufferTarget;
        }
        let composed: Vec<usize> = pass.composed.into_iter().collect();

        debug_assert_eq!(
            pass.commits.len() + composed.len(),
            layer_count,
            "every layer is either on a plane or composed"
        );
        debug_assert!(composed.iter().all(|l| pass.commits.iter().all(|c| c.entry.layer != *l)));

        Assignment {
            slots,
            all_composition: layer_count > 0 && composed.len() == layer_count,
            composed,
            hazard,
            rollbacks: pass.rollbacks,
        }
    }
}

/// Once scratch takes any of the transform it takes all of it
fn close_transform(req: PlaneCaps, forced: PlaneCaps) -> PlaneCaps {
    if forced.intersects(TRANSFORM_CAPS) {
        forced | (req & TRANSFORM_CAPS)
    } else {
        forced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::PlaneInfo;
    use crate::scratch::MemoryAllocator;
    use crate::shared::PixelFormat;
    use crate::sync::{BufferDesc, BufferHandle, BufferId};

    fn buffer(id: u64, width: u32, height: u32, format: PixelFormat) -> BufferHandle {
        BufferHandle::allocate(BufferId(id), BufferDesc::new(width, height, format))
    }

    fn layer(id: u64, source: Rect, dest: Rect) -> Layer {
        Layer::new(
            Some(buffer(id, source.width, source.height, PixelFormat::Rgba8888)),
            source,
            dest,
        )
    }

    fn caps(planes: Vec<PlaneInfo>) -> DisplayCaps {
        DisplayCaps {
            planes,
            max_sequential: 1,
            ..Default::default()
        }
    }

    fn assigner(caps: DisplayCaps, blit: Option<BlitCaps>) -> Assigner {
        let mut assigner = Assigner::new(caps, &SchedulerConfig::default(), blit);
        assigner.set_display_size(1920, 1080);
        assigner
    }

    fn pool() -> ScratchPool {
        let mut pool = ScratchPool::new(Box::new(MemoryAllocator::new(0)), 8);
        pool.begin_frame();
        pool
    }

    /// Opaque full-screen base, premultiplied 2x-scaled middle, small alpha top
    fn three_layers() -> Vec<Layer> {
        vec![
            layer(1, Rect::sized(1920, 1080), Rect::sized(1920, 1080))
                .with_flags(LayerFlags::OPAQUE),
            layer(2, Rect::sized(200, 200), Rect::new(300, 300, 400, 400))
                .with_blend(BlendMode::Premultiplied),
            layer(3, Rect::sized(64, 64), Rect::new(10, 10, 64, 64))
                .with_blend(BlendMode::Premultiplied)
                .with_alpha(0.8),
        ]
    }

    fn check_invariants(a: &Assignment, layer_count: usize, plane_count: usize) {
        let on_planes = a.plane_layer_count();
        let targets = a
            .slots
            .iter()
            .filter(|s| matches!(s, PlaneSlot::FramebufferTarget))
            .count();
        assert!(on_planes + targets <= plane_count);
        assert!(targets <= 1);
        assert_eq!(on_planes + a.composed.len(), layer_count);
        for (_, e) in a.entries() {
            assert!(!a.is_composed(e.layer));
        }
        let mut scratch: Vec<_> = a.scratch_ids().collect();
        let before = scratch.len();
        scratch.sort();
        scratch.dedup();
        assert_eq!(scratch.len(), before, "scratch set shared by two planes");
    }

    #[test]
    fn test_three_layers_three_planes() {
        let display = caps(vec![
            PlaneInfo::new(PlaneCaps::SCALE),
            PlaneInfo::new(PlaneCaps::empty()),
            PlaneInfo::new(PlaneCaps::CURSOR).with_max_size(128, 128),
        ]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = three_layers();
        let result = a.assign(&layers, &mut pool(), false);

        assert_eq!(result.plane_for(0), Some(1));
        assert_eq!(result.plane_for(1), Some(0));
        assert_eq!(result.plane_for(2), Some(2));
        assert!(result.composed.is_empty());
        assert_eq!(result.target_plane(), None);
        check_invariants(&result, 3, 3);
    }

    #[test]
    fn test_two_planes_reserve_target() {
        let display = caps(vec![
            PlaneInfo::new(PlaneCaps::SCALE),
            PlaneInfo::new(PlaneCaps::empty()),
        ]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = three_layers();
        let result = a.assign(&layers, &mut pool(), false);

        assert_eq!(result.plane_for(0), Some(1));
        assert_eq!(result.composed, vec![1, 2]);
        assert_eq!(result.target_plane(), Some(0));
        assert_eq!(result.z_order(), vec![1, 0]);
        check_invariants(&result, 3, 2);
    }

    #[test]
    fn test_blend_overlap_hazard_composes_everything() {
        let display = caps(vec![
            PlaneInfo::new(PlaneCaps::SCALE),
            PlaneInfo::new(PlaneCaps::empty()),
        ]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = vec![
            layer(1, Rect::sized(1920, 1080), Rect::sized(1920, 1080))
                .with_blend(BlendMode::Coverage),
            layer(2, Rect::sized(200, 200), Rect::new(100, 100, 200, 200))
                .with_blend(BlendMode::Premultiplied),
            layer(3, Rect::sized(200, 200), Rect::new(150, 150, 200, 200))
                .with_blend(BlendMode::Coverage),
        ];
        let result = a.assign(&layers, &mut pool(), false);

        assert!(result.hazard);
        assert!(result.all_composition);
        assert_eq!(result.composed, vec![0, 1, 2]);
        assert!(result.target_plane().is_some());
        check_invariants(&result, 3, 2);
    }

    #[test]
    fn test_hazard_keeps_opaque_top_and_premultiplied_base() {
        let display = caps(vec![
            PlaneInfo::new(PlaneCaps::SCALE),
            PlaneInfo::new(PlaneCaps::empty()),
            PlaneInfo::new(PlaneCaps::empty()),
        ]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = vec![
            layer(1, Rect::sized(1920, 1080), Rect::sized(1920, 1080))
                .with_blend(BlendMode::Premultiplied),
            layer(2, Rect::sized(200, 200), Rect::new(100, 100, 200, 200))
                .with_blend(BlendMode::Coverage),
            layer(3, Rect::sized(200, 200), Rect::new(150, 150, 200, 200))
                .with_blend(BlendMode::Coverage),
            layer(4, Rect::sized(100, 100), Rect::new(900, 900, 100, 100)),
        ];
        let result = a.assign(&layers, &mut pool(), false);

        assert!(result.hazard);
        assert!(!result.all_composition);
        assert!(result.plane_for(0).is_some());
        assert!(result.plane_for(3).is_some());
        assert_eq!(result.composed, vec![1, 2]);
        assert!(result.target_plane().is_some());
        check_invariants(&result, 4, 3);
    }

    #[test]
    fn test_tall_rotation_without_scratch_composes() {
        let display = caps(vec![
            PlaneInfo::new(PlaneCaps::ROTATE_90 | PlaneCaps::SCALE),
            PlaneInfo::new(PlaneCaps::empty()),
        ]);
        let a = assigner(display, None);
        let layers = vec![
            layer(1, Rect::sized(1080, 1920), Rect::sized(1920, 1080))
                .with_transform(Transform::ROT_90),
        ];
        let result = a.assign(&layers, &mut pool(), false);

        assert_eq!(result.plane_for(0), None);
        assert_eq!(result.composed, vec![0]);
        assert!(result.target_plane().is_some());
    }

    #[test]
    fn test_tall_rotation_with_scratch_prerotates() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::ROTATE_90), PlaneInfo::new(PlaneCaps::empty())]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = vec![
            layer(1, Rect::sized(1080, 2400), Rect::sized(2400, 1080))
                .with_transform(Transform::ROT_90),
        ];
        let result = a.assign(&layers, &mut pool(), false);

        let plane = result.plane_for(0).unwrap();
        let PlaneSlot::Layer(entry) = result.slots[plane] else {
            panic!("expected a layer slot");
        };
        let scratch = entry.scratch.unwrap();
        assert_eq!(scratch.transform, Transform::ROT_90);
        assert_eq!(entry.transform, Transform::empty());
        assert_eq!(entry.source, Rect::sized(2400, 1080));
        // Smallest plane that needs nothing extra
        assert_eq!(plane, 1);
    }

    #[test]
    fn test_short_rotation_goes_direct() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::ROTATE_90), PlaneInfo::new(PlaneCaps::empty())]);
        let a = assigner(display, None);
        let layers = vec![
            layer(1, Rect::sized(1080, 720), Rect::sized(720, 1080))
                .with_transform(Transform::ROT_90),
        ];
        let result = a.assign(&layers, &mut pool(), false);
        assert_eq!(result.plane_for(0), Some(0));
        assert!(result.entries().all(|(_, e)| e.scratch.is_none()));
    }

    #[test]
    fn test_rotation_limit_follows_scratch_decision() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::ROTATE_90)]);
        let a = assigner(display.clone(), Some(BlitCaps::default()));
        let source = Rect::sized(1080, 1500);
        let desc = BufferDesc::new(1080, 1500, PixelFormat::Rgba8888).with_layout(MemoryLayout::Tiled);
        let tiled = Layer::new(
            Some(BufferHandle::allocate(BufferId(1), desc)),
            source,
            Rect::sized(1500, 1080),
        )
        .with_transform(Transform::ROT_90);

        // Detiling feeds the plane from scratch, so the taller limit applies
        // and the plane still rotates
        let result = a.assign(std::slice::from_ref(&tiled), &mut pool(), false);
        let (_, entry) = result.entries().next().unwrap();
        assert_eq!(entry.residue, PlaneCaps::TILED);
        assert_eq!(entry.transform, Transform::ROT_90);
        assert_eq!(entry.scratch.unwrap().transform, Transform::empty());

        // Read directly, the same height is over the direct limit
        let linear = layer(2, source, Rect::sized(1500, 1080)).with_transform(Transform::ROT_90);
        let result = a.assign(std::slice::from_ref(&linear), &mut pool(), false);
        let (_, entry) = result.entries().next().unwrap();
        assert!(entry.residue.contains(PlaneCaps::ROTATE_90));
        assert_eq!(entry.transform, Transform::empty());
        assert_eq!(entry.scratch.unwrap().transform, Transform::ROT_90);
    }

    #[test]
    fn test_flip_resolved_by_partial_match() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::empty())]);
        let layers = vec![
            layer(1, Rect::sized(640, 480), Rect::sized(640, 480)).with_transform(Transform::FLIP_H),
        ];

        let with_blit = assigner(display.clone(), Some(BlitCaps::default()));
        let result = with_blit.assign(&layers, &mut pool(), false);
        let (_, entry) = result.entries().next().unwrap();
        assert_eq!(entry.residue, PlaneCaps::FLIP);
        assert_eq!(entry.scratch.unwrap().transform, Transform::FLIP_H);

        let without = assigner(display, None);
        let result = without.assign(&layers, &mut pool(), false);
        assert_eq!(result.composed, vec![0]);
    }

    #[test]
    fn test_extreme_scale_prescaled() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::SCALE)]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = vec![layer(1, Rect::sized(100, 100), Rect::sized(800, 800))];
        let result = a.assign(&layers, &mut pool(), false);

        let (_, entry) = result.entries().next().unwrap();
        assert!(entry.residue.contains(PlaneCaps::SCALE));
        assert_eq!(entry.source, Rect::sized(800, 800));
    }

    #[test]
    fn test_scratch_exhaustion_composes() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::empty()), PlaneInfo::new(PlaneCaps::empty())]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = vec![
            layer(1, Rect::sized(640, 480), Rect::sized(640, 480)).with_transform(Transform::FLIP_V),
        ];
        let mut tiny = ScratchPool::new(Box::new(MemoryAllocator::new(16)), 8);
        tiny.begin_frame();
        let result = a.assign(&layers, &mut tiny, false);
        assert_eq!(result.composed, vec![0]);
        assert!(result.target_plane().is_some());
    }

    #[test]
    fn test_ineligible_layers_compose() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::empty()); 4]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = vec![
            Layer::new(None, Rect::sized(10, 10), Rect::sized(100, 100)),
            Layer::new(
                Some(buffer(2, 64, 64, PixelFormat::Unknown(42))),
                Rect::sized(64, 64),
                Rect::sized(64, 64),
            ),
            layer(3, Rect::sized(64, 64), Rect::sized(64, 64))
                .with_flags(LayerFlags::MUST_COMPOSITE),
            layer(4, Rect::sized(8, 8), Rect::sized(8, 8)),
        ];
        let result = a.assign(&layers, &mut pool(), false);
        assert_eq!(result.composed, vec![0, 1, 2, 3]);
        assert!(result.all_composition);
    }

    #[test]
    fn test_forced_composition_keeps_top_protected() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::empty()); 3]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = vec![
            layer(1, Rect::sized(1920, 1080), Rect::sized(1920, 1080)),
            layer(2, Rect::sized(640, 480), Rect::sized(640, 480)).with_flags(LayerFlags::PROTECTED),
            layer(3, Rect::sized(640, 480), Rect::sized(640, 480)).with_flags(LayerFlags::PROTECTED),
        ];
        let result = a.assign(&layers, &mut pool(), true);
        assert_eq!(result.composed, vec![0, 1]);
        assert!(result.plane_for(2).is_some());
        assert!(result.target_plane().is_some());
    }

    #[test]
    fn test_contiguity_rolls_back_middle_layer() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::empty()); 3]);
        let a = assigner(display, Some(BlitCaps::default()));
        let layers = vec![
            layer(1, Rect::sized(1920, 1080), Rect::sized(1920, 1080)),
            layer(2, Rect::sized(64, 64), Rect::sized(64, 64)).with_flags(LayerFlags::MUST_COMPOSITE),
            layer(3, Rect::sized(64, 64), Rect::new(500, 500, 64, 64)),
            layer(4, Rect::sized(64, 64), Rect::sized(64, 64)).with_flags(LayerFlags::MUST_COMPOSITE),
        ];
        let result = a.assign(&layers, &mut pool(), false);
        assert_eq!(result.composed, vec![1, 2, 3]);
        assert!(result.plane_for(0).is_some());
        assert_eq!(result.rollbacks, 1);
        check_invariants(&result, 4, 3);
    }

    #[test]
    fn test_target_rollback_prefers_scratch_commit() {
        let display = caps(vec![PlaneInfo::new(PlaneCaps::empty()); 2]);
        let scheduler = SchedulerConfig {
            contiguous_composition: false,
            ..Default::default()
        };
        let mut a = Assigner::new(display, &scheduler, Some(BlitCaps::default()));
        a.set_display_size(1920, 1080);
        let layers = vec![
            layer(1, Rect::sized(640, 480), Rect::sized(640, 480)).with_transform(Transform::FLIP_H),
            layer(2, Rect::sized(640, 480), Rect::new(700, 0, 640, 480)),
            layer(3, Rect::sized(64, 64), Rect::new(10, 600, 64, 64)),
        ];
        let mut pool = pool();
        let result = a.assign(&layers, &mut pool, false);

        // Layer 0 used scratch and was the cheapest commit to undo
        assert_eq!(result.composed, vec![0, 2]);
        assert_eq!(result.plane_for(1), Some(1));
        assert_eq!(result.rollbacks, 1);
        assert!(result.target_plane().is_some());
        check_invariants(&result, 3, 2);
    }

    #[test]
    fn test_sequential_bail_out() {
        let mut display = caps(vec![
            PlaneInfo::new(PlaneCaps::SEQUENTIAL | PlaneCaps::YUV),
            PlaneInfo::new(PlaneCaps::empty()),
        ]);
        display.max_sequential = 1;
        let a = assigner(display, Some(BlitCaps::default()));
        let video = Layer::new(
            Some(buffer(1, 1920, 1080, PixelFormat::P010)),
            Rect::sized(1920, 1080),
            Rect::sized(1920, 1080),
        );
        let layers = vec![
            video,
            layer(2, Rect::sized(64, 64), Rect::new(0, 0, 64, 64)),
            layer(3, Rect::sized(64, 64), Rect::new(100, 0, 64, 64)),
        ];
        let result = a.assign(&layers, &mut pool(), false);
        assert!(result.is_composed(0));

        let lone = vec![Layer::new(
            Some(buffer(1, 1920, 1080, PixelFormat::P010)),
            Rect::sized(1920, 1080),
            Rect::sized(1920, 1080),
        )];
        let result = a.assign(&lone, &mut pool(), false);
        assert_eq!(result.plane_for(0), Some(0));
    }

    /// Small deterministic generator for layer soups
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u32) -> u32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 33) % bound as u64) as u32
        }
    }

    #[test]
    fn test_budget_and_termination_over_random_frames() {
        let display = caps(vec![
            PlaneInfo::new(PlaneCaps::SCALE | PlaneCaps::YUV | PlaneCaps::SEQUENTIAL),
            PlaneInfo::new(PlaneCaps::ROTATE_90 | PlaneCaps::FLIP),
            PlaneInfo::new(PlaneCaps::empty()),
            PlaneInfo::new(PlaneCaps::CURSOR).with_max_size(128, 128),
        ]);
        let plane_count = display.plane_count();
        let transforms = [
            Transform::empty(),
            Transform::FLIP_H,
            Transform::ROT_90,
            Transform::ROT_270,
        ];
        let blends = [BlendMode::None, BlendMode::Premultiplied, BlendMode::Coverage];
        let formats = [PixelFormat::Rgba8888, PixelFormat::Nv12, PixelFormat::P010];

        for seed in 0..300u64 {
            let mut rng = Lcg(seed);
            let blit = if seed % 3 == 0 { None } else { Some(BlitCaps::default()) };
            let a = assigner(display.clone(), blit);
            let count = rng.next(8) as usize;
            let layers: Vec<Layer> = (0..count)
                .map(|i| {
                    let sw = 8 + rng.next(2000);
                    let sh = 8 + rng.next(2000);
                    let dest = Rect::new(
                        rng.next(1900) as i32,
                        rng.next(1000) as i32,
                        4 + rng.next(1920),
                        4 + rng.next(1080),
                    );
                    let format = formats[rng.next(3) as usize];
                    Layer::new(
                        Some(buffer(i as u64 + 1, sw, sh, format)),
                        Rect::sized(sw, sh),
                        dest,
                    )
                    .with_transform(transforms[rng.next(4) as usize])
                    .with_blend(blends[rng.next(3) as usize])
                })
                .collect();

            let result = a.assign(&layers, &mut pool(), seed % 11 == 0);
            check_invariants(&result, count, plane_count);
            assert!(result.rollbacks <= plane_count);
            if !result.composed.is_empty() {
                assert!(result.target_plane().is_some());
            }
        }
    }
}
