//! Fixed-layout records shared with the display-controller driver.
//!
//! These structures are C-compatible and plain-old-data so they can be handed
//! to a driver (or written into shared memory) as raw bytes.
//!
//! # Record Overview
//!
//! 1. **Plane commit**: `[PlaneAttrRecord; planes]`, one per plane used in the
//!    frame, submitted as a single atomic update. Rectangles are 16.16 fixed
//!    point; fences travel out of band, referenced by `fence_index`.
//! 2. **Buffer header**: `BufferHeader`, the geometry and lock/fence summary of a
//!    shared buffer handle.

use bytemuck::{Pod, Zeroable};
use std::mem;

/// No fence attached to a plane record
pub const NO_FENCE: i32 = -1;

/// Plane attribute record for one hardware plane.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PlaneAttrRecord {
    /// Buffer scanned out by the plane
    pub buffer_id: u64,
    /// Hardware plane index
    pub plane: u32,
    /// Transform bits (flip H, flip V, rotate 90)
    pub transform: u32,
    /// 0 = none, 1 = premultiplied, 2 = coverage
    pub blend: u32,
    /// Index into the out-of-band fence list, or `NO_FENCE`
    pub fence_index: i32,
    /// Source rectangle, 16.16 fixed point
    pub src_x: i32,
    pub src_y: i32,
    pub src_w: i32,
    pub src_h: i32,
    /// Destination rectangle, integer pixels
    pub dst_x: i32,
    pub dst_y: i32,
    pub dst_w: u32,
    pub dst_h: u32,
    /// Plane alpha, 0..=0xffff
    pub alpha: u32,
    pub _reserved: u32,
}

impl PlaneAttrRecord {
    /// Size of a record in bytes
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }
}

/// Snapshot of a shared buffer handle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BufferHeader {
    pub id: u64,
    /// Monotonic count of completed exclusive writes
    pub write_seq: u64,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub layout: u32,
    /// Raw lock word: bit 31 = exclusive writer, low bits = reader count
    pub lock_word: u32,
    /// Bit 0 = protected, bit 1 = has shadow, bit 2 = destroyed
    pub flags: u32,
    /// Pending read fences in the ring
    pub read_fences: u32,
    /// 1 if a write fence is stored
    pub write_fence: u32,
}

impl BufferHeader {
    pub const FLAG_PROTECTED: u32 = 1 << 0;
    pub const FLAG_SHADOW: u32 = 1 << 1;
    pub const FLAG_DESTROYED: u32 = 1 << 2;

    /// Size of the header in bytes
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }
}
