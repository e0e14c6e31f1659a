use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::mem::{offset_of, size_of};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::pod::PodStr;
use crate::ZeroCopy;

// Constant to represent an empty reference.
pub(crate) const SENTINEL: u32 = 0;

/// Maximum length (in bytes) of a key.
pub const MAX_KEY_LEN: usize = 20;

// Marks the reserved slot of an initialized pool.
const POOL_TAG: u32 = 0x5041_4d54;

/// Size (in bytes) of a node header. The payload of a node follows its header.
pub(crate) const HEADER_LEN: usize = size_of::<NodeHeader>();

const KEY_OFFSET: usize = offset_of!(NodeHeader, key);

// Enum representing the fields of a node.
#[derive(Copy, Clone)]
pub(crate) enum Register {
    Left,
    Right,
    Height,
    KeyLen,
}

// Enum representing the fields of the allocator.
#[derive(Copy, Clone)]
enum Field {
    Root,
    FreeListHead,
    Tag,
    Stride,
}

/// Returns the number of bytes required to store a map with room for
/// `node_count` entries of `payload_size` bytes each.
///
/// The reserved slot is accounted for, so a block of this size reports a
/// capacity of exactly `node_count`. Saturates at `usize::MAX`.
pub const fn estimate_required_bytes(payload_size: usize, node_count: usize) -> usize {
    HEADER_LEN
        .saturating_add(payload_size)
        .saturating_mul(node_count.saturating_add(1))
}

/// Local view of a node pool: payload size and number of slots.
///
/// The layout is the only state a handle keeps outside of the block. It never
/// stores an address that is persisted, so a block can be copied to another base
/// address and attached again with the same layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLayout {
    /// Size (in bytes) of the value stored in every node.
    payload_size: usize,

    /// Number of slots, including the reserved slot.
    capacity: u32,

    /// Base address of the block when the layout was last attached.
    ///
    /// Only used to report that a grown block has moved.
    #[serde(skip)]
    base: usize,
}

impl PoolLayout {
    /// Returns the size (in bytes) of a single slot.
    ///
    /// Saturates at `usize::MAX`; attaching such a layout fails.
    pub const fn stride(&self) -> usize {
        HEADER_LEN.saturating_add(self.payload_size)
    }

    /// Returns the size (in bytes) of the value stored in every node.
    pub const fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Returns the number of slots, including the reserved slot.
    pub const fn slots(&self) -> usize {
        self.capacity as usize
    }

    /// Returns the number of slots available to store entries.
    pub const fn capacity(&self) -> usize {
        self.capacity.saturating_sub(1) as usize
    }

    /// Returns the number of bytes covered by the slots.
    ///
    /// Saturates at `usize::MAX`; attaching such a layout fails.
    pub const fn block_len(&self) -> usize {
        self.stride().saturating_mul(self.capacity as usize)
    }

    /// Returns the stride and the block length, failing when either does not
    /// fit. The stride is stored in a `u32` register of the reserved slot.
    fn checked_len(&self) -> Result<(u32, usize)> {
        let overflow = || Error::LayoutOverflow {
            payload_size: self.payload_size,
            slots: self.slots(),
        };

        let stride = Self::checked_stride(self.payload_size).ok_or_else(overflow)?;
        let len = (stride as usize)
            .checked_mul(self.slots())
            .ok_or_else(overflow)?;

        Ok((stride, len))
    }

    fn checked_stride(payload_size: usize) -> Option<u32> {
        HEADER_LEN
            .checked_add(payload_size)
            .and_then(|stride| u32::try_from(stride).ok())
    }

    fn slots_for(len: usize, stride: usize) -> u32 {
        u32::try_from(len / stride).unwrap_or(u32::MAX)
    }
}

/// Outcome of growing a node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowReport {
    /// Number of slots added to the pool.
    pub added: usize,

    /// Number of slots available to store entries after growing.
    pub capacity: usize,

    /// Indicates that the block no longer sits at the base address it had
    /// when the layout was taken. The pool is still consistent.
    pub address_changed: bool,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct NodeHeader {
    /// Registers for a node. This is fixed to include:
    ///   [0] - left child
    ///   [1] - right child
    ///   [2] - height
    ///   [3] - key length
    registers: [u32; 4],
    /// Node key, zero-padded.
    key: PodStr<MAX_KEY_LEN>,
}

impl NodeHeader {
    /// Creates the header of a leaf node, returning `None` when the key does
    /// not fit.
    pub(crate) fn leaf(key: &[u8]) -> Option<Self> {
        Some(Self {
            registers: [SENTINEL, SENTINEL, 1, key.len() as u32],
            key: PodStr::from_slice(key)?,
        })
    }
}

impl ZeroCopy for NodeHeader {}

/// The allocator occupies the reserved slot 0 of the pool.
///
/// Its first two fields sit at the same offsets as the child registers of a
/// node: the root of the tree is where a node keeps its left child, and the
/// head of the free list is where a node keeps its right child. Free slots are
/// chained through their right register.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct Allocator {
    /// Allocator fields:
    ///   [0] - root
    ///   [1] - free_list_head
    ///   [2] - tag
    ///   [3] - stride
    ///   [4..9] - not in use (padding)
    fields: [u32; 9],
}

const _: () = assert!(size_of::<Allocator>() == HEADER_LEN);

impl Allocator {
    fn new(stride: u32, capacity: u32) -> Self {
        let mut allocator = Self::zeroed();
        allocator.set_field(Field::Tag, POOL_TAG);
        allocator.set_field(Field::Stride, stride);
        allocator.set_field(
            Field::FreeListHead,
            if capacity > 1 { 1 } else { SENTINEL },
        );
        allocator
    }

    #[inline(always)]
    fn get_field(&self, field: Field) -> u32 {
        self.fields[field as usize]
    }

    #[inline(always)]
    fn set_field(&mut self, field: Field, value: u32) {
        self.fields[field as usize] = value;
    }
}

impl ZeroCopy for Allocator {}

/// Fixed-stride array of slots over a byte block.
///
/// Slots are addressed by index; an index is turned into a byte offset only
/// for the duration of a single access.
pub(crate) struct NodePool<B> {
    block: B,
    layout: PoolLayout,
}

impl<B: AsRef<[u8]>> NodePool<B> {
    /// Loads a pool from a block that already holds one.
    pub(crate) fn attach(block: B, layout: PoolLayout) -> Result<Self> {
        let bytes = block.as_ref();
        let (stride, block_len) = layout.checked_len()?;
        let stride = stride as usize;
        let required = block_len.max(stride);

        if layout.capacity == 0 || bytes.len() < required {
            return Err(Error::BlockTooSmall {
                len: bytes.len(),
                required,
            });
        }

        let allocator = Allocator::load(bytes);

        if allocator.get_field(Field::Tag) != POOL_TAG {
            return Err(Error::NotInitialized);
        }

        if allocator.get_field(Field::Stride) as usize != stride {
            return Err(Error::StrideMismatch {
                expected: stride,
                actual: allocator.get_field(Field::Stride) as usize,
            });
        }

        let layout = PoolLayout {
            base: bytes.as_ptr() as usize,
            ..layout
        };
        debug!(slots = layout.capacity, stride, "attached node pool");

        Ok(Self { block, layout })
    }

    /// Loads a pool from a block that was enlarged after `layout` was taken.
    ///
    /// The block must hold the content of the original block at its start.
    pub(crate) fn grown(block: B, layout: PoolLayout) -> Result<(Self, GrowReport)> {
        let (_, current) = layout.checked_len()?;
        let requested = block.as_ref().len();

        if requested <= current {
            return Err(Error::UnsupportedShrink { current, requested });
        }

        let added = PoolLayout::slots_for(requested - current, layout.stride());
        let capacity = layout.capacity.saturating_add(added);

        let pool = Self::attach(block, PoolLayout { capacity, ..layout })?;
        let address_changed = layout.base != 0 && layout.base != pool.layout.base;

        if address_changed {
            info!(
                from = layout.base,
                to = pool.layout.base,
                "node pool moved to a new base address"
            );
        }

        let report = GrowReport {
            added: (capacity - layout.capacity) as usize,
            capacity: pool.layout.capacity(),
            address_changed,
        };

        Ok((pool, report))
    }

    pub(crate) fn layout(&self) -> PoolLayout {
        self.layout
    }

    pub(crate) fn into_inner(self) -> B {
        self.block
    }

    #[inline(always)]
    fn offset(&self, index: u32, at: usize) -> usize {
        index as usize * self.layout.stride() + at
    }

    #[inline(always)]
    fn read_u32(&self, offset: usize) -> u32 {
        bytemuck::pod_read_unaligned(&self.block.as_ref()[offset..offset + size_of::<u32>()])
    }

    #[inline(always)]
    pub(crate) fn register(&self, index: u32, register: Register) -> u32 {
        self.read_u32(self.offset(index, register as usize * size_of::<u32>()))
    }

    #[inline(always)]
    fn field(&self, field: Field) -> u32 {
        self.read_u32(field as usize * size_of::<u32>())
    }

    /// Returns the index of the root node.
    pub(crate) fn root(&self) -> u32 {
        self.field(Field::Root)
    }

    pub(crate) fn free_list_head(&self) -> u32 {
        self.field(Field::FreeListHead)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.free_list_head() == SENTINEL
    }

    /// Returns the key of a node.
    pub(crate) fn key(&self, index: u32) -> &[u8] {
        let start = self.offset(index, KEY_OFFSET);
        let key: &PodStr<MAX_KEY_LEN> =
            bytemuck::from_bytes(&self.block.as_ref()[start..start + MAX_KEY_LEN]);
        key.prefix(self.register(index, Register::KeyLen) as usize)
    }

    /// Returns the payload of a node.
    pub(crate) fn payload(&self, index: u32) -> &[u8] {
        let start = self.offset(index, HEADER_LEN);
        &self.block.as_ref()[start..start + self.layout.payload_size]
    }

    /// Counts the slots on the free list.
    ///
    /// The walk stops after visiting as many slots as the pool has, so a
    /// corrupted (cyclic) list does not hang.
    pub(crate) fn free_slots(&self) -> usize {
        let mut count = 0;
        let mut index = self.free_list_head();

        while index != SENTINEL && index < self.layout.capacity && count < self.layout.slots() {
            count += 1;
            index = self.register(index, Register::Right);
        }

        count
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NodePool<B> {
    /// Initializes a pool over the whole block.
    ///
    /// The block is zeroed and every slot except the reserved one is chained
    /// into the free list in index order.
    pub(crate) fn initialize(mut block: B, payload_size: usize) -> Result<Self> {
        let bytes = block.as_mut();
        let stride = PoolLayout::checked_stride(payload_size).ok_or(Error::LayoutOverflow {
            payload_size,
            slots: 1,
        })?;

        if bytes.len() < stride as usize {
            return Err(Error::BlockTooSmall {
                len: bytes.len(),
                required: stride as usize,
            });
        }

        let layout = PoolLayout {
            payload_size,
            capacity: PoolLayout::slots_for(bytes.len(), stride as usize),
            base: bytes.as_ptr() as usize,
        };

        bytes.fill(0);
        Allocator::new(stride, layout.capacity).store(bytes);

        let mut pool = Self { block, layout };
        pool.link_free_run(1, layout.capacity, SENTINEL);

        info!(
            capacity = layout.capacity(),
            stride, "node pool initialized"
        );

        Ok(pool)
    }

    /// Links the new slots of a grown pool in front of the free list.
    ///
    /// Only the process that performed the physical resize does this; every
    /// other observer adopts the grown block as is.
    pub(crate) fn relink_grown(block: B, layout: PoolLayout) -> Result<(Self, GrowReport)> {
        let (mut pool, report) = Self::grown(block, layout)?;

        if report.added > 0 {
            let first = layout.capacity;
            let end = pool.layout.capacity;

            let start_offset = pool.offset(first, 0);
            let end_offset = pool.offset(end, 0);
            pool.block.as_mut()[start_offset..end_offset].fill(0);

            let head = pool.free_list_head();
            pool.link_free_run(first, end, head);
            pool.set_field(Field::FreeListHead, first);
        }

        info!(
            added = report.added,
            capacity = report.capacity,
            "node pool grown"
        );

        Ok((pool, report))
    }

    /// Pops a slot from the free list.
    ///
    /// The slot content is left as is; the caller is expected to overwrite it.
    pub(crate) fn allocate(&mut self) -> Result<u32> {
        let head = self.free_list_head();

        if head == SENTINEL {
            debug!(slots = self.layout.capacity, "node pool exhausted");
            return Err(Error::PoolExhausted);
        }

        let next = self.register(head, Register::Right);
        self.set_field(Field::FreeListHead, next);
        debug!(index = head, "allocated slot");

        Ok(head)
    }

    /// Clears a slot and pushes it onto the free list.
    pub(crate) fn release(&mut self, index: u32) {
        let head = self.free_list_head();

        let start = self.offset(index, 0);
        let end = self.offset(index + 1, 0);
        self.block.as_mut()[start..end].fill(0);

        self.set_register(index, Register::Right, head);
        self.set_field(Field::FreeListHead, index);
        debug!(index, "released slot");
    }

    pub(crate) fn set_root(&mut self, root: u32) {
        self.set_field(Field::Root, root);
    }

    /// Writes a node (header and payload) into a slot.
    pub(crate) fn write_node(&mut self, index: u32, header: &NodeHeader, payload: &[u8]) {
        let start = self.offset(index, 0);
        let end = self.offset(index + 1, 0);
        let slot = &mut self.block.as_mut()[start..end];

        header.store(slot);
        slot[HEADER_LEN..].copy_from_slice(payload);
    }

    pub(crate) fn payload_mut(&mut self, index: u32) -> &mut [u8] {
        let start = self.offset(index, HEADER_LEN);
        let end = start + self.layout.payload_size;
        &mut self.block.as_mut()[start..end]
    }

    #[inline(always)]
    pub(crate) fn set_register(&mut self, index: u32, register: Register, value: u32) {
        let offset = self.offset(index, register as usize * size_of::<u32>());
        self.write_u32(offset, value);
    }

    #[inline(always)]
    fn set_field(&mut self, field: Field, value: u32) {
        self.write_u32(field as usize * size_of::<u32>(), value);
    }

    #[inline(always)]
    fn write_u32(&mut self, offset: usize, value: u32) {
        self.block.as_mut()[offset..offset + size_of::<u32>()]
            .copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Chains the slots `start..end` through their right register; the last
    /// slot points at `tail`.
    fn link_free_run(&mut self, start: u32, end: u32, tail: u32) {
        for index in start..end {
            let next = if index + 1 < end { index + 1 } else { tail };
            self.set_register(index, Register::Right, next);
        }
    }
}
