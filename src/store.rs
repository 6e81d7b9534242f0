//! The block store owns the container file.
//!
//! The file is divided into two regions:
//! - the header, a table of `max_blocks` big-endian 32-bit integers mapping
//!   each logical block address to a physical block index (zero meaning
//!   "unmapped"), padded up to a multiple of the block size;
//! - the data region, a sequence of block groups of `block_size` blocks each.
//!   The first block of every group is the group-meta block, holding one byte
//!   per block in the group whose low bit is the "taken" flag.
//!
//! Callers only ever see logical addresses. The indirection allows
//! [`BlockStore::compact`] to move blocks toward the head of the file and
//! truncate it without invalidating any address held by a caller.

use crate::error::invalid_arg;
use crate::error::invalid_state;
use crate::error::Error;
use crate::error::Result;
use crate::util::read_i32;
use crate::util::ByteSize;
use std::cell::RefCell;
use std::cmp::min;
use std::collections::VecDeque;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::thread::ThreadId;

/// Hard limit on the number of logical block addresses in a container.
pub const MAX_BLOCKS_LIMIT: i32 = 4 * 1024 * 1024;
/// The null block address. Never valid as a logical or physical address.
pub const NULL_ADDRESS: i32 = 0;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: i32 = 1024;
/// Default number of logical block addresses.
pub const DEFAULT_MAX_BLOCKS: i32 = 1024 * 1024;
/// Default capacity of the cache of groups known to have free slots.
pub const DEFAULT_FREE_GROUPS_CACHE_SIZE: usize = 16;
/// Default capacity of the queue of known-free logical addresses.
pub const DEFAULT_FREE_ADDRESS_CACHE_SIZE: usize = 64;

/// Group-meta byte: the block is taken. The high seven bits are reserved and
/// always written as zero.
const META_TAKEN: u8 = 0x01;

/// Chunk size for zero-fill and header scans.
const SCAN_CHUNK: usize = 64 * 1024;

/// Synchronisation mode the backing file is opened with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AccessMode {
    /// Writes go through the OS page cache (`rw`).
    #[default]
    ReadWrite,
    /// File content is written synchronously (`rwd`).
    ReadWriteData,
    /// File content and metadata are written synchronously (`rws`).
    ReadWriteSync,
}

impl AccessMode {
    /// Returns the open(2) flags to add for this mode.
    fn open_flags(self) -> i32 {
        match self {
            Self::ReadWrite => 0,
            Self::ReadWriteData => libc::O_DSYNC,
            Self::ReadWriteSync => libc::O_SYNC,
        }
    }
}

/// Parameters for opening or creating a container file.
///
/// The container format carries no self-describing superblock, so a file must
/// be reopened with the same `block_size` and `max_blocks` it was created
/// with.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// The size of a block in bytes. Must be a power of two, at least 32.
    pub block_size: i32,
    /// The number of logical block addresses. Must be a multiple of
    /// `block_size`, at most [`MAX_BLOCKS_LIMIT`].
    pub max_blocks: i32,
    /// Capacity of the cache of groups known to have free slots.
    pub free_groups_cache_size: usize,
    /// Capacity of the queue of known-free logical addresses.
    pub free_address_cache_size: usize,
    /// Synchronisation mode of the backing file.
    pub mode: AccessMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks: DEFAULT_MAX_BLOCKS,
            free_groups_cache_size: DEFAULT_FREE_GROUPS_CACHE_SIZE,
            free_address_cache_size: DEFAULT_FREE_ADDRESS_CACHE_SIZE,
            mode: AccessMode::ReadWrite,
        }
    }
}

/// Mutable bookkeeping of a store.
struct State {
    /// Cache of the header table. `0` means unknown or unmapped; a lookup
    /// that misses here falls back to the header on disk.
    map: Vec<i32>,
    /// The number of groups currently present in the file.
    allocated_groups: i32,
    /// The number of non-taken blocks across all groups.
    free_blocks: i64,
    /// Groups known to have at least one free slot.
    free_groups: VecDeque<i32>,
    /// Logical addresses known to be unmapped.
    free_addresses: VecDeque<i32>,
    /// Circular cursor over group ids, for refills of `free_groups`.
    group_cursor: i32,
    /// Circular cursor over logical addresses, for refills of
    /// `free_addresses`.
    address_cursor: i32,
    /// Circular cursor over slot indices within a group.
    slot_cursor: i32,
    /// Bumped by every completed compaction. Block handles carry the value
    /// current at their construction.
    version: u64,
}

/// A store of fixed-size blocks inside a single container file.
///
/// The store is owned by the thread that opened it; operations from any other
/// thread fail with [`Error::WrongOwner`]. All I/O is synchronous and nothing
/// is fsync'd unless an [`AccessMode`] says so.
pub struct BlockStore {
    file: RefCell<File>,
    owner: ThreadId,
    block_size: i32,
    max_blocks: i32,
    /// Length in bytes of the header region.
    header_len: u64,
    free_groups_cache_size: usize,
    free_address_cache_size: usize,
    state: RefCell<State>,
}

impl BlockStore {
    /// Opens the container at `path`, creating it if it does not exist.
    ///
    /// An existing file must have been created with the same geometry as in
    /// `options`, otherwise the function fails.
    pub fn open<P: AsRef<Path>>(path: P, options: &StoreOptions) -> Result<Self> {
        let bs = options.block_size;
        if bs < 32 || !(bs as u32).is_power_of_two() {
            return Err(invalid_arg!(
                "block size {bs} is not a power of two of at least 32"
            ));
        }
        let mb = options.max_blocks;
        if mb <= 0 || mb > MAX_BLOCKS_LIMIT {
            return Err(invalid_arg!(
                "max blocks {mb} is out of range (limit {MAX_BLOCKS_LIMIT})"
            ));
        }
        if mb % bs != 0 {
            return Err(invalid_arg!(
                "max blocks {mb} is not a multiple of the block size {bs}"
            ));
        }
        let header_len = (mb as u64 * 4).next_multiple_of(bs as u64);
        let group_len = bs as u64 * bs as u64;

        let mut open_options = OpenOptions::new();
        open_options.read(true).write(true).create(true);
        let flags = options.mode.open_flags();
        if flags != 0 {
            open_options.custom_flags(flags);
        }
        let file = open_options.open(path.as_ref())?;

        let len = file.metadata()?.len();
        let store = Self {
            file: RefCell::new(file),
            owner: thread::current().id(),
            block_size: bs,
            max_blocks: mb,
            header_len,
            free_groups_cache_size: options.free_groups_cache_size,
            free_address_cache_size: options.free_address_cache_size,
            state: RefCell::new(State {
                map: vec![0; mb as usize],
                allocated_groups: 0,
                free_blocks: 0,
                free_groups: VecDeque::new(),
                free_addresses: VecDeque::new(),
                group_cursor: 0,
                address_cursor: 1,
                slot_cursor: 1,
                version: 0,
            }),
        };

        if len == 0 {
            store.write_zeros(0, header_len)?;
        } else {
            if len < header_len || (len - header_len) % group_len != 0 {
                return Err(invalid_state!(
                    "file length {len} does not match the container geometry"
                ));
            }
            let groups = ((len - header_len) / group_len) as i32;
            let mut free_blocks = 0i64;
            for group in 0..groups {
                let meta = store.read_meta_block(group)?;
                free_blocks += meta[1..]
                    .iter()
                    .filter(|b| **b & META_TAKEN == 0)
                    .count() as i64;
            }
            let mut state = store.state.borrow_mut();
            state.allocated_groups = groups;
            state.free_blocks = free_blocks;
        }
        log::debug!(
            "opened container {} ({}, {} groups, block size {bs})",
            path.as_ref().display(),
            ByteSize(header_len + store.state.borrow().allocated_groups as u64 * group_len),
            store.state.borrow().allocated_groups,
        );
        Ok(store)
    }

    /// Returns the size of a block in bytes.
    pub fn block_size(&self) -> i32 {
        self.block_size
    }

    /// Returns the number of logical addresses of the container.
    pub fn max_blocks(&self) -> i32 {
        self.max_blocks
    }

    /// Returns the total number of blocks in the data region, group-meta
    /// blocks included.
    pub fn total_blocks(&self) -> i64 {
        self.state.borrow().allocated_groups as i64 * self.blocks_in_group() as i64
    }

    /// Returns the number of non-taken blocks in the data region.
    pub fn free_blocks(&self) -> i64 {
        self.state.borrow().free_blocks
    }

    /// Returns the capacity of the data region in bytes.
    pub fn total_space(&self) -> u64 {
        self.total_blocks() as u64 * self.block_size as u64
    }

    /// Returns the number of free bytes in the data region.
    pub fn free_space(&self) -> u64 {
        self.free_blocks() as u64 * self.block_size as u64
    }

    /// Closes the container.
    ///
    /// All bookkeeping lives in the header and group-meta blocks, which are
    /// kept current by every operation, so there is nothing left to write.
    pub fn close(self) -> Result<()> {
        self.check_owner()?;
        Ok(())
    }

    /// Allocates a block and returns a handle to it.
    ///
    /// The block content is not initialised: it holds whatever bytes were
    /// last written at its physical location.
    pub fn allocate(&self) -> Result<Block<'_>> {
        self.check_owner()?;
        let addr = self.take_free_address()?;
        let (group, slot, free_in_group) = self.find_allocatable_slot()?;
        let physical = group * self.blocks_in_group() + slot;
        self.write_meta(group, slot, true)?;
        self.write_i32_at(self.header_slot_offset(addr), physical)?;
        let version = {
            let mut state = self.state.borrow_mut();
            state.map[addr as usize] = physical;
            state.free_blocks -= 1;
            if free_in_group <= 1 {
                state.free_groups.retain(|g| *g != group);
            }
            state.version
        };
        Ok(Block {
            store: self,
            addr,
            physical,
            version,
        })
    }

    /// Frees the block at the logical address `addr`.
    ///
    /// Freeing an unmapped address is a programming error and fails with
    /// [`Error::InvalidState`].
    pub fn deallocate(&self, addr: i32) -> Result<()> {
        self.check_owner()?;
        let physical = self.resolve(addr)?;
        let group = physical / self.blocks_in_group();
        let slot = physical % self.blocks_in_group();
        self.write_meta(group, slot, false)?;
        self.write_i32_at(self.header_slot_offset(addr), 0)?;
        let mut state = self.state.borrow_mut();
        state.map[addr as usize] = 0;
        state.free_blocks += 1;
        if state.free_groups.len() < self.free_groups_cache_size
            && !state.free_groups.contains(&group)
        {
            state.free_groups.push_back(group);
        }
        if state.free_addresses.len() < self.free_address_cache_size {
            state.free_addresses.push_back(addr);
        }
        Ok(())
    }

    /// Returns a handle to the allocated block at the logical address `addr`.
    pub fn get(&self, addr: i32) -> Result<Block<'_>> {
        self.check_owner()?;
        let physical = self.resolve(addr)?;
        let version = self.state.borrow().version;
        Ok(Block {
            store: self,
            addr,
            physical,
            version,
        })
    }

    /// Packs allocated blocks toward the head of the file and truncates
    /// trailing empty groups.
    ///
    /// Every logical address keeps its content. Block handles taken before
    /// the call become stale and fail on their next use.
    pub fn compact(&self) -> Result<()> {
        self.check_owner()?;
        let big = self.blocks_in_group();
        let mut reverse = self.snapshot_reverse_map()?;
        let mut start = 0i32;
        let mut end = self.state.borrow().allocated_groups - 1;
        let mut moved = 0u64;
        let mut truncated = 0u32;

        'outer: loop {
            // Seek the source from the tail, truncating empty groups on the
            // way down.
            let mut source = loop {
                if end < 0 {
                    break 'outer;
                }
                let meta = self.read_meta_block(end)?;
                if meta[1..].iter().all(|b| *b & META_TAKEN == 0) {
                    self.truncate_last_group()?;
                    truncated += 1;
                    end -= 1;
                } else {
                    break meta;
                }
            };
            // Seek the target from the head.
            let mut target = loop {
                if start >= end {
                    break 'outer;
                }
                let meta = self.read_meta_block(start)?;
                if meta[1..].iter().any(|b| *b & META_TAKEN == 0) {
                    break meta;
                }
                start += 1;
            };
            // Move blocks from the source into the target, one at a time,
            // until one of them is exhausted.
            loop {
                let Some(dst_slot) = Self::first_free_slot(&target) else {
                    start += 1;
                    continue 'outer;
                };
                let Some(src_slot) = Self::last_taken_slot(&source) else {
                    continue 'outer;
                };
                let src_physical = end * big + src_slot;
                let dst_physical = start * big + dst_slot;
                let logical = reverse[src_physical as usize];
                if logical != 0 {
                    self.copy_block(src_physical, dst_physical)?;
                    self.write_i32_at(self.header_slot_offset(logical), dst_physical)?;
                    self.write_meta(start, dst_slot, true)?;
                    self.write_meta(end, src_slot, false)?;
                    let mut state = self.state.borrow_mut();
                    state.map[logical as usize] = dst_physical;
                    reverse[dst_physical as usize] = logical;
                    reverse[src_physical as usize] = 0;
                    target[dst_slot as usize] = META_TAKEN;
                    source[src_slot as usize] = 0;
                    moved += 1;
                } else {
                    // A taken slot with no mapping cannot be referenced by
                    // anyone. Reclaim it.
                    log::warn!("reclaiming orphan block at physical address {src_physical}");
                    self.write_meta(end, src_slot, false)?;
                    source[src_slot as usize] = 0;
                    self.state.borrow_mut().free_blocks += 1;
                }
            }
        }

        let mut state = self.state.borrow_mut();
        state.free_groups.clear();
        state.free_addresses.clear();
        state.version += 1;
        let groups = state.allocated_groups;
        drop(state);
        log::debug!(
            "compaction moved {moved} blocks, truncated {truncated} groups, {groups} remain ({})",
            ByteSize(self.header_len + groups as u64 * big as u64 * self.block_size as u64),
        );
        Ok(())
    }

    /// The number of blocks per group, group-meta block included.
    fn blocks_in_group(&self) -> i32 {
        self.block_size
    }

    /// The length of a group in bytes.
    fn group_len(&self) -> u64 {
        self.block_size as u64 * self.block_size as u64
    }

    /// Returns the file offset of the physical block `physical`.
    fn physical_offset(&self, physical: i32) -> u64 {
        self.header_len + physical as u64 * self.block_size as u64
    }

    /// Returns the file offset of the header slot for `addr`.
    fn header_slot_offset(&self, addr: i32) -> u64 {
        addr as u64 * 4
    }

    fn check_owner(&self) -> Result<()> {
        if thread::current().id() != self.owner {
            return Err(Error::WrongOwner);
        }
        Ok(())
    }

    /// Resolves a logical address to a physical block index, using the cache
    /// and falling back to the header.
    fn resolve(&self, addr: i32) -> Result<i32> {
        if addr <= 0 || addr >= self.max_blocks {
            return Err(invalid_arg!("invalid block address {addr}"));
        }
        {
            let state = self.state.borrow();
            let physical = state.map[addr as usize];
            if physical != 0 {
                return Ok(physical);
            }
        }
        let physical = self.read_i32_at(self.header_slot_offset(addr))?;
        if physical == 0 {
            return Err(invalid_state!("block address {addr} is not mapped"));
        }
        self.state.borrow_mut().map[addr as usize] = physical;
        Ok(physical)
    }

    /// Pops a free logical address, refilling the queue from the header when
    /// it is empty.
    fn take_free_address(&self) -> Result<i32> {
        if let Some(addr) = self.state.borrow_mut().free_addresses.pop_front() {
            return Ok(addr);
        }
        self.refill_free_addresses()?;
        self.state
            .borrow_mut()
            .free_addresses
            .pop_front()
            .ok_or(Error::OutOfSpace)
    }

    /// Scans the header from the address cursor, wrapping around, until the
    /// queue is full or every address has been examined.
    fn refill_free_addresses(&self) -> Result<()> {
        let cap = self.free_address_cache_size.max(1);
        let mut cursor = self.state.borrow().address_cursor;
        if cursor < 1 || cursor >= self.max_blocks {
            cursor = 1;
        }
        let total = self.max_blocks - 1;
        let mut found = VecDeque::new();
        let mut scanned = 0i32;
        let mut buf = vec![0u8; SCAN_CHUNK];
        'scan: while scanned < total && found.len() < cap {
            let run = min(
                min((buf.len() / 4) as i32, self.max_blocks - cursor),
                total - scanned,
            );
            let chunk = &mut buf[..run as usize * 4];
            self.read_at(self.header_slot_offset(cursor), chunk)?;
            for i in 0..run {
                if read_i32(chunk, i as usize * 4) == 0 {
                    found.push_back(cursor + i);
                    if found.len() >= cap {
                        cursor += i + 1;
                        scanned = total;
                        break 'scan;
                    }
                }
            }
            scanned += run;
            cursor += run;
            if cursor >= self.max_blocks {
                cursor = 1;
            }
        }
        if cursor >= self.max_blocks {
            cursor = 1;
        }
        let mut state = self.state.borrow_mut();
        state.address_cursor = cursor;
        state.free_addresses = found;
        Ok(())
    }

    /// Returns a `(group, slot, free slots in group)` triple for the next
    /// allocation, growing the file by one group when nothing is free.
    fn find_allocatable_slot(&self) -> Result<(i32, i32, usize)> {
        loop {
            let group = self.state.borrow().free_groups.front().copied();
            let Some(group) = group else {
                self.refill_free_groups()?;
                if self.state.borrow().free_groups.is_empty() {
                    let group = self.append_group()?;
                    self.state.borrow_mut().free_groups.push_back(group);
                }
                continue;
            };
            let meta = self.read_meta_block(group)?;
            let free = meta[1..].iter().filter(|b| **b & META_TAKEN == 0).count();
            match self.pick_free_slot(&meta) {
                Some(slot) => return Ok((group, slot, free)),
                // The cache entry went stale. Drop it and retry.
                None => {
                    self.state.borrow_mut().free_groups.pop_front();
                }
            }
        }
    }

    /// Returns the first non-taken slot of the given meta block, starting at
    /// the slot cursor and wrapping, skipping the meta slot itself.
    fn pick_free_slot(&self, meta: &[u8]) -> Option<i32> {
        let slots = self.blocks_in_group() - 1;
        let mut state = self.state.borrow_mut();
        let base = (state.slot_cursor - 1).rem_euclid(slots);
        for i in 0..slots {
            let slot = 1 + (base + i) % slots;
            if meta[slot as usize] & META_TAKEN == 0 {
                state.slot_cursor = slot + 1;
                return Some(slot);
            }
        }
        None
    }

    /// Scans group metas from the group cursor, wrapping around, until the
    /// cache is full or every group has been examined.
    fn refill_free_groups(&self) -> Result<()> {
        let cap = self.free_groups_cache_size.max(1);
        let (mut cursor, groups) = {
            let state = self.state.borrow();
            (state.group_cursor, state.allocated_groups)
        };
        if groups == 0 {
            return Ok(());
        }
        if cursor < 0 || cursor >= groups {
            cursor = 0;
        }
        let mut found = VecDeque::new();
        let mut scanned = 0;
        for i in 0..groups {
            if found.len() >= cap {
                break;
            }
            let group = (cursor + i) % groups;
            let meta = self.read_meta_block(group)?;
            if meta[1..].iter().any(|b| *b & META_TAKEN == 0) {
                found.push_back(group);
            }
            scanned = i + 1;
        }
        let mut state = self.state.borrow_mut();
        state.group_cursor = (cursor + scanned) % groups;
        state.free_groups = found;
        Ok(())
    }

    /// Appends a zeroed group at the tail of the file and marks its meta slot
    /// taken.
    fn append_group(&self) -> Result<i32> {
        let group = {
            let state = self.state.borrow();
            let next = state.allocated_groups as i64 + 1;
            if next * self.blocks_in_group() as i64 > self.max_blocks as i64 {
                return Err(Error::OutOfSpace);
            }
            state.allocated_groups
        };
        let start = self.physical_offset(group * self.blocks_in_group());
        self.write_zeros(start, self.group_len())?;
        self.write_meta(group, 0, true)?;
        let mut state = self.state.borrow_mut();
        state.allocated_groups += 1;
        state.free_blocks += self.blocks_in_group() as i64 - 1;
        log::trace!("container grew to {} groups", state.allocated_groups);
        Ok(group)
    }

    /// Removes the last group of the file. The group must be empty.
    fn truncate_last_group(&self) -> Result<()> {
        let len = {
            let state = self.state.borrow();
            self.header_len + (state.allocated_groups as u64 - 1) * self.group_len()
        };
        self.file.borrow_mut().set_len(len)?;
        let mut state = self.state.borrow_mut();
        state.allocated_groups -= 1;
        state.free_blocks -= self.blocks_in_group() as i64 - 1;
        log::trace!("container shrank to {} groups", state.allocated_groups);
        Ok(())
    }

    /// Builds the physical to logical map by scanning the header once.
    fn snapshot_reverse_map(&self) -> Result<Vec<i32>> {
        let blocks = {
            let state = self.state.borrow();
            state.allocated_groups as usize * self.blocks_in_group() as usize
        };
        let mut reverse = vec![0i32; blocks];
        let mut buf = vec![0u8; SCAN_CHUNK];
        let mut addr = 1i32;
        while addr < self.max_blocks {
            let run = min((buf.len() / 4) as i32, self.max_blocks - addr);
            let chunk = &mut buf[..run as usize * 4];
            self.read_at(self.header_slot_offset(addr), chunk)?;
            for i in 0..run {
                let physical = read_i32(chunk, i as usize * 4);
                if physical == 0 {
                    continue;
                }
                if physical < 0 || physical as usize >= reverse.len() {
                    return Err(invalid_state!(
                        "header maps address {} outside the data region",
                        addr + i
                    ));
                }
                reverse[physical as usize] = addr + i;
            }
            addr += run;
        }
        Ok(reverse)
    }

    fn first_free_slot(meta: &[u8]) -> Option<i32> {
        meta.iter()
            .enumerate()
            .skip(1)
            .find(|(_, b)| **b & META_TAKEN == 0)
            .map(|(i, _)| i as i32)
    }

    fn last_taken_slot(meta: &[u8]) -> Option<i32> {
        meta.iter()
            .enumerate()
            .skip(1)
            .rev()
            .find(|(_, b)| **b & META_TAKEN != 0)
            .map(|(i, _)| i as i32)
    }

    /// Copies the content of one physical block onto another.
    fn copy_block(&self, src: i32, dst: i32) -> Result<()> {
        let mut buf = vec![0u8; self.block_size as usize];
        self.read_at(self.physical_offset(src), &mut buf)?;
        self.write_at(self.physical_offset(dst), &buf)
    }

    /// Reads the group-meta block of `group`.
    fn read_meta_block(&self, group: i32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize];
        self.read_at(self.physical_offset(group * self.blocks_in_group()), &mut buf)?;
        Ok(buf)
    }

    /// Sets or clears the taken byte of a slot in a group-meta block.
    fn write_meta(&self, group: i32, slot: i32, taken: bool) -> Result<()> {
        let off = self.physical_offset(group * self.blocks_in_group()) + slot as u64;
        self.write_at(off, &[if taken { META_TAKEN } else { 0 }])
    }

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(off))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, off: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(off))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn read_i32_at(&self, off: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_at(off, &mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    fn write_i32_at(&self, off: u64, val: i32) -> Result<()> {
        self.write_at(off, &val.to_be_bytes())
    }

    fn write_zeros(&self, off: u64, len: u64) -> Result<()> {
        let zeros = vec![0u8; min(len, SCAN_CHUNK as u64) as usize];
        let mut written = 0u64;
        while written < len {
            let run = min(zeros.len() as u64, len - written);
            self.write_at(off + written, &zeros[..run as usize])?;
            written += run;
        }
        Ok(())
    }
}

/// A handle to an allocated block.
///
/// The handle captures the mapping version current at its construction; once
/// a compaction completes, every older handle fails with
/// [`Error::StaleHandle`] instead of touching a physical location that may
/// have been reassigned. [`BlockStore::get`] returns a fresh handle for the
/// same logical address.
#[derive(Clone)]
pub struct Block<'s> {
    store: &'s BlockStore,
    addr: i32,
    physical: i32,
    version: u64,
}

impl Block<'_> {
    /// Returns the logical address of the block.
    pub fn address(&self) -> i32 {
        self.addr
    }

    /// Returns the size of the block in bytes.
    pub fn size(&self) -> i32 {
        self.store.block_size
    }

    /// Reads the whole block.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.check()?;
        let mut buf = vec![0u8; self.store.block_size as usize];
        self.store
            .read_at(self.store.physical_offset(self.physical), &mut buf)?;
        Ok(buf)
    }

    /// Writes `bytes` at the beginning of the block.
    ///
    /// A write shorter than the block size is stored verbatim: the tail of
    /// the block keeps whatever bytes were there before.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.check()?;
        if bytes.len() > self.store.block_size as usize {
            return Err(invalid_arg!(
                "write of {} bytes exceeds the block size {}",
                bytes.len(),
                self.store.block_size
            ));
        }
        self.store
            .write_at(self.store.physical_offset(self.physical), bytes)
    }

    /// Reads the big-endian 32-bit integer at byte position `pos`.
    pub fn read_int(&self, pos: i32) -> Result<i32> {
        self.check_pos(pos)?;
        self.store
            .read_i32_at(self.store.physical_offset(self.physical) + pos as u64)
    }

    /// Writes `val` as a big-endian 32-bit integer at byte position `pos`.
    pub fn write_int(&self, pos: i32, val: i32) -> Result<()> {
        self.check_pos(pos)?;
        self.store
            .write_i32_at(self.store.physical_offset(self.physical) + pos as u64, val)
    }

    /// Overwrites the whole block with zero bytes.
    pub fn clear(&self) -> Result<()> {
        self.check()?;
        self.store.write_zeros(
            self.store.physical_offset(self.physical),
            self.store.block_size as u64,
        )
    }

    fn check(&self) -> Result<()> {
        self.store.check_owner()?;
        if self.version != self.store.state.borrow().version {
            return Err(Error::StaleHandle);
        }
        Ok(())
    }

    fn check_pos(&self, pos: i32) -> Result<()> {
        self.check()?;
        if pos < 0 || pos + 4 > self.store.block_size {
            return Err(invalid_arg!("position {pos} is out of the block bounds"));
        }
        Ok(())
    }
}
