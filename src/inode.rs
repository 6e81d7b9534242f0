//! An inode represents one regular file as a linked structure of blocks.
//!
//! The root block, and every overflow inode block chained after it, is an
//! array of `block_size / 4` big-endian 32-bit slots:
//! - slot 0 holds the flags word;
//! - slot 1 holds the total file size in bytes;
//! - slot 2 points at the last inode block of the chain;
//! - slots 3 to N-2 point at data blocks, dense from the front;
//! - slot N-1 points at the next inode block, or zero.
//!
//! Slots 0 to 2 are only meaningful in the root. An inode supports at most
//! one active stream, read or append, guarded by the "locked" flag.

use crate::error::invalid_state;
use crate::error::Result;
use crate::store::Block;
use crate::store::BlockStore;
use crate::util::read_i32;
use bitflags::bitflags;
use std::io;

/// Byte position of the flags slot.
const FLAGS_POS: i32 = 0;
/// Byte position of the size slot.
const SIZE_POS: i32 = 4;
/// Byte position of the last-inode-block slot.
const LAST_POS: i32 = 8;
/// Index of the first data-block slot.
const FIRST_DATA_SLOT: i32 = 3;

bitflags! {
    /// Flags word of an inode root block.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct InodeFlags: i32 {
        /// The trailing data block is full: the next append must allocate a
        /// new data block and start at its offset 0.
        const TRAILING_FULL = 0b01;
        /// A stream is currently open on the inode.
        const LOCKED = 0b10;
    }
}

/// Returns the byte position of the slot at `index`.
fn slot_pos(index: i32) -> i32 {
    index * 4
}

/// A handle to an inode rooted at a logical block address.
///
/// The handle holds no on-disk state of its own. It stays valid across
/// compactions since it resolves its logical address on every access.
#[derive(Clone)]
pub struct Inode<'s> {
    store: &'s BlockStore,
    addr: i32,
}

impl<'s> Inode<'s> {
    /// Returns a handle to the inode rooted at `addr`.
    pub fn new(store: &'s BlockStore, addr: i32) -> Self {
        Self { store, addr }
    }

    /// Allocates and initialises a fresh, empty inode.
    pub fn create(store: &'s BlockStore) -> Result<Self> {
        let root = store.allocate()?;
        root.clear()?;
        Ok(Self {
            store,
            addr: root.address(),
        })
    }

    /// Returns the logical address of the root block.
    pub fn address(&self) -> i32 {
        self.addr
    }

    /// Returns the size of the file in bytes.
    pub fn size(&self) -> Result<i64> {
        let root = self.store.get(self.addr)?;
        Ok(root.read_int(SIZE_POS)? as i64)
    }

    /// Opens a stream appending at the end of the file.
    pub fn append_stream(&self) -> Result<AppendStream<'s>> {
        AppendStream::open(self.store, self.addr)
    }

    /// Opens a stream reading the file from the beginning.
    pub fn read_stream(&self) -> Result<ReadStream<'s>> {
        ReadStream::open(self.store, self.addr)
    }

    /// Frees every data block and overflow inode block, leaving an empty
    /// inode behind.
    pub fn clear(&self) -> Result<()> {
        self.free_chain()?;
        self.store.get(self.addr)?.clear()
    }

    /// Frees the whole inode, the root block included.
    pub fn delete(self) -> Result<()> {
        self.free_chain()?;
        self.store.deallocate(self.addr)
    }

    /// Walks the chain and frees everything except the root block.
    fn free_chain(&self) -> Result<()> {
        let root = self.store.get(self.addr)?;
        let flags = InodeFlags::from_bits_truncate(root.read_int(FLAGS_POS)?);
        if flags.contains(InodeFlags::LOCKED) {
            return Err(invalid_state!(
                "inode {} has an open stream",
                self.addr
            ));
        }
        let next_pos = slot_pos(self.store.block_size() / 4 - 1);
        let mut addr = self.addr;
        loop {
            let bytes = self.store.get(addr)?.read()?;
            for slot in FIRST_DATA_SLOT..self.store.block_size() / 4 - 1 {
                let ptr = read_i32(&bytes, slot_pos(slot) as usize);
                if ptr == 0 {
                    break;
                }
                self.store.deallocate(ptr)?;
            }
            let next = read_i32(&bytes, next_pos as usize);
            if addr != self.addr {
                self.store.deallocate(addr)?;
            }
            if next == 0 {
                break;
            }
            addr = next;
        }
        Ok(())
    }
}

/// Locks the inode rooted at `root`, failing if it is already locked.
fn lock(root: &Block<'_>, addr: i32) -> Result<InodeFlags> {
    let flags = InodeFlags::from_bits_truncate(root.read_int(FLAGS_POS)?);
    if flags.contains(InodeFlags::LOCKED) {
        return Err(invalid_state!("inode {addr} already has an open stream"));
    }
    root.write_int(FLAGS_POS, (flags | InodeFlags::LOCKED).bits())?;
    Ok(flags)
}

/// Clears the locked flag of the inode rooted at `addr`.
fn unlock(store: &BlockStore, addr: i32) -> Result<()> {
    let root = store.get(addr)?;
    let mut flags = InodeFlags::from_bits_truncate(root.read_int(FLAGS_POS)?);
    flags.remove(InodeFlags::LOCKED);
    root.write_int(FLAGS_POS, flags.bits())
}

/// A stream appending bytes at the end of an inode.
///
/// Bytes accumulate in an in-memory copy of the trailing data block, which is
/// written out whenever it fills up, on flush and on close. The stream must
/// be closed to clear the lock and settle the trailing-block flag; dropping
/// it closes it on a best-effort basis.
pub struct AppendStream<'s> {
    store: &'s BlockStore,
    root: i32,
    /// The inode block currently receiving data-block pointers.
    inode_addr: i32,
    /// The next free pointer slot in `inode_addr`.
    slot: i32,
    /// The data block the buffer belongs to. None when the next byte needs a
    /// fresh block.
    data_addr: Option<i32>,
    buf: Vec<u8>,
    fill: usize,
    size: i64,
    closed: bool,
}

impl<'s> AppendStream<'s> {
    fn open(store: &'s BlockStore, root: i32) -> Result<Self> {
        let root_block = store.get(root)?;
        let flags = lock(&root_block, root)?;
        match Self::open_locked(store, root, flags) {
            Ok(stream) => Ok(stream),
            Err(e) => {
                // Do not leave the inode locked behind a failed open.
                let _ = unlock(store, root);
                Err(e)
            }
        }
    }

    fn open_locked(store: &'s BlockStore, root: i32, flags: InodeFlags) -> Result<Self> {
        let size = store.get(root)?.read_int(SIZE_POS)? as i64;

        // Locate the last inode block through the shortcut, then follow the
        // chain in case the shortcut lags behind.
        let mut last = store.get(root)?.read_int(LAST_POS)?;
        if last == 0 {
            last = root;
        }
        let next_pos = slot_pos(store.block_size() / 4 - 1);
        loop {
            let next = store.get(last)?.read_int(next_pos)?;
            if next == 0 {
                break;
            }
            last = next;
        }

        // Find the first free pointer slot and the trailing data block.
        let bytes = store.get(last)?.read()?;
        let mut slot = FIRST_DATA_SLOT;
        let mut trailing = 0;
        while slot < store.block_size() / 4 - 1 {
            let ptr = read_i32(&bytes, slot_pos(slot) as usize);
            if ptr == 0 {
                break;
            }
            trailing = ptr;
            slot += 1;
        }

        let block_size = store.block_size() as usize;
        let mut stream = Self {
            store,
            root,
            inode_addr: last,
            slot,
            data_addr: None,
            buf: vec![0; block_size],
            fill: 0,
            size,
            closed: false,
        };
        let tail = (size % block_size as i64) as usize;
        if !flags.contains(InodeFlags::TRAILING_FULL) && tail > 0 {
            if trailing == 0 {
                return Err(invalid_state!(
                    "inode {root} has {size} bytes but no trailing data block"
                ));
            }
            let data = store.get(trailing)?.read()?;
            stream.buf.copy_from_slice(&data);
            stream.fill = tail;
            stream.data_addr = Some(trailing);
        }
        Ok(stream)
    }

    /// Appends a single byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        if self.size >= i32::MAX as i64 {
            return Err(invalid_state!("inode {} reached the size limit", self.root));
        }
        if self.data_addr.is_none() {
            self.next_data_block()?;
        }
        self.buf[self.fill] = byte;
        self.fill += 1;
        self.size += 1;
        if self.fill == self.buf.len() {
            self.write_out()?;
            self.data_addr = None;
            self.fill = 0;
        }
        Ok(())
    }

    /// Allocates the next data block and records it in the pointer chain,
    /// growing the chain with a fresh inode block when the current one is
    /// out of pointer slots.
    fn next_data_block(&mut self) -> Result<()> {
        let next_slot = self.store.block_size() / 4 - 1;
        if self.slot >= next_slot {
            let overflow = self.store.allocate()?;
            overflow.clear()?;
            self.store
                .get(self.inode_addr)?
                .write_int(slot_pos(next_slot), overflow.address())?;
            self.store
                .get(self.root)?
                .write_int(LAST_POS, overflow.address())?;
            self.inode_addr = overflow.address();
            self.slot = FIRST_DATA_SLOT;
        }
        let data = self.store.allocate()?;
        self.store
            .get(self.inode_addr)?
            .write_int(slot_pos(self.slot), data.address())?;
        self.slot += 1;
        self.data_addr = Some(data.address());
        Ok(())
    }

    /// Writes the buffered bytes of the current data block out.
    fn write_out(&mut self) -> Result<()> {
        if let Some(addr) = self.data_addr {
            self.store.get(addr)?.write(&self.buf[..self.fill])?;
        }
        Ok(())
    }

    /// Writes the trailing data block and the size field out.
    fn flush_impl(&mut self) -> Result<()> {
        self.write_out()?;
        self.store
            .get(self.root)?
            .write_int(SIZE_POS, self.size as i32)
    }

    fn close_impl(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_impl()?;
        let root = self.store.get(self.root)?;
        let mut flags = InodeFlags::from_bits_truncate(root.read_int(FLAGS_POS)?);
        let block_size = self.store.block_size() as i64;
        flags.set(
            InodeFlags::TRAILING_FULL,
            self.size > 0 && self.size % block_size == 0,
        );
        flags.remove(InodeFlags::LOCKED);
        root.write_int(FLAGS_POS, flags.bits())?;
        self.closed = true;
        Ok(())
    }

    /// Flushes pending bytes, settles the flags and unlocks the inode.
    pub fn close(mut self) -> Result<()> {
        self.close_impl()
    }
}

impl io::Write for AppendStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for byte in buf {
            self.write_byte(*byte)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_impl()?;
        Ok(())
    }
}

impl Drop for AppendStream<'_> {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

/// A stream reading an inode from the beginning.
///
/// The stream walks inode blocks in chain order, data-block slots in order
/// and bytes in order, and yields exactly `size` bytes.
pub struct ReadStream<'s> {
    store: &'s BlockStore,
    root: i32,
    inode_addr: i32,
    slot: i32,
    buf: Vec<u8>,
    buf_pos: usize,
    buf_len: usize,
    remaining: i64,
    closed: bool,
}

impl<'s> ReadStream<'s> {
    fn open(store: &'s BlockStore, root: i32) -> Result<Self> {
        let root_block = store.get(root)?;
        let size = root_block.read_int(SIZE_POS)? as i64;
        lock(&root_block, root)?;
        Ok(Self {
            store,
            root,
            inode_addr: root,
            slot: FIRST_DATA_SLOT,
            buf: Vec::new(),
            buf_pos: 0,
            buf_len: 0,
            remaining: size,
            closed: false,
        })
    }

    /// Reads the next byte, or returns None at the end of the file.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.buf_pos == self.buf_len {
            self.load_next_block()?;
        }
        let byte = self.buf[self.buf_pos];
        self.buf_pos += 1;
        self.remaining -= 1;
        Ok(Some(byte))
    }

    /// Loads the next data block of the chain into the buffer.
    fn load_next_block(&mut self) -> Result<()> {
        let next_slot = self.store.block_size() / 4 - 1;
        if self.slot >= next_slot {
            let next = self
                .store
                .get(self.inode_addr)?
                .read_int(slot_pos(next_slot))?;
            if next == 0 {
                return Err(invalid_state!(
                    "inode {} chain ends {} bytes short",
                    self.root,
                    self.remaining
                ));
            }
            self.inode_addr = next;
            self.slot = FIRST_DATA_SLOT;
        }
        let ptr = self
            .store
            .get(self.inode_addr)?
            .read_int(slot_pos(self.slot))?;
        if ptr == 0 {
            return Err(invalid_state!(
                "inode {} is missing a data block, {} bytes short",
                self.root,
                self.remaining
            ));
        }
        self.slot += 1;
        self.buf = self.store.get(ptr)?.read()?;
        self.buf_pos = 0;
        self.buf_len = self.buf.len().min(self.remaining as usize);
        Ok(())
    }

    fn close_impl(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        unlock(self.store, self.root)?;
        self.closed = true;
        Ok(())
    }

    /// Unlocks the inode.
    pub fn close(mut self) -> Result<()> {
        self.close_impl()
    }
}

impl io::Read for ReadStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut count = 0;
        while count < buf.len() {
            match self.read_byte()? {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Drop for ReadStream<'_> {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::store::StoreOptions;
    use std::io::Read;
    use std::io::Write;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> BlockStore {
        let _ = env_logger::builder().is_test(true).try_init();
        let options = StoreOptions {
            block_size: 64,
            max_blocks: 64 * 1024,
            ..Default::default()
        };
        BlockStore::open(dir.path().join("container"), &options).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn write_all(inode: &Inode<'_>, bytes: &[u8]) {
        let mut stream = inode.append_stream().unwrap();
        stream.write_all(bytes).unwrap();
        stream.close().unwrap();
    }

    fn read_all(inode: &Inode<'_>) -> Vec<u8> {
        let mut stream = inode.read_stream().unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();
        stream.close().unwrap();
        bytes
    }

    #[test]
    fn empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        assert_eq!(inode.size().unwrap(), 0);
        assert!(read_all(&inode).is_empty());
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        // Spans several overflow inode blocks: each inode block carries 12
        // data pointers, 768 bytes at block size 64.
        let data = pattern(4000);
        write_all(&inode, &data);
        assert_eq!(inode.size().unwrap(), 4000);
        assert_eq!(read_all(&inode), data);
    }

    #[test]
    fn round_trip_exact_block_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        let data = pattern(64 * 3);
        write_all(&inode, &data);
        assert_eq!(inode.size().unwrap(), 192);
        assert_eq!(read_all(&inode), data);
    }

    #[test]
    fn append_to_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        let first = pattern(100);
        let second: Vec<u8> = (0..200).map(|i| (255 - i % 256) as u8).collect();
        write_all(&inode, &first);
        write_all(&inode, &second);
        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(inode.size().unwrap(), 300);
        assert_eq!(read_all(&inode), expected);
    }

    #[test]
    fn append_after_exact_block_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        write_all(&inode, &pattern(64));
        write_all(&inode, &[0xff]);
        let mut expected = pattern(64);
        expected.push(0xff);
        assert_eq!(read_all(&inode), expected);
    }

    #[test]
    fn short_write_fills_block_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        write_all(&inode, &[1, 2, 3, 4]);
        assert_eq!(inode.size().unwrap(), 4);
        // The raw data block is reachable through the first pointer slot of
        // the root.
        let data_addr = store.get(inode.address()).unwrap().read_int(12).unwrap();
        assert_ne!(data_addr, 0);
        let raw = store.get(data_addr).unwrap().read().unwrap();
        assert_eq!(raw.len(), 64);
        assert_eq!(&raw[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn lock_exclusivity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        let stream = inode.append_stream().unwrap();
        assert!(matches!(
            inode.append_stream(),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(inode.read_stream(), Err(Error::InvalidState(_))));
        stream.close().unwrap();
        inode.read_stream().unwrap().close().unwrap();
    }

    #[test]
    fn clear_frees_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        write_all(&inode, &pattern(4000));
        inode.clear().unwrap();
        assert_eq!(inode.size().unwrap(), 0);
        // Only the root block remains allocated (meta blocks aside).
        let groups = store.total_blocks() / 64;
        let allocated = store.total_blocks() - store.free_blocks() - groups;
        assert!(allocated <= 6, "{allocated} blocks still allocated");
        assert!(read_all(&inode).is_empty());
        // The inode is usable again after a clear.
        write_all(&inode, &pattern(10));
        assert_eq!(read_all(&inode), pattern(10));
    }

    #[test]
    fn delete_frees_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        // Allocate something first so that a group exists and the baseline
        // is stable.
        store.allocate().unwrap();
        let free_at_start = store.free_blocks();
        let inode = Inode::create(&store).unwrap();
        write_all(&inode, &pattern(2000));
        let addr = inode.address();
        inode.delete().unwrap();
        assert_eq!(store.free_blocks(), free_at_start);
        assert!(matches!(store.get(addr), Err(Error::InvalidState(_))));
    }

    #[test]
    fn clear_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        let stream = inode.append_stream().unwrap();
        assert!(matches!(inode.clear(), Err(Error::InvalidState(_))));
        stream.close().unwrap();
        inode.clear().unwrap();
    }

    #[test]
    fn drop_unlocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let inode = Inode::create(&store).unwrap();
        {
            let mut stream = inode.append_stream().unwrap();
            stream.write_all(b"abc").unwrap();
        }
        assert_eq!(inode.size().unwrap(), 3);
        assert_eq!(read_all(&inode), b"abc");
    }

    #[test]
    fn survives_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        // Interleave two files, delete one, compact, and check the other.
        let keep = Inode::create(&store).unwrap();
        let drop_ = Inode::create(&store).unwrap();
        write_all(&keep, &pattern(1000));
        write_all(&drop_, &pattern(3000));
        drop_.delete().unwrap();
        store.compact().unwrap();
        assert_eq!(read_all(&keep), pattern(1000));
    }
}
