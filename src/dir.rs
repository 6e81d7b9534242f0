//! A directory maps names to block addresses.
//!
//! The root directory block holds a flags word in slot 0 and entity-list head
//! pointers in slots 1 to N-1. An entity list is a chain of blocks, each with
//! an entry count (meaningful in the head only), a next pointer and packed
//! entries `target:4B, flags:1B, nameLen:1B, name`, each followed by one
//! unused separator byte. A zero target terminates the entries of a block.
//!
//! A directory starts in the plain layout, with all entries on the single
//! chain headed at slot 1. Once it grows past the configured threshold it is
//! promoted, once and forever, to the indexed layout where entries are
//! distributed over the N-1 head slots by a hash of their name.

use crate::error::invalid_arg;
use crate::error::invalid_state;
use crate::error::Result;
use crate::store::BlockStore;
use crate::util::read_i32;
use crate::util::write_i32;
use bitflags::bitflags;
use sha2::Digest;
use sha2::Sha256;
use std::collections::BTreeMap;

/// The logical address of the root directory of a container.
pub const ROOT_DIRECTORY_ADDRESS: i32 = 1;

/// Default bound on the length of an entry name.
pub const DEFAULT_MAX_NAME_LEN: usize = 64;
/// Default number of entries at which a plain directory becomes indexed.
pub const DEFAULT_INDEX_THRESHOLD: i64 = 256;

/// Byte position of the flags slot in the root block.
const FLAGS_POS: i32 = 0;
/// Byte position of the entry count in a list block.
const LIST_SIZE_POS: usize = 0;
/// Byte position of the next pointer in a list block.
const LIST_NEXT_POS: usize = 4;
/// Byte offset of the first entry in a list block.
const ENTRIES_POS: usize = 8;
/// Bytes of an entry before the name.
const ENTRY_PREFIX_LEN: usize = 6;

bitflags! {
    /// Flags word of a directory root block.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct DirFlags: i32 {
        /// Entries are distributed over hash buckets.
        const INDEXED = 0b1;
    }
}

bitflags! {
    /// Flags byte of a directory entry.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct EntryFlags: u8 {
        /// The entry points at a directory.
        const DIRECTORY = 0b1;
    }
}

/// One directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// The entry's name.
    pub name: String,
    /// The logical address of the target block.
    pub address: i32,
    /// The entry's flags.
    pub flags: EntryFlags,
}

/// The decoded layout of a directory root block.
enum Layout {
    Plain { head: i32 },
    Indexed,
}

/// A located entry, with enough context to rewrite its block.
struct EntryLoc {
    /// The list block holding the entry.
    block: i32,
    /// Byte offset of the entry within the block.
    offset: usize,
    /// The block preceding `block` in the chain, or zero for the head.
    prev: i32,
    entry: DirEntry,
}

/// A handle to a directory rooted at a logical block address.
///
/// Like [`crate::inode::Inode`], the handle resolves its logical address on
/// every access and therefore stays valid across compactions.
#[derive(Clone)]
pub struct Directory<'s> {
    store: &'s BlockStore,
    addr: i32,
    max_name_len: usize,
    index_threshold: i64,
}

impl<'s> Directory<'s> {
    /// Returns a handle to the directory rooted at `addr`.
    ///
    /// `max_name_len` bounds entry names and must fit twice into a block;
    /// `index_threshold` is the entry count at which a plain directory is
    /// promoted to the indexed layout.
    pub fn new(
        store: &'s BlockStore,
        addr: i32,
        max_name_len: usize,
        index_threshold: i64,
    ) -> Result<Self> {
        if max_name_len == 0 || max_name_len > u8::MAX as usize {
            return Err(invalid_arg!(
                "max name length {max_name_len} does not fit an entry"
            ));
        }
        if max_name_len * 2 > store.block_size() as usize {
            return Err(invalid_arg!(
                "max name length {max_name_len} exceeds half the block size"
            ));
        }
        if index_threshold < 1 {
            return Err(invalid_arg!("index threshold must be positive"));
        }
        Ok(Self {
            store,
            addr,
            max_name_len,
            index_threshold,
        })
    }

    /// Returns the logical address of the root block.
    pub fn root_address(&self) -> i32 {
        self.addr
    }

    /// Initialises an empty directory in the plain layout over the root
    /// block.
    pub fn create(&self) -> Result<()> {
        let root = self.store.get(self.addr)?;
        root.clear()?;
        let head = self.new_list_block()?;
        root.write_int(4, head)?;
        Ok(())
    }

    /// Looks a name up.
    pub fn find(&self, name: &str) -> Result<Option<DirEntry>> {
        let head = match self.layout()? {
            Layout::Plain { head } => head,
            Layout::Indexed => self.bucket_head(name)?,
        };
        if head == 0 {
            return Ok(None);
        }
        Ok(self.scan_list(head, name)?.map(|loc| loc.entry))
    }

    /// Adds an entry.
    ///
    /// The name must be non-empty, at most `max_name_len` bytes, made of
    /// letters, digits and `${}-_.`, and not present yet.
    pub fn add(&self, name: &str, address: i32, flags: EntryFlags) -> Result<()> {
        self.check_name(name)?;
        if address <= 0 {
            return Err(invalid_arg!("invalid target address {address}"));
        }
        match self.layout()? {
            Layout::Plain { head } => {
                if self.scan_list(head, name)?.is_some() {
                    return Err(invalid_state!("an entry named {name} already exists"));
                }
                self.append_entry(head, name, address, flags)?;
                if self.list_size(head)? >= self.index_threshold {
                    self.promote(head)?;
                }
            }
            Layout::Indexed => {
                let slot = self.bucket_slot(name);
                let root = self.store.get(self.addr)?;
                let mut head = root.read_int(slot * 4)?;
                if head != 0 && self.scan_list(head, name)?.is_some() {
                    return Err(invalid_state!("an entry named {name} already exists"));
                }
                if head == 0 {
                    head = self.new_list_block()?;
                    root.write_int(slot * 4, head)?;
                }
                self.append_entry(head, name, address, flags)?;
            }
        }
        Ok(())
    }

    /// Removes the entry with the given name.
    pub fn remove(&self, name: &str) -> Result<()> {
        let (head, bucket_slot) = match self.layout()? {
            Layout::Plain { head } => (head, None),
            Layout::Indexed => {
                let slot = self.bucket_slot(name);
                let head = self.store.get(self.addr)?.read_int(slot * 4)?;
                (head, Some(slot))
            }
        };
        if head == 0 {
            return Err(invalid_state!("no entry named {name}"));
        }
        let Some(loc) = self.scan_list(head, name)? else {
            return Err(invalid_state!("no entry named {name}"));
        };

        // Rewrite the enclosing block without the entry.
        let block = self.store.get(loc.block)?;
        let bytes = block.read()?;
        let mut rewritten = vec![0u8; bytes.len()];
        rewritten[..ENTRIES_POS].copy_from_slice(&bytes[..ENTRIES_POS]);
        let mut remaining = 0usize;
        let mut read_off = ENTRIES_POS;
        let mut write_off = ENTRIES_POS;
        while let Some((entry, next_off)) = parse_entry(&bytes, read_off)? {
            if read_off != loc.offset {
                write_off = append_entry_bytes(&mut rewritten, write_off, &entry);
                remaining += 1;
            }
            read_off = next_off;
        }
        block.write(&rewritten)?;

        // Account the removal in the chain's head.
        let head_block = self.store.get(head)?;
        let chain_size = head_block.read_int(LIST_SIZE_POS as i32)? - 1;
        head_block.write_int(LIST_SIZE_POS as i32, chain_size)?;

        // An emptied block is unlinked unless it heads the chain.
        if remaining == 0 && loc.block != head {
            let next = read_i32(&bytes, LIST_NEXT_POS);
            self.store
                .get(loc.prev)?
                .write_int(LIST_NEXT_POS as i32, next)?;
            self.store.deallocate(loc.block)?;
        }
        // An emptied bucket gives its head block back.
        if let Some(slot) = bucket_slot {
            if chain_size == 0 {
                self.store.get(self.addr)?.write_int(slot * 4, 0)?;
                self.store.deallocate(head)?;
            }
        }
        Ok(())
    }

    /// Returns the number of entries in the directory.
    pub fn size(&self) -> Result<i64> {
        match self.layout()? {
            Layout::Plain { head } => self.list_size(head),
            Layout::Indexed => {
                let bytes = self.store.get(self.addr)?.read()?;
                let mut total = 0;
                for slot in 1..self.store.block_size() as usize / 4 {
                    let head = read_i32(&bytes, slot * 4);
                    if head != 0 {
                        total += self.list_size(head)?;
                    }
                }
                Ok(total)
            }
        }
    }

    /// Returns an iterator over all entries, bucket chains concatenated.
    pub fn list(&self) -> Result<ListIter<'s>> {
        let heads = match self.layout()? {
            Layout::Plain { head } => [head].into_iter().filter(|h| *h != 0).collect(),
            Layout::Indexed => {
                let bytes = self.store.get(self.addr)?.read()?;
                (1..self.store.block_size() as usize / 4)
                    .map(|slot| read_i32(&bytes, slot * 4))
                    .filter(|head| *head != 0)
                    .collect()
            }
        };
        Ok(ListIter {
            store: self.store,
            heads,
            head_idx: 0,
            chain: 0,
            block: None,
            offset: 0,
            done: false,
        })
    }

    /// Deletes the directory. It must be empty.
    pub fn delete(self) -> Result<()> {
        if self.size()? != 0 {
            return Err(invalid_state!(
                "directory {} is not empty",
                self.addr
            ));
        }
        let heads = match self.layout()? {
            Layout::Plain { head } => vec![head],
            Layout::Indexed => {
                let bytes = self.store.get(self.addr)?.read()?;
                (1..self.store.block_size() as usize / 4)
                    .map(|slot| read_i32(&bytes, slot * 4))
                    .filter(|head| *head != 0)
                    .collect()
            }
        };
        for head in heads {
            self.free_chain(head)?;
        }
        self.store.deallocate(self.addr)
    }

    /// Decodes the layout from the root flags word.
    fn layout(&self) -> Result<Layout> {
        let root = self.store.get(self.addr)?;
        let flags = DirFlags::from_bits_truncate(root.read_int(FLAGS_POS)?);
        if flags.contains(DirFlags::INDEXED) {
            Ok(Layout::Indexed)
        } else {
            Ok(Layout::Plain {
                head: root.read_int(4)?,
            })
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(invalid_arg!("empty entry name"));
        }
        if name.len() > self.max_name_len {
            return Err(invalid_arg!(
                "entry name exceeds {} bytes",
                self.max_name_len
            ));
        }
        let valid = name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'$' | b'{' | b'}' | b'-' | b'_' | b'.'));
        if !valid {
            return Err(invalid_arg!("entry name {name:?} contains invalid characters"));
        }
        Ok(())
    }

    /// The number of hash buckets of the indexed layout.
    fn bucket_count(&self) -> u32 {
        (self.store.block_size() / 4 - 1) as u32
    }

    /// Returns the root slot index of the bucket for `name`.
    ///
    /// The bucket is derived from the first four bytes of the SHA-256 digest
    /// of the name, read big-endian. This mapping is part of the on-disk
    /// format.
    fn bucket_slot(&self, name: &str) -> i32 {
        let digest = Sha256::digest(name.as_bytes());
        let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (hash % self.bucket_count()) as i32 + 1
    }

    /// Reads the head pointer of the bucket for `name`.
    fn bucket_head(&self, name: &str) -> Result<i32> {
        let slot = self.bucket_slot(name);
        self.store.get(self.addr)?.read_int(slot * 4)
    }

    /// Allocates a zeroed entity-list block.
    fn new_list_block(&self) -> Result<i32> {
        let block = self.store.allocate()?;
        block.clear()?;
        Ok(block.address())
    }

    /// Returns the entry count of the chain headed at `head`.
    fn list_size(&self, head: i32) -> Result<i64> {
        if head == 0 {
            return Ok(0);
        }
        Ok(self.store.get(head)?.read_int(LIST_SIZE_POS as i32)? as i64)
    }

    /// Scans the chain headed at `head` for `name`.
    fn scan_list(&self, head: i32, name: &str) -> Result<Option<EntryLoc>> {
        let mut prev = 0;
        let mut cur = head;
        while cur != 0 {
            let bytes = self.store.get(cur)?.read()?;
            let mut off = ENTRIES_POS;
            while let Some((entry, next_off)) = parse_entry(&bytes, off)? {
                if entry.name == name {
                    return Ok(Some(EntryLoc {
                        block: cur,
                        offset: off,
                        prev,
                        entry,
                    }));
                }
                off = next_off;
            }
            prev = cur;
            cur = read_i32(&bytes, LIST_NEXT_POS);
        }
        Ok(None)
    }

    /// Appends an entry at the tail of the chain headed at `head` and bumps
    /// the chain's entry count.
    fn append_entry(&self, head: i32, name: &str, address: i32, flags: EntryFlags) -> Result<()> {
        let block_size = self.store.block_size() as usize;
        let entry_len = ENTRY_PREFIX_LEN + name.len() + 1;
        let mut cur = head;
        loop {
            let block = self.store.get(cur)?;
            let mut bytes = block.read()?;
            let mut off = ENTRIES_POS;
            while let Some((_, next_off)) = parse_entry(&bytes, off)? {
                off = next_off;
            }
            if off + entry_len < block_size {
                let entry = DirEntry {
                    name: name.to_owned(),
                    address,
                    flags,
                };
                append_entry_bytes(&mut bytes, off, &entry);
                block.write(&bytes)?;
                break;
            }
            let next = read_i32(&bytes, LIST_NEXT_POS);
            if next != 0 {
                cur = next;
                continue;
            }
            let fresh = self.new_list_block()?;
            block.write_int(LIST_NEXT_POS as i32, fresh)?;
            cur = fresh;
        }
        let head_block = self.store.get(head)?;
        let size = head_block.read_int(LIST_SIZE_POS as i32)?;
        head_block.write_int(LIST_SIZE_POS as i32, size + 1)
    }

    /// Converts the directory to the indexed layout, redistributing every
    /// entry of the plain chain into its bucket. Not reversible.
    fn promote(&self, head: i32) -> Result<()> {
        // Read the whole chain into memory.
        let mut entries = Vec::new();
        let mut cur = head;
        while cur != 0 {
            let bytes = self.store.get(cur)?.read()?;
            let mut off = ENTRIES_POS;
            while let Some((entry, next_off)) = parse_entry(&bytes, off)? {
                entries.push(entry);
                off = next_off;
            }
            cur = read_i32(&bytes, LIST_NEXT_POS);
        }
        // Route every entry into a fresh chain for its bucket.
        let mut buckets: BTreeMap<i32, i32> = BTreeMap::new();
        for entry in &entries {
            let slot = self.bucket_slot(&entry.name);
            let bucket_head = match buckets.get(&slot) {
                Some(head) => *head,
                None => {
                    let fresh = self.new_list_block()?;
                    buckets.insert(slot, fresh);
                    fresh
                }
            };
            self.append_entry(bucket_head, &entry.name, entry.address, entry.flags)?;
        }
        // Give the plain chain back.
        self.free_chain(head)?;
        // Rewrite the root with the bucket heads.
        let root = self.store.get(self.addr)?;
        root.clear()?;
        root.write_int(FLAGS_POS, DirFlags::INDEXED.bits())?;
        for (slot, bucket_head) in &buckets {
            root.write_int(slot * 4, *bucket_head)?;
        }
        log::debug!(
            "directory {} promoted to the indexed layout with {} entries in {} buckets",
            self.addr,
            entries.len(),
            buckets.len(),
        );
        Ok(())
    }

    /// Deallocates every block of the chain headed at `head`.
    fn free_chain(&self, head: i32) -> Result<()> {
        let mut cur = head;
        while cur != 0 {
            let next = self.store.get(cur)?.read_int(LIST_NEXT_POS as i32)?;
            self.store.deallocate(cur)?;
            cur = next;
        }
        Ok(())
    }
}

/// Parses the entry at `off`, returning it along with the offset of the next
/// entry. Returns None at the end of the block's entries.
fn parse_entry(bytes: &[u8], off: usize) -> Result<Option<(DirEntry, usize)>> {
    if off + 4 > bytes.len() {
        return Ok(None);
    }
    let address = read_i32(bytes, off);
    if address == 0 {
        return Ok(None);
    }
    if off + ENTRY_PREFIX_LEN > bytes.len() {
        return Err(invalid_state!("truncated directory entry at offset {off}"));
    }
    let flags = EntryFlags::from_bits_truncate(bytes[off + 4]);
    let name_len = bytes[off + 5] as usize;
    let name_end = off + ENTRY_PREFIX_LEN + name_len;
    if name_end > bytes.len() {
        return Err(invalid_state!("truncated directory entry at offset {off}"));
    }
    let name = String::from_utf8_lossy(&bytes[off + ENTRY_PREFIX_LEN..name_end]).into_owned();
    let entry = DirEntry {
        name,
        address,
        flags,
    };
    // One separator byte after every entry.
    Ok(Some((entry, name_end + 1)))
}

/// Writes an entry at `off` and returns the offset right after its separator
/// byte. The caller guarantees the entry fits.
fn append_entry_bytes(bytes: &mut [u8], off: usize, entry: &DirEntry) -> usize {
    write_i32(bytes, off, entry.address);
    bytes[off + 4] = entry.flags.bits();
    bytes[off + 5] = entry.name.len() as u8;
    let name_end = off + ENTRY_PREFIX_LEN + entry.name.len();
    bytes[off + ENTRY_PREFIX_LEN..name_end].copy_from_slice(entry.name.as_bytes());
    name_end + 1
}

/// A lazy iterator over the entries of a directory.
///
/// Bucket chains are visited in slot order, blocks in chain order and entries
/// in block order. Each step loads at most one more block. The iterator is
/// finite and not restartable.
pub struct ListIter<'s> {
    store: &'s BlockStore,
    heads: Vec<i32>,
    head_idx: usize,
    /// The next block of the current chain, or zero.
    chain: i32,
    /// The current block's bytes, with the scan offset.
    block: Option<Vec<u8>>,
    offset: usize,
    done: bool,
}

impl Iterator for ListIter<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(bytes) = &self.block {
                match parse_entry(bytes, self.offset) {
                    Ok(Some((entry, next_off))) => {
                        self.offset = next_off;
                        return Some(Ok(entry));
                    }
                    Ok(None) => {
                        self.block = None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            // Load the next block of the current chain, or move to the next
            // chain.
            if self.chain == 0 {
                if self.head_idx >= self.heads.len() {
                    self.done = true;
                    return None;
                }
                self.chain = self.heads[self.head_idx];
                self.head_idx += 1;
            }
            let bytes = match self.store.get(self.chain).and_then(|b| b.read()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            self.chain = read_i32(&bytes, LIST_NEXT_POS);
            self.offset = ENTRIES_POS;
            self.block = Some(bytes);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::store::StoreOptions;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, block_size: i32) -> BlockStore {
        let _ = env_logger::builder().is_test(true).try_init();
        let options = StoreOptions {
            block_size,
            max_blocks: 256 * 1024,
            ..Default::default()
        };
        BlockStore::open(dir.path().join("container"), &options).unwrap()
    }

    fn new_dir<'s>(
        store: &'s BlockStore,
        max_name_len: usize,
        index_threshold: i64,
    ) -> Directory<'s> {
        let root = store.allocate().unwrap().address();
        let dir = Directory::new(store, root, max_name_len, index_threshold).unwrap();
        dir.create().unwrap();
        dir
    }

    fn is_indexed(store: &BlockStore, dir: &Directory<'_>) -> bool {
        let flags = store
            .get(dir.root_address())
            .unwrap()
            .read_int(0)
            .unwrap();
        flags & 1 != 0
    }

    #[test]
    fn round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        let dir = new_dir(&store, 30, 1000);

        dir.add("hello.txt", 42, EntryFlags::empty()).unwrap();
        dir.add("sub", 43, EntryFlags::DIRECTORY).unwrap();

        let entry = dir.find("hello.txt").unwrap().unwrap();
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.address, 42);
        assert_eq!(entry.flags, EntryFlags::empty());

        let entry = dir.find("sub").unwrap().unwrap();
        assert_eq!(entry.address, 43);
        assert!(entry.flags.contains(EntryFlags::DIRECTORY));

        assert!(dir.find("missing").unwrap().is_none());

        dir.remove("hello.txt").unwrap();
        assert!(dir.find("hello.txt").unwrap().is_none());
        assert_eq!(dir.size().unwrap(), 1);
    }

    #[test]
    fn size_law() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        let dir = new_dir(&store, 30, 1000);
        for i in 0..50 {
            dir.add(&format!("n{i}"), i + 100, EntryFlags::empty())
                .unwrap();
            assert_eq!(dir.size().unwrap(), i as i64 + 1);
        }
        for i in 0..20 {
            dir.remove(&format!("n{i}")).unwrap();
        }
        assert_eq!(dir.size().unwrap(), 30);
    }

    #[test]
    fn name_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        let dir = new_dir(&store, 10, 1000);
        assert!(matches!(
            dir.add("", 5, EntryFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            dir.add("a/b", 5, EntryFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            dir.add("name-too-long", 5, EntryFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            dir.add("ok", 0, EntryFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
        dir.add("${ok}-_.", 5, EntryFlags::empty()).unwrap();
    }

    #[test]
    fn duplicate_add() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        let dir = new_dir(&store, 30, 1000);
        dir.add("twice", 5, EntryFlags::empty()).unwrap();
        assert!(matches!(
            dir.add("twice", 6, EntryFlags::empty()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn remove_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        let dir = new_dir(&store, 30, 1000);
        assert!(matches!(dir.remove("nope"), Err(Error::InvalidState(_))));
    }

    #[test]
    fn list_yields_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        let dir = new_dir(&store, 30, 8);
        let mut names: Vec<String> = (0..30).map(|i| format!("entry{i}")).collect();
        for (i, name) in names.iter().enumerate() {
            dir.add(name, i as i32 + 1, EntryFlags::empty()).unwrap();
        }
        let mut listed: Vec<String> = dir
            .list()
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect();
        listed.sort();
        names.sort();
        assert_eq!(listed, names);
    }

    #[test]
    fn promotion_preserves_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        let dir = new_dir(&store, 30, 10);
        for i in 0..9 {
            dir.add(&format!("file{i}"), i + 1, EntryFlags::empty())
                .unwrap();
        }
        assert!(!is_indexed(&store, &dir));
        // The tenth add crosses the threshold.
        dir.add("file9", 10, EntryFlags::empty()).unwrap();
        assert!(is_indexed(&store, &dir));
        assert_eq!(dir.size().unwrap(), 10);
        for i in 0..10 {
            let entry = dir.find(&format!("file{i}")).unwrap().unwrap();
            assert_eq!(entry.address, i + 1);
        }
        // Adds keep working after the promotion.
        for i in 10..40 {
            dir.add(&format!("file{i}"), i + 1, EntryFlags::empty())
                .unwrap();
        }
        assert_eq!(dir.size().unwrap(), 40);
        for i in 0..40 {
            assert!(dir.find(&format!("file{i}")).unwrap().is_some());
        }
    }

    #[test]
    fn delete_empty_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        let dir = new_dir(&store, 30, 1000);
        dir.add("x", 9, EntryFlags::empty()).unwrap();
        assert!(matches!(
            dir.clone().delete(),
            Err(Error::InvalidState(_))
        ));
        dir.remove("x").unwrap();
        dir.delete().unwrap();
    }

    #[test]
    fn delete_returns_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 256);
        // Stabilise the baseline with one allocation.
        store.allocate().unwrap();
        let free_at_start = store.free_blocks();
        let dir = new_dir(&store, 30, 10);
        for i in 0..200 {
            dir.add(&format!("gone{i}"), i + 1, EntryFlags::empty())
                .unwrap();
        }
        for i in 0..200 {
            dir.remove(&format!("gone{i}")).unwrap();
        }
        assert_eq!(dir.size().unwrap(), 0);
        dir.delete().unwrap();
        assert_eq!(store.free_blocks(), free_at_start);
    }

    #[test]
    fn long_chain_shrinks_on_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 64);
        // Small blocks and a high threshold force a multi-block plain chain.
        let dir = new_dir(&store, 20, 100_000);
        for i in 0..40 {
            dir.add(&format!("longname{i}"), i + 1, EntryFlags::empty())
                .unwrap();
        }
        let free_before = store.free_blocks();
        for i in 0..40 {
            dir.remove(&format!("longname{i}")).unwrap();
        }
        assert_eq!(dir.size().unwrap(), 0);
        // Every list block except the head went back to the store.
        assert!(store.free_blocks() > free_before);
        for i in 0..40 {
            assert!(dir.find(&format!("longname{i}")).unwrap().is_none());
        }
    }

    #[test]
    fn indexed_directory_bulk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp, 1024);
        let dir = new_dir(&store, 30, 10);
        for i in 1..10000 {
            dir.add(&i.to_string(), i, EntryFlags::empty()).unwrap();
        }
        assert_eq!(dir.size().unwrap(), 9999);
        for i in 1..10000 {
            let entry = dir.find(&i.to_string()).unwrap().unwrap();
            assert_eq!(entry.address, i);
        }
        for i in 1..10000 {
            dir.remove(&i.to_string()).unwrap();
        }
        assert_eq!(dir.size().unwrap(), 0);
        for i in 1..10000 {
            assert!(dir.find(&i.to_string()).unwrap().is_none());
        }
    }
}
