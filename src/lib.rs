//! Single-file virtual filesystem.
//!
//! An entire hierarchical filesystem lives inside one host-OS file, accessed
//! via random I/O. The container is divided into several substructures:
//! - Block: the fixed-size unit of allocation, identified by a logical
//!   address that stays stable for the lifetime of the block;
//! - Block group: a run of blocks headed by a meta block holding the
//!   allocation bits of the group;
//! - Inode: a chain of blocks representing one regular file, written through
//!   an append stream and read back through a sequential stream;
//! - Directory: a block mapping names to target blocks, laid out either as a
//!   single entry list or as a hash-indexed table.
//!
//! The [`store::BlockStore`] maps logical to physical addresses through a
//! header table at the head of the file, which allows
//! [`store::BlockStore::compact`] to pack live blocks toward the head and
//! truncate the file without breaking any stored address. The root directory
//! of a container conventionally lives at logical address
//! [`dir::ROOT_DIRECTORY_ADDRESS`].
//!
//! The container is owned by the thread that opened it and performs no
//! locking, no journaling and no fsync of its own.

pub mod dir;
pub mod error;
pub mod inode;
pub mod store;
pub mod util;

pub use dir::DirEntry;
pub use dir::Directory;
pub use dir::EntryFlags;
pub use dir::ROOT_DIRECTORY_ADDRESS;
pub use error::Error;
pub use error::Result;
pub use inode::AppendStream;
pub use inode::Inode;
pub use inode::ReadStream;
pub use store::AccessMode;
pub use store::Block;
pub use store::BlockStore;
pub use store::StoreOptions;

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use std::io::Write;

    /// Builds a small filesystem, reopens it and walks it back.
    #[test]
    fn end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fs.sfvfs");
        let options = StoreOptions {
            block_size: 256,
            max_blocks: 64 * 1024,
            ..Default::default()
        };

        {
            let store = BlockStore::open(&path, &options).unwrap();
            // The first allocation lands at the conventional root address.
            let root_block = store.allocate().unwrap();
            assert_eq!(root_block.address(), ROOT_DIRECTORY_ADDRESS);
            let root = Directory::new(&store, ROOT_DIRECTORY_ADDRESS, 30, 256).unwrap();
            root.create().unwrap();

            let sub_block = store.allocate().unwrap().address();
            let sub = Directory::new(&store, sub_block, 30, 256).unwrap();
            sub.create().unwrap();
            root.add("etc", sub_block, EntryFlags::DIRECTORY).unwrap();

            let file = Inode::create(&store).unwrap();
            let mut stream = file.append_stream().unwrap();
            stream.write_all(b"hosts go here\n").unwrap();
            stream.close().unwrap();
            sub.add("hosts", file.address(), EntryFlags::empty()).unwrap();
            store.close().unwrap();
        }

        let store = BlockStore::open(&path, &options).unwrap();
        let root = Directory::new(&store, ROOT_DIRECTORY_ADDRESS, 30, 256).unwrap();
        let etc = root.find("etc").unwrap().unwrap();
        assert!(etc.flags.contains(EntryFlags::DIRECTORY));

        let sub = Directory::new(&store, etc.address, 30, 256).unwrap();
        let hosts = sub.find("hosts").unwrap().unwrap();
        assert!(!hosts.flags.contains(EntryFlags::DIRECTORY));

        let file = Inode::new(&store, hosts.address);
        assert_eq!(file.size().unwrap(), 14);
        let mut content = String::new();
        file.read_stream()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hosts go here\n");

        // Tear the tree down and compact the container away.
        sub.remove("hosts").unwrap();
        file.delete().unwrap();
        sub.delete().unwrap();
        root.remove("etc").unwrap();
        root.delete().unwrap();
        store.compact().unwrap();
        assert_eq!(store.total_blocks(), 0);
    }
}
