mod error;
mod flash;
mod flash_dev;
pub mod mbfs;
pub mod registry;
pub mod tinyfs;
mod vfs;

extern crate log;

/// Physical flash page size: the smallest erasable unit
pub const PAGE_SIZE: usize = 1024;
/// Flash is burned one 32-bit word at a time
pub const WORD_SIZE: usize = 4;
/// Value of every byte of a freshly erased page
pub const ERASED_BYTE: u8 = 0xFF;

/// open() flags
pub const MB_READ: u32 = 0x01;
pub const MB_WRITE: u32 = 0x02;
pub const MB_CREAT: u32 = 0x04;
/// MBFS only: start with the cursor at the end of the file
pub const MB_APPEND: u32 = 0x08;

/// seek() flags
pub const MB_SEEK_SET: u8 = 0x01;
pub const MB_SEEK_END: u8 = 0x02;
pub const MB_SEEK_CUR: u8 = 0x04;

// ---- TinyFS (MBR table) ----

/// Maximum filename length, including the null terminator
pub const FILENAME_LEN: usize = 14;
/// Maximum number of simultaneously open TinyFS descriptors
pub const MAX_FD: usize = 3;
/// Flash pages claimed by TinyFS: one MBR page followed by the data blocks
pub const TINYFS_PAGES: usize = 40;
/// Number of one-page data blocks. Block numbers live in a `u8` whose top bit
/// is the free marker, so this can be no greater than 127.
pub const DATA_BLOCK_COUNT: usize = TINYFS_PAGES - 1;
/// Records in the MBR page, including the free-block list in slot 0
pub const NO_MBR_ENTRIES: usize = 10;
/// Magic word at the start of the MBR page
pub const MAGIC_WORD: u32 = 0xA3E8_F1C7;

// ---- MBFS (file table + directories) ----

/// Logical block size. Must divide `PAGE_SIZE`.
pub const MBFS_BLOCK_SIZE: usize = 256;
/// Per-descriptor write-back cache, in bytes. Should be <= `MBFS_BLOCK_SIZE`.
pub const MBFS_CACHE_SIZE: usize = 32;
/// Size of `DirectoryEntry::file_name`, including the null terminator
pub const MBFS_FILENAME_LENGTH: usize = 16;
/// Signature stored as the name of the root directory entry
pub const MBFS_MAGIC: &str = "MICROBIT_FS_1_0";

const _: () = assert!(PAGE_SIZE % WORD_SIZE == 0);
const _: () = assert!(DATA_BLOCK_COUNT <= 127);
const _: () = assert!(NO_MBR_ENTRIES >= 2);
const _: () = assert!(NO_MBR_ENTRIES * tinyfs::MBR_SIZE <= PAGE_SIZE);
const _: () = assert!(PAGE_SIZE % MBFS_BLOCK_SIZE == 0);
const _: () = assert!(MBFS_CACHE_SIZE <= MBFS_BLOCK_SIZE);
const _: () = assert!(MBFS_MAGIC.len() < MBFS_FILENAME_LENGTH);

pub use error::{FlashError, FsError, FsResult};
pub use flash::{need_erase, Flash, Source};
pub use flash_dev::FlashDevice;
pub use mbfs::{File, Mbfs};
pub use tinyfs::TinyFs;
pub use vfs::{read_file, write_file, FileStorage, Whence};
