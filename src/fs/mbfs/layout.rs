//! MBFS 在闪存上的记录格式.
//!
//! 文件表: 每个逻辑块对应一个 u16, 取值为 [`MBFS_UNUSED`], [`MBFS_EOF`],
//! [`MBFS_DELETED`] 或者链中下一个块的块号.
//!
//! 目录项 ([`DirectoryEntry`], 24 字节, 小端):
//!
//! | 偏移 | 长度 | 字段 |
//! |---|---|---|
//! | 0  | 16 | file_name, 以 0 结尾 |
//! | 16 | 2  | first_block |
//! | 18 | 2  | flags |
//! | 20 | 4  | length |

use core::fmt::{Debug, Formatter, Result};

use super::super::{MBFS_BLOCK_SIZE, MBFS_FILENAME_LENGTH, MBFS_MAGIC};

pub const MBFS_UNUSED: u16 = 0xFFFF;
pub const MBFS_EOF: u16 = 0xEFFF;
pub const MBFS_DELETED: u16 = 0x0000;

/// 文件表中的一项
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableEntry {
    Unused,
    Eof,
    Deleted,
    Next(u16),
}

impl TableEntry {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            MBFS_UNUSED => TableEntry::Unused,
            MBFS_EOF => TableEntry::Eof,
            MBFS_DELETED => TableEntry::Deleted,
            next => TableEntry::Next(next),
        }
    }

    /// 块是否属于某个文件 (或文件表本身)
    pub fn is_live(&self) -> bool {
        matches!(self, TableEntry::Eof | TableEntry::Next(_))
    }
}

/// 目录项 flags 的取值
pub struct DirentFlags;

impl DirentFlags {
    pub const FREE: u16 = 0x8000;
    pub const VALID: u16 = 0x4000;
    pub const DIRECTORY: u16 = 0x2000;
    /// 刚创建, 长度尚未写入
    pub const NEW: u16 = 0xFFFF;
    pub const DELETED: u16 = 0x0000;
}

pub const DIRENT_SIZE: usize = 24;
pub const DIRENTS_PER_BLOCK: u16 = (MBFS_BLOCK_SIZE / DIRENT_SIZE) as u16;
pub const DIRENT_FLAGS_OFFSET: usize = MBFS_FILENAME_LENGTH + 2;
/// NEW 文件的长度字段
pub const LENGTH_UNSET: u32 = 0xFFFF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirentStatus {
    /// 从未使用过的空槽
    Free,
    New,
    Valid,
    Directory,
    Deleted,
}

#[derive(Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    file_name: [u8; MBFS_FILENAME_LENGTH],
    pub first_block: u16,
    pub flags: u16,
    pub length: u32,
}

impl Debug for DirectoryEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("DirectoryEntry")
            .field("name", &self.name())
            .field("first_block", &self.first_block)
            .field("flags", &format_args!("{:#06x}", self.flags))
            .field("length", &self.length)
            .finish()
    }
}

impl DirectoryEntry {
    /// `name` 必须已经通过文件名检查
    pub fn new(name: &str, first_block: u16, flags: u16, length: u32) -> Self {
        let mut file_name = [0u8; MBFS_FILENAME_LENGTH];
        let bytes = name.as_bytes();
        let len = bytes.len().min(MBFS_FILENAME_LENGTH - 1);
        file_name[..len].copy_from_slice(&bytes[..len]);
        Self {
            file_name,
            first_block,
            flags,
            length,
        }
    }

    /// 根目录项: 名字是签名, 长度是文件系统的块数
    pub fn root(root_block: u16, blocks: u16) -> Self {
        Self::new(
            MBFS_MAGIC,
            root_block,
            DirentFlags::VALID | DirentFlags::DIRECTORY,
            blocks as u32,
        )
    }

    pub fn decode(bytes: &[u8; DIRENT_SIZE]) -> Self {
        let mut file_name = [0u8; MBFS_FILENAME_LENGTH];
        file_name.copy_from_slice(&bytes[..MBFS_FILENAME_LENGTH]);
        let at = MBFS_FILENAME_LENGTH;
        Self {
            file_name,
            first_block: u16::from_le_bytes([bytes[at], bytes[at + 1]]),
            flags: u16::from_le_bytes([bytes[at + 2], bytes[at + 3]]),
            length: u32::from_le_bytes([bytes[at + 4], bytes[at + 5], bytes[at + 6], bytes[at + 7]]),
        }
    }

    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut bytes = [0u8; DIRENT_SIZE];
        let at = MBFS_FILENAME_LENGTH;
        bytes[..at].copy_from_slice(&self.file_name);
        bytes[at..at + 2].copy_from_slice(&self.first_block.to_le_bytes());
        bytes[at + 2..at + 4].copy_from_slice(&self.flags.to_le_bytes());
        bytes[at + 4..].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn name(&self) -> &str {
        let len = self
            .file_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(MBFS_FILENAME_LENGTH);
        core::str::from_utf8(&self.file_name[..len]).unwrap_or("")
    }

    pub fn status(&self) -> DirentStatus {
        match self.flags {
            DirentFlags::NEW if self.file_name[0] == 0xFF && self.first_block == MBFS_UNUSED => {
                DirentStatus::Free
            }
            DirentFlags::NEW => DirentStatus::New,
            f if f & DirentFlags::VALID == 0 => DirentStatus::Deleted,
            f if f & DirentFlags::DIRECTORY != 0 => DirentStatus::Directory,
            _ => DirentStatus::Valid,
        }
    }

    /// 目录项是否描述一个现存的文件或目录
    pub fn is_live(&self) -> bool {
        matches!(
            self.status(),
            DirentStatus::New | DirentStatus::Valid | DirentStatus::Directory
        )
    }

    pub fn is_directory(&self) -> bool {
        self.status() == DirentStatus::Directory
    }

    /// 对外可见的长度, NEW 文件为 0
    pub fn stored_length(&self) -> u32 {
        if self.flags == DirentFlags::NEW {
            0
        } else {
            self.length
        }
    }
}
