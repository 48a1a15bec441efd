//! MBR 页: TinyFS 唯一的元数据页.
//!
//! 页中依次存放 `NO_MBR_ENTRIES` 条记录, 每条 [`MBR_SIZE`] 字节:
//!
//! | 偏移 | 长度 | 字段 |
//! |---|---|---|
//! | 0  | 14 | name, 以 0 结尾 |
//! | 14 | 4  | flags: 最高位为 1 表示空闲, 低 31 位为文件长度 |
//! | 18 | 39 | blocks: 按顺序排列的数据块号, 0xFF 表示未使用 |
//!
//! 第 0 条记录是空闲块链表: 它的 name 字段开头是 [`MAGIC_WORD`],
//! blocks 中 `0x80 | n` 表示块 n 空闲, 0x00 表示该槽已被取走.

use log::{debug, info};

use super::super::{
    Flash, FsError, FsResult, DATA_BLOCK_COUNT, FILENAME_LEN, MAGIC_WORD, PAGE_SIZE,
};

pub const MBR_NAME_OFFSET: usize = 0;
pub const MBR_FLAGS_OFFSET: usize = MBR_NAME_OFFSET + FILENAME_LEN;
pub const MBR_BLOCKS_OFFSET: usize = MBR_FLAGS_OFFSET + 4;
/// 一条 MBR 记录的字节数
pub const MBR_SIZE: usize = MBR_BLOCKS_OFFSET + DATA_BLOCK_COUNT;

/// flags 最高位: 记录空闲
pub const MBR_FREE: u32 = 0x8000_0000;
pub const MBR_SIZE_MASK: u32 = !MBR_FREE;

/// 空闲链表槽位的取值
pub const FREE_SLOT_MARK: u8 = 0x80;
pub const POPPED_SLOT: u8 = 0x00;
pub const EMPTY_SLOT: u8 = 0xFF;

/// 一条 MBR 记录在内存中的副本
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mbr {
    pub name: [u8; FILENAME_LEN],
    pub flags: u32,
    pub blocks: [u8; DATA_BLOCK_COUNT],
}

impl Mbr {
    pub fn decode(bytes: &[u8; MBR_SIZE]) -> Self {
        let mut name = [0u8; FILENAME_LEN];
        name.copy_from_slice(&bytes[MBR_NAME_OFFSET..MBR_FLAGS_OFFSET]);
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&bytes[MBR_FLAGS_OFFSET..MBR_BLOCKS_OFFSET]);
        let mut blocks = [0u8; DATA_BLOCK_COUNT];
        blocks.copy_from_slice(&bytes[MBR_BLOCKS_OFFSET..MBR_SIZE]);
        Self {
            name,
            flags: u32::from_le_bytes(flags),
            blocks,
        }
    }

    pub fn is_free(&self) -> bool {
        self.flags & MBR_FREE != 0
    }

    pub fn filesize(&self) -> u32 {
        self.flags & MBR_SIZE_MASK
    }

    /// 名字中 0 之前的部分
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(FILENAME_LEN);
        &self.name[..len]
    }

    /// 已分配给该文件的数据块个数
    pub fn block_count(&self) -> usize {
        self.blocks
            .iter()
            .position(|&b| b == EMPTY_SLOT)
            .unwrap_or(DATA_BLOCK_COUNT)
    }
}

pub struct MbrTable {
    flash: Flash,
    location: usize,
    entries: usize,
    scratch: usize,
}

impl MbrTable {
    pub fn new(flash: Flash, location: usize, entries: usize, scratch: usize) -> Self {
        Self {
            flash,
            location,
            entries,
            scratch,
        }
    }

    fn address(&self, id: usize) -> usize {
        self.location + id * MBR_SIZE
    }

    pub fn get(&self, id: usize) -> FsResult<Mbr> {
        let mut bytes = [0u8; MBR_SIZE];
        self.flash.read(self.address(id), &mut bytes)?;
        Ok(Mbr::decode(&bytes))
    }

    pub fn free_list(&self) -> FsResult<Mbr> {
        self.get(0)
    }

    fn write(&self, address: usize, bytes: &[u8]) -> FsResult<()> {
        Ok(self.flash.write(address, bytes, Some(self.scratch))?)
    }

    /// 若 MBR 页还没有格式化则建立它. 返回是否进行了格式化.
    pub fn build(&self) -> FsResult<bool> {
        let magic = self.flash.read_u32(self.address(0) + MBR_NAME_OFFSET)?;
        if magic == MAGIC_WORD {
            debug!("tinyfs: found MBR at {:#x}", self.location);
            return Ok(false);
        }
        info!("tinyfs: building MBR at {:#x}", self.location);
        self.flash.erase_page(self.location - self.location % PAGE_SIZE)?;
        self.write(self.address(0) + MBR_NAME_OFFSET, &MAGIC_WORD.to_le_bytes())?;
        let list: Vec<u8> = (0..DATA_BLOCK_COUNT as u8)
            .map(|n| FREE_SLOT_MARK | n)
            .collect();
        self.write(self.address(0) + MBR_BLOCKS_OFFSET, &list)?;
        Ok(true)
    }

    /// 按名字查找正在使用的记录
    pub fn by_name(&self, name: &[u8]) -> FsResult<Option<usize>> {
        for id in 1..self.entries {
            let m = self.get(id)?;
            if !m.is_free() && m.name() == name {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// 编号最小的空闲记录
    pub fn get_free(&self) -> FsResult<Option<usize>> {
        for id in 1..self.entries {
            if self.get(id)?.is_free() {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// 在空闲记录 `id` 中登记一个长度为 0 的新文件
    pub fn add(&self, id: usize, name: &[u8]) -> FsResult<()> {
        let mut record = [0u8; FILENAME_LEN + 4];
        record[..name.len()].copy_from_slice(name);
        self.write(self.address(id) + MBR_NAME_OFFSET, &record)
    }

    /// 把数据块 `block` 追加到文件 `id` 的块列表末尾
    pub fn add_block(&self, id: usize, block: u8) -> FsResult<()> {
        let m = self.get(id)?;
        let slot = m.block_count();
        if slot >= DATA_BLOCK_COUNT {
            return Err(FsError::NoResources);
        }
        self.write(self.address(id) + MBR_BLOCKS_OFFSET + slot, &[block])
    }

    /// 从空闲链表中取出一个块 (后进先出)
    pub fn pop_free_block(&self) -> FsResult<u8> {
        let list = self.free_list()?;
        let slot = list
            .blocks
            .iter()
            .position(|&b| b != POPPED_SLOT && b != EMPTY_SLOT)
            .ok_or(FsError::NoResources)?;
        self.write(self.address(0) + MBR_BLOCKS_OFFSET + slot, &[POPPED_SLOT])?;
        Ok(list.blocks[slot] & !FREE_SLOT_MARK)
    }

    pub fn set_filesize(&self, id: usize, size: u32) -> FsResult<()> {
        let flags = size & MBR_SIZE_MASK;
        self.write(self.address(id) + MBR_FLAGS_OFFSET, &flags.to_le_bytes())
    }

    /// 删除记录 `id`, 把它的数据块压回空闲链表
    pub fn remove(&self, id: usize) -> FsResult<()> {
        let m = self.get(id)?;
        let used = m.block_count();
        if used > 0 {
            let list = self.free_list()?;
            let top = list
                .blocks
                .iter()
                .position(|&b| b != POPPED_SLOT)
                .unwrap_or(DATA_BLOCK_COUNT);
            let start = top.checked_sub(used).ok_or(FsError::Cancelled)?;
            let slots = self.address(0) + MBR_BLOCKS_OFFSET + start;
            self.flash.erase_mem(slots, used, Some(self.scratch))?;
            let returned: Vec<u8> = m.blocks[..used].iter().map(|b| FREE_SLOT_MARK | b).collect();
            self.write(slots, &returned)?;
        }
        self.flash.erase_mem(self.address(id), MBR_SIZE, Some(self.scratch))?;
        Ok(())
    }

    pub fn free_block_count(&self) -> FsResult<usize> {
        Ok(self
            .free_list()?
            .blocks
            .iter()
            .filter(|&&b| b != POPPED_SLOT && b != EMPTY_SLOT)
            .count())
    }
}
