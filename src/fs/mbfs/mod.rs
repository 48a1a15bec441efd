//! MBFS: 文件表 + 目录的闪存文件系统.
//!
//! 文件系统区域被切分为 `MBFS_BLOCK_SIZE` 大小的逻辑块:
//!
//! ```text
//! | 文件表 (table_size 个块) | 根目录块 | 数据块 / 目录块 ... |
//! ```
//!
//! 文件表为每个块记录链中的下一个块. 删除只在表和目录项上留下墓碑
//! (`DELETED`), 真正的擦除推迟到 [`Mbfs::recycle_block`] 以整页为单位进行.

mod file;
mod geometry;
mod handle;
mod layout;

pub use file::FileDescriptor;
pub use geometry::{Geometry, BLOCKS_PER_PAGE};
pub use handle::File;
pub use layout::{
    DirectoryEntry, DirentFlags, DirentStatus, TableEntry, DIRENTS_PER_BLOCK, DIRENT_FLAGS_OFFSET,
    DIRENT_SIZE, LENGTH_UNSET, MBFS_DELETED, MBFS_EOF, MBFS_UNUSED,
};

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::{
    Flash, FlashDevice, FsError, FsResult, Source, MBFS_BLOCK_SIZE, MBFS_FILENAME_LENGTH,
    MBFS_MAGIC, PAGE_SIZE,
};

/// 目录项的位置: 所在块号 + 块内槽号
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirentRef {
    pub block: u16,
    pub slot: u16,
}

/// [`Mbfs::recycle_block`] 对目标块的处理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    File,
    Directory,
    FileTable,
}

/// [`Mbfs::list_dir`] 的一行
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirListing {
    pub name: String,
    pub length: u32,
    pub is_directory: bool,
}

/// 路径中每一段都是 1 到 15 个可打印 ASCII 字符, 可以以 '/' 开头
pub fn is_valid_filename(path: &str) -> bool {
    let path = path.strip_prefix('/').unwrap_or(path);
    !path.is_empty()
        && path.split('/').all(|part| {
            !part.is_empty()
                && part.len() < MBFS_FILENAME_LENGTH
                && part.bytes().all(|b| (32..=126).contains(&b))
        })
}

/// 路径的最后一段
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub struct Mbfs {
    flash: Flash,
    initialised: bool,
    geometry: Geometry,
    table_size: u16,
    /// 根目录项 (签名所在的槽)
    root: DirentRef,
    last_block_allocated: u16,
    /// 区域之外预留的后备 scratch 页
    scratch_page: Option<usize>,
    open_files: Vec<FileDescriptor>,
}

impl Mbfs {
    pub fn new(device: Arc<dyn FlashDevice>) -> Self {
        Self {
            flash: Flash::new(device),
            initialised: false,
            geometry: Geometry::default(),
            table_size: 0,
            root: DirentRef { block: 0, slot: 0 },
            last_block_allocated: 0,
            scratch_page: None,
            open_files: Vec::new(),
        }
    }

    pub fn mount(
        device: Arc<dyn FlashDevice>,
        flash_start: usize,
        flash_pages: usize,
    ) -> FsResult<Self> {
        let mut fs = Self::new(device);
        fs.init(flash_start, flash_pages)?;
        Ok(fs)
    }

    /// 挂载 `flash_start` 开始的 `flash_pages` 页, 找不到文件系统就格式化.
    ///
    /// 两个参数为 0 时按设备推算: 起点是固件结束后的第一个整页,
    /// 区域一直延伸到设备最后一页 (后备 scratch 页) 之前.
    pub fn init(&mut self, flash_start: usize, flash_pages: usize) -> FsResult<()> {
        if self.initialised {
            return Err(FsError::NotSupported);
        }
        let capacity = self.flash.capacity();
        let start = if flash_start == 0 {
            let end = self.flash.device().code_end();
            (end + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
        } else {
            flash_start
        };
        let pages = if flash_pages == 0 {
            capacity.saturating_sub(PAGE_SIZE).saturating_sub(start) / PAGE_SIZE
        } else {
            flash_pages
        };

        let geometry = self.check_geometry(start, pages)?;
        match self.load(start) {
            Ok(()) => info!(
                "mbfs: loaded {} blocks at {:#x}",
                self.geometry.blocks(),
                start
            ),
            Err(FsError::NoData) => {
                self.adopt(geometry);
                self.build()?;
            }
            Err(e) => return Err(e),
        }
        self.last_block_allocated = self.root.block;
        self.initialised = true;
        Ok(())
    }

    fn check_geometry(&self, start: usize, pages: usize) -> FsResult<Geometry> {
        let blocks = pages * BLOCKS_PER_PAGE as usize;
        if start % PAGE_SIZE != 0
            || pages < 2
            || start + pages * PAGE_SIZE > self.flash.capacity()
            || blocks >= MBFS_EOF as usize
        {
            error!("mbfs: bad geometry start={:#x} pages={}", start, pages);
            return Err(FsError::InvalidParameter);
        }
        let geometry = Geometry::new(start, pages);
        if geometry.table_size() + 1 >= geometry.blocks() {
            return Err(FsError::InvalidParameter);
        }
        Ok(geometry)
    }

    fn adopt(&mut self, geometry: Geometry) {
        self.geometry = geometry;
        self.table_size = geometry.table_size();
        self.root = DirentRef {
            block: self.table_size,
            slot: 0,
        };
        let reserved = self.flash.capacity() - PAGE_SIZE;
        self.scratch_page = if reserved >= geometry.end() {
            Some(reserved)
        } else {
            None
        };
    }

    fn check_initialised(&self) -> FsResult<()> {
        if self.initialised {
            Ok(())
        } else {
            Err(FsError::NotSupported)
        }
    }

    /// 校验 `flash_start` 处的文件系统: 文件表开头 `root` 个表项都等于 `root`,
    /// 且块 `root` 以签名目录项开头.
    fn load(&mut self, flash_start: usize) -> FsResult<()> {
        let guess = Geometry::new(flash_start, 0);
        let root = self.flash.read_u16(guess.table_entry_address(0))?;
        let max_blocks = (self.flash.capacity() - flash_start) / MBFS_BLOCK_SIZE;
        if root == MBFS_DELETED || root as usize >= max_blocks || root >= MBFS_EOF {
            return Err(FsError::NoData);
        }
        for block in 1..root {
            if self.flash.read_u16(guess.table_entry_address(block))? != root {
                return Err(FsError::NoData);
            }
        }
        let mut bytes = [0u8; DIRENT_SIZE];
        self.flash.read(guess.block_address(root), &mut bytes)?;
        let entry = DirectoryEntry::decode(&bytes);
        if entry.name() != MBFS_MAGIC || !entry.is_directory() {
            return Err(FsError::NoData);
        }

        let blocks = entry.length as usize;
        if blocks % BLOCKS_PER_PAGE as usize != 0 {
            return Err(FsError::NoData);
        }
        let geometry = self
            .check_geometry(flash_start, blocks / BLOCKS_PER_PAGE as usize)
            .map_err(|_| FsError::NoData)?;
        if geometry.table_size() != root {
            return Err(FsError::NoData);
        }
        self.adopt(geometry);
        Ok(())
    }

    /// 区域中没有有效的文件系统时才重新建立; 签名完好时什么也不做.
    pub fn format(&mut self) -> FsResult<()> {
        if !self.open_files.is_empty() || self.geometry.blocks() == 0 {
            return Err(FsError::NotSupported);
        }
        match self.load(self.geometry.flash_start()) {
            Ok(()) => {
                debug!("mbfs: signature intact, format skipped");
                Ok(())
            }
            Err(FsError::NoData) => self.build(),
            Err(e) => Err(e),
        }
    }

    /// 擦除整个区域, 建立文件表和根目录
    fn build(&mut self) -> FsResult<()> {
        info!(
            "mbfs: formatting {} blocks at {:#x}",
            self.geometry.blocks(),
            self.geometry.flash_start()
        );
        for page in 0..self.geometry.pages() {
            self.flash
                .erase_page(self.geometry.flash_start() + page * PAGE_SIZE)?;
        }
        // 文件表自身占用的块, 表项都写成表的大小
        let table: Vec<u8> = (0..self.table_size)
            .flat_map(|_| self.table_size.to_le_bytes())
            .collect();
        self.flash.write(self.geometry.flash_start(), &table, None)?;
        self.file_table_write(self.root.block, MBFS_EOF)?;
        self.write_dirent(
            self.root,
            &DirectoryEntry::root(self.root.block, self.geometry.blocks()),
        )?;
        self.last_block_allocated = self.root.block;
        Ok(())
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn table_size(&self) -> u16 {
        self.table_size
    }

    // ---- 文件表 ----

    pub fn table_entry(&self, block: u16) -> FsResult<TableEntry> {
        if !self.geometry.contains(block) {
            error!("mbfs: block {} outside the filesystem", block);
            return Err(FsError::Cancelled);
        }
        let raw = self
            .flash
            .read_u16(self.geometry.table_entry_address(block))?;
        Ok(TableEntry::from_raw(raw))
    }

    fn page_entries(&self, first: u16) -> FsResult<Vec<TableEntry>> {
        (first..first + BLOCKS_PER_PAGE)
            .map(|b| self.table_entry(b))
            .collect()
    }

    /// 修改文件表的唯一入口
    pub fn file_table_write(&mut self, block: u16, value: u16) -> FsResult<()> {
        let address = self.geometry.table_entry_address(block);
        self.flash_write(address, &value.to_le_bytes())
    }

    /// 从 `first` 开始的块链
    pub fn chain(&self, first: u16) -> FsResult<Vec<u16>> {
        let mut blocks = Vec::new();
        let mut block = first;
        loop {
            if blocks.len() >= self.geometry.blocks() as usize {
                error!("mbfs: chain from {} does not terminate", first);
                return Err(FsError::Cancelled);
            }
            blocks.push(block);
            match self.table_entry(block)? {
                TableEntry::Eof => return Ok(blocks),
                TableEntry::Next(next) => block = next,
                other => {
                    error!("mbfs: chain from {} hits {:?} at {}", first, other, block);
                    return Err(FsError::Cancelled);
                }
            }
        }
    }

    /// 链中第 `index` 个块
    pub fn block_at(&self, first: u16, index: usize) -> FsResult<Option<u16>> {
        let mut block = first;
        for _ in 0..index {
            match self.table_entry(block)? {
                TableEntry::Next(next) => block = next,
                TableEntry::Eof => return Ok(None),
                _ => return Err(FsError::Cancelled),
            }
        }
        Ok(Some(block))
    }

    /// 写入闪存, 只有在需要擦除时才去申请 scratch 页
    fn flash_write(&mut self, address: usize, data: &[u8]) -> FsResult<()> {
        self.flash_write_source(address, Source::Bytes(data), data.len())
    }

    fn flash_write_source(&mut self, address: usize, source: Source, len: usize) -> FsResult<()> {
        let scratch = if self.flash.needs_erase(address, source, len)? {
            Some(self.get_free_page()?)
        } else {
            None
        };
        self.flash.write_source(address, source, len, scratch)?;
        Ok(())
    }

    // ---- 分配 ----

    /// 从上次分配的位置往后轮询一个 UNUSED 块.
    /// 只剩 DELETED 块时先回收文件表再取用.
    pub fn get_free_block(&mut self) -> FsResult<u16> {
        let blocks = self.geometry.blocks();
        let mut deleted = None;
        let mut block = self.last_block_allocated;
        for _ in 0..blocks {
            block = (block + 1) % blocks;
            match self.table_entry(block)? {
                TableEntry::Unused => {
                    self.last_block_allocated = block;
                    return Ok(block);
                }
                TableEntry::Deleted => {
                    deleted.get_or_insert(block);
                }
                _ => {}
            }
        }
        let block = deleted.ok_or(FsError::NoResources)?;
        warn!("mbfs: no unused blocks left, recycling the file table");
        self.recycle_file_table()?;
        if self.table_entry(block)? != TableEntry::Unused {
            return Err(FsError::Cancelled);
        }
        self.last_block_allocated = block;
        Ok(block)
    }

    /// 取一个空闲块并保证它已被擦除. 调用者负责在文件表中登记它.
    fn allocate_block(&mut self) -> FsResult<u16> {
        let block = self.get_free_block()?;
        let address = self.geometry.block_address(block);
        if !self.flash.is_erased(address, MBFS_BLOCK_SIZE)? {
            self.recycle_block(block, BlockType::File)?;
        }
        debug!("mbfs: allocated block {}", block);
        Ok(block)
    }

    /// 找一个已擦除的页作为 scratch.
    ///
    /// 依次尝试: 全部块都 UNUSED 的页; 只含 DELETED/UNUSED 块的页 (擦除后使用);
    /// 区域之外预留的后备页.
    pub fn get_free_page(&mut self) -> FsResult<usize> {
        let pages = self.geometry.pages();
        let start = (self.last_block_allocated / BLOCKS_PER_PAGE) as usize + 1;
        let mut recyclable = None;
        for i in 0..pages {
            let page = (start + i) % pages;
            let first = page as u16 * BLOCKS_PER_PAGE;
            let entries = self.page_entries(first)?;
            if entries.iter().any(|e| e.is_live()) {
                continue;
            }
            let address = self.geometry.block_address(first);
            if entries.iter().all(|e| *e == TableEntry::Unused) {
                if !self.flash.is_erased(address, PAGE_SIZE)? {
                    self.flash.erase_page(address)?;
                }
                debug!("mbfs: scratch page {:#x}", address);
                return Ok(address);
            }
            recyclable.get_or_insert(address);
        }
        if let Some(address) = recyclable {
            debug!("mbfs: erasing deleted page {:#x} for scratch", address);
            self.flash.erase_page(address)?;
            return Ok(address);
        }
        match self.scratch_page {
            Some(address) => {
                warn!("mbfs: falling back to reserved scratch page {:#x}", address);
                if !self.flash.is_erased(address, PAGE_SIZE)? {
                    self.flash.erase_page(address)?;
                }
                Ok(address)
            }
            None => Err(FsError::NoResources),
        }
    }

    /// 经由 scratch 页重写 `block` 所在的整页, 丢弃其中的 UNUSED/DELETED 块.
    ///
    /// - 文件表块中的 DELETED 表项变为 UNUSED
    /// - `kind` 为 `Directory` 时, `block` 中被删除的目录项被清空
    /// - 其余块原样保留
    pub fn recycle_block(&mut self, block: u16, kind: BlockType) -> FsResult<()> {
        let first = self.geometry.first_block_of_page(block);
        let page = self.geometry.block_address(first);
        let entries = self.page_entries(first)?;
        if !entries.iter().any(|e| e.is_live()) {
            debug!("mbfs: page {:#x} holds nothing live, erasing", page);
            self.flash.erase_page(page)?;
            return Ok(());
        }

        let scratch = self.get_free_page()?;
        debug!("mbfs: recycling page {:#x} through {:#x}", page, scratch);
        for (i, entry) in entries.iter().enumerate() {
            let b = first + i as u16;
            let mut data = [0u8; MBFS_BLOCK_SIZE];
            if b < self.table_size {
                self.flash.read(self.geometry.block_address(b), &mut data)?;
                for pair in data.chunks_mut(2) {
                    if u16::from_le_bytes([pair[0], pair[1]]) == MBFS_DELETED {
                        pair.copy_from_slice(&MBFS_UNUSED.to_le_bytes());
                    }
                }
            } else if !entry.is_live() {
                continue;
            } else {
                self.flash.read(self.geometry.block_address(b), &mut data)?;
                if kind == BlockType::Directory && b == block {
                    for chunk in data.chunks_mut(DIRENT_SIZE) {
                        if let Ok(bytes) = <&[u8; DIRENT_SIZE]>::try_from(&*chunk) {
                            if DirectoryEntry::decode(bytes).status() == DirentStatus::Deleted {
                                chunk.fill(0xFF);
                            }
                        }
                    }
                }
            }
            self.flash
                .write(scratch + i * MBFS_BLOCK_SIZE, &data, None)?;
        }
        self.flash.erase_page(page)?;
        self.flash.copy_page(scratch, page)?;
        self.flash.erase_page(scratch)?;
        Ok(())
    }

    /// 把文件表中所有 DELETED 表项变为 UNUSED
    pub fn recycle_file_table(&mut self) -> FsResult<()> {
        let entries_per_page = PAGE_SIZE / 2;
        let blocks = self.geometry.blocks() as usize;
        let mut first = 0u16;
        while first < self.table_size {
            let from = first as usize * MBFS_BLOCK_SIZE / 2;
            let to = (from + entries_per_page).min(blocks);
            let mut dirty = false;
            for b in from..to {
                if self.table_entry(b as u16)? == TableEntry::Deleted {
                    dirty = true;
                    break;
                }
            }
            if dirty {
                self.recycle_block(first, BlockType::FileTable)?;
            }
            first += BLOCKS_PER_PAGE;
        }
        Ok(())
    }

    // ---- 目录 ----

    pub fn read_dirent(&self, dirent: DirentRef) -> FsResult<DirectoryEntry> {
        let mut bytes = [0u8; DIRENT_SIZE];
        self.flash
            .read(self.geometry.dirent_address(dirent), &mut bytes)?;
        Ok(DirectoryEntry::decode(&bytes))
    }

    fn write_dirent(&mut self, dirent: DirentRef, entry: &DirectoryEntry) -> FsResult<()> {
        let address = self.geometry.dirent_address(dirent);
        self.flash_write(address, &entry.encode())
    }

    fn set_dirent_flags(&mut self, dirent: DirentRef, flags: u16) -> FsResult<()> {
        let address = self.geometry.dirent_address(dirent) + DIRENT_FLAGS_OFFSET;
        self.flash_write(address, &flags.to_le_bytes())
    }

    /// 目录 `directory` 中的所有槽, 包括空槽和已删除的槽
    fn dir_entries(&self, directory: DirentRef) -> FsResult<Vec<(DirentRef, DirectoryEntry)>> {
        let first = self.read_dirent(directory)?.first_block;
        let mut out = Vec::new();
        for block in self.chain(first)? {
            for slot in 0..DIRENTS_PER_BLOCK {
                let dirent = DirentRef { block, slot };
                out.push((dirent, self.read_dirent(dirent)?));
            }
        }
        Ok(out)
    }

    fn find_entry(
        &self,
        directory: DirentRef,
        name: &str,
    ) -> FsResult<Option<(DirentRef, DirectoryEntry)>> {
        Ok(self
            .dir_entries(directory)?
            .into_iter()
            .find(|(dirent, e)| *dirent != self.root && e.is_live() && e.name() == name))
    }

    /// `path` 的父目录; 中间任何一段不存在或不是目录时为 `None`
    pub fn get_directory_of(&self, path: &str) -> FsResult<Option<DirentRef>> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let mut parts: Vec<&str> = path.split('/').collect();
        parts.pop();
        let mut directory = self.root;
        for part in parts {
            match self.find_entry(directory, part)? {
                Some((dirent, e)) if e.is_directory() => directory = dirent,
                _ => return Ok(None),
            }
        }
        Ok(Some(directory))
    }

    /// 在 `directory` (缺省为 `path` 的父目录) 中查找 `path` 的最后一段
    pub fn get_directory_entry(
        &self,
        path: &str,
        directory: Option<DirentRef>,
    ) -> FsResult<Option<DirentRef>> {
        let directory = match directory {
            Some(d) => d,
            None => match self.get_directory_of(path)? {
                Some(d) => d,
                None => return Ok(None),
            },
        };
        Ok(self
            .find_entry(directory, basename(path))?
            .map(|(dirent, _)| dirent))
    }

    /// 在目录中找一个可用的槽, 依次尝试: 空槽; 回收一个已删除的槽; 给目录追加新块
    pub fn create_directory_entry(&mut self, directory: DirentRef) -> FsResult<DirentRef> {
        let entries = self.dir_entries(directory)?;
        if let Some((dirent, _)) = entries
            .iter()
            .find(|(_, e)| e.status() == DirentStatus::Free)
        {
            return Ok(*dirent);
        }
        if let Some((dirent, _)) = entries
            .iter()
            .find(|(_, e)| e.status() == DirentStatus::Deleted)
        {
            debug!("mbfs: reclaiming deleted entry {:?}", dirent);
            self.recycle_block(dirent.block, BlockType::Directory)?;
            return Ok(*dirent);
        }

        let last = entries
            .last()
            .map(|(dirent, _)| dirent.block)
            .ok_or(FsError::Cancelled)?;
        let block = self.allocate_block()?;
        self.file_table_write(block, MBFS_EOF)?;
        self.file_table_write(last, block)?;
        debug!("mbfs: directory grows {} -> {}", last, block);
        Ok(DirentRef { block, slot: 0 })
    }

    /// 在 `directory` 中新建文件或目录, 并为它分配第一个块
    pub fn create_file(
        &mut self,
        name: &str,
        directory: DirentRef,
        is_directory: bool,
    ) -> FsResult<DirentRef> {
        let dirent = self.create_directory_entry(directory)?;
        let block = self.allocate_block()?;
        self.file_table_write(block, MBFS_EOF)?;
        let entry = if is_directory {
            DirectoryEntry::new(name, block, DirentFlags::VALID | DirentFlags::DIRECTORY, 0)
        } else {
            DirectoryEntry::new(name, block, DirentFlags::NEW, LENGTH_UNSET)
        };
        self.write_dirent(dirent, &entry)?;
        debug!("mbfs: created {:?} at {:?}", entry, dirent);
        Ok(dirent)
    }

    pub fn create_directory(&mut self, path: &str) -> FsResult<()> {
        self.check_initialised()?;
        if !is_valid_filename(path) {
            return Err(FsError::InvalidParameter);
        }
        let directory = self
            .get_directory_of(path)?
            .ok_or(FsError::InvalidParameter)?;
        let name = basename(path);
        if self.find_entry(directory, name)?.is_some() {
            return Err(FsError::InvalidParameter);
        }
        self.create_file(name, directory, true)?;
        Ok(())
    }

    /// 列出目录 `path` ("" 或 "/" 为根目录) 中所有现存的项
    pub fn list_dir(&self, path: &str) -> FsResult<Vec<DirListing>> {
        self.check_initialised()?;
        let trimmed = path.trim_matches('/');
        let directory = if trimmed.is_empty() {
            self.root
        } else {
            match self.get_directory_entry(trimmed, None)? {
                Some(dirent) if self.read_dirent(dirent)?.is_directory() => dirent,
                _ => return Err(FsError::InvalidParameter),
            }
        };
        Ok(self
            .dir_entries(directory)?
            .into_iter()
            .filter(|(dirent, e)| *dirent != self.root && e.is_live())
            .map(|(_, e)| DirListing {
                name: e.name().to_string(),
                length: e.stored_length(),
                is_directory: e.is_directory(),
            })
            .collect())
    }

    /// 文件表中 UNUSED 块的个数
    pub fn free_blocks(&self) -> FsResult<usize> {
        let mut count = 0;
        for b in 0..self.geometry.blocks() {
            if self.table_entry(b)? == TableEntry::Unused {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamFlash;
    use crate::fs::{MB_CREAT, MB_READ, MB_WRITE};

    pub(super) fn mount(pages: usize) -> (Arc<RamFlash>, Mbfs) {
        let dev = Arc::new(RamFlash::new(pages + 1));
        let fs = Mbfs::mount(dev.clone(), 0, 0).unwrap();
        (dev, fs)
    }

    #[test]
    fn filenames() {
        assert!(is_valid_filename("a.txt"));
        assert!(is_valid_filename("/dir/sub/file"));
        assert!(is_valid_filename("exactly15chars_"));
        assert!(!is_valid_filename("sixteen_chars_xx"));
        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename("/"));
        assert!(!is_valid_filename("a//b"));
        assert!(!is_valid_filename("tab\there"));
    }

    #[test]
    fn format_layout() {
        let (_, fs) = mount(16);
        let g = fs.geometry();
        assert_eq!(g.blocks(), 64);
        assert_eq!(fs.table_size(), 1);
        assert_eq!(fs.table_entry(0).unwrap(), TableEntry::Next(1));
        assert_eq!(fs.table_entry(1).unwrap(), TableEntry::Eof);
        assert_eq!(fs.table_entry(2).unwrap(), TableEntry::Unused);
        let root = fs.read_dirent(DirentRef { block: 1, slot: 0 }).unwrap();
        assert_eq!(root.name(), MBFS_MAGIC);
        assert_eq!(root.length, 64);
        assert_eq!(root.first_block, 1);
        assert_eq!(fs.free_blocks().unwrap(), 62);
        assert!(fs.list_dir("/").unwrap().is_empty());
    }

    #[test]
    fn load_is_idempotent() {
        let (dev, mut fs) = mount(16);
        let fd = fs.open("keep", MB_CREAT | MB_WRITE).unwrap();
        fs.write(fd, &[9u8; 300]).unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fs.init(0, 0), Err(FsError::NotSupported));
        let image = dev.snapshot();

        let again = Mbfs::mount(dev.clone(), 0, 0).unwrap();
        assert_eq!(dev.snapshot(), image);
        assert_eq!(
            again.list_dir("").unwrap(),
            vec![DirListing {
                name: "keep".into(),
                length: 300,
                is_directory: false
            }]
        );
    }

    #[test]
    fn corrupt_signature_reformats() {
        let dev = Arc::new(RamFlash::new(17));
        {
            let mut fs = Mbfs::mount(dev.clone(), 0, 0).unwrap();
            let fd = fs.open("gone", MB_CREAT | MB_WRITE).unwrap();
            fs.close(fd).unwrap();
        }
        // clobber the first byte of the signature
        dev.burn(MBFS_BLOCK_SIZE, &[0xFFFF_FF00]).unwrap();
        let fs = Mbfs::mount(dev, 0, 0).unwrap();
        assert!(fs.list_dir("").unwrap().is_empty());
    }

    #[test]
    fn format_only_rebuilds_a_missing_filesystem() {
        let (dev, mut fs) = mount(16);
        crate::fs::write_file(&mut fs, "keep", b"kept").unwrap();
        let image = dev.snapshot();
        fs.format().unwrap();
        fs.format().unwrap();
        assert_eq!(dev.snapshot(), image);
        assert_eq!(crate::fs::read_file(&mut fs, "keep").unwrap(), b"kept");

        let fd = fs.open("keep", MB_READ).unwrap();
        assert_eq!(fs.format(), Err(FsError::NotSupported));
        fs.close(fd).unwrap();

        dev.burn(MBFS_BLOCK_SIZE, &[0xFFFF_FF00]).unwrap();
        fs.format().unwrap();
        assert!(fs.list_dir("").unwrap().is_empty());
        assert_eq!(fs.free_blocks().unwrap(), 62);
        assert_eq!(
            crate::fs::read_file(&mut fs, "keep"),
            Err(FsError::InvalidParameter)
        );
    }

    #[test]
    fn dynamic_geometry() {
        let dev = Arc::new(RamFlash::with_code_end(20, 3 * PAGE_SIZE + 10));
        let fs = Mbfs::mount(dev, 0, 0).unwrap();
        assert_eq!(fs.geometry().flash_start(), 4 * PAGE_SIZE);
        assert_eq!(fs.geometry().pages(), 15);

        let dev = Arc::new(RamFlash::new(4));
        assert!(matches!(
            Mbfs::mount(dev.clone(), PAGE_SIZE + 1, 2),
            Err(FsError::InvalidParameter)
        ));
        assert!(matches!(
            Mbfs::mount(dev, 0, 5),
            Err(FsError::InvalidParameter)
        ));
    }

    #[test]
    fn not_initialised() {
        let mut fs = Mbfs::new(Arc::new(RamFlash::new(8)));
        assert_eq!(fs.open("a", MB_CREAT), Err(FsError::NotSupported));
        assert_eq!(fs.remove("a"), Err(FsError::NotSupported));
        assert_eq!(fs.create_directory("d"), Err(FsError::NotSupported));
    }

    #[test]
    fn directories() {
        let (_, mut fs) = mount(16);
        fs.create_directory("logs").unwrap();
        fs.create_directory("/logs/old").unwrap();
        assert_eq!(fs.create_directory("logs"), Err(FsError::InvalidParameter));
        assert_eq!(fs.create_directory("nope/x"), Err(FsError::InvalidParameter));

        let fd = fs.open("/logs/old/day1", MB_CREAT | MB_WRITE).unwrap();
        fs.write(fd, b"entry").unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fs.open("logs", MB_READ), Err(FsError::NotSupported));
        assert_eq!(fs.open("missing/day1", MB_CREAT), Err(FsError::InvalidParameter));

        let listing = fs.list_dir("logs").unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_directory);
        assert_eq!(
            fs.list_dir("/logs/old/").unwrap(),
            vec![DirListing {
                name: "day1".into(),
                length: 5,
                is_directory: false
            }]
        );
        assert_eq!(fs.list_dir("logs/old/day1"), Err(FsError::InvalidParameter));

        assert_eq!(fs.remove("logs/old"), Err(FsError::NotSupported));
        fs.remove("logs/old/day1").unwrap();
        fs.remove("logs/old").unwrap();
        assert!(fs.list_dir("logs").unwrap().is_empty());
    }

    #[test]
    fn directory_entry_preference() {
        let (dev, mut fs) = mount(16);
        let root = fs.root;
        // the nine free slots of the root block come first
        for i in 0..DIRENTS_PER_BLOCK - 1 {
            let fd = fs.open(&format!("f{}", i), MB_CREAT).unwrap();
            fs.close(fd).unwrap();
        }
        assert_eq!(fs.chain(root.block).unwrap(), vec![root.block]);
        assert_eq!(
            fs.get_directory_entry("f0", None).unwrap(),
            Some(DirentRef { block: root.block, slot: 1 })
        );

        // then a deleted slot is reclaimed in place
        fs.remove("f3").unwrap();
        let erases = dev.total_erases();
        let fd = fs.open("g", MB_CREAT).unwrap();
        fs.close(fd).unwrap();
        assert!(dev.total_erases() > erases);
        assert_eq!(fs.chain(root.block).unwrap(), vec![root.block]);
        assert_eq!(
            fs.get_directory_entry("g", None).unwrap(),
            Some(DirentRef { block: root.block, slot: 4 })
        );
        assert!(fs.get_directory_entry("f3", None).unwrap().is_none());
        assert!(fs.get_directory_entry("f8", None).unwrap().is_some());

        // and only then does the directory grow
        let fd = fs.open("h", MB_CREAT).unwrap();
        fs.close(fd).unwrap();
        let chain = fs.chain(root.block).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(
            fs.get_directory_entry("h", None).unwrap(),
            Some(DirentRef { block: chain[1], slot: 0 })
        );
        assert_eq!(fs.list_dir("").unwrap().len(), DIRENTS_PER_BLOCK as usize);
    }

    #[test]
    fn tombstone_then_recycle() {
        let (_, mut fs) = mount(16);
        let fd = fs.open("doomed", MB_CREAT | MB_WRITE).unwrap();
        fs.write(fd, &[7u8; 600]).unwrap();
        fs.close(fd).unwrap();
        let dirent = fs.get_directory_entry("doomed", None).unwrap().unwrap();
        let blocks = fs.chain(fs.read_dirent(dirent).unwrap().first_block).unwrap();
        assert_eq!(blocks.len(), 3);

        fs.remove("doomed").unwrap();
        assert_eq!(fs.read_dirent(dirent).unwrap().status(), DirentStatus::Deleted);
        for &b in &blocks {
            assert_eq!(fs.table_entry(b).unwrap(), TableEntry::Deleted);
        }
        assert_eq!(fs.open("doomed", MB_READ), Err(FsError::InvalidParameter));

        fs.recycle_file_table().unwrap();
        for &b in &blocks {
            assert_eq!(fs.table_entry(b).unwrap(), TableEntry::Unused);
        }
        // the root directory block survives the table rewrite
        assert!(fs.list_dir("").unwrap().is_empty());
        assert_eq!(fs.free_blocks().unwrap(), 62);
    }

    #[test]
    fn recycle_keeps_live_neighbours() {
        let (_, mut fs) = mount(16);
        let a: Vec<u8> = (0..200u8).collect();
        fs.create_directory("d").unwrap();
        let fd = fs.open("a", MB_CREAT | MB_WRITE).unwrap();
        fs.write(fd, &a).unwrap();
        fs.close(fd).unwrap();
        let fd = fs.open("b", MB_CREAT | MB_WRITE).unwrap();
        fs.write(fd, b"bbbb").unwrap();
        fs.close(fd).unwrap();
        fs.remove("b").unwrap();

        let root_block = fs.root.block;
        fs.recycle_block(root_block, BlockType::Directory).unwrap();
        let dirent = fs.root;
        let slots: Vec<DirentStatus> = fs
            .dir_entries(dirent)
            .unwrap()
            .iter()
            .map(|(_, e)| e.status())
            .collect();
        assert_eq!(slots[3], DirentStatus::Free);
        assert_eq!(crate::fs::read_file(&mut fs, "a").unwrap(), a);
        assert_eq!(fs.list_dir("").unwrap().len(), 2);
    }

    #[test]
    fn exhaustion_falls_back_to_deleted_blocks() {
        let (_, mut fs) = mount(4);
        // 16 blocks: table + root leave 14 for data
        let fd = fs.open("fill", MB_CREAT | MB_WRITE).unwrap();
        let big = vec![0x42u8; 14 * MBFS_BLOCK_SIZE];
        assert_eq!(fs.write(fd, &big).unwrap(), big.len());
        fs.close(fd).unwrap();
        assert_eq!(fs.free_blocks().unwrap(), 0);
        assert_eq!(fs.open("more", MB_CREAT), Err(FsError::NoResources));

        fs.remove("fill").unwrap();
        assert_eq!(fs.free_blocks().unwrap(), 0);
        let fd = fs.open("again", MB_CREAT | MB_WRITE | MB_READ).unwrap();
        assert_eq!(fs.write(fd, &big[..1000]).unwrap(), 1000);
        fs.close(fd).unwrap();
        assert_eq!(crate::fs::read_file(&mut fs, "again").unwrap(), &big[..1000]);
    }

    #[test]
    fn blocks_are_handed_out_round_robin() {
        let (_, mut fs) = mount(16);
        assert_eq!(fs.get_free_block().unwrap(), 2);
        assert_eq!(fs.get_free_block().unwrap(), 3);
        fs.last_block_allocated = 62;
        assert_eq!(fs.get_free_block().unwrap(), 63);
        // wraps around, skipping the table and the root directory
        assert_eq!(fs.get_free_block().unwrap(), 2);
    }

    #[test]
    fn scratch_page_preference() {
        let (dev, mut fs) = mount(4);
        // a page of unused blocks after the last allocation
        assert_eq!(fs.get_free_page().unwrap(), PAGE_SIZE);

        let full = vec![0x42u8; 14 * MBFS_BLOCK_SIZE];
        crate::fs::write_file(&mut fs, "x", &full).unwrap();
        // every page holds live data: only the reserved page is left
        assert_eq!(fs.scratch_page, Some(4 * PAGE_SIZE));
        assert_eq!(fs.get_free_page().unwrap(), 4 * PAGE_SIZE);

        // a page of deleted blocks is erased and used
        fs.remove("x").unwrap();
        let erases = dev.erase_count(1);
        assert_eq!(fs.get_free_page().unwrap(), PAGE_SIZE);
        assert_eq!(dev.erase_count(1), erases + 1);
        assert!(fs.flash.is_erased(PAGE_SIZE, PAGE_SIZE).unwrap());
    }

    #[test]
    fn no_reserved_page_means_no_scratch() {
        let dev = Arc::new(RamFlash::new(4));
        let mut fs = Mbfs::mount(dev, 0, 4).unwrap();
        assert_eq!(fs.scratch_page, None);
        let full = vec![0x42u8; 14 * MBFS_BLOCK_SIZE];
        crate::fs::write_file(&mut fs, "x", &full).unwrap();
        assert_eq!(fs.get_free_page(), Err(FsError::NoResources));

        // setting bits back to 1 needs a scratch page
        let fd = fs.open("x", MB_WRITE).unwrap();
        assert_eq!(fs.write_at(fd, 0, &[0xFF; 40]), Err(FsError::NoResources));
        fs.close(fd).unwrap();
        assert_eq!(crate::fs::read_file(&mut fs, "x").unwrap(), full);
    }
}
