//! 文件描述符层: open / read / write / seek / flush / close / remove.
//!
//! 描述符缓存的 `length` 比目录项中记录的长度更新, 直到 `flush` 或 `close`
//! 才写回闪存. 小于 `MBFS_CACHE_SIZE` 的写入先进入描述符自带的缓存.

use log::{debug, warn};

use super::super::{
    FileStorage, FsError, FsResult, Source, Whence, MBFS_BLOCK_SIZE, MBFS_CACHE_SIZE, MB_APPEND,
    MB_CREAT, MB_READ, MB_WRITE,
};
use super::layout::{DirentFlags, TableEntry, MBFS_DELETED, MBFS_EOF};
use super::{basename, is_valid_filename, DirentRef, Mbfs};

#[derive(Clone, Debug)]
pub struct FileDescriptor {
    pub flags: u32,
    pub id: usize,
    pub seek: u32,
    /// 当前长度, 包含尚未写回的部分
    pub length: u32,
    pub dirent: DirentRef,
    /// 父目录的目录项
    pub directory: DirentRef,
    cache: [u8; MBFS_CACHE_SIZE],
    cache_length: usize,
}

impl FileDescriptor {
    fn new(flags: u32, id: usize, length: u32, dirent: DirentRef, directory: DirentRef) -> Self {
        Self {
            flags,
            id,
            seek: if flags & MB_APPEND != 0 { length } else { 0 },
            length,
            dirent,
            directory,
            cache: [0; MBFS_CACHE_SIZE],
            cache_length: 0,
        }
    }
}

impl Mbfs {
    /// 打开 `path`. 同一文件同时只能有一个描述符.
    pub fn open(&mut self, path: &str, flags: u32) -> FsResult<usize> {
        self.check_initialised()?;
        if !is_valid_filename(path) {
            return Err(FsError::InvalidParameter);
        }
        let directory = self
            .get_directory_of(path)?
            .ok_or(FsError::InvalidParameter)?;
        let name = basename(path);
        let dirent = match self.find_entry(directory, name)? {
            Some((dirent, entry)) => {
                if entry.is_directory() || self.open_files.iter().any(|f| f.dirent == dirent) {
                    return Err(FsError::NotSupported);
                }
                dirent
            }
            None if flags & MB_CREAT != 0 => self.create_file(name, directory, false)?,
            None => return Err(FsError::InvalidParameter),
        };

        let mut id = 0;
        while self.open_files.iter().any(|f| f.id == id) {
            id += 1;
        }
        let length = self.read_dirent(dirent)?.stored_length();
        self.open_files
            .push(FileDescriptor::new(flags, id, length, dirent, directory));
        debug!("mbfs: open {} as {}", path, id);
        Ok(id)
    }

    /// 查找描述符, `remove` 为真时同时把它从打开文件表中摘下
    pub fn get_file_descriptor(&mut self, fd: usize, remove: bool) -> Option<FileDescriptor> {
        let index = self.open_files.iter().position(|f| f.id == fd)?;
        if remove {
            Some(self.open_files.remove(index))
        } else {
            Some(self.open_files[index].clone())
        }
    }

    /// 在描述符上执行 `op`, 无论成败都把描述符放回原位
    fn with_descriptor<T>(
        &mut self,
        fd: usize,
        op: impl FnOnce(&mut Self, &mut FileDescriptor) -> FsResult<T>,
    ) -> FsResult<T> {
        self.check_initialised()?;
        let index = self
            .open_files
            .iter()
            .position(|f| f.id == fd)
            .ok_or(FsError::InvalidParameter)?;
        let mut file = self.open_files.remove(index);
        let result = op(self, &mut file);
        self.open_files.insert(index, file);
        result
    }

    pub fn flush(&mut self, fd: usize) -> FsResult<()> {
        self.with_descriptor(fd, |fs, file| fs.sync(file))
    }

    /// 写回并释放描述符. 写回失败时描述符同样被释放, 错误照常返回.
    pub fn close(&mut self, fd: usize) -> FsResult<()> {
        self.check_initialised()?;
        let mut file = self
            .get_file_descriptor(fd, true)
            .ok_or(FsError::InvalidParameter)?;
        let result = self.sync(&mut file);
        match &result {
            Ok(()) => debug!("mbfs: closed {}", fd),
            Err(e) => warn!("mbfs: closed {} without saving: {}", fd, e),
        }
        result
    }

    pub fn seek(&mut self, fd: usize, offset: i32, whence: Whence) -> FsResult<u32> {
        self.with_descriptor(fd, |fs, file| {
            fs.write_back(file)?;
            file.seek = whence.resolve(offset, file.seek, file.length)?;
            Ok(file.seek)
        })
    }

    /// 当前文件长度
    pub fn len(&mut self, fd: usize) -> FsResult<u32> {
        self.with_descriptor(fd, |fs, file| {
            fs.write_back(file)?;
            Ok(file.length)
        })
    }

    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> FsResult<usize> {
        self.with_descriptor(fd, |fs, file| {
            if file.flags & MB_READ == 0 {
                return Err(FsError::InvalidParameter);
            }
            fs.write_back(file)?;
            fs.read_buffer(file, buf)
        })
    }

    pub fn write(&mut self, fd: usize, buf: &[u8]) -> FsResult<usize> {
        self.with_descriptor(fd, |fs, file| {
            if file.flags & MB_WRITE == 0 {
                return Err(FsError::InvalidParameter);
            }
            if file.cache_length + buf.len() > MBFS_CACHE_SIZE {
                fs.write_back(file)?;
            }
            if buf.len() > MBFS_CACHE_SIZE {
                return fs.write_buffer(file, buf);
            }
            let at = file.cache_length;
            file.cache[at..at + buf.len()].copy_from_slice(buf);
            file.cache_length += buf.len();
            Ok(buf.len())
        })
    }

    /// 把游标直接放到 `offset` (可以越过文件末尾) 后写入, 不经过缓存
    pub fn write_at(&mut self, fd: usize, offset: u32, buf: &[u8]) -> FsResult<usize> {
        self.with_descriptor(fd, |fs, file| {
            if file.flags & MB_WRITE == 0 {
                return Err(FsError::InvalidParameter);
            }
            fs.write_back(file)?;
            file.seek = offset;
            fs.write_buffer(file, buf)
        })
    }

    /// 删除文件或空目录. 块链和目录项只被标记为 DELETED.
    pub fn remove(&mut self, path: &str) -> FsResult<()> {
        self.check_initialised()?;
        if !is_valid_filename(path) {
            return Err(FsError::InvalidParameter);
        }
        let directory = self
            .get_directory_of(path)?
            .ok_or(FsError::InvalidParameter)?;
        let (mut dirent, entry) = self
            .find_entry(directory, basename(path))?
            .ok_or(FsError::InvalidParameter)?;
        if entry.is_directory() {
            if self.dir_entries(dirent)?.iter().any(|(_, e)| e.is_live()) {
                return Err(FsError::NotSupported);
            }
        } else {
            let fd = self.open(path, MB_READ)?;
            dirent = self
                .get_file_descriptor(fd, true)
                .ok_or(FsError::Cancelled)?
                .dirent;
        }

        let first = self.read_dirent(dirent)?.first_block;
        for block in self.chain(first)? {
            self.file_table_write(block, MBFS_DELETED)?;
        }
        self.set_dirent_flags(dirent, DirentFlags::DELETED)?;
        debug!("mbfs: removed {}", path);
        Ok(())
    }

    /// 写回缓存, 长度有变化时更新目录项.
    ///
    /// 从未写过长度的 NEW 目录项可以原地修改; 否则写一个新目录项并删除旧的.
    fn sync(&mut self, file: &mut FileDescriptor) -> FsResult<()> {
        self.write_back(file)?;
        let stored = self.read_dirent(file.dirent)?;
        if stored.length == file.length {
            return Ok(());
        }
        let mut entry = stored.clone();
        entry.length = file.length;
        entry.flags = DirentFlags::VALID;
        if stored.flags == DirentFlags::NEW {
            self.write_dirent(file.dirent, &entry)?;
        } else {
            let fresh = self.create_directory_entry(file.directory)?;
            self.write_dirent(fresh, &entry)?;
            self.set_dirent_flags(file.dirent, DirentFlags::DELETED)?;
            debug!("mbfs: {} moved {:?} -> {:?}", entry.name(), file.dirent, fresh);
            file.dirent = fresh;
        }
        Ok(())
    }

    fn write_back(&mut self, file: &mut FileDescriptor) -> FsResult<()> {
        if file.cache_length == 0 {
            return Ok(());
        }
        let pending = file.cache;
        let len = file.cache_length;
        // 写不进去的部分留在缓存里, 下一次 flush 再试
        let written = self.write_buffer(file, &pending[..len])?;
        file.cache[..len - written].copy_from_slice(&pending[written..len]);
        file.cache_length = len - written;
        if written < len {
            warn!("mbfs: {} cached bytes still pending", len - written);
            return Err(FsError::NoResources);
        }
        Ok(())
    }

    fn read_buffer(&mut self, file: &mut FileDescriptor, buf: &mut [u8]) -> FsResult<usize> {
        if file.seek >= file.length || buf.is_empty() {
            return Ok(0);
        }
        let first = self.read_dirent(file.dirent)?.first_block;
        let mut block = self
            .block_at(first, file.seek as usize / MBFS_BLOCK_SIZE)?
            .ok_or(FsError::Cancelled)?;
        let mut offset = file.seek as usize % MBFS_BLOCK_SIZE;
        let total = buf.len().min((file.length - file.seek) as usize);
        let mut done = 0;
        while done < total {
            if offset == MBFS_BLOCK_SIZE {
                block = match self.table_entry(block)? {
                    TableEntry::Next(next) => next,
                    other => {
                        warn!("mbfs: chain ends early at {} ({:?})", block, other);
                        break;
                    }
                };
                offset = 0;
            }
            let n = (MBFS_BLOCK_SIZE - offset).min(total - done);
            let address = self.geometry.block_address(block) + offset;
            if let Err(e) = self.flash.read(address, &mut buf[done..done + n]) {
                if done == 0 {
                    return Err(e.into());
                }
                break;
            }
            done += n;
            offset += n;
            file.seek += n as u32;
        }
        Ok(done)
    }

    /// 从游标处写入 `data`. 游标越过文件末尾时先用 0 填满空洞.
    fn write_buffer(&mut self, file: &mut FileDescriptor, data: &[u8]) -> FsResult<usize> {
        let mut result = Ok(());
        if file.seek > file.length {
            let gap = (file.seek - file.length) as usize;
            file.seek = file.length;
            let mut padded = 0;
            result = self.write_segments(file, Source::Fill(0), gap, &mut padded);
        }
        let mut written = 0;
        if result.is_ok() {
            result = self.write_segments(file, Source::Bytes(data), data.len(), &mut written);
        }
        match result {
            Ok(()) => Ok(written),
            Err(e) if written > 0 => {
                warn!("mbfs: short write {}/{}: {}", written, data.len(), e);
                Ok(written)
            }
            Err(e) => Err(e),
        }
    }

    fn write_segments(
        &mut self,
        file: &mut FileDescriptor,
        source: Source,
        len: usize,
        done: &mut usize,
    ) -> FsResult<()> {
        if len == 0 {
            return Ok(());
        }
        let first = self.read_dirent(file.dirent)?.first_block;
        let index = file.seek as usize / MBFS_BLOCK_SIZE;
        let (mut block, mut offset) = match self.block_at(first, index)? {
            Some(block) => (block, file.seek as usize % MBFS_BLOCK_SIZE),
            // 游标正好在最后一块的末尾
            None => {
                let last = index.checked_sub(1).ok_or(FsError::Cancelled)?;
                let block = self.block_at(first, last)?.ok_or(FsError::Cancelled)?;
                (block, MBFS_BLOCK_SIZE)
            }
        };

        while *done < len {
            if offset == MBFS_BLOCK_SIZE {
                block = match self.table_entry(block)? {
                    TableEntry::Next(next) => next,
                    TableEntry::Eof => {
                        let next = self.allocate_block()?;
                        self.file_table_write(next, MBFS_EOF)?;
                        self.file_table_write(block, next)?;
                        next
                    }
                    _ => return Err(FsError::Cancelled),
                };
                offset = 0;
            }
            let n = (MBFS_BLOCK_SIZE - offset).min(len - *done);
            let address = self.geometry.block_address(block) + offset;
            self.flash_write_source(address, source.window(*done, n), n)?;
            *done += n;
            offset += n;
            file.seek += n as u32;
            file.length = file.length.max(file.seek);
        }
        Ok(())
    }
}

impl FileStorage for Mbfs {
    fn open(&mut self, name: &str, flags: u32) -> FsResult<usize> {
        Mbfs::open(self, name, flags)
    }

    fn close(&mut self, fd: usize) -> FsResult<()> {
        Mbfs::close(self, fd)
    }

    fn seek(&mut self, fd: usize, offset: i32, whence: Whence) -> FsResult<u32> {
        Mbfs::seek(self, fd, offset, whence)
    }

    fn read(&mut self, fd: usize, buf: &mut [u8]) -> FsResult<usize> {
        Mbfs::read(self, fd, buf)
    }

    fn write(&mut self, fd: usize, buf: &[u8]) -> FsResult<usize> {
        Mbfs::write(self, fd, buf)
    }

    fn write_at(&mut self, fd: usize, offset: u32, buf: &[u8]) -> FsResult<usize> {
        Mbfs::write_at(self, fd, offset, buf)
    }

    fn remove(&mut self, name: &str) -> FsResult<()> {
        Mbfs::remove(self, name)
    }
}
