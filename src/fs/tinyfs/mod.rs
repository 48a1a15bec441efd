//! TinyFS: 单页 MBR 表 + 整页数据块的极简文件系统.
//!
//! 布局: `flash_start` 处是 MBR 页, 其后紧跟 `DATA_BLOCK_COUNT` 个数据页.
//! 每个文件最多占用 `DATA_BLOCK_COUNT` 个数据块, 文件中偏移 `off` 的字节
//! 位于 `blocks[off / PAGE_SIZE]` 块的 `off % PAGE_SIZE` 处.

mod mbr;

pub use mbr::{Mbr, MbrTable, MBR_SIZE};

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::{
    Flash, FlashDevice, FsError, FsResult, Source, Whence, DATA_BLOCK_COUNT, FILENAME_LEN,
    MAX_FD, MB_CREAT, MB_READ, MB_WRITE, NO_MBR_ENTRIES, PAGE_SIZE, TINYFS_PAGES,
};

/// 描述符被占用
const FD_BUSY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Default)]
struct TinyFd {
    flags: u32,
    seek: u32,
    /// MBR 记录编号
    mbr: usize,
    filesize: u32,
}

impl TinyFd {
    fn is_busy(&self) -> bool {
        self.flags & FD_BUSY != 0
    }
}

pub struct TinyFs {
    flash: Flash,
    table: Option<MbrTable>,
    data_start: usize,
    scratch: usize,
    fd_table: [TinyFd; MAX_FD],
}

fn check_name(name: &str) -> FsResult<&[u8]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= FILENAME_LEN || bytes.contains(&0) {
        return Err(FsError::InvalidParameter);
    }
    Ok(bytes)
}

impl TinyFs {
    /// 未初始化的实例, 在 [`init`](Self::init) 之前所有操作都返回 `NotSupported`
    pub fn new(device: Arc<dyn FlashDevice>) -> Self {
        Self {
            flash: Flash::new(device),
            table: None,
            data_start: 0,
            scratch: 0,
            fd_table: [TinyFd::default(); MAX_FD],
        }
    }

    pub fn mount(
        device: Arc<dyn FlashDevice>,
        flash_start: usize,
        scratch_page: usize,
    ) -> FsResult<Self> {
        let mut fs = Self::new(device);
        fs.init(flash_start, scratch_page)?;
        Ok(fs)
    }

    /// 在 `flash_start` 处挂载 (必要时格式化) 文件系统.
    /// `flash_start` 为 0 时取固件之后的第一个整页, `scratch_page` 为 0 时取设备最后一页.
    pub fn init(&mut self, flash_start: usize, scratch_page: usize) -> FsResult<()> {
        if self.table.is_some() {
            return Err(FsError::NotSupported);
        }
        let capacity = self.flash.capacity();
        let start = if flash_start == 0 {
            let end = self.flash.device().code_end();
            (end + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
        } else {
            flash_start
        };
        let scratch = if scratch_page == 0 {
            capacity.checked_sub(PAGE_SIZE).ok_or(FsError::InvalidParameter)?
        } else {
            scratch_page
        };
        let end = start + TINYFS_PAGES * PAGE_SIZE;
        if start % PAGE_SIZE != 0
            || scratch % PAGE_SIZE != 0
            || end > capacity
            || scratch + PAGE_SIZE > capacity
            || (scratch >= start && scratch < end)
        {
            error!("tinyfs: bad geometry start={:#x} scratch={:#x}", start, scratch);
            return Err(FsError::InvalidParameter);
        }

        let table = MbrTable::new(self.flash.clone(), start, NO_MBR_ENTRIES, scratch);
        if !table.build()? {
            info!("tinyfs: mounted existing filesystem at {:#x}", start);
        }
        self.table = Some(table);
        self.data_start = start + PAGE_SIZE;
        self.scratch = scratch;
        Ok(())
    }

    fn table(&self) -> FsResult<&MbrTable> {
        self.table.as_ref().ok_or(FsError::NotSupported)
    }

    fn fd(&self, fd: usize) -> FsResult<TinyFd> {
        self.table()?;
        match self.fd_table.get(fd) {
            Some(f) if f.is_busy() => Ok(*f),
            _ => Err(FsError::InvalidParameter),
        }
    }

    fn block_address(&self, block: u8) -> usize {
        self.data_start + block as usize * PAGE_SIZE
    }

    pub fn open(&mut self, name: &str, flags: u32) -> FsResult<usize> {
        let table = self.table()?;
        let name = check_name(name)?;
        let slot = self
            .fd_table
            .iter()
            .position(|f| !f.is_busy())
            .ok_or(FsError::NoResources)?;
        let id = match table.by_name(name)? {
            Some(id) => {
                if self.fd_table.iter().any(|f| f.is_busy() && f.mbr == id) {
                    return Err(FsError::NotSupported);
                }
                id
            }
            None if flags & MB_CREAT != 0 => {
                let id = table.get_free()?.ok_or(FsError::NoResources)?;
                table.add(id, name)?;
                debug!("tinyfs: created entry {}", id);
                id
            }
            None => return Err(FsError::InvalidParameter),
        };
        let filesize = table.get(id)?.filesize();
        self.fd_table[slot] = TinyFd {
            flags: (flags & (MB_READ | MB_WRITE)) | FD_BUSY,
            seek: 0,
            mbr: id,
            filesize,
        };
        Ok(slot)
    }

    pub fn close(&mut self, fd: usize) -> FsResult<()> {
        let f = self.fd(fd)?;
        let table = self.table()?;
        if table.get(f.mbr)?.filesize() != f.filesize {
            table.set_filesize(f.mbr, f.filesize)?;
        }
        self.fd_table[fd] = TinyFd::default();
        Ok(())
    }

    pub fn seek(&mut self, fd: usize, offset: i32, whence: Whence) -> FsResult<u32> {
        let f = self.fd(fd)?;
        let pos = whence.resolve(offset, f.seek, f.filesize)?;
        self.fd_table[fd].seek = pos;
        Ok(pos)
    }

    /// 当前文件长度
    pub fn len(&self, fd: usize) -> FsResult<u32> {
        Ok(self.fd(fd)?.filesize)
    }

    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> FsResult<usize> {
        let mut f = self.fd(fd)?;
        if f.flags & MB_READ == 0 {
            return Err(FsError::InvalidParameter);
        }
        let m = self.table()?.get(f.mbr)?;
        let mut done = 0;
        while done < buf.len() && f.seek < f.filesize {
            let index = f.seek as usize / PAGE_SIZE;
            let offset = f.seek as usize % PAGE_SIZE;
            let block = match m.blocks.get(index) {
                Some(&b) if b != mbr::EMPTY_SLOT => b,
                _ => {
                    error!("tinyfs: entry {} has no block {}", f.mbr, index);
                    break;
                }
            };
            let n = (PAGE_SIZE - offset)
                .min(buf.len() - done)
                .min((f.filesize - f.seek) as usize);
            if let Err(e) = self
                .flash
                .read(self.block_address(block) + offset, &mut buf[done..done + n])
            {
                if done == 0 {
                    return Err(e.into());
                }
                break;
            }
            done += n;
            f.seek += n as u32;
        }
        self.fd_table[fd].seek = f.seek;
        Ok(done)
    }

    pub fn write(&mut self, fd: usize, buf: &[u8]) -> FsResult<usize> {
        let mut f = self.fd(fd)?;
        if f.flags & MB_WRITE == 0 {
            return Err(FsError::InvalidParameter);
        }
        let size_before = f.filesize;

        // 空洞先用 0 填满, 填充字节同样计入文件长度
        let mut result = Ok(());
        if f.seek > f.filesize {
            let gap = (f.seek - f.filesize) as usize;
            f.seek = f.filesize;
            let mut padded = 0;
            result = self.write_segments(&mut f, Source::Fill(0), gap, &mut padded);
        }
        let mut written = 0;
        if result.is_ok() {
            result = self.write_segments(&mut f, Source::Bytes(buf), buf.len(), &mut written);
        }

        self.fd_table[fd] = f;
        if f.filesize != size_before {
            let persisted = self.table()?.set_filesize(f.mbr, f.filesize);
            result = result.and(persisted);
        }
        match result {
            Ok(()) => Ok(written),
            Err(e) if written > 0 => {
                warn!("tinyfs: short write {}/{}: {}", written, buf.len(), e);
                Ok(written)
            }
            Err(e) => Err(e),
        }
    }

    /// 把游标直接放到 `offset` (可以越过文件末尾) 后写入
    pub fn write_at(&mut self, fd: usize, offset: u32, buf: &[u8]) -> FsResult<usize> {
        self.fd(fd)?;
        self.fd_table[fd].seek = offset;
        self.write(fd, buf)
    }

    fn write_segments(
        &self,
        f: &mut TinyFd,
        source: Source,
        len: usize,
        done: &mut usize,
    ) -> FsResult<()> {
        let table = self.table()?;
        let mut m = table.get(f.mbr)?;
        let mut allocated = m.block_count();
        while *done < len {
            let index = f.seek as usize / PAGE_SIZE;
            let offset = f.seek as usize % PAGE_SIZE;
            if index >= DATA_BLOCK_COUNT {
                return Err(FsError::NoResources);
            }
            let block = if index < allocated {
                m.blocks[index]
            } else {
                let b = table.pop_free_block()?;
                table.add_block(f.mbr, b)?;
                debug!("tinyfs: block {} -> entry {}", b, f.mbr);
                // 回收来的块可能还留有旧数据, 整页擦掉比经过 scratch 改写便宜
                let address = self.block_address(b);
                if !self.flash.is_erased(address, PAGE_SIZE)? {
                    self.flash.erase_page(address)?;
                }
                m.blocks[index] = b;
                allocated += 1;
                b
            };
            let n = (PAGE_SIZE - offset).min(len - *done);
            self.flash.write_source(
                self.block_address(block) + offset,
                source.window(*done, n),
                n,
                Some(self.scratch),
            )?;
            *done += n;
            f.seek += n as u32;
            f.filesize = f.filesize.max(f.seek);
        }
        Ok(())
    }

    pub fn unlink(&mut self, name: &str) -> FsResult<()> {
        let table = self.table()?;
        let name = check_name(name)?;
        let id = table.by_name(name)?.ok_or(FsError::InvalidParameter)?;
        if self.fd_table.iter().any(|f| f.is_busy() && f.mbr == id) {
            return Err(FsError::NotSupported);
        }
        table.remove(id)?;
        debug!("tinyfs: removed entry {}", id);
        Ok(())
    }

    pub fn free_blocks(&self) -> FsResult<usize> {
        self.table()?.free_block_count()
    }

    /// 所有文件占用的数据块总数
    pub fn allocated_blocks(&self) -> FsResult<usize> {
        let table = self.table()?;
        let mut total = 0;
        for id in 1..NO_MBR_ENTRIES {
            let m = table.get(id)?;
            if !m.is_free() {
                total += m.block_count();
            }
        }
        Ok(total)
    }
}

impl super::FileStorage for TinyFs {
    fn open(&mut self, name: &str, flags: u32) -> FsResult<usize> {
        TinyFs::open(self, name, flags)
    }

    fn close(&mut self, fd: usize) -> FsResult<()> {
        TinyFs::close(self, fd)
    }

    fn seek(&mut self, fd: usize, offset: i32, whence: Whence) -> FsResult<u32> {
        TinyFs::seek(self, fd, offset, whence)
    }

    fn read(&mut self, fd: usize, buf: &mut [u8]) -> FsResult<usize> {
        TinyFs::read(self, fd, buf)
    }

    fn write(&mut self, fd: usize, buf: &[u8]) -> FsResult<usize> {
        TinyFs::write(self, fd, buf)
    }

    fn write_at(&mut self, fd: usize, offset: u32, buf: &[u8]) -> FsResult<usize> {
        TinyFs::write_at(self, fd, offset, buf)
    }

    fn remove(&mut self, name: &str) -> FsResult<()> {
        self.unlink(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamFlash;
    use crate::fs::MAGIC_WORD;

    const DEVICE_PAGES: usize = TINYFS_PAGES + 1;

    fn mount() -> (Arc<RamFlash>, TinyFs) {
        let dev = Arc::new(RamFlash::new(DEVICE_PAGES));
        let fs = TinyFs::mount(dev.clone(), 0, 0).unwrap();
        (dev, fs)
    }

    #[test]
    fn build_is_idempotent() {
        let (dev, fs) = mount();
        assert_eq!(fs.free_blocks().unwrap(), DATA_BLOCK_COUNT);
        let mut magic = [0u8; 4];
        dev.read(0, &mut magic).unwrap();
        assert_eq!(u32::from_le_bytes(magic), MAGIC_WORD);

        let mut fs = fs;
        let fd = fs.open("keep", MB_CREAT | MB_WRITE).unwrap();
        fs.write(fd, b"persist").unwrap();
        fs.close(fd).unwrap();
        let image = dev.snapshot();

        let mut again = TinyFs::mount(dev.clone(), 0, 0).unwrap();
        assert_eq!(dev.snapshot(), image);
        assert_eq!(again.init(0, 0), Err(FsError::NotSupported));
        let fd = again.open("keep", MB_READ).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(again.read(fd, &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"persist");
    }

    #[test]
    fn not_initialised() {
        let dev = Arc::new(RamFlash::new(DEVICE_PAGES));
        let mut fs = TinyFs::new(dev);
        assert_eq!(fs.open("a", MB_CREAT), Err(FsError::NotSupported));
        assert_eq!(fs.unlink("a"), Err(FsError::NotSupported));
    }

    #[test]
    fn bad_geometry() {
        let dev = Arc::new(RamFlash::new(DEVICE_PAGES));
        let mut fs = TinyFs::new(dev);
        // scratch inside the region
        assert_eq!(fs.init(0, PAGE_SIZE), Err(FsError::InvalidParameter));
        assert_eq!(fs.init(PAGE_SIZE, 0), Err(FsError::InvalidParameter));
    }

    #[test]
    fn round_trip_across_blocks() {
        let (_, mut fs) = mount();
        let data: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
        let fd = fs.open("big.bin", MB_CREAT | MB_WRITE).unwrap();
        assert_eq!(fs.write(fd, &data[..1000]).unwrap(), 1000);
        assert_eq!(fs.write(fd, &data[1000..]).unwrap(), 2000);
        fs.close(fd).unwrap();

        let fd = fs.open("big.bin", MB_READ).unwrap();
        assert_eq!(fs.len(fd).unwrap(), 3000);
        let mut back = vec![0u8; 4000];
        assert_eq!(fs.read(fd, &mut back).unwrap(), 3000);
        assert_eq!(&back[..3000], &data[..]);
        assert_eq!(fs.read(fd, &mut back).unwrap(), 0);
    }

    #[test]
    fn overwrite_in_place() {
        let (_, mut fs) = mount();
        let fd = fs.open("f", MB_CREAT | MB_WRITE | MB_READ).unwrap();
        fs.write(fd, b"aaaaaaaa").unwrap();
        fs.seek(fd, 2, Whence::Set).unwrap();
        fs.write(fd, b"ZZ").unwrap();
        fs.seek(fd, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 8];
        fs.read(fd, &mut buf).unwrap();
        assert_eq!(&buf, b"aaZZaaaa");
        assert_eq!(fs.len(fd).unwrap(), 8);
    }

    #[test]
    fn seek_bounds() {
        let (_, mut fs) = mount();
        let fd = fs.open("s", MB_CREAT | MB_WRITE | MB_READ).unwrap();
        fs.write(fd, b"0123456789").unwrap();
        assert_eq!(fs.seek(fd, -1, Whence::End).unwrap(), 9);
        assert_eq!(fs.seek(fd, 10, Whence::Set).unwrap(), 10);
        assert_eq!(fs.seek(fd, 11, Whence::Set), Err(FsError::InvalidParameter));
        assert_eq!(fs.seek(fd, -1, Whence::Set), Err(FsError::InvalidParameter));
        assert_eq!(fs.seek(fd, -3, Whence::Cur).unwrap(), 7);

        let mut buf = [0u8; 8];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");
        assert_eq!(fs.seek(fd, 0, Whence::Cur).unwrap(), 10);
    }

    #[test]
    fn sparse_write_pads_with_zero() {
        let (_, mut fs) = mount();
        let fd = fs.open("sparse", MB_CREAT | MB_WRITE | MB_READ).unwrap();
        fs.write(fd, b"ab").unwrap();
        assert_eq!(fs.write_at(fd, 1500, b"xyz").unwrap(), 3);
        assert_eq!(fs.len(fd).unwrap(), 1503);
        fs.seek(fd, 0, Whence::Set).unwrap();
        let mut back = vec![0xAAu8; 1503];
        assert_eq!(fs.read(fd, &mut back).unwrap(), 1503);
        assert_eq!(&back[..2], b"ab");
        assert!(back[2..1500].iter().all(|&b| b == 0));
        assert_eq!(&back[1500..], b"xyz");
    }

    #[test]
    fn flags_and_handles() {
        let (_, mut fs) = mount();
        assert_eq!(fs.open("missing", MB_READ), Err(FsError::InvalidParameter));
        assert_eq!(fs.open("", MB_CREAT), Err(FsError::InvalidParameter));
        assert_eq!(
            fs.open("much-too-long-name", MB_CREAT),
            Err(FsError::InvalidParameter)
        );
        let fd = fs.open("ro", MB_CREAT | MB_READ).unwrap();
        assert_eq!(fs.write(fd, b"x"), Err(FsError::InvalidParameter));
        assert_eq!(fs.open("ro", MB_WRITE), Err(FsError::NotSupported));
        assert_eq!(fs.unlink("ro"), Err(FsError::NotSupported));
        fs.close(fd).unwrap();
        assert_eq!(fs.close(fd), Err(FsError::InvalidParameter));
        assert_eq!(fs.read(7, &mut [0u8; 1]), Err(FsError::InvalidParameter));
    }

    #[test]
    fn fd_exhaustion() {
        let (_, mut fs) = mount();
        let fds: Vec<usize> = (0..MAX_FD)
            .map(|i| fs.open(&format!("f{}", i), MB_CREAT).unwrap())
            .collect();
        assert_eq!(fds, (0..MAX_FD).collect::<Vec<_>>());
        assert_eq!(fs.open("extra", MB_CREAT), Err(FsError::NoResources));
        fs.close(1).unwrap();
        assert_eq!(fs.open("extra", MB_CREAT).unwrap(), 1);
    }

    #[test]
    fn entry_exhaustion() {
        let (_, mut fs) = mount();
        for i in 0..NO_MBR_ENTRIES - 1 {
            let fd = fs.open(&format!("e{}", i), MB_CREAT).unwrap();
            fs.close(fd).unwrap();
        }
        assert_eq!(fs.open("last", MB_CREAT), Err(FsError::NoResources));
    }

    #[test]
    fn blocks_are_conserved() {
        let (_, mut fs) = mount();
        let check = |fs: &TinyFs| {
            assert_eq!(
                fs.free_blocks().unwrap() + fs.allocated_blocks().unwrap(),
                DATA_BLOCK_COUNT
            );
        };
        let payload = vec![0x5Au8; 2 * PAGE_SIZE + 10];
        for name in ["a", "b", "c"] {
            let fd = fs.open(name, MB_CREAT | MB_WRITE).unwrap();
            fs.write(fd, &payload).unwrap();
            fs.close(fd).unwrap();
            check(&fs);
        }
        assert_eq!(fs.allocated_blocks().unwrap(), 9);
        fs.unlink("b").unwrap();
        check(&fs);
        assert_eq!(fs.open("b", MB_READ), Err(FsError::InvalidParameter));

        // freed blocks are handed out again, last in first out
        let fd = fs.open("d", MB_CREAT | MB_WRITE | MB_READ).unwrap();
        fs.write(fd, &vec![0x11u8; PAGE_SIZE * 4]).unwrap();
        check(&fs);
        fs.seek(fd, 0, Whence::Set).unwrap();
        let mut back = vec![0u8; PAGE_SIZE * 4];
        fs.read(fd, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0x11));
        fs.close(fd).unwrap();
        fs.unlink("a").unwrap();
        fs.unlink("c").unwrap();
        fs.unlink("d").unwrap();
        assert_eq!(fs.free_blocks().unwrap(), DATA_BLOCK_COUNT);
    }

    #[test]
    fn out_of_blocks_is_a_short_write() {
        let (_, mut fs) = mount();
        let fd = fs.open("hog", MB_CREAT | MB_WRITE).unwrap();
        let all = vec![1u8; DATA_BLOCK_COUNT * PAGE_SIZE];
        assert_eq!(fs.write(fd, &all).unwrap(), all.len());
        assert_eq!(fs.write(fd, b"more"), Err(FsError::NoResources));
        fs.close(fd).unwrap();
        let fd = fs.open("other", MB_CREAT | MB_WRITE).unwrap();
        assert_eq!(fs.write(fd, b"x"), Err(FsError::NoResources));
    }

    #[test]
    fn flash_failure_keeps_written_prefix() {
        let (dev, mut fs) = mount();
        let fd = fs.open("torn", MB_CREAT | MB_WRITE | MB_READ).unwrap();
        fs.write(fd, &vec![3u8; 100]).unwrap();
        // the rest of block 0 and the free-list pop succeed, attaching block 1 fails
        dev.fail_burns(((PAGE_SIZE - 100) / 4 + 1) as u64, 1);
        let n = fs.write(fd, &vec![4u8; 2 * PAGE_SIZE]).unwrap();
        assert_eq!(n, PAGE_SIZE - 100);
        assert_eq!(fs.len(fd).unwrap(), PAGE_SIZE as u32);
        assert_eq!(fs.seek(fd, 0, Whence::Cur).unwrap(), PAGE_SIZE as u32);
        fs.close(fd).unwrap();

        let fd = fs.open("torn", MB_READ).unwrap();
        assert_eq!(fs.len(fd).unwrap(), PAGE_SIZE as u32);
        let mut back = vec![0u8; PAGE_SIZE];
        fs.read(fd, &mut back).unwrap();
        assert!(back[..100].iter().all(|&b| b == 3));
        assert!(back[100..].iter().all(|&b| b == 4));
    }

    #[test]
    fn failed_size_update_is_still_a_short_write() {
        let (dev, mut fs) = mount();
        let fd = fs.open("late", MB_CREAT | MB_WRITE | MB_READ).unwrap();
        // pop, attach and three data words go through; staging the new size fails
        dev.fail_burns(5, 1);
        assert_eq!(fs.write(fd, b"0123456789").unwrap(), 10);
        assert_eq!(fs.seek(fd, 0, Whence::Cur).unwrap(), 10);
        assert_eq!(fs.len(fd).unwrap(), 10);
        fs.close(fd).unwrap();

        let fd = fs.open("late", MB_READ).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"0123456789");
    }
}
