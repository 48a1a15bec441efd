//! 单个文件的句柄: 构造时打开, 析构时关闭.

use std::sync::Arc;

use log::warn;
use spin::Mutex;

use super::super::{registry, FsError, FsResult, Whence, MB_CREAT, MB_READ, MB_WRITE};
use super::Mbfs;

pub struct File {
    fs: Arc<Mutex<Mbfs>>,
    fd: Option<usize>,
    name: String,
}

impl File {
    /// 以 `flags` 打开 `name`
    pub fn open(fs: Arc<Mutex<Mbfs>>, name: &str, flags: u32) -> FsResult<Self> {
        let fd = fs.lock().open(name, flags)?;
        Ok(Self {
            fs,
            fd: Some(fd),
            name: name.to_string(),
        })
    }

    /// 在默认文件系统上以读写方式打开 `name`, 不存在则创建
    pub fn open_default(name: &str) -> FsResult<Self> {
        let fs = registry::default_fs().ok_or(FsError::NotSupported)?;
        Self::open(fs, name, MB_READ | MB_WRITE | MB_CREAT)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 底层的文件描述符
    pub fn handle(&self) -> FsResult<usize> {
        self.fd.ok_or(FsError::NotSupported)
    }

    pub fn set_position(&mut self, offset: u32) -> FsResult<u32> {
        let fd = self.handle()?;
        let offset = i32::try_from(offset).map_err(|_| FsError::InvalidParameter)?;
        self.fs.lock().seek(fd, offset, Whence::Set)
    }

    pub fn position(&mut self) -> FsResult<u32> {
        let fd = self.handle()?;
        self.fs.lock().seek(fd, 0, Whence::Cur)
    }

    pub fn len(&mut self) -> FsResult<u32> {
        let fd = self.handle()?;
        self.fs.lock().len(fd)
    }

    pub fn is_empty(&mut self) -> FsResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let fd = self.handle()?;
        self.fs.lock().read(fd, buf)
    }

    /// 读一个字节, 到达文件末尾时为 `None`
    pub fn read_byte(&mut self) -> FsResult<Option<u8>> {
        let mut byte = [0u8; 1];
        Ok(match self.read(&mut byte)? {
            0 => None,
            _ => Some(byte[0]),
        })
    }

    pub fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let fd = self.handle()?;
        self.fs.lock().write(fd, buf)
    }

    pub fn write_byte(&mut self, byte: u8) -> FsResult<()> {
        match self.write(&[byte])? {
            1 => Ok(()),
            _ => Err(FsError::NoResources),
        }
    }

    /// 追加到文件末尾, 之后游标停在新的末尾
    pub fn append(&mut self, buf: &[u8]) -> FsResult<usize> {
        let fd = self.handle()?;
        let mut fs = self.fs.lock();
        fs.seek(fd, 0, Whence::End)?;
        fs.write(fd, buf)
    }

    pub fn flush(&mut self) -> FsResult<()> {
        let fd = self.handle()?;
        self.fs.lock().flush(fd)
    }

    pub fn close(mut self) -> FsResult<()> {
        self.release()
    }

    /// 关闭并删除文件
    pub fn remove(mut self) -> FsResult<()> {
        self.release()?;
        self.fs.lock().remove(&self.name)
    }

    fn release(&mut self) -> FsResult<()> {
        match self.fd.take() {
            Some(fd) => self.fs.lock().close(fd),
            None => Ok(()),
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("mbfs: closing {} failed: {}", self.name, e);
        }
    }
}
