//! 两种文件系统共用的 POSIX 风格调用接口

use log::debug;

use super::{FsError, FsResult, MB_CREAT, MB_READ, MB_SEEK_CUR, MB_SEEK_END, MB_SEEK_SET, MB_WRITE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    /// 由 `MB_SEEK_*` 标志得到
    pub fn from_flags(flags: u8) -> FsResult<Self> {
        match flags {
            MB_SEEK_SET => Ok(Whence::Set),
            MB_SEEK_CUR => Ok(Whence::Cur),
            MB_SEEK_END => Ok(Whence::End),
            _ => Err(FsError::InvalidParameter),
        }
    }

    /// 计算新的绝对位置, 结果必须落在 `[0, length]` 内
    pub fn resolve(self, offset: i32, seek: u32, length: u32) -> FsResult<u32> {
        let base = match self {
            Whence::Set => 0,
            Whence::Cur => seek as i64,
            Whence::End => length as i64,
        };
        let position = base + offset as i64;
        if position < 0 || position > length as i64 {
            return Err(FsError::InvalidParameter);
        }
        Ok(position as u32)
    }
}

pub trait FileStorage {
    fn open(&mut self, name: &str, flags: u32) -> FsResult<usize>;
    fn close(&mut self, fd: usize) -> FsResult<()>;
    fn seek(&mut self, fd: usize, offset: i32, whence: Whence) -> FsResult<u32>;
    fn read(&mut self, fd: usize, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&mut self, fd: usize, buf: &[u8]) -> FsResult<usize>;
    /// Positional write. `offset` may lie past the end of the file; the gap is
    /// filled with zeros.
    fn write_at(&mut self, fd: usize, offset: u32, buf: &[u8]) -> FsResult<usize>;
    fn remove(&mut self, name: &str) -> FsResult<()>;
}

/// 读出整个文件
pub fn read_file<S: FileStorage + ?Sized>(fs: &mut S, name: &str) -> FsResult<Vec<u8>> {
    let fd = fs.open(name, MB_READ)?;
    let mut data = Vec::new();
    let mut chunk = [0u8; 128];
    let result = loop {
        match fs.read(fd, &mut chunk) {
            Ok(0) => break Ok(()),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) => break Err(e),
        }
    };
    fs.close(fd)?;
    result.map(|_| data)
}

/// 用 `data` 替换文件内容, 文件不存在时创建. 返回写入的字节数.
pub fn write_file<S: FileStorage + ?Sized>(fs: &mut S, name: &str, data: &[u8]) -> FsResult<usize> {
    match fs.remove(name) {
        Ok(()) => debug!("replacing {}", name),
        Err(FsError::InvalidParameter) => {}
        Err(e) => return Err(e),
    }
    let fd = fs.open(name, MB_CREAT | MB_WRITE)?;
    let mut written = 0;
    let result = loop {
        if written == data.len() {
            break Ok(());
        }
        match fs.write(fd, &data[written..]) {
            Ok(0) => break Err(FsError::NoResources),
            Ok(n) => written += n,
            Err(e) => break Err(e),
        }
    };
    fs.close(fd)?;
    result.map(|_| written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve() {
        assert_eq!(Whence::from_flags(MB_SEEK_END), Ok(Whence::End));
        assert_eq!(Whence::from_flags(3), Err(FsError::InvalidParameter));
        assert_eq!(Whence::End.resolve(-1, 0, 10), Ok(9));
        assert_eq!(Whence::Cur.resolve(2, 3, 10), Ok(5));
        assert_eq!(Whence::Set.resolve(11, 0, 10), Err(FsError::InvalidParameter));
        assert_eq!(Whence::Cur.resolve(-4, 3, 10), Err(FsError::InvalidParameter));
    }
}
