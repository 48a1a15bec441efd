use crate::fs::{FlashDevice, FlashError, ERASED_BYTE, PAGE_SIZE, WORD_SIZE};
use spin::Mutex;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

// std::fs::File 可以访问宿主机上的一个文件.
// 我们将它包装成 FlashImage 类型来模拟一块闪存, 为它实现 FlashDevice 接口.
// 烧写需要先读出原值再按位与, 所以每次访问都要先 seek 到目标地址.
pub struct FlashImage {
    file: Mutex<File>,
    capacity: usize,
    code_end: usize,
}

impl FlashImage {
    /// 新建一个全部为 0xFF 的镜像文件, 共 `pages` 页
    pub fn create<P: AsRef<Path>>(path: P, pages: usize, code_end: usize) -> std::io::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let blank = [ERASED_BYTE; PAGE_SIZE];
        for _ in 0..pages {
            f.write_all(&blank)?;
        }
        Ok(Self {
            file: Mutex::new(f),
            capacity: pages * PAGE_SIZE,
            code_end,
        })
    }

    /// 打开已有的镜像文件
    pub fn open<P: AsRef<Path>>(path: P, code_end: usize) -> std::io::Result<Self> {
        let f = OpenOptions::new().read(true).write(true).open(path)?;
        let len = f.metadata()?.len() as usize;
        Ok(Self {
            file: Mutex::new(f),
            capacity: len - len % PAGE_SIZE,
            code_end,
        })
    }
}

impl FlashDevice for FlashImage {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn code_end(&self) -> usize {
        self.code_end
    }

    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(address as u64))
            .and_then(|_| file.read_exact(buf))
            .map_err(|_| FlashError::Read { address })
    }

    fn erase_page(&self, page_address: usize) -> Result<(), FlashError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_address as u64))
            .and_then(|_| file.write_all(&[ERASED_BYTE; PAGE_SIZE]))
            .map_err(|_| FlashError::Erase { page: page_address })
    }

    fn burn(&self, word_address: usize, words: &[u32]) -> Result<(), FlashError> {
        if word_address % WORD_SIZE != 0 {
            return Err(FlashError::Unaligned { address: word_address });
        }
        let err = move |_: std::io::Error| FlashError::Burn { address: word_address };
        let mut file = self.file.lock();
        let mut old = vec![0u8; words.len() * WORD_SIZE];
        file.seek(SeekFrom::Start(word_address as u64)).map_err(err)?;
        file.read_exact(&mut old).map_err(err)?;
        for (chunk, word) in old.chunks_mut(WORD_SIZE).zip(words) {
            for (b, n) in chunk.iter_mut().zip(word.to_le_bytes()) {
                *b &= n;
            }
        }
        file.seek(SeekFrom::Start(word_address as u64)).map_err(err)?;
        file.write_all(&old).map_err(err)
    }
}

struct RamFlashInner {
    data: Vec<u8>,
    erase_counts: Vec<u32>,
    burns: u64,
    /// (从第几次烧写开始, 还要失败几次)
    faults: Option<(u64, u64)>,
}

/// 内存中的闪存模拟器, 记录每页的擦除次数, 并可以在若干次烧写后注入故障.
pub struct RamFlash {
    inner: Mutex<RamFlashInner>,
    code_end: usize,
}

impl RamFlash {
    pub fn new(pages: usize) -> Self {
        Self::with_code_end(pages, 0)
    }

    pub fn with_code_end(pages: usize, code_end: usize) -> Self {
        Self {
            inner: Mutex::new(RamFlashInner {
                data: vec![ERASED_BYTE; pages * PAGE_SIZE],
                erase_counts: vec![0; pages],
                burns: 0,
                faults: None,
            }),
            code_end,
        }
    }

    /// 页 `page` (页号, 不是地址) 被擦除的次数
    pub fn erase_count(&self, page: usize) -> u32 {
        self.inner.lock().erase_counts[page]
    }

    pub fn total_erases(&self) -> u32 {
        self.inner.lock().erase_counts.iter().sum()
    }

    /// 再成功烧写 `after` 次之后, 接下来的 `count` 次烧写失败
    pub fn fail_burns(&self, after: u64, count: u64) {
        let mut inner = self.inner.lock();
        inner.faults = Some((inner.burns + after, count));
    }

    pub fn heal(&self) {
        self.inner.lock().faults = None;
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }
}

impl FlashDevice for RamFlash {
    fn capacity(&self) -> usize {
        self.inner.lock().data.len()
    }

    fn code_end(&self) -> usize {
        self.code_end
    }

    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        let inner = self.inner.lock();
        let src = inner
            .data
            .get(address..address + buf.len())
            .ok_or(FlashError::Read { address })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn erase_page(&self, page_address: usize) -> Result<(), FlashError> {
        let mut inner = self.inner.lock();
        if page_address % PAGE_SIZE != 0 || page_address >= inner.data.len() {
            return Err(FlashError::Erase { page: page_address });
        }
        inner.data[page_address..page_address + PAGE_SIZE].fill(ERASED_BYTE);
        inner.erase_counts[page_address / PAGE_SIZE] += 1;
        Ok(())
    }

    fn burn(&self, word_address: usize, words: &[u32]) -> Result<(), FlashError> {
        if word_address % WORD_SIZE != 0 {
            return Err(FlashError::Unaligned { address: word_address });
        }
        let mut inner = self.inner.lock();
        if word_address + words.len() * WORD_SIZE > inner.data.len() {
            return Err(FlashError::Burn { address: word_address });
        }
        if let Some((at, left)) = inner.faults {
            if inner.burns >= at && left > 0 {
                inner.faults = Some((at, left - 1));
                return Err(FlashError::Burn { address: word_address });
            }
        }
        inner.burns += 1;
        for (i, word) in words.iter().enumerate() {
            let at = word_address + i * WORD_SIZE;
            for (b, n) in inner.data[at..at + WORD_SIZE].iter_mut().zip(word.to_le_bytes()) {
                *b &= n;
            }
        }
        Ok(())
    }
}
