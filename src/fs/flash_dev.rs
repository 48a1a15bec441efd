//! 闪存设备接口层: 文件系统唯一依赖的硬件原语.
//!
//! 与块设备不同, NOR 闪存可以按字节直接读取, 但写入只能把位从 1 清为 0,
//! 想把 0 变回 1 只能以页 ([`PAGE_SIZE`](super::PAGE_SIZE)) 为单位整体擦除.
//! 上层的写入引擎 [`Flash`](super::Flash) 负责隐藏这个限制.
//!
//! 地址空间是扁平的: 地址 0 是设备的第一个字节.

use std::any::Any;

use super::FlashError;

pub trait FlashDevice: Send + Sync + Any {
    /// 设备总字节数, 是 `PAGE_SIZE` 的整数倍
    fn capacity(&self) -> usize;

    /// 固件 (代码 + 静态数据) 在闪存中结束的位置.
    /// 文件系统在未指定起始地址时会占用其后的第一个整页.
    fn code_end(&self) -> usize {
        0
    }

    /// 从 `address` 开始读取 `buf.len()` 个字节
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), FlashError>;

    /// 把 `page_address` 开始的一整页置为 0xFF
    fn erase_page(&self, page_address: usize) -> Result<(), FlashError>;

    /// 从字对齐的 `word_address` 开始烧写若干个字.
    /// 烧写只能清除位: 结果等于原值与新值按位与.
    fn burn(&self, word_address: usize, words: &[u32]) -> Result<(), FlashError>;
}
