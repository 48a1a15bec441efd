//! 进程内唯一的默认文件系统.
//!
//! 第一个通过 [`install`] 登记的 [`Mbfs`] 成为默认实例,
//! 之后的登记不会替换它, 除非先调用 [`clear`].

use std::sync::Arc;

use lazy_static::*;
use log::info;
use spin::Mutex;

use super::{FlashDevice, FsResult, Mbfs};

lazy_static! {
    static ref DEFAULT_FILE_SYSTEM: Mutex<Option<Arc<Mutex<Mbfs>>>> = Mutex::new(None);
}

/// 登记 `fs`. 若它成为了默认实例则返回 true.
pub fn install(fs: Arc<Mutex<Mbfs>>) -> bool {
    let mut slot = DEFAULT_FILE_SYSTEM.lock();
    if slot.is_some() {
        return false;
    }
    info!("registered default filesystem");
    *slot = Some(fs);
    true
}

/// 挂载一个文件系统并尝试登记为默认实例
pub fn mount_default(
    device: Arc<dyn FlashDevice>,
    flash_start: usize,
    flash_pages: usize,
) -> FsResult<Arc<Mutex<Mbfs>>> {
    let fs = Arc::new(Mutex::new(Mbfs::mount(device, flash_start, flash_pages)?));
    install(fs.clone());
    Ok(fs)
}

pub fn default_fs() -> Option<Arc<Mutex<Mbfs>>> {
    DEFAULT_FILE_SYSTEM.lock().clone()
}

/// 取消登记并返回原来的默认实例
pub fn clear() -> Option<Arc<Mutex<Mbfs>>> {
    DEFAULT_FILE_SYSTEM.lock().take()
}
