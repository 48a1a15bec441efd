use thiserror::Error;

/// Failures reported by the flash write engine or the device beneath it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    #[error("range {address:#x}+{len} lies outside the flash array")]
    OutOfRange { address: usize, len: usize },
    #[error("address {address:#x} is not aligned")]
    Unaligned { address: usize },
    #[error("page needs an erase but no scratch page was supplied")]
    NoScratch,
    #[error("scratch page {page:#x} is the page being rewritten")]
    ScratchOverlap { page: usize },
    #[error("read failed at {address:#x}")]
    Read { address: usize },
    #[error("burn failed at {address:#x}")]
    Burn { address: usize },
    #[error("erase failed for page {page:#x}")]
    Erase { page: usize },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The file system is not initialised, or the request cannot be honoured
    /// (e.g. the file is already open).
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("no resources available")]
    NoResources,
    #[error("operation cancelled")]
    Cancelled,
    /// No file system could be found on the flash.
    #[error("no data")]
    NoData,
    #[error(transparent)]
    Flash(#[from] FlashError),
}

pub type FsResult<T> = Result<T, FsError>;

pub const MICROBIT_INVALID_PARAMETER: i32 = -1001;
pub const MICROBIT_NOT_SUPPORTED: i32 = -1002;
pub const MICROBIT_NO_RESOURCES: i32 = -1005;
pub const MICROBIT_CANCELLED: i32 = -1007;
pub const MICROBIT_NO_DATA: i32 = -1012;

impl FsError {
    /// The runtime's integer error code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            FsError::NotSupported => MICROBIT_NOT_SUPPORTED,
            FsError::InvalidParameter => MICROBIT_INVALID_PARAMETER,
            FsError::NoResources => MICROBIT_NO_RESOURCES,
            FsError::NoData => MICROBIT_NO_DATA,
            FsError::Cancelled | FsError::Flash(_) => MICROBIT_CANCELLED,
        }
    }
}
