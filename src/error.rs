use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};
use thiserror::Error;

/// Errors reported by a flash device. Every [`NorFlash`](embedded_storage::nor_flash::NorFlash)
/// implementation used with this crate has to be convertible into this type.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum FlashError {
    /// The requested range `[offset, offset + len)` is not inside the device.
    #[error("address out of range")]
    OutOfRange,

    /// Offset or length is not a multiple of the program unit (write) or erase unit (erase).
    #[error("address not aligned")]
    NotAligned,

    /// Write protection is enabled.
    #[error("flash is write protected")]
    Protected,

    /// A program unit in range was not erased and double writes are not allowed.
    #[error("program unit written twice without erase")]
    DoubleWrite,

    /// Another time sliced operation is still in progress.
    #[error("flash operation in progress")]
    Locked,

    /// A time sliced operation did not finish within its deadline.
    #[error("flash operation timed out")]
    Timeout,

    /// Any other error of the underlying driver.
    #[error("flash device error")]
    Device,
}

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            FlashError::OutOfRange => NorFlashErrorKind::OutOfBounds,
            FlashError::NotAligned => NorFlashErrorKind::NotAligned,
            _ => NorFlashErrorKind::Other,
        }
    }
}

impl From<NorFlashErrorKind> for FlashError {
    fn from(kind: NorFlashErrorKind) -> Self {
        match kind {
            NorFlashErrorKind::OutOfBounds => FlashError::OutOfRange,
            NorFlashErrorKind::NotAligned => FlashError::NotAligned,
            _ => FlashError::Device,
        }
    }
}

/// Errors of the flash circular buffer and the settings layer. Marked as non-exhaustive to allow
/// future additions without breaking the API.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The error reported by the underlying flash, passed through unchanged.
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    /// Sectors have to be aligned to the erase unit and at least two sectors are required.
    #[error("invalid sector layout")]
    InvalidSectorLayout,

    /// A sector carries the expected magic but an unknown version.
    #[error("sector version mismatch")]
    VersionMismatch,

    /// The active sector is full and no sector can be activated without touching the scratch
    /// reserve. Compacting the buffer may help.
    #[error("no space left in the circular buffer")]
    NoSpace,

    /// Compaction did not free enough space for the entry.
    #[error("storage full")]
    StorageFull,

    /// Entries are limited to `MAX_ENTRY_LEN` bytes, values to `MAX_VAL_LEN` bytes.
    #[error("value too long")]
    ValueTooLong,

    /// The data passed to `write_entry_data` does not match the reserved length.
    #[error("entry length mismatch")]
    LengthMismatch,

    /// No handler is registered for the name or the handler cannot provide a value.
    #[error("not found")]
    NotFound,

    /// The handler does not know the remaining path of the name.
    #[error("unknown key")]
    UnknownKey,

    /// The value could not be converted to the type of the setting.
    #[error("invalid value")]
    InvalidValue,

    /// Names have at most `MAX_DIR_DEPTH` segments.
    #[error("name too deep")]
    TooDeep,

    /// Names have at most `MAX_NAME_LEN` bytes.
    #[error("name too long")]
    NameTooLong,

    /// A persisted line is not of the form `name=value`.
    #[error("malformed line")]
    MalformedLine,

    /// The handler does not implement the requested capability.
    #[error("not supported")]
    Unsupported,

    /// A handler with the same name is already registered.
    #[error("handler already registered")]
    AlreadyRegistered,

    /// `save` was called without a registered destination.
    #[error("no save destination")]
    NoDestination,

    /// The store is already in use further up the call stack.
    #[error("store locked")]
    Locked,

    /// I/O error of a file backed store.
    #[cfg(feature = "std")]
    #[error("i/o error: {0:?}")]
    Io(#[cfg_attr(feature = "defmt", defmt(Debug2Format))] std::io::ErrorKind),
}

impl Error {
    pub(crate) fn flash<E: Into<FlashError>>(e: E) -> Self {
        Error::Flash(e.into())
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.kind())
    }
}
