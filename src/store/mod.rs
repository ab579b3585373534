//! Persistence backends of the settings.

use crate::error::Error;

mod fcb;
#[cfg(feature = "std")]
mod file;

pub use fcb::FcbStore;
#[cfg(feature = "std")]
pub use file::FileStore;

/// A place settings are loaded from and saved to.
///
/// Stores take `&self` so one instance can be registered both as source and as destination.
/// A store that is entered again while busy reports [`Error::Locked`].
pub trait Store {
    /// Calls `visit` for every persisted record, oldest first. Records that cannot be read or
    /// parsed are skipped.
    fn load(&self, visit: &mut dyn FnMut(&str, Option<&str>)) -> Result<(), Error>;

    /// Called once before the records of a save are written.
    fn save_start(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Appends a record. `None` records the deletion of the setting.
    fn save(&self, name: &str, value: Option<&str>) -> Result<(), Error>;

    /// Called once after all records of a save were written.
    fn save_end(&self) -> Result<(), Error> {
        Ok(())
    }
}
