#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

pub mod crc;
pub mod error;
pub mod fault;
pub mod fcb;
pub mod handler;
pub mod line;
pub mod name;
pub mod platform;
mod raw;
pub mod sim;
pub mod store;
pub mod timeslot;
pub mod value;

extern crate alloc;

pub use error::{Error, FlashError};
pub use fcb::{EntryLocation, Fcb, FcbConfig};
pub use handler::{ExportTarget, Handler};
pub use line::MAX_VAL_LEN;
pub use name::{MAX_DIR_DEPTH, MAX_NAME_LEN, Name};
pub use raw::{DEFAULT_MAGIC, DEFAULT_VERSION, MAX_ENTRY_LEN};
pub use sim::{FlashSimulator, SimulatorConfig};
pub use store::Store;

use alloc::string::String;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Registry of setting handlers together with the stores they are loaded from and saved to.
///
/// All links are borrowed: handlers and stores are owned by the subsystems using them and have
/// to outlive the registry. Independent registries can coexist, e.g. one per test.
#[derive(Default)]
pub struct Settings<'a> {
    // most recently registered first
    handlers: Vec<&'a dyn Handler>,
    sources: Vec<&'a dyn Store>,
    destination: Option<&'a dyn Store>,
}

impl<'a> Settings<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler. Names are unique, registering a second handler with the same name fails
    /// with [`Error::AlreadyRegistered`].
    pub fn register(&mut self, handler: &'a dyn Handler) -> Result<(), Error> {
        if self.lookup(handler.name()).is_some() {
            return Err(Error::AlreadyRegistered);
        }
        self.handlers.insert(0, handler);
        Ok(())
    }

    /// Adds a store to load from. Sources are loaded in registration order.
    pub fn register_source(&mut self, store: &'a dyn Store) {
        self.sources.push(store);
    }

    /// Sets the store `save` writes to, replacing the previous one.
    pub fn register_destination(&mut self, store: &'a dyn Store) {
        self.destination = Some(store);
    }

    pub fn lookup(&self, root: &str) -> Option<&'a dyn Handler> {
        self.handlers.iter().copied().find(|h| h.name() == root)
    }

    fn resolve<'n>(&self, name: &'n str) -> Result<(&'a dyn Handler, Name<'n>), Error> {
        let name = Name::parse(name)?;
        let handler = self.lookup(name.root()).ok_or(Error::NotFound)?;
        Ok((handler, name))
    }

    /// Passes `value` to the handler owning `name`. The handler only stages the value, it takes
    /// effect on [`Settings::commit`].
    pub fn set_value(&self, name: &str, value: Option<&str>) -> Result<(), Error> {
        let (handler, name) = self.resolve(name)?;
        handler.set(name.args(), value)
    }

    /// Current value of `name`. Fails with [`Error::NotFound`] if no handler owns the name or
    /// the handler cannot report values.
    pub fn get_value(&self, name: &str) -> Result<String, Error> {
        let (handler, name) = self.resolve(name)?;
        match handler.get(name.args()) {
            Err(Error::Unsupported) => Err(Error::NotFound),
            result => result,
        }
    }

    /// Commits the handler owning `name`, or all handlers for `None`. All handlers are committed
    /// even if one fails, the first error is returned.
    pub fn commit(&self, name: Option<&str>) -> Result<(), Error> {
        if let Some(name) = name {
            let (handler, _) = self.resolve(name)?;
            return match handler.commit() {
                Err(Error::Unsupported) => Ok(()),
                result => result,
            };
        }

        let mut result = Ok(());
        for handler in &self.handlers {
            match handler.commit() {
                Ok(()) | Err(Error::Unsupported) => {}
                Err(e) => {
                    #[cfg(feature = "defmt")]
                    warn!("commit: {} failed: {}", handler.name(), e);

                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Replays every source into the handlers, then commits all handlers.
    ///
    /// Records that cannot be applied are skipped. A failing source does not stop the other
    /// sources from loading, its error is returned after the commit.
    pub fn load(&self) -> Result<(), Error> {
        let mut result = Ok(());
        for source in &self.sources {
            let loaded = source.load(&mut |name: &str, value: Option<&str>| {
                if let Err(_e) = self.set_value(name, value) {
                    #[cfg(feature = "defmt")]
                    trace!("load: skipping {}: {}", name, _e);

                    #[cfg(feature = "debug-logs")]
                    println!("Settings: load: skipping {name}: {_e}");
                }
            });
            if let Err(e) = loaded {
                #[cfg(feature = "defmt")]
                warn!("load: source failed: {}", e);

                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        let committed = self.commit(None);
        result.and(committed)
    }

    /// Exports every handler to the destination, skipping values that are already stored.
    ///
    /// All handlers are exported even if one of them or a write fails, the first error is
    /// returned.
    pub fn save(&self) -> Result<(), Error> {
        let destination = self.destination.ok_or(Error::NoDestination)?;
        destination.save_start()?;

        let mut result = Ok(());
        for handler in &self.handlers {
            let mut write_error = None;
            let exported = handler.export(
                &mut |name: &str, value: Option<&str>| {
                    if let Err(e) = Self::store_one(destination, name, value)
                        && write_error.is_none()
                    {
                        write_error = Some(e);
                    }
                },
                ExportTarget::Persist,
            );

            let error = match exported {
                Ok(()) | Err(Error::Unsupported) => write_error,
                Err(e) => Some(e),
            };
            if let Some(e) = error {
                #[cfg(feature = "defmt")]
                warn!("save: {} failed: {}", handler.name(), e);

                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        let finished = destination.save_end();
        result.and(finished)
    }

    /// Writes a single value to the destination unless it is already the stored value.
    pub fn save_one(&self, name: &str, value: Option<&str>) -> Result<(), Error> {
        let destination = self.destination.ok_or(Error::NoDestination)?;
        Self::store_one(destination, name, value)
    }

    fn store_one(destination: &dyn Store, name: &str, value: Option<&str>) -> Result<(), Error> {
        let value = value.filter(|v| !v.is_empty());

        let mut is_dup = false;
        destination.load(&mut |stored_name: &str, stored: Option<&str>| {
            if stored_name == name {
                is_dup = stored == value;
            }
        })?;
        if is_dup {
            #[cfg(feature = "defmt")]
            trace!("save_one: {} unchanged", name);
            return Ok(());
        }

        destination.save(name, value)
    }
}
