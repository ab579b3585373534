use crate::error::Error;
use alloc::string::String;

/// Why values are exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ExportTarget {
    /// Values are written to the save destination.
    Persist,
    /// Values are displayed, e.g. by a shell.
    Show,
}

/// Owner of the subtree of settings below [`Handler::name`].
///
/// Every capability is optional, the default implementations report [`Error::Unsupported`].
/// Methods take `&self` because a handler is usually a long lived object shared with the
/// subsystem it configures; use `Cell` or `RefCell` for the values.
///
/// `args` are the segments of the setting name after the handler name, so for `myfoo/mybar` the
/// handler `myfoo` is called with `["mybar"]`.
pub trait Handler {
    fn name(&self) -> &str;

    fn get(&self, args: &[&str]) -> Result<String, Error> {
        let _ = args;
        Err(Error::Unsupported)
    }

    /// Applies a value. `None` means the setting was deleted. Values are staged until
    /// [`Handler::commit`] is called.
    fn set(&self, args: &[&str], value: Option<&str>) -> Result<(), Error> {
        let _ = (args, value);
        Err(Error::Unsupported)
    }

    /// Activates all values applied since the last commit.
    fn commit(&self) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Calls `emit` with the full name and value of every setting of this handler.
    fn export(
        &self,
        emit: &mut dyn FnMut(&str, Option<&str>),
        target: ExportTarget,
    ) -> Result<(), Error> {
        let _ = (emit, target);
        Err(Error::Unsupported)
    }
}
