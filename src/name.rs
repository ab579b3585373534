//! Setting names are `/` separated paths like `myfoo/mybar`. The first segment selects the
//! handler, the remaining segments are passed to it.

use crate::error::Error;

/// Maximum number of segments of a name.
pub const MAX_DIR_DEPTH: usize = 8;

/// Maximum length of a name in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// A parsed name borrowing its segments from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Name<'n> {
    segments: [&'n str; MAX_DIR_DEPTH],
    len: usize,
}

impl<'n> Name<'n> {
    /// Splits `name` on `/`. Empty segments, e.g. from `a//b` or a leading `/`, are skipped.
    pub fn parse(name: &'n str) -> Result<Name<'n>, Error> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }

        let mut segments = [""; MAX_DIR_DEPTH];
        let mut len = 0;
        for segment in name.split('/').filter(|s| !s.is_empty()) {
            if len == MAX_DIR_DEPTH {
                return Err(Error::TooDeep);
            }
            segments[len] = segment;
            len += 1;
        }

        if len == 0 {
            return Err(Error::NotFound);
        }
        Ok(Self { segments, len })
    }

    /// Name of the handler.
    pub fn root(&self) -> &'n str {
        self.segments[0]
    }

    /// Segments after the root.
    pub fn args(&self) -> &[&'n str] {
        &self.segments[1..self.len]
    }

    pub fn segments(&self) -> &[&'n str] {
        &self.segments[..self.len]
    }
}
