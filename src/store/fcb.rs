use crate::error::Error;
use crate::fcb::{Fcb, FcbConfig};
use crate::line::{line_name, make_line, parse_line};
use crate::platform::Platform;
use crate::store::Store;
use core::cell::RefCell;
use core::ops::ControlFlow;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Number of compactions tried before an append gives up with [`Error::StorageFull`].
pub const MAX_APPEND_ATTEMPTS: usize = 10;

/// Stores `name=value` records as entries of a flash circular buffer.
pub struct FcbStore<T: Platform> {
    fcb: RefCell<Fcb<T>>,
}

impl<T: Platform> FcbStore<T> {
    /// Opens the buffer on `hal`.
    ///
    /// A reset during compaction leaves no free sector behind. In that case the partially filled
    /// scratch sector is erased before the store is used, the entries it received are still in
    /// the sector that was being compacted.
    ///
    /// Compaction needs a scratch sector, a `config` without one fails with
    /// [`Error::InvalidSectorLayout`].
    pub fn new(hal: T, config: FcbConfig) -> Result<Self, Error> {
        if config.scratch_count == 0 {
            return Err(Error::InvalidSectorLayout);
        }
        let mut fcb = Fcb::new(hal, config)?;

        for _ in 0..fcb.sector_count() {
            if fcb.free_sector_count() >= 1 {
                break;
            }

            #[cfg(feature = "defmt")]
            warn!("no free sector, erasing sector {}", fcb.active_sector());

            #[cfg(feature = "debug-logs")]
            println!("FcbStore: recovering, erasing sector {}", fcb.active_sector());

            fcb.erase_active()?;
        }
        if fcb.free_sector_count() < 1 {
            return Err(Error::StorageFull);
        }

        Ok(Self {
            fcb: RefCell::new(fcb),
        })
    }

    /// Gives access to the underlying buffer, e.g. to query statistics.
    pub fn with_fcb<R>(&self, f: impl FnOnce(&mut Fcb<T>) -> R) -> Result<R, Error> {
        let mut fcb = self.fcb.try_borrow_mut().map_err(|_| Error::Locked)?;
        Ok(f(&mut fcb))
    }

    pub fn into_inner(self) -> Fcb<T> {
        self.fcb.into_inner()
    }

    fn append(fcb: &mut Fcb<T>, record: &[u8]) -> Result<(), Error> {
        for _attempt in 0..MAX_APPEND_ATTEMPTS {
            match fcb.append(record.len()) {
                Ok(location) => {
                    fcb.write_entry_data(&location, record)?;
                    return fcb.append_finish(&location);
                }
                Err(Error::NoSpace) => {
                    #[cfg(feature = "defmt")]
                    trace!("append: no space, compacting (attempt {})", _attempt);

                    if let Err(_e) = fcb.compact(line_name) {
                        #[cfg(feature = "defmt")]
                        warn!("append: compaction failed: {}", _e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::StorageFull)
    }
}

impl<T: Platform> Store for FcbStore<T> {
    fn load(&self, visit: &mut dyn FnMut(&str, Option<&str>)) -> Result<(), Error> {
        let mut fcb = self.fcb.try_borrow_mut().map_err(|_| Error::Locked)?;
        fcb.walk(|_location, data| {
            let Ok(line) = core::str::from_utf8(data) else {
                #[cfg(feature = "defmt")]
                warn!("load: skipping non utf-8 entry @{:#08x}", _location.offset);
                return ControlFlow::Continue(());
            };
            match parse_line(line) {
                Ok((name, value)) => visit(name, value),
                Err(_e) => {
                    #[cfg(feature = "defmt")]
                    warn!("load: skipping entry @{:#08x}: {}", _location.offset, _e);
                }
            }
            ControlFlow::Continue(())
        })
    }

    fn save(&self, name: &str, value: Option<&str>) -> Result<(), Error> {
        let record = make_line(name, value)?;
        let mut fcb = self.fcb.try_borrow_mut().map_err(|_| Error::Locked)?;
        Self::append(&mut fcb, record.as_bytes())
    }
}
