use crate::error::FlashError;
use alloc::vec::Vec;
use embedded_storage::nor_flash::NorFlash;

/// A flash usable by the circular buffer. See README.md for an example implementation.
pub trait Platform: Crc + NorFlash<Error: Into<FlashError>> {}

impl<T: Crc + NorFlash<Error: Into<FlashError>>> Platform for T {}

/// CRC-32 (IEEE) as computed by zlib: `crc32(crc32(init, a), b) == crc32(init, a ++ b)`.
pub trait Crc {
    fn crc32(init: u32, data: &[u8]) -> u32;
}

impl<T: Crc> Crc for &mut T {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        T::crc32(init, data)
    }
}

/// Devices that can block program and erase operations.
pub trait WriteProtect {
    /// Idempotent. While enabled, writes fail with [`FlashError::Protected`].
    fn set_write_protection(&mut self, enabled: bool);
}

impl<T: WriteProtect> WriteProtect for &mut T {
    fn set_write_protection(&mut self, enabled: bool) {
        T::set_write_protection(self, enabled)
    }
}

/// `count` consecutive erase units of `size` bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashPages {
    pub count: usize,
    pub size: usize,
}

/// Geometry query used by partitioning logic.
pub trait PageLayout {
    fn page_layout(&self) -> &[FlashPages];
}

impl<T: PageLayout> PageLayout for &mut T {
    fn page_layout(&self) -> &[FlashPages] {
        T::page_layout(self)
    }
}

/// A region of flash used as one sector of a circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sector {
    pub offset: u32,
    pub size: u32,
}

impl Sector {
    /// `count` sectors of `size` bytes, back to back starting at `offset`. Offsets beyond the
    /// address space saturate, such a list is rejected as a layout.
    pub fn uniform(offset: u32, size: u32, count: usize) -> Vec<Sector> {
        (0..count as u32)
            .map(|i| Sector {
                offset: offset.saturating_add(i.saturating_mul(size)),
                size,
            })
            .collect()
    }

    /// First address after the sector, `None` if it does not fit the address space.
    pub(crate) fn checked_end(&self) -> Option<u32> {
        self.offset.checked_add(self.size)
    }

    /// Only valid for sectors of a checked layout.
    pub(crate) fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Splits `[offset, offset + len)` into one sector per erase unit described by `layout`.
///
/// Units that are only partially covered by the range are skipped.
pub fn sectors_in(layout: &[FlashPages], offset: u32, len: u32) -> Vec<Sector> {
    let end = offset.saturating_add(len);
    let mut sectors = Vec::new();
    let mut address = 0u32;
    for pages in layout {
        for _ in 0..pages.count {
            let sector = Sector {
                offset: address,
                size: pages.size as u32,
            };
            let Some(next) = sector.checked_end() else {
                return sectors;
            };
            if sector.offset >= offset && next <= end {
                sectors.push(sector);
            }
            address = next;
        }
    }
    sectors
}

pub trait AlignedOps: Platform {
    fn align_read(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }
}

#[inline(always)]
pub(crate) const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
pub(crate) const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    use crate::error::FlashError;
    use crate::platform::{Crc, FlashPages, PageLayout};
    use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashError, ReadNorFlash};
    use esp_storage::{FlashStorage, FlashStorageError};

    /// Adds the ROM CRC routine and the page layout to the esp-storage driver.
    pub struct EspFlash<'d> {
        inner: FlashStorage<'d>,
        layout: [FlashPages; 1],
    }

    impl<'d> EspFlash<'d> {
        pub fn new(inner: FlashStorage<'d>) -> Self {
            let layout = [FlashPages {
                count: inner.capacity() / FlashStorage::ERASE_SIZE,
                size: FlashStorage::ERASE_SIZE,
            }];
            Self { inner, layout }
        }
    }

    impl From<FlashStorageError> for FlashError {
        fn from(e: FlashStorageError) -> Self {
            e.kind().into()
        }
    }

    impl ErrorType for EspFlash<'_> {
        type Error = FlashStorageError;
    }

    impl NorFlash for EspFlash<'_> {
        const WRITE_SIZE: usize = FlashStorage::WRITE_SIZE;
        const ERASE_SIZE: usize = FlashStorage::ERASE_SIZE;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            self.inner.erase(from, to)
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            self.inner.write(offset, bytes)
        }
    }

    impl ReadNorFlash for EspFlash<'_> {
        const READ_SIZE: usize = FlashStorage::READ_SIZE;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            self.inner.read(offset, bytes)
        }

        fn capacity(&self) -> usize {
            self.inner.capacity()
        }
    }

    impl PageLayout for EspFlash<'_> {
        fn page_layout(&self) -> &[FlashPages] {
            &self.layout
        }
    }

    impl Crc for EspFlash<'_> {
        fn crc32(init: u32, data: &[u8]) -> u32 {
            esp_hal::rom::crc::crc32_le(init, data)
        }
    }
}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
pub use chip::*;
