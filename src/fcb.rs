use crate::error::Error;
use crate::platform::{AlignedOps, Platform, Sector};
use crate::raw::{
    self, CRC_SIZE, DEFAULT_MAGIC, DEFAULT_VERSION, LenField, MAX_ENTRY_LEN, SECTOR_HEADER_SIZE,
    SectorHeader,
};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::ControlFlow;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

/// Sectors, identification and the number of sectors kept free for compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FcbConfig {
    pub sectors: Vec<Sector>,
    pub magic: u32,
    pub version: u8,
    pub scratch_count: usize,
}

impl FcbConfig {
    pub fn new(sectors: Vec<Sector>) -> Self {
        Self {
            sectors,
            magic: DEFAULT_MAGIC,
            version: DEFAULT_VERSION,
            scratch_count: 1,
        }
    }
}

/// Position of an entry. Only valid for the buffer that returned it and until its sector is
/// erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EntryLocation {
    /// Index into the configured sectors.
    pub sector: usize,
    /// Flash address of the length field.
    pub offset: u32,
    /// Flash address of the first data byte.
    pub data_offset: u32,
    pub data_len: usize,
}

#[derive(strum::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SectorState {
    /// Erased or not carrying a valid header.
    Free,
    /// Receives appends.
    Active,
    /// Holds entries, no longer appended to.
    Full,
    /// Live entries are being copied out before the sector is erased.
    Reclaiming,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SectorStatistics {
    pub free: u16,
    pub active: u16,
    pub full: u16,
    pub reclaiming: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntryStatistics {
    pub valid: u32,
    pub corrupt: u32,
    pub data_bytes: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FcbStatistics {
    pub sectors: SectorStatistics,
    pub entries: EntryStatistics,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    sector: usize,
    offset: u32,
}

enum Probe {
    Entry { len_bytes: usize, data_len: usize },
    Corrupt { footprint: usize },
    /// No further entry in this sector. `blank` is false if the sector ends in garbage.
    End { blank: bool },
}

enum Step {
    Entry(EntryLocation),
    Corrupt,
    End,
}

/// Append-only log over a ring of sectors.
///
/// Entries are appended to the active sector. Once it is full the next sector in the ring is
/// activated as long as `scratch_count` free sectors remain. Space is reclaimed by
/// [`Fcb::rotate`], which erases the oldest sector, or [`Fcb::compact`], which first copies the
/// entries of the oldest sector that are still live.
pub struct Fcb<T: Platform> {
    pub(crate) hal: T,
    sectors: Vec<Sector>,
    magic: u32,
    version: u8,
    scratch_count: usize,

    // set by scan
    oldest: usize,
    active: usize,
    active_id: u16,
    tail: u32,
    reclaiming: Option<usize>,
}

impl<T: Platform> Fcb<T> {
    /// Reads the header of every sector to restore oldest and active sector and the append
    /// position. A flash without any valid sector is initialized with sector 0 as the active one.
    pub fn new(hal: T, config: FcbConfig) -> Result<Fcb<T>, Error> {
        if config.sectors.len() < 2 || config.scratch_count >= config.sectors.len() {
            return Err(Error::InvalidSectorLayout);
        }
        for sector in &config.sectors {
            if !(sector.offset as usize).is_multiple_of(T::ERASE_SIZE)
                || !(sector.size as usize).is_multiple_of(T::ERASE_SIZE)
                || (sector.size as usize) <= raw::header_footprint::<T>()
                || sector
                    .checked_end()
                    .is_none_or(|end| end as usize > hal.capacity())
            {
                return Err(Error::InvalidSectorLayout);
            }
        }

        let mut fcb = Self {
            hal,
            sectors: config.sectors,
            magic: config.magic,
            version: config.version,
            scratch_count: config.scratch_count,
            oldest: 0,
            active: 0,
            active_id: 0,
            tail: 0,
            reclaiming: None,
        };
        fcb.scan()?;
        Ok(fcb)
    }

    fn scan(&mut self) -> Result<(), Error> {
        let mut newest: Option<(usize, u16)> = None;
        let mut oldest: Option<(usize, u16)> = None;

        for index in 0..self.sectors.len() {
            let Some(header) = self.read_header(index)? else {
                continue;
            };

            #[cfg(feature = "debug-logs")]
            println!("  fcb: sector {index} id {}", header.id);

            if newest.is_none_or(|(_, id)| id_newer(header.id, id)) {
                newest = Some((index, header.id));
            }
            if oldest.is_none_or(|(_, id)| id_newer(id, header.id)) {
                oldest = Some((index, header.id));
            }
        }

        self.reclaiming = None;
        match (oldest, newest) {
            (Some((oldest, _)), Some((active, active_id))) => {
                self.oldest = oldest;
                self.active = active;
                self.active_id = active_id;
                self.tail = self.find_tail(active)?;
            }
            _ => {
                #[cfg(feature = "defmt")]
                trace!("scan: no valid sector, initializing sector 0");

                self.activate(0, 0)?;
                self.oldest = 0;
            }
        }

        #[cfg(feature = "defmt")]
        trace!(
            "scan: oldest {} active {} tail @{:#08x}",
            self.oldest, self.active, self.tail
        );
        Ok(())
    }

    fn read_header(&mut self, index: usize) -> Result<Option<SectorHeader>, Error> {
        let mut raw = [0u8; SECTOR_HEADER_SIZE];
        raw::read_aligned(&mut self.hal, self.sectors[index].offset, &mut raw)?;
        let header = SectorHeader::decode(&raw);
        if header.magic != self.magic {
            return Ok(None);
        }
        if header.version != self.version {
            return Err(Error::VersionMismatch);
        }
        Ok(Some(header))
    }

    fn find_tail(&mut self, index: usize) -> Result<u32, Error> {
        let sector = self.sectors[index];
        let mut offset = self.first_entry_offset(index);
        let mut buf = Vec::new();
        loop {
            match self.probe(offset, sector.end(), &mut buf)? {
                Probe::Entry {
                    len_bytes,
                    data_len,
                } => offset += raw::entry_footprint::<T>(len_bytes, data_len) as u32,
                Probe::Corrupt { footprint } => offset += footprint as u32,
                Probe::End { blank: true } => return Ok(offset),
                // garbage after the last entry, nothing can be appended here anymore
                Probe::End { blank: false } => return Ok(sector.end()),
            }
        }
    }

    fn first_entry_offset(&self, index: usize) -> u32 {
        self.sectors[index].offset + raw::header_footprint::<T>() as u32
    }

    fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.sectors.len()
    }

    fn is_blank(&mut self, index: usize) -> Result<bool, Error> {
        let sector = self.sectors[index];
        let mut buf = [0u8; 64];
        let mut offset = sector.offset;
        while offset < sector.end() {
            let len = buf.len().min((sector.end() - offset) as usize);
            raw::read_aligned(&mut self.hal, offset, &mut buf[..len])?;
            if buf[..len].iter().any(|&b| b != 0xff) {
                return Ok(false);
            }
            offset += len as u32;
        }
        Ok(true)
    }

    /// Makes `index` the active sector, writing a fresh header with `id`.
    fn activate(&mut self, index: usize, id: u16) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("activate: sector {} id {}", index, id);

        #[cfg(feature = "debug-logs")]
        println!("  fcb: activate sector {index} id {id}");

        if !self.is_blank(index)? {
            self.erase_sector(index)?;
        }
        let header = SectorHeader {
            magic: self.magic,
            version: self.version,
            id,
        };
        raw::write_aligned(&mut self.hal, self.sectors[index].offset, &header.encode())?;

        self.active = index;
        self.active_id = id;
        self.tail = self.first_entry_offset(index);
        Ok(())
    }

    /// Activates the sector after the active one if more than `reserve` sectors are free.
    fn new_sector(&mut self, reserve: usize) -> Result<(), Error> {
        if self.free_sector_count() <= reserve {
            return Err(Error::NoSpace);
        }
        self.activate(self.next_index(self.active), self.active_id.wrapping_add(1))
    }

    fn erase_sector(&mut self, index: usize) -> Result<(), Error> {
        let sector = self.sectors[index];

        #[cfg(feature = "defmt")]
        trace!("erase_sector: {} @{:#08x}", index, sector.offset);

        self.hal
            .erase(sector.offset, sector.end())
            .map_err(Error::flash)
    }

    /// Number of sectors between the active and the oldest sector.
    pub fn free_sector_count(&self) -> usize {
        let n = self.sectors.len();
        let used = (self.active + n - self.oldest) % n + 1;
        n - used
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn sector_state(&self, index: usize) -> SectorState {
        let n = self.sectors.len();
        if self.reclaiming == Some(index) {
            SectorState::Reclaiming
        } else if index == self.active {
            SectorState::Active
        } else if (index + n - self.oldest) % n < (self.active + n - self.oldest) % n {
            SectorState::Full
        } else {
            SectorState::Free
        }
    }

    pub fn oldest_sector(&self) -> usize {
        self.oldest
    }

    pub fn active_sector(&self) -> usize {
        self.active
    }

    /// Reserves space for an entry of `len` data bytes and writes its length field.
    ///
    /// The entry stays invisible until the data has been written with
    /// [`Fcb::write_entry_data`] and [`Fcb::append_finish`] has stored its CRC. Fails with
    /// [`Error::NoSpace`] if the active sector is full and no further sector can be activated
    /// without using the scratch reserve.
    pub fn append(&mut self, len: usize) -> Result<EntryLocation, Error> {
        let mut raw_len = [0xffu8; 2];
        let len_bytes = raw::encode_len(len, &mut raw_len)?;
        let footprint = raw::entry_footprint::<T>(len_bytes, len);

        let capacity = self.sectors[self.active].size as usize - raw::header_footprint::<T>();
        if footprint > capacity {
            return Err(Error::ValueTooLong);
        }

        if self.tail as usize + footprint > self.sectors[self.active].end() as usize {
            self.new_sector(self.scratch_count)?;
        }

        let location = EntryLocation {
            sector: self.active,
            offset: self.tail,
            data_offset: self.tail + T::align_write_ceil(len_bytes) as u32,
            data_len: len,
        };

        #[cfg(feature = "defmt")]
        trace!("append: @{:#08x} [{}]", location.offset, len);

        // the slot is consumed even if programming the length fails
        self.tail += footprint as u32;
        raw::write_aligned(&mut self.hal, location.offset, &raw_len[..len_bytes])?;

        Ok(location)
    }

    pub fn write_entry_data(&mut self, location: &EntryLocation, data: &[u8]) -> Result<(), Error> {
        if data.len() != location.data_len {
            return Err(Error::LengthMismatch);
        }
        raw::write_aligned(&mut self.hal, location.data_offset, data)
    }

    /// Seals an entry by writing the CRC over its length field and the data read back from flash.
    pub fn append_finish(&mut self, location: &EntryLocation) -> Result<(), Error> {
        let len_bytes = raw::len_bytes(location.data_len);
        let mut raw_len = [0u8; 2];
        raw::read_aligned(
            &mut self.hal,
            location.offset,
            &mut raw_len[..len_bytes],
        )?;
        let mut data = vec![0u8; location.data_len];
        raw::read_aligned(&mut self.hal, location.data_offset, &mut data)?;

        let crc = T::crc32(T::crc32(0, &raw_len[..len_bytes]), &data);
        let crc_offset = location.data_offset + T::align_write_ceil(location.data_len) as u32;
        raw::write_aligned(&mut self.hal, crc_offset, &crc.to_le_bytes())
    }

    /// Appends a complete entry.
    pub fn append_entry(&mut self, data: &[u8]) -> Result<EntryLocation, Error> {
        let location = self.append(data.len())?;
        self.write_entry_data(&location, data)?;
        self.append_finish(&location)?;
        Ok(location)
    }

    fn probe(&mut self, offset: u32, limit: u32, buf: &mut Vec<u8>) -> Result<Probe, Error> {
        if offset >= limit {
            return Ok(Probe::End { blank: true });
        }

        let mut raw_len = [0xffu8; 2];
        let n = raw_len.len().min((limit - offset) as usize);
        raw::read_aligned(&mut self.hal, offset, &mut raw_len[..n])?;

        let (len_bytes, data_len) = match raw::decode_len(raw_len) {
            LenField::Blank => return Ok(Probe::End { blank: true }),
            LenField::Len { len, bytes } => (bytes, len),
        };
        let footprint = raw::entry_footprint::<T>(len_bytes, data_len);
        if data_len > MAX_ENTRY_LEN || offset as usize + footprint > limit as usize {
            return Ok(Probe::End { blank: false });
        }

        let data_offset = offset + T::align_write_ceil(len_bytes) as u32;
        buf.resize(data_len, 0);
        raw::read_aligned(&mut self.hal, data_offset, buf)?;
        let mut raw_crc = [0u8; CRC_SIZE];
        let crc_offset = data_offset + T::align_write_ceil(data_len) as u32;
        raw::read_aligned(&mut self.hal, crc_offset, &mut raw_crc)?;

        let crc = T::crc32(T::crc32(0, &raw_len[..len_bytes]), buf);
        if crc != u32::from_le_bytes(raw_crc) {
            #[cfg(feature = "defmt")]
            warn!("probe: crc mismatch @{:#08x}", offset);

            return Ok(Probe::Corrupt { footprint });
        }

        Ok(Probe::Entry {
            len_bytes,
            data_len,
        })
    }

    fn start_position(&self) -> Position {
        Position {
            sector: self.oldest,
            offset: self.first_entry_offset(self.oldest),
        }
    }

    fn step(&mut self, pos: &mut Position, buf: &mut Vec<u8>) -> Result<Step, Error> {
        loop {
            let limit = if pos.sector == self.active {
                self.tail
            } else {
                self.sectors[pos.sector].end()
            };

            match self.probe(pos.offset, limit, buf)? {
                Probe::Entry {
                    len_bytes,
                    data_len,
                } => {
                    let location = EntryLocation {
                        sector: pos.sector,
                        offset: pos.offset,
                        data_offset: pos.offset + T::align_write_ceil(len_bytes) as u32,
                        data_len,
                    };
                    pos.offset += raw::entry_footprint::<T>(len_bytes, data_len) as u32;
                    return Ok(Step::Entry(location));
                }
                Probe::Corrupt { footprint } => {
                    pos.offset += footprint as u32;
                    return Ok(Step::Corrupt);
                }
                Probe::End { .. } => {}
            }

            if pos.sector == self.active {
                return Ok(Step::End);
            }
            pos.sector = self.next_index(pos.sector);
            pos.offset = self.first_entry_offset(pos.sector);
        }
    }

    fn next_valid(
        &mut self,
        pos: &mut Position,
        buf: &mut Vec<u8>,
    ) -> Result<Option<EntryLocation>, Error> {
        loop {
            match self.step(pos, buf)? {
                Step::Entry(location) => return Ok(Some(location)),
                Step::Corrupt => continue,
                Step::End => return Ok(None),
            }
        }
    }

    /// Returns the entry following `after`, or the first entry of the oldest sector for `None`.
    ///
    /// Entries with a missing or wrong CRC are skipped.
    pub fn next_entry(
        &mut self,
        after: Option<&EntryLocation>,
    ) -> Result<Option<EntryLocation>, Error> {
        let mut pos = match after {
            None => self.start_position(),
            Some(location) => Position {
                sector: location.sector,
                offset: location.data_offset
                    + T::align_write_ceil(location.data_len) as u32
                    + T::align_write_ceil(CRC_SIZE) as u32,
            },
        };
        let mut buf = Vec::new();
        self.next_valid(&mut pos, &mut buf)
    }

    pub fn read_entry(&mut self, location: &EntryLocation) -> Result<Vec<u8>, Error> {
        let mut data = vec![0u8; location.data_len];
        raw::read_aligned(&mut self.hal, location.data_offset, &mut data)?;
        Ok(data)
    }

    /// Visits every valid entry, oldest sector first and in append order within a sector.
    pub fn walk<F>(&mut self, mut visit: F) -> Result<(), Error>
    where
        F: FnMut(&EntryLocation, &[u8]) -> ControlFlow<()>,
    {
        let mut pos = self.start_position();
        let mut buf = Vec::new();
        while let Some(location) = self.next_valid(&mut pos, &mut buf)? {
            if visit(&location, &buf).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Activates the next sector even if it is part of the scratch reserve.
    pub fn append_to_scratch(&mut self) -> Result<(), Error> {
        self.new_sector(0)
    }

    /// Erases the oldest sector. If it is the active one, the next sector is activated first.
    pub fn rotate(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("rotate: oldest {}", self.oldest);

        if self.oldest == self.active {
            self.new_sector(0)?;
        }
        let oldest = self.oldest;
        self.oldest = self.next_index(oldest);
        self.erase_sector(oldest)
    }

    /// Copies the entries of the oldest sector whose key does not appear again later in the log
    /// into a fresh sector, then erases the oldest sector.
    ///
    /// `key_of` extracts the key of an entry. Entries without a key are dropped.
    pub fn compact(&mut self, key_of: fn(&[u8]) -> Option<&[u8]>) -> Result<(), Error> {
        self.append_to_scratch()?;

        let oldest = self.oldest;
        self.reclaiming = Some(oldest);

        #[cfg(feature = "debug-logs")]
        println!("  fcb: compact sector {oldest}");

        let copied = self.copy_live(oldest, key_of);
        self.reclaiming = None;
        copied?;
        self.rotate()
    }

    fn copy_live(
        &mut self,
        oldest: usize,
        key_of: fn(&[u8]) -> Option<&[u8]>,
    ) -> Result<(), Error> {
        let mut pos = self.start_position();
        let mut buf = Vec::new();
        let mut later_buf = Vec::new();
        while let Some(location) = self.next_valid(&mut pos, &mut buf)? {
            if location.sector != oldest {
                break;
            }
            let Some(key) = key_of(&buf) else {
                continue;
            };

            let mut later = pos;
            let mut superseded = false;
            while self.next_valid(&mut later, &mut later_buf)?.is_some() {
                if key_of(&later_buf) == Some(key) {
                    superseded = true;
                    break;
                }
            }
            if superseded {
                continue;
            }

            if let Err(_e) = self.append_entry(&buf) {
                #[cfg(feature = "defmt")]
                warn!("compact: dropping entry @{:#08x}: {}", location.offset, _e);
            }
        }
        Ok(())
    }

    /// Erases the active sector and restores the state from flash. Used to recover from a reset
    /// during compaction, which leaves the scratch sector partially filled.
    pub fn erase_active(&mut self) -> Result<(), Error> {
        self.erase_sector(self.active)?;
        self.scan()
    }

    pub fn statistics(&mut self) -> Result<FcbStatistics, Error> {
        let mut sectors = SectorStatistics::default();
        for index in 0..self.sectors.len() {
            match self.sector_state(index) {
                SectorState::Free => sectors.free += 1,
                SectorState::Active => sectors.active += 1,
                SectorState::Full => sectors.full += 1,
                SectorState::Reclaiming => sectors.reclaiming += 1,
            }
        }

        let mut entries = EntryStatistics::default();
        let mut pos = self.start_position();
        let mut buf = Vec::new();
        loop {
            match self.step(&mut pos, &mut buf)? {
                Step::Entry(location) => {
                    entries.valid += 1;
                    entries.data_bytes += location.data_len as u32;
                }
                Step::Corrupt => entries.corrupt += 1,
                Step::End => break,
            }
        }

        Ok(FcbStatistics { sectors, entries })
    }

    pub fn flash(&mut self) -> &mut T {
        &mut self.hal
    }

    pub fn into_inner(self) -> T {
        self.hal
    }
}

/// Sector ids wrap around, `a` is newer if it is less than half the id space ahead of `b`.
fn id_newer(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}
