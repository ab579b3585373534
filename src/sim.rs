//! A RAM backed NOR flash.
//!
//! The simulator enforces the rules real NOR parts impose on their users: programming can only
//! clear bits, only an erase sets them again, and both operations have to be aligned to the
//! program and erase unit respectively. On top of that it can model wear, transient bit errors
//! and operation timing, and it keeps counters of everything it did.

use crate::error::FlashError;
use crate::fault::{FaultPolicy, NoFaults};
use crate::platform::{Crc, FlashPages, PageLayout, WriteProtect};
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use core::str::FromStr;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};
use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};
use strum::IntoEnumIterator;

/// Fill byte of an erase unit that exceeded its erase cycle budget.
pub const WORN_PATTERN: u8 = 0x0F;

/// Fill byte of the region hit by a simulated erase failure.
pub const FAILED_ERASE_PATTERN: u8 = 0x55;

const ERASED: u8 = 0xFF;

/// Minimum duration of each operation, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timing {
    pub read_us: u32,
    pub write_us: u32,
    pub erase_us: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Number of erase units of the device.
    pub units: usize,
    /// Allow programming units that are not erased. The result is the AND of old and new data.
    pub allow_double_writes: bool,
    /// Write protection blocks erase too, not only program operations.
    pub erase_protect: bool,
    /// Erase units erased more often than this return unreliable data.
    pub max_erase_cycles: Option<u32>,
    /// Probability, in parts per thousand, that a read returns one flipped byte.
    pub read_failure_rate_pm: u16,
    /// Probability, in parts per thousand, that a write programs one flipped byte.
    pub write_failure_rate_pm: u16,
    /// Probability, in parts per thousand, that an erase leaves a region in `FAILED_ERASE_PATTERN`.
    pub erase_failure_rate_pm: u16,
    pub timing: Option<Timing>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            units: 16,
            allow_double_writes: false,
            erase_protect: true,
            max_erase_cycles: None,
            read_failure_rate_pm: 0,
            write_failure_rate_pm: 0,
            erase_failure_rate_pm: 0,
            timing: None,
        }
    }
}

impl SimulatorConfig {
    pub fn with_units(units: usize) -> Self {
        Self {
            units,
            ..Default::default()
        }
    }
}

/// Names of the global counters as reported by [`SimStatistics::counters`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::Display,
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[strum(serialize_all = "snake_case")]
pub enum Counter {
    BytesRead,
    BytesWritten,
    DoubleWrites,
    FlashReadCalls,
    FlashReadTimeUs,
    FlashWriteCalls,
    FlashWriteTimeUs,
    FlashEraseCalls,
    FlashEraseTimeUs,
}

const ERASE_CYCLES_PREFIX: &str = "erase_cycles_unit";
const DIRTY_READ_PREFIX: &str = "dirty_read_unit";

/// Wrapping 32-bit counters, one set per simulator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimStatistics {
    pub bytes_read: u32,
    pub bytes_written: u32,
    pub double_writes: u32,
    pub flash_read_calls: u32,
    pub flash_read_time_us: u32,
    pub flash_write_calls: u32,
    pub flash_write_time_us: u32,
    pub flash_erase_calls: u32,
    pub flash_erase_time_us: u32,
    /// Indexed by erase unit.
    pub erase_cycles: Vec<u32>,
    /// Indexed by erase unit.
    pub dirty_reads: Vec<u32>,
}

impl SimStatistics {
    fn new(units: usize) -> Self {
        Self {
            erase_cycles: vec![0; units],
            dirty_reads: vec![0; units],
            ..Default::default()
        }
    }

    pub fn get(&self, counter: Counter) -> u32 {
        match counter {
            Counter::BytesRead => self.bytes_read,
            Counter::BytesWritten => self.bytes_written,
            Counter::DoubleWrites => self.double_writes,
            Counter::FlashReadCalls => self.flash_read_calls,
            Counter::FlashReadTimeUs => self.flash_read_time_us,
            Counter::FlashWriteCalls => self.flash_write_calls,
            Counter::FlashWriteTimeUs => self.flash_write_time_us,
            Counter::FlashEraseCalls => self.flash_erase_calls,
            Counter::FlashEraseTimeUs => self.flash_erase_time_us,
        }
    }

    /// Looks up a counter by name, e.g. `bytes_written` or `erase_cycles_unit3`.
    pub fn counter(&self, name: &str) -> Option<u32> {
        if let Ok(counter) = Counter::from_str(name) {
            return Some(self.get(counter));
        }
        if let Some(unit) = name.strip_prefix(ERASE_CYCLES_PREFIX) {
            return unit
                .parse::<usize>()
                .ok()
                .and_then(|unit| self.erase_cycles.get(unit).copied());
        }
        if let Some(unit) = name.strip_prefix(DIRTY_READ_PREFIX) {
            return unit
                .parse::<usize>()
                .ok()
                .and_then(|unit| self.dirty_reads.get(unit).copied());
        }
        None
    }

    /// All counters with their names, global counters first.
    pub fn counters(&self) -> Vec<(String, u32)> {
        let mut all: Vec<(String, u32)> = Counter::iter()
            .map(|c| (String::from(<&'static str>::from(c)), self.get(c)))
            .collect();
        for (unit, &cycles) in self.erase_cycles.iter().enumerate() {
            all.push((format!("{ERASE_CYCLES_PREFIX}{unit}"), cycles));
        }
        for (unit, &reads) in self.dirty_reads.iter().enumerate() {
            all.push((format!("{DIRTY_READ_PREFIX}{unit}"), reads));
        }
        all
    }
}

/// A NOR flash of `units` erase units of `ERASE_UNIT` bytes, programmable in `PROGRAM_UNIT`
/// byte chunks.
pub struct FlashSimulator<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize, P = NoFaults>
where
    P: FaultPolicy,
{
    buf: Vec<u8>,
    config: SimulatorConfig,
    faults: P,
    write_protected: bool,
    layout: [FlashPages; 1],
    stats: SimStatistics,
}

impl<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize>
    FlashSimulator<PROGRAM_UNIT, ERASE_UNIT, NoFaults>
{
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_faults(config, NoFaults)
    }
}

impl<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize, P: FaultPolicy>
    FlashSimulator<PROGRAM_UNIT, ERASE_UNIT, P>
{
    const GEOMETRY_OK: () = assert!(
        PROGRAM_UNIT > 0 && ERASE_UNIT > 0 && ERASE_UNIT.is_multiple_of(PROGRAM_UNIT),
        "erase unit must be a multiple of the program unit"
    );

    pub fn with_faults(config: SimulatorConfig, faults: P) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::GEOMETRY_OK;

        Self {
            buf: vec![ERASED; config.units * ERASE_UNIT],
            layout: [FlashPages {
                count: config.units,
                size: ERASE_UNIT,
            }],
            stats: SimStatistics::new(config.units),
            config,
            faults,
            write_protected: false,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn statistics(&self) -> &SimStatistics {
        &self.stats
    }

    /// Shortcut for `statistics().counter(name)`.
    pub fn counter(&self, name: &str) -> Option<u32> {
        self.stats.counter(name)
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    /// Raw view of the whole device, bypassing all checks and counters.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn range(&self, offset: u32, len: usize) -> Result<Range<usize>, FlashError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(FlashError::OutOfRange)?;
        if end > self.buf.len() {
            return Err(FlashError::OutOfRange);
        }
        Ok(start..end)
    }

    fn busy_wait(time_us: u32) {
        #[cfg(feature = "std")]
        std::thread::sleep(std::time::Duration::from_micros(time_us as u64));
        #[cfg(not(feature = "std"))]
        let _ = time_us;
    }

    fn read_checked(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(offset, bytes.len())?;

        self.stats.flash_read_calls = self.stats.flash_read_calls.wrapping_add(1);
        bytes.copy_from_slice(&self.buf[range.clone()]);

        if let Some(max_cycles) = self.config.max_erase_cycles
            && !range.is_empty()
        {
            for unit in range.start / ERASE_UNIT..range.end.div_ceil(ERASE_UNIT) {
                if self.stats.erase_cycles[unit] <= max_cycles {
                    continue;
                }
                let start = range.start.max(unit * ERASE_UNIT);
                let end = range.end.min((unit + 1) * ERASE_UNIT);
                let i = start - range.start + self.faults.pick(end - start);
                bytes[i] = !bytes[i];
                self.stats.dirty_reads[unit] = self.stats.dirty_reads[unit].wrapping_add(1);

                #[cfg(feature = "defmt")]
                warn!("read: dirty read in worn unit {}", unit);
            }
        }

        if !bytes.is_empty() && self.faults.should_fail(self.config.read_failure_rate_pm) {
            let i = self.faults.pick(bytes.len());
            bytes[i] = !bytes[i];
        }

        self.stats.bytes_read = self.stats.bytes_read.wrapping_add(bytes.len() as u32);
        if let Some(timing) = self.config.timing {
            Self::busy_wait(timing.read_us);
            self.stats.flash_read_time_us = self.stats.flash_read_time_us.wrapping_add(timing.read_us);
        }
        Ok(())
    }

    fn write_checked(&mut self, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        #[cfg(feature = "defmt")]
        trace!("write @{:#08x}: [{}]", offset, bytes.len());

        let range = self.range(offset, bytes.len())?;
        if !range.start.is_multiple_of(PROGRAM_UNIT) || !bytes.len().is_multiple_of(PROGRAM_UNIT) {
            return Err(FlashError::NotAligned);
        }
        if self.write_protected {
            return Err(FlashError::Protected);
        }

        self.stats.flash_write_calls = self.stats.flash_write_calls.wrapping_add(1);

        let dirty_units = self.buf[range.clone()]
            .chunks(PROGRAM_UNIT)
            .filter(|unit| unit.iter().any(|&b| b != ERASED))
            .count();
        if dirty_units > 0 {
            self.stats.double_writes = self.stats.double_writes.wrapping_add(dirty_units as u32);
            if !self.config.allow_double_writes {
                #[cfg(feature = "debug-logs")]
                println!("  sim: double write @{offset:#08x}, {dirty_units} unit(s)");

                return Err(FlashError::DoubleWrite);
            }
        }

        let corrupted = (!bytes.is_empty()
            && self.faults.should_fail(self.config.write_failure_rate_pm))
        .then(|| self.faults.pick(bytes.len()));

        for (i, (dst, &src)) in self.buf[range].iter_mut().zip(bytes).enumerate() {
            let src = if corrupted == Some(i) { !src } else { src };
            // NOR programming only pulls bits to zero
            *dst &= src;
        }

        self.stats.bytes_written = self.stats.bytes_written.wrapping_add(bytes.len() as u32);
        if let Some(timing) = self.config.timing {
            Self::busy_wait(timing.write_us);
            self.stats.flash_write_time_us =
                self.stats.flash_write_time_us.wrapping_add(timing.write_us);
        }
        Ok(())
    }

    fn erase_checked(&mut self, from: u32, to: u32) -> Result<(), FlashError> {
        #[cfg(feature = "defmt")]
        trace!("erase {:#08x} - {:#08x}", from, to);

        if to < from {
            return Err(FlashError::OutOfRange);
        }
        let range = self.range(from, (to - from) as usize)?;
        if !range.start.is_multiple_of(ERASE_UNIT) || !range.len().is_multiple_of(ERASE_UNIT) {
            return Err(FlashError::NotAligned);
        }
        if self.config.erase_protect && self.write_protected {
            return Err(FlashError::Protected);
        }

        self.stats.flash_erase_calls = self.stats.flash_erase_calls.wrapping_add(1);

        for unit in range.start / ERASE_UNIT..range.end / ERASE_UNIT {
            let cycles = self.stats.erase_cycles[unit].wrapping_add(1);
            self.stats.erase_cycles[unit] = cycles;

            let pattern = match self.config.max_erase_cycles {
                Some(max_cycles) if cycles > max_cycles => WORN_PATTERN,
                _ => ERASED,
            };
            self.buf[unit * ERASE_UNIT..(unit + 1) * ERASE_UNIT].fill(pattern);
        }

        if !range.is_empty() && self.faults.should_fail(self.config.erase_failure_rate_pm) {
            let start = self.faults.pick(range.len());
            let len = 1 + self.faults.pick(range.len() - start);
            let failed = range.start + start..range.start + start + len;

            #[cfg(feature = "defmt")]
            warn!("erase: simulated failure {:#08x}[{}]", failed.start, len);

            self.buf[failed].fill(FAILED_ERASE_PATTERN);
        }

        if let Some(timing) = self.config.timing {
            Self::busy_wait(timing.erase_us);
            self.stats.flash_erase_time_us =
                self.stats.flash_erase_time_us.wrapping_add(timing.erase_us);
        }
        Ok(())
    }
}

impl<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize, P: FaultPolicy> ErrorType
    for FlashSimulator<PROGRAM_UNIT, ERASE_UNIT, P>
{
    type Error = FlashError;
}

impl<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize, P: FaultPolicy> ReadNorFlash
    for FlashSimulator<PROGRAM_UNIT, ERASE_UNIT, P>
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.read_checked(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize, P: FaultPolicy> NorFlash
    for FlashSimulator<PROGRAM_UNIT, ERASE_UNIT, P>
{
    const WRITE_SIZE: usize = PROGRAM_UNIT;
    const ERASE_SIZE: usize = ERASE_UNIT;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.erase_checked(from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.write_checked(offset, bytes)
    }
}

impl<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize, P: FaultPolicy> WriteProtect
    for FlashSimulator<PROGRAM_UNIT, ERASE_UNIT, P>
{
    fn set_write_protection(&mut self, enabled: bool) {
        self.write_protected = enabled;
    }
}

impl<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize, P: FaultPolicy> PageLayout
    for FlashSimulator<PROGRAM_UNIT, ERASE_UNIT, P>
{
    fn page_layout(&self) -> &[FlashPages] {
        &self.layout
    }
}

impl<const PROGRAM_UNIT: usize, const ERASE_UNIT: usize, P: FaultPolicy> Crc
    for FlashSimulator<PROGRAM_UNIT, ERASE_UNIT, P>
{
    fn crc32(init: u32, data: &[u8]) -> u32 {
        crate::crc::crc32(init, data)
    }
}
