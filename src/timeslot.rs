//! Flash operations in radio timeslots.
//!
//! Programming and erasing stall the CPU, which a radio stack cannot tolerate while it is
//! scheduling connection events. When the [`Timeslot`] scheduler reports radio activity, erase
//! and write requests are split into steps (one erase unit or one word) and executed in the
//! time slices the scheduler grants. An [`Operation`] keeps its progress between slices.

use crate::error::FlashError;
use crate::platform::{Crc, align_ceil};
use core::cell::{Cell, RefCell};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash, check_erase, check_write,
};

/// Deadline of a complete erase or write request, in microseconds.
pub const OPERATION_TIMEOUT_US: u32 = 200_000;

/// Bytes programmed per step of a write.
const WRITE_STEP: usize = 4;

/// Decides when a slice has to be given back.
pub trait Budget {
    /// Called after `steps` steps of the current slice.
    fn exhausted(&mut self, steps: u32) -> bool;
}

/// Runs until the operation is done.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl Budget for Unlimited {
    fn exhausted(&mut self, _steps: u32) -> bool {
        false
    }
}

/// Stops once the next step would likely overrun the slice, estimating a step by the average of
/// the steps so far.
pub struct SliceBudget<'c, C: Timeslot + ?Sized> {
    clock: &'c C,
    start_us: u32,
    slice_us: u32,
}

impl<'c, C: Timeslot + ?Sized> SliceBudget<'c, C> {
    pub fn new(clock: &'c C, slice_us: u32) -> Self {
        Self {
            start_us: clock.now_us(),
            clock,
            slice_us,
        }
    }
}

impl<C: Timeslot + ?Sized> Budget for SliceBudget<'_, C> {
    fn exhausted(&mut self, steps: u32) -> bool {
        let elapsed = self.clock.now_us().wrapping_sub(self.start_us);
        elapsed.saturating_add(elapsed / steps.max(1)) > self.slice_us
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Progress {
    Done,
    /// The budget ran out, call [`Operation::resume`] again in the next slice.
    Pending,
}

/// A resumable erase or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation<'d> {
    /// Erases `[address, end)`, `address` advances by one erase unit per step.
    Erase { address: u32, end: u32 },
    Write { address: u32, data: &'d [u8] },
}

impl<'d> Operation<'d> {
    pub fn erase(from: u32, to: u32) -> Self {
        Operation::Erase {
            address: from,
            end: to,
        }
    }

    pub fn write(offset: u32, data: &'d [u8]) -> Self {
        Operation::Write {
            address: offset,
            data,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Operation::Erase { address, end } => address >= end,
            Operation::Write { data, .. } => data.is_empty(),
        }
    }

    /// Range and alignment of the remaining part against `flash`. A reversed erase range is out
    /// of range.
    pub fn check<F: NorFlash>(&self, flash: &F) -> Result<(), NorFlashErrorKind> {
        match self {
            Operation::Erase { address, end } => check_erase(flash, *address, *end),
            Operation::Write { address, data } => check_write(flash, *address, data.len()),
        }
    }

    /// Executes steps until the operation is done or `budget` is exhausted. A failed step is not
    /// retried, the operation stays at the failed step.
    ///
    /// The remaining part is checked before the first step, a request that is out of range or
    /// not aligned fails without touching the flash.
    pub fn resume<F, B>(&mut self, flash: &mut F, budget: &mut B) -> Result<Progress, FlashError>
    where
        F: NorFlash<Error: Into<FlashError>>,
        B: Budget + ?Sized,
    {
        self.check(&*flash)?;

        let mut steps = 0u32;
        while !self.is_done() {
            match self {
                Operation::Erase { address, end } => {
                    let step = (*end - *address).min(F::ERASE_SIZE as u32);
                    flash
                        .erase(*address, *address + step)
                        .map_err(Into::<FlashError>::into)?;
                    *address += step;
                }
                Operation::Write { address, data } => {
                    let current: &'d [u8] = *data;
                    let step = current.len().min(align_ceil(WRITE_STEP, F::WRITE_SIZE));
                    let (head, rest) = current.split_at(step);
                    flash.write(*address, head).map_err(Into::<FlashError>::into)?;
                    *address += step as u32;
                    *data = rest;
                }
            }
            steps += 1;
            if !self.is_done() && budget.exhausted(steps) {
                return Ok(Progress::Pending);
            }
        }
        Ok(Progress::Done)
    }
}

/// Grants time slices for flash operations.
pub trait Timeslot {
    /// True while the radio needs the CPU, flash operations then only run in granted slices.
    fn is_active(&self) -> bool;

    /// Monotonic wrapping microsecond clock.
    fn now_us(&self) -> u32;

    /// Blocks until a slice is granted, returning its length in microseconds, or returns `None`
    /// if no slice can be granted before `deadline_us`.
    fn wait_for_slice(&mut self, deadline_us: u32) -> Option<u32>;

    /// Returns the slice to the radio.
    fn release_slice(&mut self) {}
}

/// A flash whose erase and write requests yield to the radio.
///
/// Only one erase or write can be in flight. A second request while one is pending fails with
/// [`FlashError::Locked`] instead of waiting. Reads are executed immediately.
pub struct TimeslicedFlash<F, S> {
    flash: RefCell<F>,
    scheduler: RefCell<S>,
    busy: Cell<bool>,
}

impl<F, S> TimeslicedFlash<F, S>
where
    F: NorFlash<Error: Into<FlashError>>,
    S: Timeslot,
{
    pub fn new(flash: F, scheduler: S) -> Self {
        Self {
            flash: RefCell::new(flash),
            scheduler: RefCell::new(scheduler),
            busy: Cell::new(false),
        }
    }

    pub fn into_inner(self) -> (F, S) {
        (self.flash.into_inner(), self.scheduler.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    pub fn read(&self, offset: u32, bytes: &mut [u8]) -> Result<(), FlashError> {
        let mut flash = self.flash.try_borrow_mut().map_err(|_| FlashError::Locked)?;
        flash.read(offset, bytes).map_err(Into::into)
    }

    /// Claims the flash for `operation`. The claim is released when the returned handle drops.
    ///
    /// Fails with [`FlashError::OutOfRange`] or [`FlashError::NotAligned`] before claiming if the
    /// whole request does not fit the flash.
    pub fn submit<'d>(&self, operation: Operation<'d>) -> Result<Pending<'_, 'd, F, S>, FlashError> {
        if self.busy.get() {
            #[cfg(feature = "defmt")]
            warn!("submit: flash busy");

            return Err(FlashError::Locked);
        }
        {
            let flash = self.flash.try_borrow().map_err(|_| FlashError::Locked)?;
            operation.check(&*flash)?;
        }
        self.busy.set(true);
        let started_us = self
            .scheduler
            .try_borrow()
            .map(|s| s.now_us())
            .unwrap_or_default();
        Ok(Pending {
            owner: self,
            operation,
            started_us,
        })
    }

    pub fn erase(&self, from: u32, to: u32) -> Result<(), FlashError> {
        self.submit(Operation::erase(from, to))?.finish()
    }

    pub fn write(&self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.submit(Operation::write(offset, data))?.finish()
    }
}

/// An erase or write holding the flash.
pub struct Pending<'t, 'd, F, S> {
    owner: &'t TimeslicedFlash<F, S>,
    operation: Operation<'d>,
    started_us: u32,
}

impl<'d, F, S> Pending<'_, 'd, F, S>
where
    F: NorFlash<Error: Into<FlashError>>,
    S: Timeslot,
{
    pub fn operation(&self) -> &Operation<'d> {
        &self.operation
    }

    /// Executes as many steps as fit into a slice of `slice_us` microseconds.
    pub fn run_slice(&mut self, slice_us: u32) -> Result<Progress, FlashError> {
        let mut flash = self
            .owner
            .flash
            .try_borrow_mut()
            .map_err(|_| FlashError::Locked)?;
        let scheduler = self
            .owner
            .scheduler
            .try_borrow()
            .map_err(|_| FlashError::Locked)?;
        let mut budget = SliceBudget::new(&*scheduler, slice_us);
        self.operation.resume(&mut *flash, &mut budget)
    }

    /// Drives the operation to completion. Without radio activity it runs in one go, otherwise
    /// slice by slice until done or [`OPERATION_TIMEOUT_US`] after submission.
    pub fn finish(mut self) -> Result<(), FlashError> {
        let is_active = self
            .owner
            .scheduler
            .try_borrow()
            .map_err(|_| FlashError::Locked)?
            .is_active();

        if !is_active {
            let mut flash = self
                .owner
                .flash
                .try_borrow_mut()
                .map_err(|_| FlashError::Locked)?;
            self.operation.resume(&mut *flash, &mut Unlimited)?;
            return Ok(());
        }

        let deadline_us = self.started_us.wrapping_add(OPERATION_TIMEOUT_US);
        loop {
            let granted = self
                .owner
                .scheduler
                .try_borrow_mut()
                .map_err(|_| FlashError::Locked)?
                .wait_for_slice(deadline_us);
            let Some(slice_us) = granted else {
                #[cfg(feature = "defmt")]
                warn!("finish: no slice before deadline");
                return Err(FlashError::Timeout);
            };

            #[cfg(feature = "defmt")]
            trace!("finish: slice of {}us", slice_us);

            let progress = self.run_slice(slice_us);

            let mut scheduler = self
                .owner
                .scheduler
                .try_borrow_mut()
                .map_err(|_| FlashError::Locked)?;
            scheduler.release_slice();

            if progress? == Progress::Done {
                return Ok(());
            }
            if scheduler.now_us().wrapping_sub(self.started_us) >= OPERATION_TIMEOUT_US {
                return Err(FlashError::Timeout);
            }
        }
    }
}

impl<F, S> Drop for Pending<'_, '_, F, S> {
    fn drop(&mut self) {
        self.owner.busy.set(false);
    }
}

impl<F, S> ErrorType for TimeslicedFlash<F, S> {
    type Error = FlashError;
}

impl<F, S> ReadNorFlash for TimeslicedFlash<F, S>
where
    F: NorFlash<Error: Into<FlashError>>,
    S: Timeslot,
{
    const READ_SIZE: usize = F::READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        TimeslicedFlash::read(self, offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.flash.try_borrow().map(|f| f.capacity()).unwrap_or(0)
    }
}

impl<F, S> NorFlash for TimeslicedFlash<F, S>
where
    F: NorFlash<Error: Into<FlashError>>,
    S: Timeslot,
{
    const WRITE_SIZE: usize = F::WRITE_SIZE;
    const ERASE_SIZE: usize = F::ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        TimeslicedFlash::erase(self, from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        TimeslicedFlash::write(self, offset, bytes)
    }
}

impl<F: Crc, S> Crc for TimeslicedFlash<F, S> {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        F::crc32(init, data)
    }
}
