//! Fault injection for the flash simulator.
//!
//! Production code uses [`NoFaults`], which compiles down to nothing. Tests that want to exercise
//! error paths use [`RandomFaults`] with a fixed seed so failures are reproducible.

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

/// Rates are given in parts per thousand.
pub trait FaultPolicy {
    /// Returns true if an operation configured with `rate_pm` should be corrupted.
    fn should_fail(&mut self, rate_pm: u16) -> bool;

    /// Picks an index in `0..len`. `len` is never zero.
    fn pick(&mut self, len: usize) -> usize;
}

/// Never injects a fault.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultPolicy for NoFaults {
    #[inline(always)]
    fn should_fail(&mut self, _rate_pm: u16) -> bool {
        false
    }

    #[inline(always)]
    fn pick(&mut self, _len: usize) -> usize {
        0
    }
}

/// Injects faults drawn from `R`.
pub struct RandomFaults<R: RngCore> {
    rng: R,
}

impl<R: RngCore> RandomFaults<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RandomFaults<SmallRng> {
    /// Deterministic sequence for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(SmallRng::seed_from_u64(seed))
    }
}

impl<R: RngCore> FaultPolicy for RandomFaults<R> {
    fn should_fail(&mut self, rate_pm: u16) -> bool {
        if rate_pm == 0 {
            return false;
        }
        self.rng.gen_range(0..1000u16) < rate_pm
    }

    fn pick(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.rng.gen_range(0..len)
    }
}

impl<F: FaultPolicy> FaultPolicy for &mut F {
    fn should_fail(&mut self, rate_pm: u16) -> bool {
        F::should_fail(self, rate_pm)
    }

    fn pick(&mut self, len: usize) -> usize {
        F::pick(self, len)
    }
}
