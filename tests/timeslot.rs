use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use flash_settings::platform::Sector;
use flash_settings::timeslot::{Operation, Progress, TimeslicedFlash, Timeslot, Unlimited};
use flash_settings::{Fcb, FcbConfig, FlashError, FlashSimulator, SimulatorConfig};
use pretty_assertions::assert_eq;
use std::cell::Cell;
use std::ops::ControlFlow;

type Sim = FlashSimulator<4, 1024>;

/// Scheduler whose clock advances by `tick_us` on every read.
struct Radio {
    active: bool,
    tick_us: u32,
    now: Cell<u32>,
    slice_us: Option<u32>,
    granted: usize,
    released: usize,
}

impl Radio {
    fn idle() -> Self {
        Self::busy(None)
    }

    fn busy(slice_us: Option<u32>) -> Self {
        Self {
            active: slice_us.is_some(),
            tick_us: 10,
            now: Cell::new(0),
            slice_us,
            granted: 0,
            released: 0,
        }
    }
}

impl Timeslot for Radio {
    fn is_active(&self) -> bool {
        self.active
    }

    fn now_us(&self) -> u32 {
        let now = self.now.get().wrapping_add(self.tick_us);
        self.now.set(now);
        now
    }

    fn wait_for_slice(&mut self, deadline_us: u32) -> Option<u32> {
        let slice_us = self.slice_us?;
        if deadline_us.wrapping_sub(self.now_us()) as i32 <= 0 {
            return None;
        }
        self.granted += 1;
        Some(slice_us)
    }

    fn release_slice(&mut self) {
        self.released += 1;
    }
}

fn sim(units: usize) -> Sim {
    Sim::new(SimulatorConfig::with_units(units))
}

#[test]
fn resume_without_budget_completes() {
    let mut flash = sim(4);
    let data = [0x11u8; 12];

    let mut write = Operation::write(8, &data);
    assert_eq!(write.resume(&mut flash, &mut Unlimited), Ok(Progress::Done));
    assert!(write.is_done());
    assert_eq!(&flash.as_bytes()[8..20], &data);

    let mut erase = Operation::erase(0, 4096);
    assert_eq!(erase.resume(&mut flash, &mut Unlimited), Ok(Progress::Done));
    assert!(flash.as_bytes().iter().all(|&b| b == 0xff));
    // one erase per unit
    assert_eq!(flash.statistics().flash_erase_calls, 4);
}

#[test]
fn idle_radio_runs_in_one_go() {
    let flash = TimeslicedFlash::new(sim(4), Radio::idle());

    flash.write(0, &[0u8; 64]).unwrap();
    flash.erase(0, 2048).unwrap();
    assert!(!flash.is_busy());

    let (sim, radio) = flash.into_inner();
    assert_eq!(radio.granted, 0);
    assert_eq!(sim.statistics().flash_write_calls, 16);
    assert_eq!(sim.statistics().flash_erase_calls, 2);
}

#[test]
fn busy_radio_splits_into_slices() {
    let flash = TimeslicedFlash::new(sim(4), Radio::busy(Some(50)));
    let data: Vec<u8> = (0..64).collect();

    flash.write(0, &data).unwrap();

    let (sim, radio) = flash.into_inner();
    // five steps fit into 50us with a step taking 10us
    assert_eq!(radio.granted, 4);
    assert_eq!(radio.released, 4);
    assert_eq!(&sim.as_bytes()[..64], data.as_slice());
}

#[test]
fn manual_slices() {
    let flash = TimeslicedFlash::new(sim(4), Radio::busy(Some(15)));

    let mut pending = flash.submit(Operation::erase(0, 4096)).unwrap();
    assert_eq!(pending.run_slice(15), Ok(Progress::Pending));
    assert_eq!(
        pending.operation(),
        &Operation::Erase {
            address: 1024,
            end: 4096
        }
    );

    // a second operation has to wait for the first one
    assert!(flash.is_busy());
    assert_eq!(flash.write(0, &[0u8; 4]), Err(FlashError::Locked));
    let mut buf = [0u8; 4];
    flash.read(0, &mut buf).unwrap();

    let mut slices = 1;
    while pending.run_slice(15).unwrap() == Progress::Pending {
        slices += 1;
    }
    assert_eq!(slices, 4);
    assert!(pending.operation().is_done());

    drop(pending);
    assert!(!flash.is_busy());
    flash.write(0, &[0u8; 4]).unwrap();
}

#[test]
fn invalid_requests_leave_flash_untouched() {
    let flash = TimeslicedFlash::new(sim(4), Radio::idle());
    flash.write(3072, &[0u8; 8]).unwrap();
    flash.write(1024, &[0u8; 4]).unwrap();

    // partly beyond the end
    assert_eq!(flash.erase(3072, 5120), Err(FlashError::OutOfRange));
    // reversed
    assert_eq!(flash.erase(1024, 0), Err(FlashError::OutOfRange));
    assert_eq!(flash.erase(1024, 1536), Err(FlashError::NotAligned));
    assert_eq!(flash.write(4092, &[0u8; 8]), Err(FlashError::OutOfRange));
    // the aligned head must not be programmed
    assert_eq!(flash.write(2048, &[0u8; 6]), Err(FlashError::NotAligned));
    assert_eq!(flash.write(2050, &[0u8; 4]), Err(FlashError::NotAligned));
    assert!(!flash.is_busy());

    let (sim, _) = flash.into_inner();
    assert_eq!(&sim.as_bytes()[3072..3080], &[0u8; 8]);
    assert_eq!(&sim.as_bytes()[1024..1028], &[0u8; 4]);
    assert_eq!(&sim.as_bytes()[2048..2056], &[0xff; 8]);
    assert_eq!(sim.statistics().flash_erase_calls, 0);
    // two steps for the first write, one for the second
    assert_eq!(sim.statistics().flash_write_calls, 3);
}

#[test]
fn invalid_requests_are_rejected_before_claiming() {
    let flash = TimeslicedFlash::new(sim(2), Radio::busy(Some(15)));

    assert_eq!(
        flash.submit(Operation::erase(0, 4096)).err(),
        Some(FlashError::OutOfRange)
    );
    assert_eq!(
        flash.submit(Operation::write(0, &[0u8; 3])).err(),
        Some(FlashError::NotAligned)
    );
    assert!(!flash.is_busy());

    let (_, radio) = flash.into_inner();
    assert_eq!(radio.granted, 0);
}

#[test]
fn resume_checks_the_whole_request() {
    let mut flash = sim(2);
    flash.write(1024, &[0u8; 4]).unwrap();

    let mut erase = Operation::erase(1024, 3072);
    assert_eq!(
        erase.resume(&mut flash, &mut Unlimited),
        Err(FlashError::OutOfRange)
    );
    assert_eq!(&flash.as_bytes()[1024..1028], &[0u8; 4]);

    let mut write = Operation::write(0, &[0u8; 6]);
    assert_eq!(
        write.resume(&mut flash, &mut Unlimited),
        Err(FlashError::NotAligned)
    );
    assert_eq!(flash.statistics().flash_write_calls, 1);
    assert_eq!(flash.statistics().flash_erase_calls, 0);
}

#[test]
fn no_slice_times_out() {
    let mut radio = Radio::busy(None);
    radio.active = true;
    let flash = TimeslicedFlash::new(sim(1), radio);

    assert_eq!(flash.erase(0, 1024), Err(FlashError::Timeout));
    assert!(!flash.is_busy());

    let (sim, _) = flash.into_inner();
    assert_eq!(sim.statistics().flash_erase_calls, 0);
}

#[test]
fn slow_slices_time_out() {
    let mut radio = Radio::busy(Some(10));
    radio.tick_us = 30_000;
    let flash = TimeslicedFlash::new(sim(1), radio);

    assert_eq!(flash.write(0, &[0u8; 64]), Err(FlashError::Timeout));

    let (sim, radio) = flash.into_inner();
    assert!(radio.granted < 16);
    assert!(sim.statistics().flash_write_calls < 16);
}

#[test]
fn circular_buffer_on_sliced_flash() {
    let flash = TimeslicedFlash::new(sim(4), Radio::busy(Some(40)));
    assert_eq!(flash.capacity(), 4096);

    let mut fcb = Fcb::new(flash, FcbConfig::new(Sector::uniform(0, 1024, 4))).unwrap();
    for i in 0..40 {
        fcb.append_entry(format!("radio/channel={i}").as_bytes())
            .unwrap();
    }

    let mut last = Vec::new();
    fcb.walk(|_, data| {
        last = data.to_vec();
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(last, b"radio/channel=39");

    let (_, radio) = fcb.into_inner().into_inner();
    assert!(radio.granted > 0);
}
