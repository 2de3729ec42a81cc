//! Shared test doubles: a settable clock, a fixed RNG, and the stack configuration built on them.

use crate::config::Config;
use crate::store::MemStore;
use crate::time::{Instant, Timer};
use crate::transport::RecordingTransport;
use alloc::rc::Rc;
use core::cell::Cell;

/// A clock that tests advance by hand.
pub struct MockTimer(pub Rc<Cell<u32>>);

impl MockTimer {
    pub fn new() -> (Self, Rc<Cell<u32>>) {
        let cell = Rc::new(Cell::new(0));
        (MockTimer(cell.clone()), cell)
    }
}

impl Timer for MockTimer {
    fn now(&self) -> Instant {
        Instant::from_raw_micros(self.0.get())
    }
}

/// A deterministic "RNG" for reproducible challenges and message-IDs.
pub struct NullRng(pub u32);

impl rand_core::RngCore for NullRng {
    fn next_u32(&mut self) -> u32 {
        // xorshift, seeded by the constructor
        let mut x = self.0.max(1);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn next_u64(&mut self) -> u64 {
        u64::from(self.next_u32()) << 32 | u64::from(self.next_u32())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for b in dest {
            *b = self.next_u32() as u8;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

pub enum TestConfig {}

impl Config for TestConfig {
    type Timer = MockTimer;
    type Transport = RecordingTransport;
    type Store = MemStore;
    type Rng = NullRng;
}
