//! GPIO driver seam and a simulated driver.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Error, Result};

/// Physical (or simulated) pin access.
///
/// Reads are synchronous so the watch engine can sample from its timer task
/// without holding anything across an await point.
pub trait GpioDriver: Send + Sync {
    /// Reported in `setupData` replies.
    fn kind(&self) -> &str;

    fn input_pins(&self) -> Vec<u32>;

    fn output_pins(&self) -> Vec<u32>;

    fn read_input(&self, pin: u32) -> Result<bool>;

    fn read_output(&self, pin: u32) -> Result<bool>;

    fn write_output(&self, pin: u32, on: bool) -> Result<bool>;

    /// Releases the pins. Called once at shutdown.
    fn close(&self) {}
}

pub(crate) fn invalid_input() -> Error {
    Error::Resource("invalid input".into())
}

pub(crate) fn invalid_output() -> Error {
    Error::Resource("invalid output".into())
}

pub(crate) fn invalid_pin() -> Error {
    Error::Resource("invalid pin".into())
}

/// Driver for hosts without GPIO hardware: unforced inputs read a
/// pseudo-random level and outputs latch whatever was last written.
#[derive(Debug, Default)]
pub struct SimulatedGpio {
    inputs: BTreeSet<u32>,
    forced: Mutex<BTreeMap<u32, bool>>,
    outputs: Mutex<BTreeMap<u32, bool>>,
}

impl SimulatedGpio {
    pub fn new(inputs: impl IntoIterator<Item = u32>, outputs: impl IntoIterator<Item = u32>) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
            forced: Mutex::new(BTreeMap::new()),
            outputs: Mutex::new(outputs.into_iter().map(|pin| (pin, false)).collect()),
        }
    }

    /// Pins an input to a fixed level instead of the random one.
    pub fn set_input(&self, pin: u32, level: bool) -> Result<()> {
        if !self.inputs.contains(&pin) {
            return Err(invalid_input());
        }
        self.forced.lock().insert(pin, level);
        Ok(())
    }
}

impl GpioDriver for SimulatedGpio {
    fn kind(&self) -> &str {
        "simulation"
    }

    fn input_pins(&self) -> Vec<u32> {
        self.inputs.iter().copied().collect()
    }

    fn output_pins(&self) -> Vec<u32> {
        self.outputs.lock().keys().copied().collect()
    }

    fn read_input(&self, pin: u32) -> Result<bool> {
        if !self.inputs.contains(&pin) {
            return Err(invalid_input());
        }
        if let Some(level) = self.forced.lock().get(&pin) {
            return Ok(*level);
        }
        Ok(rand::thread_rng().gen_range(5..25) > 15)
    }

    fn read_output(&self, pin: u32) -> Result<bool> {
        self.outputs.lock().get(&pin).copied().ok_or_else(invalid_output)
    }

    fn write_output(&self, pin: u32, on: bool) -> Result<bool> {
        match self.outputs.lock().get_mut(&pin) {
            Some(level) => {
                *level = on;
                Ok(on)
            }
            None => Err(invalid_output()),
        }
    }

    fn close(&self) {
        for level in self.outputs.lock().values_mut() {
            *level = false;
        }
        tracing::debug!("simulated gpio released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_latch_and_unknown_pins_fail() {
        let gpio = SimulatedGpio::new([11, 13], [33, 35]);
        assert!(!gpio.read_output(33).unwrap());
        assert!(gpio.write_output(33, true).unwrap());
        assert!(gpio.read_output(33).unwrap());
        assert!(!gpio.read_output(35).unwrap());
        assert!(matches!(gpio.write_output(7, true), Err(Error::Resource(m)) if m == "invalid output"));
        assert!(matches!(gpio.read_input(7), Err(Error::Resource(m)) if m == "invalid input"));
    }

    #[test]
    fn forced_inputs_are_stable() {
        let gpio = SimulatedGpio::new([11], []);
        gpio.set_input(11, true).unwrap();
        for _ in 0..5 {
            assert!(gpio.read_input(11).unwrap());
        }
        assert!(gpio.set_input(12, true).is_err());
    }

    #[test]
    fn close_drives_outputs_low() {
        let gpio = SimulatedGpio::new([], [33]);
        gpio.write_output(33, true).unwrap();
        gpio.close();
        assert!(!gpio.read_output(33).unwrap());
        assert_eq!(gpio.kind(), "simulation");
        assert_eq!(gpio.output_pins(), vec![33]);
    }
}
