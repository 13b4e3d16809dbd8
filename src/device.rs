use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

use crate::responder::RegisterDevice;

pub const REG_SYSRANGE_START: u8 = 0x00;
pub const REG_RESULT_INTERRUPT_STATUS: u8 = 0x13;
pub const REG_RESULT_RANGE_STATUS: u8 = 0x14;
pub const REG_RESULT_RANGE_MM: u8 = 0x1E;
pub const REG_IDENTIFICATION_MODEL_ID: u8 = 0xC0;
pub const REG_IDENTIFICATION_REVISION_ID: u8 = 0xC2;

pub const MODEL_ID: u8 = 0xEE;
pub const REVISION_ID: u8 = 0x10;

/// Simulated single-shot conversion time.
pub const CONVERSION_LATENCY: Duration = Duration::from_millis(75);

const INTERRUPT_DATA_READY: u8 = 0x07;
const DISTANCE_MIN_MM: u16 = 100;
const DISTANCE_MAX_MM: u16 = 2000;
const DISTANCE_INITIAL_MM: u16 = 1000;
const DISTANCE_STEP_MM: i32 = 50;

#[derive(Debug, Clone, Copy)]
enum Measurement {
    Idle,
    InProgress(Instant),
    Complete,
}

/// Emulation of the VL53L0X time-of-flight ranger as seen through its
/// register file.
///
/// Most of the 256 registers are plain scratch that persist as written.
/// Three accesses carry behaviour: writing a value with bit 0 set to 0x00
/// arms a measurement, the background tick completes it after the
/// conversion latency (fresh distance at 0x1E/0x1F big-endian, 0x07 at
/// 0x13), and reading 0x13 while it holds 0x07 clears it back to 0x00. The
/// start bit is edge-triggered and never latched into the register file.
pub struct TofDevice {
    registers: [u8; 256],
    measurement: Measurement,
    distance_mm: u16,
    latency: Duration,
}

impl TofDevice {
    pub fn new() -> Self {
        Self::with_latency(CONVERSION_LATENCY)
    }

    /// Builds the device with a non-default conversion latency.
    pub fn with_latency(latency: Duration) -> Self {
        let mut registers = [0u8; 256];
        registers[REG_IDENTIFICATION_MODEL_ID as usize] = MODEL_ID;
        registers[REG_IDENTIFICATION_REVISION_ID as usize] = REVISION_ID;
        let mut device = TofDevice {
            registers,
            measurement: Measurement::Idle,
            distance_mm: DISTANCE_INITIAL_MM,
            latency,
        };
        device.store_distance();
        device
    }

    pub fn distance_mm(&self) -> u16 {
        self.distance_mm
    }

    /// Random walk of the simulated distance, clamped to the device's
    /// measurable range.
    fn update_distance(&mut self) {
        let step = rand::thread_rng().gen_range(-DISTANCE_STEP_MM..=DISTANCE_STEP_MM);
        let next = i32::from(self.distance_mm) + step;
        self.distance_mm = next.clamp(i32::from(DISTANCE_MIN_MM), i32::from(DISTANCE_MAX_MM)) as u16;
    }

    fn store_distance(&mut self) {
        let [high, low] = self.distance_mm.to_be_bytes();
        self.registers[REG_RESULT_RANGE_MM as usize] = high;
        self.registers[REG_RESULT_RANGE_MM as usize + 1] = low;
    }
}

impl Default for TofDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterDevice for TofDevice {
    fn write_register(&mut self, index: u8, value: u8) {
        if index == REG_SYSRANGE_START && value & 0x01 != 0 {
            if let Measurement::Idle = self.measurement {
                info!("measurement started");
                self.measurement = Measurement::InProgress(Instant::now());
                self.registers[REG_RESULT_INTERRUPT_STATUS as usize] = 0x00;
            }
            return;
        }
        self.registers[index as usize] = value;
    }

    fn read_register(&mut self, index: u8) -> u8 {
        let value = self.registers[index as usize];
        if index == REG_RESULT_INTERRUPT_STATUS && value == INTERRUPT_DATA_READY {
            // Data-ready is consumed by the read.
            self.registers[index as usize] = 0x00;
            self.measurement = Measurement::Idle;
            debug!("interrupt status cleared by read");
        }
        value
    }

    fn tick(&mut self) {
        if let Measurement::InProgress(started) = self.measurement {
            if started.elapsed() >= self.latency {
                self.update_distance();
                self.store_distance();
                self.registers[REG_RESULT_INTERRUPT_STATUS as usize] = INTERRUPT_DATA_READY;
                self.measurement = Measurement::Complete;
                info!("measurement complete: {} mm", self.distance_mm);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identification_registers() {
        let mut device = TofDevice::new();
        assert_eq!(device.read_register(REG_IDENTIFICATION_MODEL_ID), 0xEE);
        assert_eq!(device.read_register(REG_IDENTIFICATION_REVISION_ID), 0x10);
    }

    #[test]
    fn scratch_registers_persist() {
        let mut device = TofDevice::new();
        device.write_register(0x42, 0xA5);
        assert_eq!(device.read_register(0x42), 0xA5);
        assert_eq!(device.read_register(0x43), 0x00);
    }

    #[test]
    fn start_bit_is_not_latched() {
        let mut device = TofDevice::new();
        device.write_register(REG_SYSRANGE_START, 0x01);
        assert_eq!(device.read_register(REG_SYSRANGE_START), 0x00);
    }

    #[test]
    fn data_ready_after_latency_and_self_clears() {
        let mut device = TofDevice::with_latency(Duration::ZERO);
        device.write_register(REG_SYSRANGE_START, 0x01);
        assert_eq!(device.read_register(REG_RESULT_INTERRUPT_STATUS), 0x00);
        device.tick();
        assert_eq!(device.read_register(REG_RESULT_INTERRUPT_STATUS), 0x07);
        assert_eq!(device.read_register(REG_RESULT_INTERRUPT_STATUS), 0x00);
    }

    #[test]
    fn no_data_ready_before_latency() {
        let mut device = TofDevice::with_latency(Duration::from_secs(3600));
        device.write_register(REG_SYSRANGE_START, 0x01);
        device.tick();
        assert_eq!(device.read_register(REG_RESULT_INTERRUPT_STATUS), 0x00);
    }

    #[test]
    fn start_while_busy_is_ignored() {
        let mut device = TofDevice::with_latency(Duration::ZERO);
        device.write_register(REG_SYSRANGE_START, 0x01);
        device.tick();
        // The completed result must survive a second strobe before the
        // status read.
        device.write_register(REG_SYSRANGE_START, 0x01);
        assert_eq!(device.read_register(REG_RESULT_INTERRUPT_STATUS), 0x07);
    }

    #[test]
    fn distance_stays_in_range() {
        let mut device = TofDevice::with_latency(Duration::ZERO);
        for _ in 0..500 {
            device.write_register(REG_SYSRANGE_START, 0x01);
            device.tick();
            let high = device.read_register(REG_RESULT_RANGE_MM);
            let low = device.read_register(REG_RESULT_RANGE_MM + 1);
            let distance = u16::from_be_bytes([high, low]);
            assert!((100..=2000).contains(&distance), "distance {}", distance);
            assert_eq!(distance, device.distance_mm());
            // Consume the data-ready latch to rearm.
            device.read_register(REG_RESULT_INTERRUPT_STATUS);
        }
    }

    #[test]
    fn measurement_can_rerun_after_status_read() {
        let mut device = TofDevice::with_latency(Duration::ZERO);
        device.write_register(REG_SYSRANGE_START, 0x01);
        device.tick();
        assert_eq!(device.read_register(REG_RESULT_INTERRUPT_STATUS), 0x07);
        device.write_register(REG_SYSRANGE_START, 0x01);
        device.tick();
        assert_eq!(device.read_register(REG_RESULT_INTERRUPT_STATUS), 0x07);
    }
}
