//! Wires the controller engine to the clocked responder engine over an
//! in-memory open-drain bus and runs the full measurement contract across
//! two threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use softi2c_tof::controller::Controller;
use softi2c_tof::device::TofDevice;
use softi2c_tof::error::Error;
use softi2c_tof::line::Line;
use softi2c_tof::responder::Responder;
use softi2c_tof::timing::Timing;

const ADDR: u8 = 0x29;
const BIT_PERIOD_US: u64 = 400;
const GAP: Duration = Duration::from_millis(2);

/// A shared pair of bus lines. Each endpoint owns a drive flag per line;
/// the observed level is the wired-AND of everyone's drive.
struct Wire {
    sda: [AtomicBool; 2],
    scl: [AtomicBool; 2],
}

impl Wire {
    fn new() -> Arc<Wire> {
        Arc::new(Wire {
            sda: [AtomicBool::new(false), AtomicBool::new(false)],
            scl: [AtomicBool::new(false), AtomicBool::new(false)],
        })
    }
}

fn endpoint(wire: &Arc<Wire>, side: usize) -> (SimLine, SimLine) {
    (
        SimLine {
            wire: Arc::clone(wire),
            signal: Signal::Sda,
            side,
        },
        SimLine {
            wire: Arc::clone(wire),
            signal: Signal::Scl,
            side,
        },
    )
}

#[derive(Clone, Copy)]
enum Signal {
    Sda,
    Scl,
}

struct SimLine {
    wire: Arc<Wire>,
    signal: Signal,
    side: usize,
}

impl SimLine {
    fn flags(&self) -> &[AtomicBool; 2] {
        match self.signal {
            Signal::Sda => &self.wire.sda,
            Signal::Scl => &self.wire.scl,
        }
    }
}

impl Line for SimLine {
    fn release(&mut self) -> Result<(), Error> {
        self.flags()[self.side].store(false, Ordering::SeqCst);
        Ok(())
    }

    fn drive_low(&mut self) -> Result<(), Error> {
        self.flags()[self.side].store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_high(&self) -> Result<bool, Error> {
        let flags = self.flags();
        Ok(!(flags[0].load(Ordering::SeqCst) || flags[1].load(Ordering::SeqCst)))
    }
}

fn spawn_responder(
    wire: &Arc<Wire>,
    running: &Arc<AtomicBool>,
    latency: Duration,
) -> thread::JoinHandle<Result<(), Error>> {
    let (sda, scl) = endpoint(wire, 1);
    let timing = Timing::from_bit_period_us(BIT_PERIOD_US);
    let running = Arc::clone(running);
    let handle = thread::spawn(move || {
        let device = TofDevice::with_latency(latency);
        let mut responder = Responder::new(sda, scl, timing, ADDR, 2, device);
        responder.run(&running)
    });
    // Give the responder a moment to reach its idle poll.
    thread::sleep(Duration::from_millis(20));
    handle
}

#[test]
fn full_measurement_contract_over_the_wire() {
    let wire = Wire::new();
    let running = Arc::new(AtomicBool::new(true));
    let responder = spawn_responder(&wire, &running, Duration::from_millis(40));

    let (sda, scl) = endpoint(&wire, 0);
    let mut controller = Controller::new(sda, scl, Timing::from_bit_period_us(BIT_PERIOD_US), GAP);

    // Identification.
    assert_eq!(controller.read_register(ADDR, 0xC0).unwrap(), 0xEE);
    assert_eq!(controller.read_register(ADDR, 0xC2).unwrap(), 0x10);

    // Scratch register round-trip.
    controller.write(ADDR, &[0x42, 0xA5]).unwrap();
    assert_eq!(controller.read_register(ADDR, 0x42).unwrap(), 0xA5);

    // A foreign address gets no acknowledgement and leaves the responder
    // ready for the next frame.
    match controller.write(0x2A, &[0xC0]) {
        Err(Error::NoResponse) => {}
        other => panic!("expected NoResponse for foreign address, got {:?}", other),
    }
    assert_eq!(controller.read_register(ADDR, 0xC0).unwrap(), 0xEE);

    // Multi-byte read auto-increments through 0xC0..0xC2.
    let mut ident = [0u8; 3];
    controller.write_then_read(ADDR, 0xC0, &mut ident).unwrap();
    assert_eq!(ident, [0xEE, 0x00, 0x10]);

    // Multi-byte write lands in consecutive registers.
    controller.write(ADDR, &[0x60, 1, 2, 3]).unwrap();
    let mut scratch = [0u8; 3];
    controller.write_then_read(ADDR, 0x60, &mut scratch).unwrap();
    assert_eq!(scratch, [1, 2, 3]);

    // Full measurement cycle: arm, wait out the conversion, then the
    // data-ready latch must read 0x07 exactly once.
    controller.write(ADDR, &[0x00, 0x01]).unwrap();
    thread::sleep(Duration::from_millis(120));
    assert_eq!(controller.read_register(ADDR, 0x13).unwrap(), 0x07);
    assert_eq!(controller.read_register(ADDR, 0x13).unwrap(), 0x00);
    let high = controller.read_register(ADDR, 0x1E).unwrap();
    let low = controller.read_register(ADDR, 0x1F).unwrap();
    let distance = u16::from_be_bytes([high, low]);
    assert!((100..=2000).contains(&distance), "distance {}", distance);

    running.store(false, Ordering::SeqCst);
    responder.join().unwrap().unwrap();
}

#[test]
fn responder_recovers_from_an_aborted_transaction() {
    let wire = Wire::new();
    let running = Arc::new(AtomicBool::new(true));
    let responder = spawn_responder(&wire, &running, Duration::from_millis(40));
    let quarter = Duration::from_micros(BIT_PERIOD_US);

    let (mut sda, mut scl) = endpoint(&wire, 0);

    // START, half an address byte, then the controller dies with both
    // lines released and no STOP.
    sda.drive_low().unwrap();
    thread::sleep(quarter);
    scl.drive_low().unwrap();
    thread::sleep(quarter);
    for _ in 0..4 {
        scl.release().unwrap();
        thread::sleep(quarter * 2);
        scl.drive_low().unwrap();
        thread::sleep(quarter * 2);
    }
    sda.release().unwrap();
    scl.release().unwrap();

    // Long enough for the responder's bounded waits to expire.
    thread::sleep(Duration::from_millis(50));

    let mut controller = Controller::new(sda, scl, Timing::from_bit_period_us(BIT_PERIOD_US), GAP);
    assert_eq!(controller.read_register(ADDR, 0xC0).unwrap(), 0xEE);
    assert_eq!(controller.read_register(ADDR, 0xC2).unwrap(), 0x10);

    running.store(false, Ordering::SeqCst);
    responder.join().unwrap().unwrap();
}
