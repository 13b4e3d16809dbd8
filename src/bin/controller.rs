use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{value_parser, Arg, ArgAction, Command};
use log::{debug, error, info, warn};
use rppal::gpio::Gpio;

use softi2c_tof::config::{self, BusConfig, ControllerConfig};
use softi2c_tof::controller::Controller;
use softi2c_tof::device::{
    MODEL_ID, REG_IDENTIFICATION_MODEL_ID, REG_IDENTIFICATION_REVISION_ID, REG_RESULT_INTERRUPT_STATUS,
    REG_RESULT_RANGE_MM, REG_RESULT_RANGE_STATUS, REG_SYSRANGE_START, REVISION_ID,
};
use softi2c_tof::error::Error;
use softi2c_tof::line::GpioLine;

fn cli() -> Command {
    Command::new("controller")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Drives a measurement workflow against a software I2C time-of-flight responder")
        .arg(
            Arg::new("data-line")
                .long("data-line")
                .value_name("BCM")
                .required(true)
                .value_parser(value_parser!(u8))
                .help("GPIO line carrying the data (SDA) signal"),
        )
        .arg(
            Arg::new("clock-line")
                .long("clock-line")
                .value_name("BCM")
                .required(true)
                .value_parser(value_parser!(u8))
                .help("GPIO line carrying the clock (SCL) signal"),
        )
        .arg(
            Arg::new("address")
                .long("address")
                .value_name("ADDR")
                .default_value(&*Box::leak(format!("0x{:02x}", config::DEFAULT_ADDRESS).into_boxed_str()))
                .value_parser(parse_address)
                .help("7-bit responder address"),
        )
        .arg(
            Arg::new("bit-period-us")
                .long("bit-period-us")
                .value_name("MICROS")
                .default_value(&*Box::leak(config::DEFAULT_BIT_PERIOD_US.to_string().into_boxed_str()))
                .value_parser(value_parser!(u64).range(1..))
                .help("Quarter clock phase duration in microseconds"),
        )
        .arg(
            Arg::new("frequency-hz")
                .long("frequency-hz")
                .value_name("HZ")
                .default_value(&*Box::leak(config::DEFAULT_FREQUENCY_HZ.to_string().into_boxed_str()))
                .value_parser(value_parser!(u32).range(1..))
                .help("Measurement cycles per second"),
        )
        .arg(
            Arg::new("max-measurements")
                .long("max-measurements")
                .value_name("N")
                .default_value(&*Box::leak(config::DEFAULT_MAX_MEASUREMENTS.to_string().into_boxed_str()))
                .value_parser(value_parser!(u32))
                .help("Total measurement cycles before exiting"),
        )
        .arg(
            Arg::new("write-read-gap-us")
                .long("write-read-gap-us")
                .value_name("MICROS")
                .value_parser(value_parser!(u64))
                .help("Delay between a register write and the following read [default: measurement period / 20]"),
        )
        .arg(
            Arg::new("max-failures")
                .long("max-failures")
                .value_name("N")
                .default_value(&*Box::leak(config::DEFAULT_MAX_FAILURES.to_string().into_boxed_str()))
                .value_parser(value_parser!(u32).range(1..))
                .help("Consecutive failed cycles before bus recovery runs"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase log verbosity (repeatable)"),
        )
}

fn parse_address(s: &str) -> Result<u8, String> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    }
    .map_err(|e| e.to_string())?;
    if value > 0x7F {
        return Err(String::from("address must fit in 7 bits"));
    }
    Ok(value)
}

fn init_logging(verbosity: u8, file: &str) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(match verbosity {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .chain(std::io::stderr())
        .chain(fern::log_file(file)?)
        .apply()?;
    Ok(())
}

fn main() {
    let matches = cli().get_matches();

    if let Err(e) = init_logging(matches.get_count("verbose"), "controller.log") {
        eprintln!("could not initialise logging: {}", e);
        process::exit(1);
    }

    let bus = BusConfig {
        data_line: *matches.get_one::<u8>("data-line").unwrap(),
        clock_line: *matches.get_one::<u8>("clock-line").unwrap(),
        address: *matches.get_one::<u8>("address").unwrap(),
        bit_period_us: *matches.get_one::<u64>("bit-period-us").unwrap(),
    };
    let frequency_hz = *matches.get_one::<u32>("frequency-hz").unwrap();
    let workflow = ControllerConfig {
        frequency_hz,
        max_measurements: *matches.get_one::<u32>("max-measurements").unwrap(),
        write_read_gap: matches
            .get_one::<u64>("write-read-gap-us")
            .map(|us| Duration::from_micros(*us))
            .unwrap_or_else(|| ControllerConfig::default_gap(frequency_hz)),
        max_failures: *matches.get_one::<u32>("max-failures").unwrap(),
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            error!("could not install signal handler: {}", e);
            process::exit(1);
        }
    }

    let mut controller = match open_bus(&bus, &workflow) {
        Ok(controller) => controller,
        Err(e) => {
            error!("initialisation failed: {}", e);
            process::exit(1);
        }
    };

    info!(
        "controller on SDA={} SCL={}, responder 0x{:02x}, bit period {}us, {} Hz",
        bus.data_line, bus.clock_line, bus.address, bus.bit_period_us, workflow.frequency_hz
    );

    identify(&mut controller, bus.address);
    run_measurements(&mut controller, bus.address, &workflow, &running);
}

fn open_bus(bus: &BusConfig, workflow: &ControllerConfig) -> Result<Controller<GpioLine>, Error> {
    let gpio = Gpio::new()?;
    let sda = GpioLine::new(&gpio, bus.data_line)?;
    let scl = GpioLine::new(&gpio, bus.clock_line)?;
    Ok(Controller::new(sda, scl, bus.timing(), workflow.write_read_gap))
}

fn identify(controller: &mut Controller<GpioLine>, address: u8) {
    match controller.read_register(address, REG_IDENTIFICATION_MODEL_ID) {
        Ok(id) if id == MODEL_ID => info!("model id 0x{:02x}", id),
        Ok(id) => warn!("unexpected model id 0x{:02x} (expected 0x{:02x})", id, MODEL_ID),
        Err(e) => warn!("could not read model id: {}", e),
    }
    match controller.read_register(address, REG_IDENTIFICATION_REVISION_ID) {
        Ok(rev) if rev == REVISION_ID => info!("revision id 0x{:02x}", rev),
        Ok(rev) => warn!("unexpected revision id 0x{:02x} (expected 0x{:02x})", rev, REVISION_ID),
        Err(e) => warn!("could not read revision id: {}", e),
    }
}

fn run_measurements(
    controller: &mut Controller<GpioLine>,
    address: u8,
    workflow: &ControllerConfig,
    running: &AtomicBool,
) {
    let period = workflow.period();
    let mut cycle = 0u32;
    let mut successes = 0u32;
    let mut consecutive_failures = 0u32;

    while running.load(Ordering::SeqCst) && cycle < workflow.max_measurements {
        cycle += 1;
        match measure(controller, address, period) {
            Ok((status, distance)) => {
                successes += 1;
                consecutive_failures = 0;
                info!(
                    "cycle {}/{}: {} mm (range status 0x{:02x}, success rate {:.1}%)",
                    cycle,
                    workflow.max_measurements,
                    distance,
                    status,
                    f64::from(successes) * 100.0 / f64::from(cycle)
                );
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!("cycle {}/{} failed: {}", cycle, workflow.max_measurements, e);
                if consecutive_failures >= workflow.max_failures {
                    if let Err(e) = controller.bus_recovery() {
                        error!("bus recovery failed: {}", e);
                    }
                    consecutive_failures = 0;
                }
            }
        }
        thread::sleep(period);
    }

    let rate = if cycle > 0 {
        f64::from(successes) * 100.0 / f64::from(cycle)
    } else {
        0.0
    };
    info!("done: {} cycles, {} successful ({:.1}%)", cycle, successes, rate);
}

/// One measurement cycle: arm the ranger, give the conversion a measurement
/// period to finish, then collect status and the big-endian distance.
fn measure(
    controller: &mut Controller<GpioLine>,
    address: u8,
    period: Duration,
) -> Result<(u8, u16), Error> {
    controller.write_register(address, REG_SYSRANGE_START, 0x01)?;
    thread::sleep(period);

    let interrupt = controller.read_register(address, REG_RESULT_INTERRUPT_STATUS)?;
    if interrupt != 0x07 {
        debug!("interrupt status 0x{:02x}, conversion not flagged ready", interrupt);
    }
    let status = controller.read_register(address, REG_RESULT_RANGE_STATUS)?;
    let high = controller.read_register(address, REG_RESULT_RANGE_MM)?;
    let low = controller.read_register(address, REG_RESULT_RANGE_MM + 1)?;
    Ok((status, u16::from_be_bytes([high, low])))
}
