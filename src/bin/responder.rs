use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, Command};
use log::{error, info};
use rppal::gpio::Gpio;

use softi2c_tof::config::{self, BusConfig};
use softi2c_tof::device::TofDevice;
use softi2c_tof::line::GpioLine;
use softi2c_tof::responder::edge::EdgeResponder;
use softi2c_tof::responder::Responder;

fn cli() -> Command {
    Command::new("responder")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Emulates a VL53L0X time-of-flight ranger behind a software I2C responder")
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
                .help("7-bit address to answer to"),
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
            Arg::new("max-failures")
                .long("max-failures")
                .value_name("N")
                .default_value(&*Box::leak(config::DEFAULT_MAX_FAILURES.to_string().into_boxed_str()))
                .value_parser(value_parser!(u32).range(1..))
                .help("Consecutive bus faults before an extended idle pause"),
        )
        .arg(
            Arg::new("engine")
                .long("engine")
                .value_name("KIND")
                .default_value("clocked")
                .value_parser(["clocked", "edge"])
                .help("Responder engine: bounded clock waits, or the edge-sampled reference"),
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

    if let Err(e) = init_logging(matches.get_count("verbose"), "responder.log") {
        eprintln!("could not initialise logging: {}", e);
        process::exit(1);
    }

    let bus = BusConfig {
        data_line: *matches.get_one::<u8>("data-line").unwrap(),
        clock_line: *matches.get_one::<u8>("clock-line").unwrap(),
        address: *matches.get_one::<u8>("address").unwrap(),
        bit_period_us: *matches.get_one::<u64>("bit-period-us").unwrap(),
    };
    let max_failures = *matches.get_one::<u32>("max-failures").unwrap();
    let engine = matches.get_one::<String>("engine").unwrap().clone();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            error!("could not install signal handler: {}", e);
            process::exit(1);
        }
    }

    let (sda, scl) = match open_lines(&bus) {
        Ok(lines) => lines,
        Err(e) => {
            error!("initialisation failed: {}", e);
            process::exit(1);
        }
    };

    info!(
        "responder on SDA={} SCL={}, address 0x{:02x}, bit period {}us, {} engine",
        bus.data_line, bus.clock_line, bus.address, bus.bit_period_us, engine
    );

    let device = TofDevice::new();
    let result = match engine.as_str() {
        "edge" => EdgeResponder::new(sda, scl, bus.timing(), bus.address, device).run(&running),
        _ => Responder::new(sda, scl, bus.timing(), bus.address, max_failures, device).run(&running),
    };

    match result {
        Ok(()) => info!("responder stopped"),
        Err(e) => {
            error!("responder failed: {}", e);
            process::exit(1);
        }
    }
}

fn open_lines(bus: &BusConfig) -> Result<(GpioLine, GpioLine), softi2c_tof::Error> {
    let gpio = Gpio::new()?;
    let sda = GpioLine::new(&gpio, bus.data_line)?;
    let scl = GpioLine::new(&gpio, bus.clock_line)?;
    Ok((sda, scl))
}
