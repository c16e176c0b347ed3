use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand, Args, ArgEnum};
use thiserror::Error;

use trunkline::card::Generation;
use trunkline::config::DriverConfig;
use trunkline::maintenance::{self, Maintenance};
use trunkline::span::LineType;
use trunkline_pac::device::{self, Board, RegisterAddress, RegisterIo, RegisterValue};

use crate::dump::{registers_dump_raw, registers_dump_global, registers_dump_span, registers_dump_debug};
use crate::logger::ConsoleLogger;
use crate::mmio::MmioWindow;

mod dump;
mod logger;
mod mmio;
mod monitor;

#[derive(Error, Debug)]
pub(crate) enum ToolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Driver(#[from] trunkline::Error),
    #[error("register access: {0}")]
    Register(device::Error),
    #[error("bad number {0:?}")]
    Parse(String),
}

impl From<device::Error> for ToolError {
    fn from(e: device::Error) -> Self {
        Self::Register(e)
    }
}

pub(crate) type Result<T> = std::result::Result<T, ToolError>;

#[derive(Parser)]
#[clap(author, version, about, long_about=None)]
pub(crate) struct Cli {
    /// PCI resource file for the card's register BAR.
    #[clap(long, default_value="/sys/bus/pci/devices/0000:01:00.0/resource0")]
    pub resource: PathBuf,

    /// Driver configuration, JSON.
    #[clap(long)]
    pub config: Option<PathBuf>,

    #[clap(short, long, parse(from_occurrences))]
    pub verbose: usize,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(ArgEnum, Clone)]
pub(crate) enum TestMode {
    Off,
    LocalLoopback,
    NetworkLineLoopback,
    NetworkPayloadLoopback,
}

#[derive(Args)]
pub(crate) struct TestArgs {
    #[clap(arg_enum)]
    mode: TestMode,

    #[clap(long)]
    pub span: usize,

    #[clap(long, arg_enum, default_value="t1")]
    pub line: Line,
}

#[derive(ArgEnum, Clone, Copy)]
pub(crate) enum Line {
    T1,
    E1,
    J1,
}

impl From<Line> for LineType {
    fn from(line: Line) -> Self {
        match line {
            Line::T1 => LineType::T1,
            Line::E1 => LineType::E1,
            Line::J1 => LineType::J1,
        }
    }
}

#[derive(Subcommand, Clone)]
pub(crate) enum DumpMode {
    #[clap(name="span")]
    Span {
        span: usize,
    },

    #[clap(name="global")]
    Global,

    #[clap(name="debug")]
    Debug,

    #[clap(name="all")]
    All,
}

#[derive(Args)]
pub(crate) struct DumpArgs {
    #[clap(subcommand)]
    mode: DumpMode,
}

#[derive(Args)]
pub(crate) struct GetArgs {
    address: String,
}

#[derive(Args)]
pub(crate) struct SetArgs {
    address: String,
    value: String,
}

#[derive(Args)]
pub(crate) struct MonitorArgs {
    /// Simulated cards in the chassis.
    #[clap(long, default_value="1")]
    pub cards: usize,

    /// Simulate octal cards instead of quad.
    #[clap(long)]
    pub octal: bool,

    /// Share one timing source across cards.
    #[clap(long)]
    pub timing_cable: bool,

    /// Drop signal on this span of the first card halfway through.
    #[clap(long)]
    pub los: Option<usize>,

    #[clap(long, default_value="10")]
    pub seconds: u64,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    #[clap(name="test")]
    Test(TestArgs),

    #[clap(name="dump")]
    Dump(DumpArgs),

    #[clap(name="get")]
    Get(GetArgs),

    #[clap(name="set")]
    Set(SetArgs),

    /// Run the driver against simulated cards.
    #[clap(name="monitor")]
    Monitor(MonitorArgs),
}

fn parse_number(text: &str) -> Result<u16> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| ToolError::Parse(text.to_string()))
}

/// Reject span indices the card doesn't have before touching its registers.
fn checked_span<D: RegisterIo>(board: &Board<D>, span: usize) -> Result<usize> {
    let generation = Generation::from_revid(board.revid().read()?)?;
    if span >= generation.ports {
        return Err(trunkline::Error::SpanIndex(span).into());
    }
    Ok(span)
}

fn load_config(path: &Option<PathBuf>) -> Result<DriverConfig> {
    match path {
        Some(path) => Ok(DriverConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(DriverConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    ConsoleLogger::register(args.verbose);
    let config = load_config(&args.config)?;

    if let Commands::Monitor(a) = &args.command {
        monitor::monitor(a, config)?;
        eprintln!("done: monitor");
        return Ok(());
    }

    let window = MmioWindow::open(&args.resource)?;
    let board = Board::new(&window);

    match args.command {
        Commands::Test(a) => {
            let maintenance = match a.mode {
                TestMode::Off                    => Maintenance::None,
                TestMode::LocalLoopback          => Maintenance::LocalLoopback,
                TestMode::NetworkLineLoopback    => Maintenance::NetworkLineLoopback,
                TestMode::NetworkPayloadLoopback => Maintenance::NetworkPayloadLoopback,
            };

            let span = checked_span(&board, a.span)?;
            let line = LineType::from(a.line);
            maintenance::apply(&board.span(span), maintenance, line.channels())?;
        },
        Commands::Dump(a) => {
            match a.mode {
                DumpMode::All => {
                    registers_dump_raw(&window)?;
                },
                DumpMode::Global => {
                    registers_dump_global(&board)?;
                },
                DumpMode::Debug => {
                    let generation = Generation::from_revid(board.revid().read()?)?;
                    registers_dump_debug(&board, generation.ports)?;
                },
                DumpMode::Span { span } => {
                    let span = checked_span(&board, span)?;
                    registers_dump_span(&board.span(span))?;
                },
            }
        },
        Commands::Get(a) => {
            let address: RegisterAddress = parse_number(&a.address)?;
            let value: RegisterValue = window.read(address)?;
            println!("{address:04x}: {value:04x}");
        },
        Commands::Set(a) => {
            let address: RegisterAddress = parse_number(&a.address)?;
            let value: RegisterValue = parse_number(&a.value)?;
            window.write(address, value)?;
        },
        Commands::Monitor(_) => {},
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunkline::sim::MemoryWindow;

    fn board_memory(generation: Generation) -> MemoryWindow {
        let memory = MemoryWindow::new();
        memory.poke(0x000b, generation.revid().into());
        memory
    }

    #[test]
    fn span_index_checked_against_card() {
        let memory = board_memory(Generation::quad());
        let board = Board::new(&memory);
        assert_eq!(checked_span(&board, 3).unwrap(), 3);
        assert!(matches!(
            checked_span(&board, 4),
            Err(ToolError::Driver(trunkline::Error::SpanIndex(4)))
        ));
        assert!(matches!(
            checked_span(&board, 200),
            Err(ToolError::Driver(trunkline::Error::SpanIndex(200)))
        ));

        let memory = board_memory(Generation::octal());
        let board = Board::new(&memory);
        assert_eq!(checked_span(&board, 7).unwrap(), 7);
    }

    #[test]
    fn numbers_parse_as_hex_or_decimal() {
        assert_eq!(parse_number("0x0b").unwrap(), 0x0b);
        assert_eq!(parse_number("11").unwrap(), 11);
        assert!(matches!(parse_number("0xzz"), Err(ToolError::Parse(_))));
    }
}
