use thiserror::Error;

use trunkline_pac::device::{self, RegisterAddress, RegisterValue};
use trunkline_pac::register::HdlcAddressing;

use crate::handle::Handle;

#[derive(Error, Debug)]
pub enum Error {
    #[error("register access: {0}")]
    Register(device::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("register check failed at {address:04x}: wrote {wrote:04x}, read {read:04x}")]
    SelfTest {
        address: RegisterAddress,
        wrote: RegisterValue,
        read: RegisterValue,
    },

    #[error("no interrupts seen within {0} ms")]
    NoInterrupts(u64),

    #[error("DMA allocation of {0} bytes failed")]
    Allocation(usize),

    #[error("sync priority {0} out of range")]
    SyncPriority(u8),

    #[error("HDLC addressing mode {0:?} not supported")]
    UnsupportedHdlcMode(HdlcAddressing),

    #[error("echo canceller tap length {0} not supported")]
    TapLength(usize),

    #[error("span {0} does not exist")]
    SpanIndex(usize),

    #[error("channel {channel} does not exist on span {span}")]
    ChannelIndex {
        span: usize,
        channel: usize,
    },

    #[error("configuration: {0}")]
    Config(String),

    #[error("stale handle {0:?}")]
    StaleHandle(Handle),

    #[error("card is not running")]
    NotRunning,
}

impl From<device::Error> for Error {
    fn from(e: device::Error) -> Self {
        Self::Register(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
