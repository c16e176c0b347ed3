use log::{debug, warn};

use trunkline_pac::device::{RegisterIo, Span, HDLC_BUFFER_LEN};
use trunkline_pac::register::{HdlcAddressing, HSR};

use crate::error::{Error, Result};
use crate::host::Host;

/// Bytes moved per transmit-ready interrupt.
pub const TX_FIFO_LEN: usize = HDLC_BUFFER_LEN;

/// Flag octets between transmitted frames.
const INTERFRAME_FLAGS: u8 = 1;

/// Why a received frame was thrown away.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HdlcAbort {
    BadChecksum,
    Aborted,
    Overflow,
    BadFraming,
}

/// One piece of an outgoing message, as returned by
/// [`Host::hdlc_next_transmit`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HdlcChunk {
    pub len: usize,

    /// This piece ends the message.
    pub end: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HdlcState {
    Idle,
    Active { channel: usize, transmitting: bool },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HdlcCounters {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub aborts: u64,
}

/// The HDLC signaling controller of one span.
pub struct HdlcController {
    span: usize,
    state: HdlcState,
    counters: HdlcCounters,
}

impl HdlcController {
    pub fn new(span: usize) -> Self {
        Self {
            span,
            state: HdlcState::Idle,
            counters: HdlcCounters::default(),
        }
    }

    pub fn state(&self) -> HdlcState {
        self.state
    }

    pub fn counters(&self) -> HdlcCounters {
        self.counters
    }

    pub fn channel(&self) -> Option<usize> {
        match self.state {
            HdlcState::Active { channel, .. } => Some(channel),
            HdlcState::Idle => None,
        }
    }

    /// Route `channel` to the controller, reset it and enable its
    /// interrupts.
    ///
    /// Only transparent framing with FCS and no address matching is
    /// supported. Fails with a timeout if the reset does not complete
    /// within `poll_limit` status reads.
    ///
    pub fn start<D: RegisterIo + ?Sized>(
        &mut self,
        span: &Span<'_, D>,
        channel: usize,
        mode: HdlcAddressing,
        poll_limit: u32,
    ) -> Result<()> {
        if mode != HdlcAddressing::None {
            return Err(Error::UnsupportedHdlcMode(mode));
        }
        assert!(channel < 32);

        let filter = 1u32 << channel;
        span.hmode().write(|w| w
            .with_ADDRESSING(HdlcAddressing::None)
            .with_FCS_ENB(1)
        )?;
        span.htsf0().write(|w| w.with_CH(filter as u16))?;
        span.htsf1().write(|w| w.with_CH((filter >> 16) as u16))?;
        span.hifg().write(|w| w.with_FLAGS(INTERFRAME_FLAGS))?;
        span.himr().write(|w| w
            .with_RX_FRAME_ENB(1)
            .with_RX_POOL_FULL_ENB(1)
            .with_TX_HALF_EMPTY_ENB(1)
            .with_TX_POOL_READY_ENB(1)
        )?;

        span.hcr().write(|w| w.with_RESET(1))?;
        let mut polls = 0;
        while span.hsr().read()?.RESET_BUSY() != 0 {
            polls += 1;
            if polls >= poll_limit {
                warn!("hdlc: span {} reset did not complete", self.span);
                self.stop(span)?;
                return Err(Error::Timeout("HDLC controller reset"));
            }
        }

        self.state = HdlcState::Active { channel, transmitting: false };
        debug!("hdlc: span {} started on channel {channel}", self.span);
        Ok(())
    }

    pub fn stop<D: RegisterIo + ?Sized>(&mut self, span: &Span<'_, D>) -> Result<()> {
        span.htsf0().write(|w| w.with_CH(0))?;
        span.htsf1().write(|w| w.with_CH(0))?;
        span.himr().write(|w| w
            .with_RX_FRAME_ENB(0)
            .with_RX_POOL_FULL_ENB(0)
            .with_TX_HALF_EMPTY_ENB(0)
            .with_TX_POOL_READY_ENB(0)
        )?;
        self.state = HdlcState::Idle;
        Ok(())
    }

    /// Drain the receive buffer. `hsr` is the status captured with the
    /// interrupt; RX_FRAME set means the drained bytes end a frame.
    pub fn on_receive_ready<D: RegisterIo + ?Sized>(
        &mut self,
        span: &Span<'_, D>,
        hsr: HSR,
        host: &mut dyn Host,
    ) -> Result<()> {
        if self.state == HdlcState::Idle {
            return Ok(());
        }

        let count = (span.hrbc().read()?.COUNT() as usize).min(HDLC_BUFFER_LEN);
        let mut words = [0u16; HDLC_BUFFER_LEN];
        let words = &mut words[..count];
        span.device().read_burst(span.hrxbuf(0).address(), words)?;
        let mut data = [0u8; HDLC_BUFFER_LEN];
        for (byte, word) in data.iter_mut().zip(words.iter()) {
            *byte = *word as u8;
        }
        let data = &data[..count];

        if hsr.RX_FRAME() == 0 {
            if !data.is_empty() {
                host.hdlc_partial(self.span, data);
            }
            return Ok(());
        }

        let abort = if hsr.CRC_ERR() != 0 {
            Some(HdlcAbort::BadChecksum)
        } else if hsr.ABORT() != 0 {
            Some(HdlcAbort::Aborted)
        } else if hsr.OVERFLOW() != 0 {
            Some(HdlcAbort::Overflow)
        } else if hsr.FRAMING_ERR() != 0 {
            Some(HdlcAbort::BadFraming)
        } else {
            None
        };

        match abort {
            Some(reason) => {
                debug!("hdlc: span {} receive {reason:?}", self.span);
                self.counters.aborts += 1;
                host.hdlc_abort(self.span, reason);
            },
            None => {
                self.counters.frames_received += 1;
                host.hdlc_frame(self.span, data);
            },
        }
        Ok(())
    }

    /// Hand the controller its next piece of outgoing data.
    pub fn on_transmit_ready<D: RegisterIo + ?Sized>(
        &mut self,
        span: &Span<'_, D>,
        host: &mut dyn Host,
    ) -> Result<()> {
        let HdlcState::Active { channel, .. } = self.state else {
            return Ok(());
        };

        let mut buffer = [0u8; TX_FIFO_LEN];
        let chunk = match host.hdlc_next_transmit(self.span, &mut buffer) {
            Some(chunk) => chunk,
            None => {
                self.state = HdlcState::Active { channel, transmitting: false };
                return Ok(());
            },
        };
        let len = chunk.len.min(TX_FIFO_LEN);

        let mut words = [0u16; TX_FIFO_LEN];
        for (word, &byte) in words.iter_mut().zip(buffer[..len].iter()) {
            *word = byte as u16;
        }
        span.device().write_burst(span.htxbuf(0).address(), &words[..len])?;

        span.hcr().write(|w| w
            .with_TX_HALF_FULL(1)
            .with_TX_MSG_END(chunk.end as u8)
        )?;
        if chunk.end {
            self.counters.frames_sent += 1;
        }

        self.state = HdlcState::Active { channel, transmitting: true };
        Ok(())
    }

    /// Start transmitting if the controller went quiet and the host has
    /// since queued data.
    pub fn kick<D: RegisterIo + ?Sized>(&mut self, span: &Span<'_, D>, host: &mut dyn Host) -> Result<()> {
        match self.state {
            HdlcState::Active { transmitting: false, .. } => self.on_transmit_ready(span, host),
            _ => Ok(()),
        }
    }
}
