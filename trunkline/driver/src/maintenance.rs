use trunkline_pac::device::{RegisterIo, Span, Result};
use trunkline_pac::register::FramerLoopback;

use crate::alarm::AlarmMask;

/// Maintenance state of a span.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Maintenance {
    #[default]
    None,
    LocalLoopback,
    NetworkLineLoopback,
    NetworkPayloadLoopback,

    /// Report the given alarms regardless of the line.
    AlarmSimulation(AlarmMask),
}

impl Maintenance {
    pub fn framer_loopback(self) -> FramerLoopback {
        match self {
            Self::LocalLoopback          => FramerLoopback::Local,
            Self::NetworkLineLoopback    => FramerLoopback::NetworkLine,
            Self::NetworkPayloadLoopback => FramerLoopback::NetworkPayload,
            Self::None | Self::AlarmSimulation(_) => FramerLoopback::No,
        }
    }

    pub fn is_loopback(self) -> bool {
        self.framer_loopback() != FramerLoopback::No
    }

    pub fn simulated_alarms(self) -> Option<AlarmMask> {
        match self {
            Self::AlarmSimulation(mask) => Some(mask),
            _ => None,
        }
    }
}

/// Program the framer for a maintenance state. `channels` is the number
/// of channels the span carries.
pub fn apply<D: RegisterIo + ?Sized>(span: &Span<'_, D>, maintenance: Maintenance, channels: usize) -> Result<()> {
    match maintenance.framer_loopback() {
        FramerLoopback::NetworkPayload => set_network_payload_loopback(span, channels),
        loopback => span.fmr().modify(|m| m.with_LB(loopback)),
    }
}

/// Framer network payload loopback
///
/// The raw data within the receive time slots is looped back to the
/// transmit framer, where it is re-framed on transmit timing. Any received
/// bitstream with matching framing should be re-transmitted error-free.
///
/// ### At the line interface:
/// * Line RX drives Line TX
/// * Line TX <- TX Framer <- RX Framer <- Line RX
///
/// Robbed-bit insertion would corrupt the looped payload, so it is turned
/// off for every channel.
///
fn set_network_payload_loopback<D: RegisterIo + ?Sized>(span: &Span<'_, D>, channels: usize) -> Result<()> {
    span.fmr().modify(|m| m
        .with_LB(FramerLoopback::NetworkPayload)
    )?;

    for channel in 0..channels {
        span.tscr(channel).modify(|m| m
            .with_ROB_ENB(0)
        )?;
    }

    Ok(())
}
