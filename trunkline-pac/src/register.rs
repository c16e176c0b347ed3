#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

use modular_bitfield_msb::prelude::*;

///////////////////////////////////////////////////////////////////////
// Global block

/// Global Status Register (GSR) - 0x0000
///
/// * DMA_TICK: The DMA engine completed one transfer tick. RXIDENT holds
///   the receive identity of the most recently filled buffer.
/// * FRAMER: One or more span framers have an interrupt pending. Read
///   FISB to find which.
/// * HDLC: One or more HDLC controllers have an interrupt pending.
/// * DSP: The echo canceller has an event pending.
/// * RXIDENT: Receive identity, a free-running 7-bit counter advanced by
///   the DMA engine once per millisecond tick.
///
/// Writing a 1 to a status bit acknowledges it. RXIDENT is read-only.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct GSR {
    pub DMA_TICK: B1,
    pub FRAMER: B1,
    pub HDLC: B1,
    pub DSP: B1,
    #[skip] __: B5,
    pub RXIDENT: B7,
}

/// Global Interrupt Enable Register (GIER) - 0x0001
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct GIER {
    pub DMA_TICK_ENB: B1,
    pub FRAMER_ENB: B1,
    pub HDLC_ENB: B1,
    pub DSP_ENB: B1,
    #[skip] __: B12,
}

/// Framer Interrupt Span Bitmap (FISB) - 0x0002
///
/// Bit N (LSB = span 0) is set while span N has framer status to report.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct FISB {
    #[skip] __: B8,
    pub SPANS: B8,
}

/// DMA Control Register (DMACR) - 0x0003
///
/// * RUN: Start (1) or stop (0) the DMA engine. The engine finishes the
///   tick in progress before it stops.
/// * BURST: Use PCI burst transfers (burst-capable generations only).
/// * EXPRESS: PCI Express bridge present.
/// * IRQ_ENB: Raise the interrupt line on every DMA tick.
/// * TICKS_PER_IRQ: Number of one-millisecond ticks per interrupt.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct DMACR {
    pub RUN: B1,
    pub BURST: B1,
    pub EXPRESS: B1,
    pub IRQ_ENB: B1,
    #[skip] __: B5,
    pub TICKS_PER_IRQ: B7,
}

/// DMA Address Registers
/// * Receive base low (DMARXL) - 0x0004
/// * Receive base high (DMARXH) - 0x0005
/// * Transmit base low (DMATXL) - 0x0006
/// * Transmit base high (DMATXH) - 0x0007
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct DMAADDR {
    pub ADDR: B16,
}

/// DMA Frame Count Register (DMACNT) - 0x0008
///
/// Number of frames in each of the receive and transmit rings.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct DMACNT {
    #[skip] __: B9,
    pub FRAMES: B7,
}

/// DMA Frame Size Register (DMAFSZ) - 0x0009
///
/// Size in bytes of one frame (one DMA tick worth of samples for every
/// channel of every span).
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct DMAFSZ {
    pub SIZE: B16,
}

/// Scratch Register (SCRATCH) - 0x000a
///
/// Read/write register with no side effects. Used by the start-up
/// register self-test.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct SCRATCH {
    pub VALUE: B16,
}

/// Revision Register (REVID) - 0x000b
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct REVID {
    pub GEN: B4,
    pub PORTS: B4,
    pub REV: B8,
}

#[derive(Copy, Clone, BitfieldSpecifier, Debug, PartialEq, Eq)]
#[bits=2]
pub enum ClockMode {
    /// The card's own oscillator times the card. Nothing is driven onto
    /// the timing cable.
    FreeRun = 0b00,

    /// The card recovers timing from the span in CLKSEL.SPAN and, with
    /// CABLE set, drives it onto the timing bus for other cards.
    Recovered = 0b01,

    /// The card tracks the reference on the timing bus.
    Tracking = 0b10,

    /// The card times itself from the span in CLKSEL.SPAN without
    /// declaring it a recovered reference.
    SystemTiming = 0b11,
}

/// Clock Select Register (CLKSEL) - 0x0010
///
/// * MODE: Receive clock source selection, see [`ClockMode`].
/// * CABLE: Drive the selected reference onto the inter-card timing cable.
/// * SPAN: Span providing the reference when MODE is `Recovered` or
///   `SystemTiming`.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct CLKSEL {
    pub MODE: ClockMode,
    pub CABLE: B1,
    #[skip] __: B9,
    pub SPAN: B4,
}

/// TSI Control Register (TSICR) - 0x0020
///
/// * HOLD: While set, the fabric ignores TSISRC/TSIDST. Clearing it
///   commits the pair written since it was set.
/// * OCTAL: Fabric runs in multiplexed octal mode (eight spans) rather
///   than single-stream mode (up to four spans).
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct TSICR {
    pub HOLD: B1,
    pub OCTAL: B1,
    #[skip] __: B14,
}

/// TSI Slot Registers
/// * Source slot (TSISRC) - 0x0021
/// * Destination slot (TSIDST) - 0x0022
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct TSISLOT {
    #[skip] __: B5,
    pub SLOT: B11,
}

///////////////////////////////////////////////////////////////////////
// Per-span framer block

#[derive(Copy, Clone, BitfieldSpecifier, Debug, PartialEq, Eq)]
#[bits=2]
pub enum LineMode {
    T1 = 0b00,
    E1 = 0b01,
    J1 = 0b10,
}

#[derive(Copy, Clone, BitfieldSpecifier, Debug, PartialEq, Eq)]
#[bits=2]
pub enum FramerLoopback {
    /// No Loopback
    No = 0b00,

    /// ### Framer Local Loopback
    /// Transmit PCM data is looped back to the receive PCM output. The
    /// line receive input is ignored while all ones are transmitted.
    Local = 0b01,

    /// ### Framer Network Line Loopback
    /// Received line data is re-transmitted after line decoding, without
    /// entering the framing blocks.
    NetworkLine = 0b10,

    /// ### Framer Network Payload Loopback
    /// Received timeslot payload is looped back to the transmit framer and
    /// re-framed on transmit timing.
    NetworkPayload = 0b11,
}

/// Framer Mode Register (FMR) - 0xN00
///
/// * MODE: Line mode, see [`LineMode`].
/// * ESF_CRC4: T1/J1 extended superframe, or E1 CRC-4 multiframe.
/// * B8ZS_HDB3: B8ZS (T1/J1) or HDB3 (E1) line coding, AMI otherwise.
/// * LB: Framer loopback, see [`FramerLoopback`].
/// * FORCE_LOS: Force loss of signal on the receiver.
/// * TX_ENB: Enable the line transmitter.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct FMR {
    pub MODE: LineMode,
    pub ESF_CRC4: B1,
    pub B8ZS_HDB3: B1,
    #[skip] __: B8,
    pub LB: FramerLoopback,
    pub FORCE_LOS: B1,
    pub TX_ENB: B1,
}

/// Framer Raw Status Register (FRSR) - 0xN01
///
/// Live (undebounced) receive conditions.
///
/// * LOS: Loss of signal.
/// * LFA: Loss of frame alignment (red).
/// * AIS: Alarm indication signal (blue).
/// * RAI: Remote alarm indication received (yellow).
/// * SIG_CHANGE: One or more receive signaling nibbles changed. Read
///   RSCR0/RSCR1 to find which.
/// * HDLC_RX: The span's HDLC controller has receive data ready.
/// * HDLC_TX: The span's HDLC controller can accept transmit data.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct FRSR {
    pub LOS: B1,
    pub LFA: B1,
    pub AIS: B1,
    pub RAI: B1,
    pub SIG_CHANGE: B1,
    pub HDLC_RX: B1,
    pub HDLC_TX: B1,
    #[skip] __: B9,
}

/// Framer Interrupt Enable Register (FIER) - 0xN02
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct FIER {
    pub LOS_ENB: B1,
    pub LFA_ENB: B1,
    pub AIS_ENB: B1,
    pub RAI_ENB: B1,
    pub SIG_ENB: B1,
    #[skip] __: B11,
}

/// Receive Signaling Change Registers
/// * Channels 0-15 (RSCR0) - 0xN03
/// * Channels 16-31 (RSCR1) - 0xN04
///
/// Bit N (LSB first) set when channel N's receive signaling changed.
/// Reading clears.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct RSChR {
    pub CH: B16,
}

/// Receive Signaling Array Register (RSAR) - 0xN20 + channel
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RSAR {
    #[skip] __: B12,
    pub ABCD: B4,
}

/// Transmit Signaling Control Register (TSCR) - 0xN40 + channel
///
/// * ROB_ENB: Insert robbed-bit signaling from ABCD rather than passing
///   the PCM data through.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct TSCR {
    pub ROB_ENB: B1,
    #[skip] __: B11,
    pub ABCD: B4,
}

///////////////////////////////////////////////////////////////////////
// Per-span HDLC controller

/// HDLC Command Register (HCR) - 0xN80
///
/// * RESET: Reset the controller. HSR.RESET_BUSY stays set until the
///   reset completes.
/// * TX_HALF_FULL: The transmit pool was filled with the bytes written
///   to HTXBUF since the last command.
/// * TX_MSG_END: The bytes handed over with TX_HALF_FULL end a message.
///   The controller appends the FCS and closing flag.
/// * RX_FLUSH: Discard receive data.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct HCR {
    pub RESET: B1,
    pub TX_HALF_FULL: B1,
    pub TX_MSG_END: B1,
    pub RX_FLUSH: B1,
    #[skip] __: B12,
}

/// HDLC Status Register (HSR) - 0xN81
///
/// * RESET_BUSY: Reset in progress.
/// * RX_FRAME: A complete frame ends in the receive buffer.
/// * RX_POOL_FULL: The receive pool filled before a frame ended.
/// * TX_HALF_EMPTY: The transmit pool drained below half.
/// * TX_POOL_READY: The transmit pool is ready for more data.
/// * CRC_ERR: The completed frame failed its FCS check.
/// * ABORT: The completed frame was aborted by the far end.
/// * OVERFLOW: The receive pool overflowed while assembling the frame.
/// * FRAMING_ERR: The completed frame was not an integral number of
///   octets.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct HSR {
    pub RESET_BUSY: B1,
    pub RX_FRAME: B1,
    pub RX_POOL_FULL: B1,
    pub TX_HALF_EMPTY: B1,
    pub TX_POOL_READY: B1,
    pub CRC_ERR: B1,
    pub ABORT: B1,
    pub OVERFLOW: B1,
    pub FRAMING_ERR: B1,
    #[skip] __: B7,
}

/// HDLC Interrupt Mask Register (HIMR) - 0xN82
///
/// A 1 enables the corresponding interrupt source.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct HIMR {
    pub RX_FRAME_ENB: B1,
    pub RX_POOL_FULL_ENB: B1,
    pub TX_HALF_EMPTY_ENB: B1,
    pub TX_POOL_READY_ENB: B1,
    #[skip] __: B12,
}

/// HDLC Timeslot Filter Registers
/// * Channels 0-15 (HTSF0) - 0xN83
/// * Channels 16-31 (HTSF1) - 0xN84
///
/// Bit N (LSB first) routes channel N's timeslot to the controller.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct HTSF {
    pub CH: B16,
}

/// HDLC Interframe Gap Register (HIFG) - 0xN85
///
/// Number of flag octets sent between frames.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct HIFG {
    #[skip] __: B8,
    pub FLAGS: B8,
}

/// HDLC Receive Byte Count Register (HRBC) - 0xN86
///
/// Number of bytes waiting in HRXBUF.
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct HRBC {
    #[skip] __: B10,
    pub COUNT: B6,
}

#[derive(Copy, Clone, BitfieldSpecifier, Debug, PartialEq, Eq)]
#[bits=2]
pub enum HdlcAddressing {
    None = 0b00,
    Address8 = 0b01,
    Address16 = 0b10,
    Transparent = 0b11,
}

/// HDLC Mode Register (HMODE) - 0xN87
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct HMODE {
    pub ADDRESSING: HdlcAddressing,
    pub FCS_ENB: B1,
    #[skip] __: B13,
}

/// HDLC Buffer Registers
/// * Receive buffer (HRXBUF) - 0xNc0 - 0xNdf
/// * Transmit buffer (HTXBUF) - 0xNe0 - 0xNff
///
#[bitfield(bits=16)]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub struct HBUF {
    #[skip] __: B8,
    pub DATA: B8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gsr_layout_is_msb_first() {
        let gsr = GSR::new().with_DMA_TICK(1).with_RXIDENT(0x7f);
        let raw: u16 = gsr.into();
        assert_eq!(raw, 0b1000_0000_0111_1111);

        let gsr = GSR::from(0b0100_0000_0000_0101u16);
        assert_eq!(gsr.DMA_TICK(), 0);
        assert_eq!(gsr.FRAMER(), 1);
        assert_eq!(gsr.RXIDENT(), 5);
    }

    #[test]
    fn clksel_round_trips_mode_and_span() {
        let clksel = CLKSEL::new()
            .with_MODE(ClockMode::Recovered)
            .with_CABLE(1)
            .with_SPAN(6);
        let raw: u16 = clksel.into();
        let back = CLKSEL::from(raw);
        assert_eq!(back.MODE(), ClockMode::Recovered);
        assert_eq!(back.CABLE(), 1);
        assert_eq!(back.SPAN(), 6);
    }

    #[test]
    fn tsislot_holds_eleven_bits() {
        let slot = TSISLOT::new().with_SLOT(0x7ff);
        let raw: u16 = slot.into();
        assert_eq!(raw, 0x07ff);
    }
}
