//! Interrupt and deferred-work dispatch for a card.
//!
//! The interrupt path snapshots every status register it needs in one
//! pass under the register lock, acknowledges what it read, and then acts
//! on the snapshot with only the card state locked. Work that may block or
//! reallocate (latency changes, clock reselection, DSP polling) is flagged
//! for the deferred worker.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use log::{debug, trace, warn};

use trunkline_pac::device::{Board, RegisterIo, CHANNELS_PER_SPAN};
use trunkline_pac::register::{FRSR, GSR, HSR};

use crate::alarm::RawStatus;
use crate::card::{Card, CardState};
use crate::dma::{TickOutcome, CHUNK};
use crate::error::Result;
use crate::host::{Chunk, Host};
use crate::span::Span;

struct SignalingStatus {
    changed: Vec<(usize, u8)>,
}

struct SpanInterruptStatus {
    frsr: FRSR,
    signaling: Option<SignalingStatus>,
    hdlc: Option<HSR>,
}

struct CardInterruptStatus {
    gsr: GSR,
    spans: Vec<SpanInterruptStatus>,
}

///////////////////////////////////////////////////////////////////////

impl CardInterruptStatus {
    /// Read and acknowledge. `None` if the card has nothing pending.
    fn capture<D: RegisterIo + ?Sized>(board: &Board<'_, D>, spans: usize) -> Result<Option<Self>> {
        let gsr = board.gsr().read()?;
        if gsr.DMA_TICK() == 0 && gsr.FRAMER() == 0 && gsr.HDLC() == 0 && gsr.DSP() == 0 {
            return Ok(None);
        }

        let flagged = if gsr.FRAMER() != 0 || gsr.HDLC() != 0 {
            board.fisb().read()?.SPANS()
        } else {
            0
        };

        let mut captured = Vec::with_capacity(spans);
        for span in board.spans(spans) {
            captured.push(SpanInterruptStatus::capture(&span, flagged & (1 << span.index()) != 0)?);
        }

        board.gsr().write(|w| w
            .with_DMA_TICK(gsr.DMA_TICK())
            .with_FRAMER(gsr.FRAMER())
            .with_HDLC(gsr.HDLC())
            .with_DSP(gsr.DSP())
        )?;
        for (span, status) in board.spans(spans).zip(captured.iter()) {
            if let Some(hsr) = status.hdlc {
                span.hsr().write(|_| hsr)?;
            }
        }

        Ok(Some(Self {
            gsr,
            spans: captured,
        }))
    }
}

impl SpanInterruptStatus {
    fn capture<D: RegisterIo + ?Sized>(span: &trunkline_pac::device::Span<'_, D>, flagged: bool) -> Result<Self> {
        let frsr = span.frsr().read()?;

        let signaling = if flagged && frsr.SIG_CHANGE() != 0 {
            let bitmap = span.rscr_bitmap()?;
            let mut changed = Vec::new();
            for channel in (0..CHANNELS_PER_SPAN).filter(|&c| bitmap & (1u32 << c) != 0) {
                changed.push((channel, span.rsar(channel).read()?.ABCD()));
            }
            Some(SignalingStatus { changed })
        } else {
            None
        };

        let hdlc = if flagged && (frsr.HDLC_RX() != 0 || frsr.HDLC_TX() != 0) {
            Some(span.hsr().read()?)
        } else {
            None
        };

        Ok(Self {
            frsr,
            signaling,
            hdlc,
        })
    }
}

///////////////////////////////////////////////////////////////////////

/// Hand one DMA frame's samples to the host and take its transmit samples.
///
/// A frame holds `CHUNK` rows per span; each row is one sample of all 32
/// timeslots.
///
fn fan_out(spans: &[Span], host: &mut dyn Host, rx: &[u8], tx: &mut [u8]) {
    let count = spans.len();
    let rx_rows: &[[u8; CHANNELS_PER_SPAN]] = bytemuck::cast_slice(rx);
    let tx_rows: &mut [[u8; CHANNELS_PER_SPAN]] = bytemuck::cast_slice_mut(tx);

    for span in spans.iter().filter(|s| s.running()) {
        let line = span.line();
        for channel in span.channels().iter().filter(|c| c.open) {
            let timeslot = line.timeslot(channel.index);
            let row = |sample: usize| sample * count + span.index();

            let mut received: Chunk = [0; CHUNK];
            for (sample, byte) in received.iter_mut().enumerate() {
                *byte = rx_rows[row(sample)][timeslot];
            }
            host.receive(span.index(), channel.index, &received);

            let mut transmit: Chunk = [line.idle_code(); CHUNK];
            host.transmit(span.index(), channel.index, &mut transmit);
            for (sample, &byte) in transmit.iter().enumerate() {
                tx_rows[row(sample)][timeslot] = byte;
            }
        }
    }
}

impl<W: RegisterIo> Card<W> {
    /// Service the card's interrupt line. Returns `false` if the interrupt
    /// was not this card's.
    ///
    /// `now_ms` drives alarm debounce; pass [`Card::now_ms`] outside tests.
    ///
    pub fn handle_interrupt(&self, now_ms: u64) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }

        let spans = self.spans();
        let status = match self.regs.board(|board| CardInterruptStatus::capture(board, spans)) {
            Ok(Some(status)) => status,
            Ok(None) => return false,
            Err(e) => {
                warn!("card {}: reading interrupt status failed: {e}", self.index);
                return false;
            },
        };
        self.interrupts.fetch_add(1, Ordering::AcqRel);

        let mut wake = false;
        {
            let mut state = self.lock_state();
            let state = &mut *state;

            if status.gsr.DMA_TICK() != 0 {
                wake |= self.on_dma_tick(state, status.gsr.RXIDENT());
            }

            for (index, span_status) in status.spans.iter().enumerate() {
                wake |= self.on_span_status(state, index, span_status, now_ms);
            }
        }

        if status.gsr.DSP() != 0 {
            self.deferred.dsp.store(true, Ordering::Release);
            wake = true;
        }

        if wake {
            let _ = self.wake.try_send(());
        }
        true
    }

    fn on_dma_tick(&self, state: &mut CardState, ident: u8) -> bool {
        let outcome = state.ring.on_tick(ident, |_, rx, tx| {
            fan_out(&state.spans, state.host.as_mut(), rx, tx)
        });

        match outcome {
            TickOutcome::Normal => false,
            TickOutcome::Coalesced { frames } => {
                trace!("card {}: {frames} frames in one tick", self.index);
                false
            },
            TickOutcome::Spurious => {
                debug!("card {}: tick without new frames", self.index);
                false
            },
            TickOutcome::Shortfall { missed, needed } => {
                debug!("card {}: missed {missed} ticks, ring needs {needed}", self.index);
                let pending = state.ring.pending_depth().is_some();
                if pending {
                    self.deferred.latency.store(true, Ordering::Release);
                }
                pending
            },
            TickOutcome::Overrun { missed } => {
                warn!("card {}: lost {missed} ticks at maximum latency", self.index);
                false
            },
        }
    }

    fn on_span_status(&self, state: &mut CardState, index: usize, status: &SpanInterruptStatus, now_ms: u64) -> bool {
        let span = &mut state.spans[index];
        let mut wake = false;

        let not_open = !span.any_open();
        let loopback = span.maintenance.is_loopback();
        let evaluation = span.alarms.evaluate(RawStatus::from(status.frsr), now_ms, not_open, loopback);
        if evaluation.changed {
            debug!("card {}: span {index} alarms {:?}", self.index, evaluation.mask);
            state.host.alarm_changed(index, evaluation.mask);
        }
        if evaluation.resync {
            self.deferred.sync.store(true, Ordering::Release);
            wake = true;
        }

        if let Some(signaling) = &status.signaling {
            for &(channel, abcd) in &signaling.changed {
                let Some(c) = span.channels.get_mut(channel) else {
                    continue;
                };
                if c.rx_signaling != abcd {
                    c.rx_signaling = abcd;
                    span.counters.signaling_changes += 1;
                    state.host.signaling_changed(index, channel, abcd);
                }
            }
        }

        if let Some(hsr) = status.hdlc {
            let host = state.host.as_mut();
            let serviced = self.regs.board(|board| -> Result<()> {
                let regs = board.span(index);
                if hsr.RX_FRAME() != 0 || hsr.RX_POOL_FULL() != 0 {
                    span.hdlc.on_receive_ready(&regs, hsr, host)?;
                }
                if hsr.TX_HALF_EMPTY() != 0 || hsr.TX_POOL_READY() != 0 {
                    span.hdlc.on_transmit_ready(&regs, host)?;
                }
                Ok(())
            });
            if let Err(e) = serviced {
                warn!("card {}: span {index} HDLC service failed: {e}", self.index);
            }
        }

        wake
    }

    /// Run whatever the interrupt handler deferred, plus the periodic
    /// clock check and DSP poll once their periods have passed.
    pub fn service_deferred(&self, now_ms: u64) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let mut result = Ok(());

        if self.deferred.latency.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.increase_latency() {
                warn!("card {}: latency increase failed: {e}", self.index);
                result = Err(e);
            }
        }

        let (sync_due, dsp_due) = {
            let state = self.lock_state();
            (
                now_ms.saturating_sub(state.last_sync_ms) >= self.config.sync_period_ms,
                now_ms.saturating_sub(state.last_dsp_ms) >= self.config.dsp_poll_ms,
            )
        };

        if self.deferred.sync.swap(false, Ordering::AcqRel) || sync_due {
            if let Err(e) = self.resync_clock() {
                warn!("card {}: clock selection failed: {e}", self.index);
                result = result.and(Err(e));
            }
        }

        if self.deferred.dsp.swap(false, Ordering::AcqRel) || dsp_due {
            let mut state = self.lock_state();
            let state = &mut *state;
            state.last_dsp_ms = now_ms;
            match state.echo.poll(state.host.as_mut()) {
                Ok(0) => {},
                Ok(events) => trace!("card {}: {events} DSP events", self.index),
                Err(e) => {
                    warn!("card {}: DSP poll failed: {e}", self.index);
                    result = result.and(Err(e));
                },
            }
        }

        result
    }

    fn increase_latency(&self) -> Result<()> {
        let mut state = self.lock_state();
        let state = &mut *state;
        let Some(depth) = state.ring.pending_depth() else {
            return Ok(());
        };
        let installed = state.ring.request_latency_increase(depth, &self.regs, state.allocator.as_mut())?;
        debug!("card {}: latency now {installed}", self.index);
        Ok(())
    }
}

/// Deferred-work loop for one card. Returns once the card shuts down.
pub fn run_deferred<W: RegisterIo>(card: &Card<W>) {
    let period = Duration::from_millis(card.config.sync_period_ms.min(card.config.dsp_poll_ms));

    loop {
        match card.wakeups.recv_timeout(period) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if card.stopping.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = card.service_deferred(card.now_ms()) {
            warn!("card {}: deferred work: {e}", card.index);
        }
    }

    debug!("card {}: deferred worker exiting", card.index);
}

pub fn spawn_deferred_worker<W>(card: Arc<Card<W>>) -> io::Result<JoinHandle<()>>
where
    W: RegisterIo + Send + 'static,
{
    thread::Builder::new()
        .name(format!("trunkline_card{}", card.index()))
        .spawn(move || run_deferred(&card))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmMask;
    use crate::card::tests::{config, rig, rig_with, Rig};
    use crate::config::DriverConfig;
    use crate::echo::{DspEvent, ToneEvent};
    use crate::hdlc::HdlcAbort;
    use crate::sim::HostEvent;
    use crate::span::LineType;
    use crate::sync::{ClockSelection, SyncRegistry};
    use trunkline_pac::device::Addressing;
    use trunkline_pac::register::{ClockMode, HdlcAddressing, FISB, RSAR, RSChR, HRBC};

    const GSR_ADDRESS: u16 = 0x0000;
    const FISB_ADDRESS: u16 = 0x0002;

    fn span_address(span: usize, offset: usize) -> u16 {
        Addressing::span_nxx(span, offset) as u16
    }

    fn raise(rig: &Rig, gsr: GSR) {
        rig.memory.poke(GSR_ADDRESS, gsr.into());
    }

    fn tick(rig: &Rig, ident: u8, now: u64) -> bool {
        raise(rig, GSR::new().with_DMA_TICK(1).with_RXIDENT(ident));
        rig.card.handle_interrupt(now)
    }

    fn set_frsr(rig: &Rig, span: usize, frsr: FRSR) {
        rig.memory.poke(span_address(span, 0x01), frsr.into());
    }

    fn started() -> Rig {
        let rig = rig();
        rig.card.start().unwrap();
        rig.host.take_events();
        rig
    }

    #[test]
    fn foreign_interrupt_is_declined() {
        let rig = started();
        assert!(!rig.card.handle_interrupt(0));
        assert_eq!(rig.card.counters().interrupts, 0);
    }

    #[test]
    fn stopped_card_declines_interrupts() {
        let rig = rig();
        raise(&rig, GSR::new().with_DMA_TICK(1));
        assert!(!rig.card.handle_interrupt(0));
    }

    #[test]
    fn status_is_acknowledged() {
        let rig = started();
        assert!(tick(&rig, 5, 0));
        let gsr = GSR::from(rig.memory.peek(GSR_ADDRESS));
        assert_eq!(gsr.DMA_TICK(), 0);
        assert_eq!(gsr.RXIDENT(), 5);
        assert_eq!(rig.card.counters().interrupts, 1);
    }

    #[test]
    fn samples_reach_open_channels() {
        let rig = started();
        rig.card.span_startup(1).unwrap();
        rig.card.open_channel(1, 7).unwrap();
        rig.host.set_transmit(1, 7, 0x42);

        for ident in 0..3 {
            tick(&rig, ident, 0);
        }

        // Fresh DMA memory reads as idle code.
        assert_eq!(rig.host.received(1, 7), vec![0xff; 3 * CHUNK]);
        assert!(rig.host.received(1, 6).is_empty());
        assert!(rig.host.received(0, 7).is_empty());

        let state = rig.card.lock_state();
        let region = state.ring.region().unwrap();
        assert_eq!(region.len(), 2 * 2 * crate::dma::frame_size(4));
    }

    #[test]
    fn late_interrupt_deepens_ring() {
        let rig = started();
        tick(&rig, 10, 0);
        tick(&rig, 14, 0);

        let counters = rig.card.counters();
        assert_eq!(counters.missed_interrupts, 1);
        assert_eq!(rig.card.latency(), 2);

        rig.card.service_deferred(0).unwrap();
        assert!(rig.card.latency() >= 4);
        assert_eq!(rig.card.counters().latency_changes, 1);

        let dmacnt = rig.card.regs.board(|b| b.dmacnt().read()).unwrap();
        assert_eq!(dmacnt.FRAMES() as usize, rig.card.latency());
        assert_eq!(rig.card.regs.board(|b| b.dmacr().read()).unwrap().RUN(), 1);
    }

    #[test]
    fn lost_ticks_at_maximum_latency_are_counted() {
        let rig = rig_with(0, DriverConfig { max_latency: 2, ..config() }, Arc::new(SyncRegistry::new(false)));
        rig.card.start().unwrap();
        tick(&rig, 0, 0);
        tick(&rig, 9, 0);

        let counters = rig.card.counters();
        assert_eq!(counters.lossy_ticks, 1);
        rig.card.service_deferred(0).unwrap();
        assert_eq!(rig.card.latency(), 2);
    }

    #[test]
    fn debounced_loss_of_signal_moves_the_clock() {
        let rig = started();
        rig.card.span_startup(0).unwrap();
        rig.card.span_startup(1).unwrap();
        rig.card.set_sync_priority(0, 1).unwrap();
        rig.card.set_sync_priority(1, 2).unwrap();
        rig.card.open_channel(0, 0).unwrap();
        assert_eq!(rig.card.clock(), Some(ClockSelection { mode: ClockMode::Recovered, span: 0, cable: false }));

        set_frsr(&rig, 0, FRSR::new().with_LOS(1));
        tick(&rig, 0, 0);
        assert!(!rig.card.alarms(0).unwrap().contains(AlarmMask::RED));

        tick(&rig, 1, 2_500);
        let alarms = rig.card.alarms(0).unwrap();
        assert!(alarms.contains(AlarmMask::RED | AlarmMask::LOS));
        assert!(rig.host.events().contains(&HostEvent::Alarm(0, alarms)));

        rig.card.service_deferred(2_500).unwrap();
        assert_eq!(rig.card.clock(), Some(ClockSelection { mode: ClockMode::Recovered, span: 1, cable: false }));
        let clksel = rig.card.regs.board(|b| b.clksel().read()).unwrap();
        assert_eq!(clksel.SPAN(), 1);
    }

    #[test]
    fn signaling_changes_are_reported_once() {
        let rig = started();
        rig.memory.poke(FISB_ADDRESS, FISB::new().with_SPANS(0b0100).into());
        set_frsr(&rig, 2, FRSR::new().with_SIG_CHANGE(1));
        rig.memory.poke(span_address(2, 0x03), RSChR::new().with_CH(1 << 3).into());
        rig.memory.poke(span_address(2, 0x20 + 3), RSAR::new().with_ABCD(0b1010).into());

        raise(&rig, GSR::new().with_FRAMER(1));
        assert!(rig.card.handle_interrupt(0));
        raise(&rig, GSR::new().with_FRAMER(1));
        assert!(rig.card.handle_interrupt(1));

        let signaling: Vec<_> = rig.host.events().into_iter()
            .filter(|e| matches!(e, HostEvent::Signaling(..)))
            .collect();
        assert_eq!(signaling, vec![HostEvent::Signaling(2, 3, 0b1010)]);
        assert_eq!(rig.card.rx_signaling(2, 3).unwrap(), 0b1010);
        assert_eq!(rig.card.span_status(2).unwrap().counters.signaling_changes, 1);
    }

    #[test]
    fn bad_checksum_aborts_received_frame() {
        let rig = started();
        rig.card.hdlc_start(1, 23, HdlcAddressing::None).unwrap();

        rig.memory.poke(FISB_ADDRESS, FISB::new().with_SPANS(0b0010).into());
        set_frsr(&rig, 1, FRSR::new().with_HDLC_RX(1));
        rig.memory.poke(span_address(1, 0x81), HSR::new().with_RX_FRAME(1).with_CRC_ERR(1).into());
        rig.memory.poke(span_address(1, 0x86), HRBC::new().with_COUNT(2).into());
        raise(&rig, GSR::new().with_HDLC(1));
        rig.host.take_events();

        assert!(rig.card.handle_interrupt(0));

        let events: Vec<_> = rig.host.take_events().into_iter()
            .filter(|e| !matches!(e, HostEvent::Alarm(..)))
            .collect();
        assert_eq!(events, vec![HostEvent::HdlcAbort(1, HdlcAbort::BadChecksum)]);
        assert_eq!(rig.memory.peek(span_address(1, 0x81)), 0);
        assert_eq!(rig.card.span_status(1).unwrap().hdlc.aborts, 1);
    }

    #[test]
    fn dsp_events_reach_host() {
        let rig = started();
        let flat = rig.card.lock_state().echo.flat_index(3, 9);
        rig.dsp.push_event(DspEvent { channel: flat, event: ToneEvent::Begin('5') });

        raise(&rig, GSR::new().with_DSP(1));
        assert!(rig.card.handle_interrupt(0));
        rig.card.service_deferred(0).unwrap();

        assert!(rig.host.events().contains(&HostEvent::Dsp(3, 9, ToneEvent::Begin('5'))));
    }

    #[test]
    fn line_type_sets_timeslot_and_idle_code() {
        let rig = started();
        rig.card.configure_span(0, LineType::E1).unwrap();
        rig.card.span_startup(0).unwrap();
        rig.card.open_channel(0, 30).unwrap();
        tick(&rig, 0, 0);
        assert_eq!(rig.host.received(0, 30).len(), CHUNK);
    }

    #[test]
    fn worker_exits_on_shutdown() {
        let Rig { card, .. } = rig();
        let card = Arc::new(card);
        card.start().unwrap();

        let worker = spawn_deferred_worker(card.clone()).unwrap();
        card.shutdown().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn restarted_card_runs_deferred_work() {
        let Rig { card, memory, .. } = rig();
        let card = Arc::new(card);
        card.start().unwrap();
        card.shutdown().unwrap();
        card.start().unwrap();

        let worker = spawn_deferred_worker(card.clone()).unwrap();
        for ident in [10, 14] {
            memory.poke(GSR_ADDRESS, GSR::new().with_DMA_TICK(1).with_RXIDENT(ident).into());
            assert!(card.handle_interrupt(0));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while card.latency() < 4 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(card.latency() >= 4);
        assert!(!worker.is_finished());

        card.shutdown().unwrap();
        worker.join().unwrap();
    }
}
