use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};

use trunkline_pac::device::{Addressing, RegisterAddress, RegisterIo, RegisterValue};
use trunkline_pac::register::{HdlcAddressing, REVID};

use crate::alarm::AlarmMask;
use crate::config::DriverConfig;
use crate::dma::{DmaAllocator, DmaRing, HeapAllocator};
use crate::echo::{EchoCanceller, EchoControl};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::hdlc::HdlcCounters;
use crate::host::Host;
use crate::maintenance::{self, Maintenance};
use crate::reserve::Reservation;
use crate::span::{LineType, Span, SpanCounters};
use crate::sync::{ClockSelection, SyncRegistry, MAX_SYNC_PRIORITY};
use crate::tsi::{ChannelAddress, CrossConnect, CrossConnects, FabricMode};
use crate::window::RegisterWindow;

/// Hardware generation and capabilities, from the revision register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    pub gen2: bool,
    pub gen3: bool,
    pub gen5: bool,
    pub burst: bool,
    pub express: bool,
    pub ports: usize,
}

impl Generation {
    pub fn from_revid(revid: REVID) -> Result<Self> {
        let generation = revid.GEN();
        let ports = revid.PORTS() as usize;
        if !matches!(ports, 1 | 2 | 4 | 8) {
            return Err(Error::Config(format!("unsupported port count {ports}")));
        }
        if generation < 2 {
            return Err(Error::Config(format!("unsupported card generation {generation}")));
        }

        Ok(Self {
            gen2: generation >= 2,
            gen3: generation >= 3,
            gen5: generation >= 5,
            burst: generation >= 3,
            express: generation >= 5,
            ports,
        })
    }

    pub fn revid(&self) -> REVID {
        let generation = if self.gen5 { 5 } else if self.gen3 { 3 } else { 2 };
        REVID::new()
            .with_GEN(generation)
            .with_PORTS(self.ports as u8)
    }

    pub fn quad() -> Self {
        Self { gen2: true, gen3: true, gen5: false, burst: true, express: false, ports: 4 }
    }

    pub fn octal() -> Self {
        Self { gen2: true, gen3: true, gen5: true, burst: true, express: true, ports: 8 }
    }

    pub fn fabric_mode(&self) -> FabricMode {
        FabricMode::for_ports(self.ports)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CardCounters {
    pub interrupts: u64,
    pub missed_interrupts: u64,
    pub lossy_ticks: u64,
    pub latency_changes: u64,
    pub spurious: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpanStatus {
    pub line: LineType,
    pub alarms: AlarmMask,
    pub maintenance: Maintenance,
    pub sync_priority: u8,
    pub running: bool,
    pub counters: SpanCounters,
    pub hdlc: HdlcCounters,
}

#[derive(Default)]
pub(crate) struct DeferredFlags {
    pub latency: AtomicBool,
    pub sync: AtomicBool,
    pub dsp: AtomicBool,
}

pub(crate) struct CardState {
    pub spans: Vec<Span>,
    pub ring: DmaRing,
    pub allocator: Box<dyn DmaAllocator>,
    pub tsi: CrossConnects,
    pub echo: EchoControl,
    pub host: Box<dyn Host>,
    pub sync_handle: Option<Handle>,
    pub clock: Option<ClockSelection>,
    pub last_sync_ms: u64,
    pub last_dsp_ms: u64,
}

/// One framer card.
///
/// Lock order is card state, then the register window. The sync registry
/// lock is taken with the card state held but never with the register
/// window held.
///
pub struct Card<W> {
    pub(crate) index: usize,
    pub(crate) generation: Generation,
    pub(crate) config: DriverConfig,
    pub(crate) regs: RegisterWindow<W>,
    pub(crate) state: Mutex<CardState>,
    pub(crate) registry: Arc<SyncRegistry>,
    pub(crate) deferred: DeferredFlags,
    pub(crate) started: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) stopping: AtomicBool,
    pub(crate) interrupts: AtomicU64,
    pub(crate) wake: Sender<()>,
    pub(crate) wakeups: Receiver<()>,
    epoch: Instant,
}

impl<W: RegisterIo> Card<W> {
    pub fn new(
        index: usize,
        io: W,
        config: DriverConfig,
        generation: Generation,
        registry: Arc<SyncRegistry>,
        host: Box<dyn Host>,
        dsp: Box<dyn EchoCanceller>,
    ) -> Result<Self> {
        config.validate()?;

        let spans = generation.ports;
        let (wake, wakeups) = bounded(1);

        Ok(Self {
            index,
            generation,
            regs: RegisterWindow::new(io),
            state: Mutex::new(CardState {
                spans: (0..spans).map(|i| Span::new(i, &config)).collect(),
                ring: DmaRing::new(spans, config.max_latency, config.ticks_per_irq),
                allocator: Box::new(HeapAllocator::new()),
                tsi: CrossConnects::new(generation.fabric_mode()),
                echo: EchoControl::new(dsp, spans),
                host,
                sync_handle: None,
                clock: None,
                last_sync_ms: 0,
                last_dsp_ms: 0,
            }),
            config,
            registry,
            deferred: DeferredFlags::default(),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            interrupts: AtomicU64::new(0),
            wake,
            wakeups,
            epoch: Instant::now(),
        })
    }

    /// Use `allocator` for DMA memory instead of the heap.
    pub fn with_allocator(mut self, allocator: Box<dyn DmaAllocator>) -> Self {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner).allocator = allocator;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn spans(&self) -> usize {
        self.generation.ports
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Milliseconds since the card was created, for the `now` arguments.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_span(&self, span: usize) -> Result<()> {
        if span >= self.spans() {
            return Err(Error::SpanIndex(span));
        }
        Ok(())
    }

    fn check_channel(state: &CardState, address: ChannelAddress) -> Result<()> {
        let span = state.spans.get(address.span).ok_or(Error::SpanIndex(address.span))?;
        if address.channel >= span.channels.len() {
            return Err(Error::ChannelIndex { span: address.span, channel: address.channel });
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // Lifecycle

    /// Bring the card up: register self-test, DMA ring, sync registration,
    /// interrupts. A failure undoes the completed steps and leaves every
    /// span in red alarm.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) || self.started.load(Ordering::Acquire) {
            return Err(Error::Config(format!("card {} already running", self.index)));
        }
        info!("card {}: starting {:?}", self.index, self.generation);
        self.stopping.store(false, Ordering::Release);

        if let Err(e) = self.bring_up() {
            error!("card {}: start failed: {e}", self.index);
            self.force_red();
            return Err(e);
        }

        for span in self.lock_state().spans.iter_mut() {
            span.alarms.reset();
        }
        self.running.store(true, Ordering::Release);
        if let Err(e) = self.resync_clock() {
            warn!("card {}: initial clock selection failed: {e}", self.index);
        }
        info!("card {}: running", self.index);
        Ok(())
    }

    fn bring_up(&self) -> Result<()> {
        let mut reservation = Reservation::new("card start");
        reservation.step("register self-test", || self.self_test(), || {})?;
        reservation.step("DMA ring", || self.install_dma(), || self.release_dma())?;
        reservation.step("sync registry", || self.register_sync(), || self.unregister_sync())?;
        reservation.step("interrupts", || self.enable_interrupts(), || self.disable_interrupts())?;
        reservation.step("interrupt check", || self.wait_for_interrupts(), || {})?;
        reservation.commit();
        Ok(())
    }

    fn self_test(&self) -> Result<()> {
        const PATTERNS: [u16; 6] = [0x0000, 0xffff, 0xaaaa, 0x5555, 0x1248, 0xedb7];

        self.regs.board(|board| {
            let scratch = board.scratch();
            for wrote in PATTERNS {
                scratch.write(|w| w.with_VALUE(wrote))?;
                let read = scratch.read()?.VALUE();
                if read != wrote {
                    return Err(Error::SelfTest { address: scratch.address(), wrote, read });
                }
            }
            Ok(())
        })
    }

    fn install_dma(&self) -> Result<()> {
        let mut state = self.lock_state();
        let state = &mut *state;
        state.ring.install_buffers(self.config.latency, &self.regs, state.allocator.as_mut())
    }

    fn release_dma(&self) {
        let mut state = self.lock_state();
        let state = &mut *state;
        state.ring.release_buffers(state.allocator.as_mut());
    }

    fn register_sync(&self) -> Result<()> {
        let handle = self.registry.register(self.index, self.spans())?;
        let mut state = self.lock_state();
        state.sync_handle = Some(handle);
        state.clock = None;
        Ok(())
    }

    fn unregister_sync(&self) {
        let handle = self.lock_state().sync_handle.take();
        if let Some(handle) = handle {
            if let Err(e) = self.registry.unregister(handle) {
                warn!("card {}: sync unregister: {e}", self.index);
            }
        }
    }

    fn enable_interrupts(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        let generation = self.generation;
        let ticks = self.config.ticks_per_irq as u8;

        self.regs.board(|board| -> Result<()> {
            board.gsr().write(|w| w
                .with_DMA_TICK(1)
                .with_FRAMER(1)
                .with_HDLC(1)
                .with_DSP(1)
            )?;
            board.gier().write(|w| w
                .with_DMA_TICK_ENB(1)
                .with_FRAMER_ENB(1)
                .with_HDLC_ENB(1)
                .with_DSP_ENB(1)
            )?;
            board.dmacr().write(|w| w
                .with_RUN(1)
                .with_BURST(generation.burst as u8)
                .with_EXPRESS(generation.express as u8)
                .with_IRQ_ENB(1)
                .with_TICKS_PER_IRQ(ticks)
            )?;
            Ok(())
        })
    }

    fn disable_interrupts(&self) {
        self.started.store(false, Ordering::Release);
        let masked = self.regs.board(|board| -> Result<()> {
            board.dmacr().modify(|m| m.with_RUN(0).with_IRQ_ENB(0))?;
            board.gier().write(|w| w)?;
            Ok(())
        });
        if let Err(e) = masked {
            warn!("card {}: masking interrupts failed: {e}", self.index);
        }
    }

    fn wait_for_interrupts(&self) -> Result<()> {
        let wait_ms = self.config.interrupt_wait_ms;
        if wait_ms == 0 {
            return Ok(());
        }

        let before = self.interrupts.load(Ordering::Acquire);
        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        while Instant::now() < deadline {
            if self.interrupts.load(Ordering::Acquire) != before {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(Error::NoInterrupts(wait_ms))
    }

    fn force_red(&self) {
        let mut state = self.lock_state();
        let state = &mut *state;
        for span in state.spans.iter_mut() {
            let evaluation = span.alarms.force_red();
            if evaluation.changed {
                state.host.alarm_changed(span.index(), evaluation.mask);
            }
        }
    }

    /// Stop DMA, mask interrupts, stop HDLC and leave the sync registry.
    /// Cleanup continues past register failures; the first is returned.
    pub fn shutdown(&self) -> Result<()> {
        info!("card {}: shutting down", self.index);
        self.running.store(false, Ordering::Release);
        self.stopping.store(true, Ordering::Release);
        self.disable_interrupts();

        let mut result = Ok(());
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            for span in state.spans.iter_mut() {
                span.running = false;
                if span.hdlc.channel().is_some() {
                    let index = span.index();
                    let stopped = self.regs.board(|board| span.hdlc.stop(&board.span(index)));
                    if let Err(e) = stopped {
                        warn!("card {}: span {index} HDLC stop failed: {e}", self.index);
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
            }
            state.ring.release_buffers(state.allocator.as_mut());
        }
        self.unregister_sync();

        let _ = self.wake.try_send(());
        result
    }

    ///////////////////////////////////////////////////////////////////
    // Timing

    /// Re-run the clock election for this card and program the result if
    /// it changed.
    pub fn resync_clock(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.last_sync_ms = self.now_ms();
        let Some(handle) = state.sync_handle else {
            return Ok(());
        };

        let candidates: Vec<_> = state.spans.iter().map(Span::candidate).collect();
        self.registry.update(handle, &candidates)?;
        let selection = self.registry.decide(handle)?;

        if state.clock == Some(selection) {
            return Ok(());
        }

        self.regs.board(|board| board.clksel().write(|w| w
            .with_MODE(selection.mode)
            .with_CABLE(selection.cable as u8)
            .with_SPAN(selection.span as u8)
        ))?;
        info!("card {}: clock {:?} span {}{}", self.index, selection.mode, selection.span,
            if selection.cable { " (cable)" } else { "" });
        state.clock = Some(selection);
        Ok(())
    }

    pub fn clock(&self) -> Option<ClockSelection> {
        self.lock_state().clock
    }

    pub fn set_sync_priority(&self, span: usize, priority: u8) -> Result<()> {
        self.check_span(span)?;
        if priority > MAX_SYNC_PRIORITY {
            return Err(Error::SyncPriority(priority));
        }
        self.lock_state().spans[span].sync_priority = priority;
        self.resync_clock()
    }

    ///////////////////////////////////////////////////////////////////
    // Spans

    /// Set a span's line type. Channels are rebuilt, so cross-connects,
    /// echo cancellation and HDLC on the span are torn down.
    pub fn configure_span(&self, span: usize, line: LineType) -> Result<()> {
        self.check_span(span)?;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            let s = &mut state.spans[span];
            let tsi = &mut state.tsi;
            let channels = s.channels.len();

            self.regs.board(|board| -> Result<()> {
                if s.hdlc.channel().is_some() {
                    s.hdlc.stop(&board.span(span))?;
                }
                for channel in 0..channels {
                    tsi.release_channel(board, ChannelAddress::new(span, channel))?;
                }
                board.span(span).fmr().modify(|m| m
                    .with_MODE(line.framer_mode())
                    .with_ESF_CRC4(1)
                    .with_B8ZS_HDB3(1)
                )?;
                Ok(())
            })?;

            state.echo.invalidate_span(span)?;
            s.configure(line);
            debug!("card {}: span {span} configured {line:?}", self.index);
        }
        self.resync_clock()
    }

    pub fn span_startup(&self, span: usize) -> Result<()> {
        self.check_span(span)?;
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        {
            let mut state = self.lock_state();
            self.regs.board(|board| -> Result<()> {
                let regs = board.span(span);
                regs.fmr().modify(|m| m.with_TX_ENB(1))?;
                regs.fier().write(|w| w
                    .with_LOS_ENB(1)
                    .with_LFA_ENB(1)
                    .with_AIS_ENB(1)
                    .with_RAI_ENB(1)
                    .with_SIG_ENB(1)
                )?;
                Ok(())
            })?;
            state.spans[span].running = true;
        }
        info!("card {}: span {span} up", self.index);
        self.resync_clock()
    }

    pub fn span_shutdown(&self, span: usize) -> Result<()> {
        self.check_span(span)?;
        {
            let mut state = self.lock_state();
            let s = &mut state.spans[span];
            s.running = false;
            self.regs.board(|board| -> Result<()> {
                let regs = board.span(span);
                if s.hdlc.channel().is_some() {
                    s.hdlc.stop(&regs)?;
                }
                regs.fier().write(|w| w)?;
                regs.fmr().modify(|m| m.with_TX_ENB(0))?;
                Ok(())
            })?;
        }
        info!("card {}: span {span} down", self.index);
        self.resync_clock()
    }

    pub fn set_maintenance(&self, span: usize, mode: Maintenance) -> Result<()> {
        self.check_span(span)?;
        {
            let mut state = self.lock_state();
            let s = &mut state.spans[span];
            let previous = s.maintenance;
            let channels = s.channels.len();
            let line = s.line();
            let restore: Vec<(usize, u8)> = s.channels.iter().map(|c| (c.index, c.tx_signaling)).collect();

            self.regs.board(|board| -> Result<()> {
                let regs = board.span(span);
                maintenance::apply(&regs, mode, channels)?;
                if previous == Maintenance::NetworkPayloadLoopback && mode != previous && line.robbed_bit() {
                    for &(channel, abcd) in &restore {
                        regs.tscr(channel).write(|w| w.with_ROB_ENB(1).with_ABCD(abcd))?;
                    }
                }
                Ok(())
            })?;

            s.maintenance = mode;
            s.alarms.simulate(mode.simulated_alarms());
            debug!("card {}: span {span} maintenance {mode:?}", self.index);
        }
        self.resync_clock()
    }

    pub fn span_status(&self, span: usize) -> Result<SpanStatus> {
        self.check_span(span)?;
        let state = self.lock_state();
        let s = &state.spans[span];
        Ok(SpanStatus {
            line: s.line(),
            alarms: s.alarms(),
            maintenance: s.maintenance(),
            sync_priority: s.sync_priority(),
            running: s.running(),
            counters: s.counters(),
            hdlc: s.hdlc.counters(),
        })
    }

    pub fn alarms(&self, span: usize) -> Result<AlarmMask> {
        Ok(self.span_status(span)?.alarms)
    }

    ///////////////////////////////////////////////////////////////////
    // Channels

    pub fn open_channel(&self, span: usize, channel: usize) -> Result<()> {
        self.check_span(span)?;
        self.lock_state().spans[span].channel_mut(channel)?.open = true;
        Ok(())
    }

    /// Close a channel, tearing down whatever refers to it.
    pub fn close_channel(&self, span: usize, channel: usize) -> Result<()> {
        self.check_span(span)?;
        let mut state = self.lock_state();
        let state = &mut *state;
        let s = &mut state.spans[span];
        s.channel_mut(channel)?.open = false;

        let tsi = &mut state.tsi;
        self.regs.board(|board| -> Result<()> {
            tsi.release_channel(board, ChannelAddress::new(span, channel))?;
            if s.hdlc.channel() == Some(channel) {
                s.hdlc.stop(&board.span(span))?;
            }
            Ok(())
        })?;
        state.echo.disable_channel(span, channel)
    }

    /// Transmit robbed-bit signaling `abcd` on a channel.
    pub fn set_tx_signaling(&self, span: usize, channel: usize, abcd: u8) -> Result<()> {
        self.check_span(span)?;
        let mut state = self.lock_state();
        let s = &mut state.spans[span];
        if !s.line().robbed_bit() {
            return Err(Error::Config(format!("span {span} is {:?}, no robbed-bit signaling", s.line())));
        }
        let abcd = abcd & 0x0f;
        s.channel_mut(channel)?.tx_signaling = abcd;
        self.regs.board(|board| board.span(span).tscr(channel).write(|w| w
            .with_ROB_ENB(1)
            .with_ABCD(abcd)
        ))?;
        Ok(())
    }

    pub fn rx_signaling(&self, span: usize, channel: usize) -> Result<u8> {
        self.check_span(span)?;
        Ok(self.lock_state().spans[span].channel_mut(channel)?.rx_signaling)
    }

    ///////////////////////////////////////////////////////////////////
    // Cross-connects

    pub fn assign(&self, source: ChannelAddress, destination: ChannelAddress) -> Result<Handle> {
        let mut state = self.lock_state();
        Self::check_channel(&state, source)?;
        Self::check_channel(&state, destination)?;
        let tsi = &mut state.tsi;
        self.regs.board(|board| tsi.assign(board, source, destination))
    }

    pub fn unassign(&self, destination: ChannelAddress) -> Result<()> {
        let mut state = self.lock_state();
        Self::check_channel(&state, destination)?;
        let tsi = &mut state.tsi;
        self.regs.board(|board| tsi.unassign(board, destination))
    }

    pub fn remove_cross_connect(&self, handle: Handle) -> Result<()> {
        let mut state = self.lock_state();
        let tsi = &mut state.tsi;
        self.regs.board(|board| tsi.remove(board, handle))
    }

    pub fn cross_connect(&self, handle: Handle) -> Result<CrossConnect> {
        self.lock_state().tsi.lookup(handle)
    }

    ///////////////////////////////////////////////////////////////////
    // HDLC

    pub fn hdlc_start(&self, span: usize, channel: usize, mode: HdlcAddressing) -> Result<()> {
        self.check_span(span)?;
        let mut state = self.lock_state();
        let s = &mut state.spans[span];
        s.channel_mut(channel)?;
        let poll_limit = self.config.hdlc_reset_poll_limit;
        self.regs.board(|board| s.hdlc.start(&board.span(span), channel, mode, poll_limit))
    }

    pub fn hdlc_stop(&self, span: usize) -> Result<()> {
        self.check_span(span)?;
        let mut state = self.lock_state();
        let s = &mut state.spans[span];
        self.regs.board(|board| s.hdlc.stop(&board.span(span)))
    }

    /// Tell the controller the host has queued data to send.
    pub fn hdlc_kick(&self, span: usize) -> Result<()> {
        self.check_span(span)?;
        let mut state = self.lock_state();
        let state = &mut *state;
        let s = &mut state.spans[span];
        let host = state.host.as_mut();
        self.regs.board(|board| s.hdlc.kick(&board.span(span), host))
    }

    ///////////////////////////////////////////////////////////////////
    // Echo cancellation

    pub fn echo_enable(&self, span: usize, channel: usize, taps: usize) -> Result<Handle> {
        self.check_span(span)?;
        let mut state = self.lock_state();
        state.spans[span].channel_mut(channel)?;
        state.echo.enable(span, channel, taps)
    }

    pub fn echo_disable(&self, handle: Handle) -> Result<()> {
        self.lock_state().echo.disable(handle)
    }

    pub fn echo_taps(&self, handle: Handle) -> Result<usize> {
        self.lock_state().echo.taps(handle)
    }

    pub fn dsp_get_register(&self, address: u32) -> Result<u32> {
        self.lock_state().echo.get_register(address)
    }

    pub fn dsp_set_register(&self, address: u32, value: u32) -> Result<()> {
        self.lock_state().echo.set_register(address, value)
    }

    ///////////////////////////////////////////////////////////////////
    // Diagnostics

    pub fn counters(&self) -> CardCounters {
        let dma = self.lock_state().ring.counters();
        CardCounters {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            missed_interrupts: dma.missed_interrupts,
            lossy_ticks: dma.lossy_ticks,
            latency_changes: dma.latency_changes,
            spurious: dma.spurious,
        }
    }

    pub fn latency(&self) -> usize {
        self.lock_state().ring.depth()
    }

    pub fn read_register(&self, address: RegisterAddress) -> Result<RegisterValue> {
        self.regs.read(address)
    }

    pub fn write_register(&self, address: RegisterAddress, value: RegisterValue) -> Result<()> {
        self.regs.write(address, value)
    }

    /// Every register in the window. Reading has the same side effects as
    /// any other read, such as clearing signaling change bits.
    pub fn dump_registers(&self) -> Result<Vec<(RegisterAddress, RegisterValue)>> {
        self.regs.exclusive(|io| {
            (0..Addressing::WINDOW_LEN)
                .map(|address| {
                    let address = address as RegisterAddress;
                    Ok((address, io.read(address)?))
                })
                .collect()
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sim::{MemoryWindow, RecordingHost, SimEchoCanceller};
    use crate::sync::Reference;
    use trunkline_pac::register::{ClockMode, FramerLoopback};

    pub(crate) struct Rig {
        pub card: Card<MemoryWindow>,
        pub memory: MemoryWindow,
        pub host: RecordingHost,
        pub dsp: SimEchoCanceller,
        pub registry: Arc<SyncRegistry>,
    }

    pub(crate) fn config() -> DriverConfig {
        DriverConfig {
            interrupt_wait_ms: 0,
            ..Default::default()
        }
    }

    pub(crate) fn rig_with(index: usize, config: DriverConfig, registry: Arc<SyncRegistry>) -> Rig {
        let memory = MemoryWindow::new();
        memory.set_write_one_to_clear(0x0000);
        for span in 0..4 {
            memory.set_write_one_to_clear(Addressing::span_nxx(span, 0x81) as u16);
        }
        let host = RecordingHost::new();
        let dsp = SimEchoCanceller::new();
        let card = Card::new(
            index,
            memory.clone(),
            config,
            Generation::quad(),
            registry.clone(),
            Box::new(host.clone()),
            Box::new(dsp.clone()),
        ).unwrap();
        Rig { card, memory, host, dsp, registry }
    }

    pub(crate) fn rig() -> Rig {
        rig_with(0, config(), Arc::new(SyncRegistry::new(false)))
    }

    #[test]
    fn generation_from_revid() {
        let generation = Generation::from_revid(REVID::new().with_GEN(5).with_PORTS(8)).unwrap();
        assert_eq!(generation, Generation::octal());
        assert_eq!(generation.fabric_mode(), FabricMode::Octal);
        assert_eq!(Generation::from_revid(Generation::quad().revid()).unwrap(), Generation::quad());
        assert!(matches!(Generation::from_revid(REVID::new().with_GEN(3).with_PORTS(3)), Err(Error::Config(_))));
    }

    #[test]
    fn start_brings_card_up() {
        let rig = rig();
        rig.card.start().unwrap();

        assert!(rig.card.is_running());
        assert_eq!(rig.card.latency(), 2);
        let dmacr = rig.card.regs.board(|b| b.dmacr().read()).unwrap();
        assert_eq!(dmacr.RUN(), 1);
        assert_eq!(dmacr.IRQ_ENB(), 1);
        assert_eq!(dmacr.BURST(), 1);
        assert_eq!(rig.card.clock(), Some(ClockSelection::FREE_RUN));
    }

    #[test]
    fn self_test_failure_forces_red() {
        let rig = rig();
        rig.memory.set_stuck(0x000a);

        assert!(matches!(rig.card.start(), Err(Error::SelfTest { address: 0x000a, .. })));
        assert!(!rig.card.is_running());
        for span in 0..4 {
            assert!(rig.card.alarms(span).unwrap().contains(AlarmMask::RED));
        }
        assert_eq!(rig.host.events().len(), 4);
    }

    #[test]
    fn missing_interrupts_unwind_start() {
        let registry = Arc::new(SyncRegistry::new(false));
        let rig = rig_with(0, DriverConfig { interrupt_wait_ms: 5, ..config() }, registry.clone());

        assert!(matches!(rig.card.start(), Err(Error::NoInterrupts(5))));

        assert_eq!(rig.card.latency(), 0);
        let dmacr = rig.card.regs.board(|b| b.dmacr().read()).unwrap();
        assert_eq!(dmacr.RUN(), 0);
        assert_eq!(rig.memory.peek(0x0001), 0);
        assert!(registry.register(0, 4).is_ok());
        assert!(rig.card.alarms(0).unwrap().contains(AlarmMask::RED));
    }

    #[test]
    fn allocation_failure_unwinds_start() {
        let registry = Arc::new(SyncRegistry::new(false));
        let Rig { card, .. } = rig_with(0, config(), registry.clone());
        let card = card.with_allocator(Box::new(HeapAllocator::with_limit(16)));

        assert!(matches!(card.start(), Err(Error::Allocation(_))));
        assert!(registry.register(0, 4).is_ok());
    }

    #[test]
    fn span_changes_rerun_election() {
        let rig = rig();
        rig.card.start().unwrap();
        rig.card.span_startup(0).unwrap();
        rig.card.span_startup(1).unwrap();
        assert_eq!(rig.card.clock().unwrap().mode, ClockMode::SystemTiming);

        rig.card.set_sync_priority(1, 1).unwrap();
        assert_eq!(rig.card.clock(), Some(ClockSelection { mode: ClockMode::Recovered, span: 1, cable: false }));
        let clksel = rig.card.regs.board(|b| b.clksel().read()).unwrap();
        assert_eq!(clksel.MODE(), ClockMode::Recovered);
        assert_eq!(clksel.SPAN(), 1);

        rig.card.set_maintenance(1, Maintenance::LocalLoopback).unwrap();
        assert_eq!(rig.card.clock().unwrap().span, 0);
    }

    #[test]
    fn span_startup_needs_running_card() {
        let rig = rig();
        assert!(matches!(rig.card.span_startup(0), Err(Error::NotRunning)));
    }

    #[test]
    fn sync_priority_range_checked() {
        let rig = rig();
        assert!(matches!(rig.card.set_sync_priority(0, 33), Err(Error::SyncPriority(33))));
        assert!(matches!(rig.card.set_sync_priority(4, 1), Err(Error::SpanIndex(4))));
    }

    #[test]
    fn line_change_tears_down_channel_state() {
        let rig = rig();
        rig.card.start().unwrap();

        let cross = rig.card.assign(ChannelAddress::new(0, 1), ChannelAddress::new(1, 1)).unwrap();
        let echo = rig.card.echo_enable(0, 1, 128).unwrap();
        rig.card.hdlc_start(0, 23, HdlcAddressing::None).unwrap();

        rig.card.configure_span(0, LineType::E1).unwrap();

        assert!(matches!(rig.card.cross_connect(cross), Err(Error::StaleHandle(_))));
        assert!(matches!(rig.card.echo_taps(echo), Err(Error::StaleHandle(_))));
        assert_eq!(rig.dsp.channel(rig.card.lock_state().echo.flat_index(0, 1)), None);
        let status = rig.card.span_status(0).unwrap();
        assert_eq!(status.line, LineType::E1);
        let fmr = rig.card.regs.board(|b| b.span(0).fmr().read()).unwrap();
        assert_eq!(fmr.MODE(), trunkline_pac::register::LineMode::E1);
        assert!(rig.card.lock_state().spans[0].hdlc.channel().is_none());
    }

    #[test]
    fn closing_channel_drops_cross_connects_and_echo() {
        let rig = rig();
        rig.card.open_channel(2, 4).unwrap();
        let cross = rig.card.assign(ChannelAddress::new(2, 4), ChannelAddress::new(3, 0)).unwrap();
        rig.card.echo_enable(2, 4, 64).unwrap();

        rig.card.close_channel(2, 4).unwrap();
        assert!(matches!(rig.card.cross_connect(cross), Err(Error::StaleHandle(_))));
        assert_eq!(rig.dsp.channel((4 << 2) | 2), None);
    }

    #[test]
    fn channel_index_checked_against_line_type() {
        let rig = rig();
        assert!(matches!(
            rig.card.assign(ChannelAddress::new(0, 24), ChannelAddress::new(0, 0)),
            Err(Error::ChannelIndex { span: 0, channel: 24 })
        ));
        assert!(matches!(rig.card.echo_enable(0, 1, 100), Err(Error::TapLength(100))));
    }

    #[test]
    fn tx_signaling_programs_robbed_bits() {
        let rig = rig();
        rig.card.set_tx_signaling(1, 5, 0b1001).unwrap();
        let tscr = rig.card.regs.board(|b| b.span(1).tscr(5).read()).unwrap();
        assert_eq!(tscr.ROB_ENB(), 1);
        assert_eq!(tscr.ABCD(), 0b1001);

        // Leaving payload loopback puts robbed-bit insertion back.
        rig.card.set_maintenance(1, Maintenance::NetworkPayloadLoopback).unwrap();
        assert_eq!(rig.card.regs.board(|b| b.span(1).tscr(5).read()).unwrap().ROB_ENB(), 0);
        rig.card.set_maintenance(1, Maintenance::None).unwrap();
        let tscr = rig.card.regs.board(|b| b.span(1).tscr(5).read()).unwrap();
        assert_eq!(tscr.ROB_ENB(), 1);
        assert_eq!(tscr.ABCD(), 0b1001);
        assert_eq!(rig.card.regs.board(|b| b.span(1).fmr().read()).unwrap().LB(), FramerLoopback::No);

        rig.card.configure_span(1, LineType::E1).unwrap();
        assert!(matches!(rig.card.set_tx_signaling(1, 5, 1), Err(Error::Config(_))));
    }

    #[test]
    fn dsp_register_passthrough() {
        let rig = rig();
        rig.card.dsp_set_register(0x40, 7).unwrap();
        assert_eq!(rig.card.dsp_get_register(0x40).unwrap(), 7);
    }

    #[test]
    fn hdlc_kick_sends_queued_data() {
        let rig = rig();
        rig.card.hdlc_start(3, 0, HdlcAddressing::None).unwrap();
        rig.host.queue_hdlc(3, &[1, 2, 3]);
        rig.memory.take_journal();

        rig.card.hdlc_kick(3).unwrap();
        let journal = rig.memory.take_journal();
        let htxbuf = Addressing::span_nxx(3, 0xe0) as u16;
        assert_eq!(&journal[..3], &[(htxbuf, 1), (htxbuf + 1, 2), (htxbuf + 2, 3)]);
        assert_eq!(rig.card.span_status(3).unwrap().hdlc.frames_sent, 1);
        assert!(matches!(
            rig.card.hdlc_start(3, 0, HdlcAddressing::Address8),
            Err(Error::UnsupportedHdlcMode(HdlcAddressing::Address8))
        ));
    }

    #[test]
    fn shutdown_releases_everything() {
        let rig = rig();
        rig.card.start().unwrap();
        rig.card.shutdown().unwrap();

        assert!(!rig.card.is_running());
        assert_eq!(rig.card.latency(), 0);
        assert_eq!(rig.card.regs.board(|b| b.dmacr().read()).unwrap().RUN(), 0);
        assert!(rig.registry.register(0, 4).is_ok());
    }

    #[test]
    fn second_start_is_rejected() {
        let rig = rig();
        rig.card.start().unwrap();
        let base = rig.card.lock_state().ring.region().unwrap().bus_address();

        assert!(matches!(rig.card.start(), Err(Error::Config(_))));

        assert!(rig.card.is_running());
        assert_eq!(rig.card.latency(), 2);
        assert_eq!(rig.card.lock_state().ring.region().unwrap().bus_address(), base);
        assert_eq!(rig.card.regs.board(|b| b.dmacr().read()).unwrap().RUN(), 1);
        assert!(!rig.card.alarms(0).unwrap().contains(AlarmMask::RED));
        assert!(matches!(rig.registry.register(0, 4), Err(Error::Config(_))));
    }

    #[test]
    fn card_restarts_after_shutdown() {
        let rig = rig();
        rig.card.start().unwrap();
        rig.card.shutdown().unwrap();
        rig.card.start().unwrap();

        assert!(rig.card.is_running());
        assert!(!rig.card.stopping.load(Ordering::Acquire));
        assert_eq!(rig.card.latency(), 2);
    }

    #[test]
    fn register_diagnostics() {
        let rig = rig();
        rig.card.write_register(0x000a, 0x1234).unwrap();
        assert_eq!(rig.card.read_register(0x000a).unwrap(), 0x1234);

        let dump = rig.card.dump_registers().unwrap();
        assert_eq!(dump.len(), Addressing::WINDOW_LEN);
        assert_eq!(dump[0x000a], (0x000a, 0x1234));

        rig.memory.set_failing(true);
        assert!(matches!(rig.card.read_register(0), Err(Error::Register(_))));
    }

    #[test]
    fn cable_mode_cards_share_one_reference() {
        let registry = Arc::new(SyncRegistry::new(true));
        let first = rig_with(0, config(), registry.clone());
        let second = rig_with(1, config(), registry.clone());
        first.card.start().unwrap();
        second.card.start().unwrap();

        second.card.span_startup(2).unwrap();
        second.card.set_sync_priority(2, 1).unwrap();
        first.card.span_startup(0).unwrap();

        // The second card picks up the first card's decision on its next
        // pass.
        second.card.resync_clock().unwrap();

        assert_eq!(registry.reference(), Some(Reference::Recovered(crate::sync::SpanRef { card: 1, span: 2 })));
        assert_eq!(first.card.clock(), Some(ClockSelection::TRACKING));
        assert_eq!(second.card.clock(), Some(ClockSelection { mode: ClockMode::Recovered, span: 2, cable: true }));
    }
}
