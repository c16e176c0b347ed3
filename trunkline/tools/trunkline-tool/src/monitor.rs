use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use console::{style, Color};
use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use log::info;

use trunkline::alarm::AlarmMask;
use trunkline::card::{Card, Generation};
use trunkline::config::DriverConfig;
use trunkline::dispatch::spawn_deferred_worker;
use trunkline::echo::ToneEvent;
use trunkline::hdlc::HdlcAbort;
use trunkline::host::{Chunk, Host};
use trunkline::sim::{MemoryWindow, SimEchoCanceller};
use trunkline::sync::SyncRegistry;
use trunkline_pac::device::{Addressing, RegisterAddress};
use trunkline_pac::register::{FRSR, GSR, REVID};

use crate::{MonitorArgs, Result};

const GSR_ADDRESS: RegisterAddress = 0x0000;
const REVID_ADDRESS: RegisterAddress = 0x000b;

#[derive(Clone, Debug)]
enum MonitorEvent {
    Alarm(usize, usize, AlarmMask),
    Signaling(usize, usize, usize, u8),
    HdlcFrame(usize, usize, usize),
    HdlcAbort(usize, usize, HdlcAbort),
    Tone(usize, usize, usize, ToneEvent),
}

/// Forwards card callbacks to the monitor's printer, and echoes each
/// channel's received samples back out.
struct ConsoleHost {
    card: usize,
    events: Sender<MonitorEvent>,
    echo: Vec<[Chunk; 32]>,
}

impl ConsoleHost {
    fn new(card: usize, spans: usize, events: Sender<MonitorEvent>) -> Self {
        Self {
            card,
            events,
            echo: vec![[[0xff; 8]; 32]; spans],
        }
    }

    fn send(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }
}

impl Host for ConsoleHost {
    fn receive(&mut self, span: usize, channel: usize, chunk: &Chunk) {
        self.echo[span][channel] = *chunk;
    }

    fn transmit(&mut self, span: usize, channel: usize, chunk: &mut Chunk) {
        *chunk = self.echo[span][channel];
    }

    fn alarm_changed(&mut self, span: usize, mask: AlarmMask) {
        self.send(MonitorEvent::Alarm(self.card, span, mask));
    }

    fn signaling_changed(&mut self, span: usize, channel: usize, abcd: u8) {
        self.send(MonitorEvent::Signaling(self.card, span, channel, abcd));
    }

    fn hdlc_frame(&mut self, span: usize, data: &[u8]) {
        self.send(MonitorEvent::HdlcFrame(self.card, span, data.len()));
    }

    fn hdlc_abort(&mut self, span: usize, reason: HdlcAbort) {
        self.send(MonitorEvent::HdlcAbort(self.card, span, reason));
    }

    fn dsp_event(&mut self, span: usize, channel: usize, event: ToneEvent) {
        self.send(MonitorEvent::Tone(self.card, span, channel, event));
    }
}

/// Stands in for the card's DMA engine: advances the receive identity
/// once per interrupt period and raises the tick.
fn spawn_ticker(card: Arc<Card<MemoryWindow>>, memory: MemoryWindow, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    let period = Duration::from_millis(card.config().ticks_per_irq as u64);
    let advance = card.config().ticks_per_irq as u8;

    let handle = thread::Builder::new()
        .name(format!("tl_tick{}", card.index()))
        .spawn(move || {
            let mut ident = 0u8;
            while !stop.load(Ordering::Acquire) {
                ident = ident.wrapping_add(advance) & 0x7f;
                let gsr = GSR::from(memory.peek(GSR_ADDRESS))
                    .with_DMA_TICK(1)
                    .with_RXIDENT(ident);
                memory.poke(GSR_ADDRESS, gsr.into());
                card.handle_interrupt(card.now_ms());
                thread::sleep(period);
            }
        })?;
    Ok(handle)
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::Alarm(card, span, mask) => {
            let color = if mask.intersects(AlarmMask::UNSYNCABLE) {
                Color::Red
            } else if mask.intersects(AlarmMask::YELLOW | AlarmMask::RECOVER) {
                Color::Yellow
            } else {
                Color::Green
            };
            eprintln!("{card}.{span} {}", style(format!("{mask:?}")).fg(color));
        },
        MonitorEvent::Signaling(card, span, channel, abcd) => {
            eprintln!("{card}.{span}.{channel:02} ABCD={abcd:04b}");
        },
        MonitorEvent::HdlcFrame(card, span, len) => {
            eprintln!("{card}.{span} HDLC frame, {len} bytes");
        },
        MonitorEvent::HdlcAbort(card, span, reason) => {
            eprintln!("{card}.{span} HDLC {}", style(format!("{reason:?}")).fg(Color::Red));
        },
        MonitorEvent::Tone(card, span, channel, event) => {
            eprintln!("{card}.{span}.{channel:02} {event:?}");
        },
    }
}

/// Run simulated cards through start-up, optional line loss and shutdown,
/// printing what the driver reports.
pub fn monitor(args: &MonitorArgs, mut config: DriverConfig) -> Result<()> {
    config.timing_cable |= args.timing_cable;
    let registry = Arc::new(SyncRegistry::new(config.timing_cable));
    let (sender, receiver) = unbounded();
    let stop = Arc::new(AtomicBool::new(false));

    let mut cards = Vec::new();
    let mut threads = Vec::new();

    for index in 0..args.cards {
        let memory = MemoryWindow::new();
        memory.set_write_one_to_clear(GSR_ADDRESS);
        let revid = if args.octal { Generation::octal() } else { Generation::quad() }.revid();
        memory.poke(REVID_ADDRESS, revid.into());

        let generation = Generation::from_revid(REVID::from(memory.peek(REVID_ADDRESS)))?;
        for span in 0..generation.ports {
            memory.set_write_one_to_clear(Addressing::span_nxx(span, 0x81) as RegisterAddress);
        }

        let card = Arc::new(Card::new(
            index,
            memory.clone(),
            config.clone(),
            generation,
            registry.clone(),
            Box::new(ConsoleHost::new(index, generation.ports, sender.clone())),
            Box::new(SimEchoCanceller::new()),
        )?);

        threads.push(spawn_ticker(card.clone(), memory.clone(), stop.clone())?);
        card.start()?;
        threads.push(spawn_deferred_worker(card.clone())?);

        for span in 0..generation.ports {
            card.span_startup(span)?;
            card.set_sync_priority(span, (span + 1) as u8)?;
            card.open_channel(span, 0)?;
        }

        cards.push((card, memory));
    }
    drop(sender);

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut los_raised = false;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        if let (Some(span), false) = (args.los, los_raised) {
            if deadline - now <= Duration::from_secs(args.seconds) / 2 {
                if let Some((card, memory)) = cards.first() {
                    if span < card.spans() {
                        info!("monitor: dropping signal on 0.{span}");
                        memory.poke(Addressing::span_nxx(span, 0x01) as RegisterAddress, FRSR::new().with_LOS(1).into());
                    }
                }
                los_raised = true;
            }
        }

        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => print_event(&event),
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for (card, _) in &cards {
        card.shutdown()?;
    }
    stop.store(true, Ordering::Release);
    for thread in threads {
        let _ = thread.join();
    }

    for (card, _) in &cards {
        print_summary(card);
    }

    Ok(())
}

fn print_summary(card: &Card<MemoryWindow>) {
    let counters = card.counters();
    let color = |v: u64| if v != 0 { Color::Red } else { Color::Green };

    eprintln!("card {}: {} interrupts [{}][{}] latency changes {}",
        card.index(),
        counters.interrupts,
        style(format!("missed {}", counters.missed_interrupts)).fg(color(counters.missed_interrupts)),
        style(format!("lossy {}", counters.lossy_ticks)).fg(color(counters.lossy_ticks)),
        counters.latency_changes,
    );
    if let Some(clock) = card.clock() {
        eprintln!("\tclock {:?} span {}", clock.mode, clock.span);
    }
}
