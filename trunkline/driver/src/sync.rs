use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use trunkline_pac::register::ClockMode;

use crate::error::{Error, Result};
use crate::handle::{next_generation, Handle, HandleKind};

/// Highest sync priority a span can be given. Zero means "never a timing
/// source".
pub const MAX_SYNC_PRIORITY: u8 = 32;

/// A span's standing in the election.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanCandidate {
    pub priority: u8,

    /// No alarm that disqualifies the span as a timing source.
    pub alarm_free: bool,
    pub running: bool,
}

impl SpanCandidate {
    fn usable(&self) -> bool {
        self.alarm_free && self.running
    }
}

/// A span, identified across the chassis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SpanRef {
    pub card: usize,
    pub span: usize,
}

/// Clock-select programming for one card.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockSelection {
    pub mode: ClockMode,
    pub span: usize,

    /// Drive the reference onto the timing cable.
    pub cable: bool,
}

impl ClockSelection {
    pub const FREE_RUN: Self = Self { mode: ClockMode::FreeRun, span: 0, cable: false };
    pub const TRACKING: Self = Self { mode: ClockMode::Tracking, span: 0, cable: false };
}

/// Outcome of an election.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    /// A prioritised span recovers timing for everyone.
    Recovered(SpanRef),

    /// Nothing prioritised is usable; a usable span times its card without
    /// being declared a recovered reference.
    SystemTiming(SpanRef),

    /// No usable span. The card runs from its own oscillator.
    SelfTimed { card: usize },
}

/// Pick the prioritised span to time from.
///
/// The lowest nonzero priority held by a usable span wins. Ties go to the
/// lower card index, then the lower span index.
///
pub fn elect<'a, I>(cards: I) -> Option<SpanRef>
where
    I: IntoIterator<Item = (usize, &'a [SpanCandidate])>,
{
    cards.into_iter()
        .flat_map(|(card, spans)| spans.iter()
            .enumerate()
            .map(move |(span, candidate)| (SpanRef { card, span }, *candidate)))
        .filter(|(_, c)| c.priority != 0 && c.usable())
        .min_by_key(|(span_ref, c)| (c.priority, *span_ref))
        .map(|(span_ref, _)| span_ref)
}

/// Choose a reference for one card when no prioritised span qualifies.
pub fn fallback(card: usize, spans: &[SpanCandidate]) -> Reference {
    match spans.iter().position(SpanCandidate::usable) {
        Some(span) => Reference::SystemTiming(SpanRef { card, span }),
        None => Reference::SelfTimed { card },
    }
}

/// Clock-select programming for `card` given the chosen reference.
///
/// On the timing cable, the card owning the reference drives it and every
/// other card tracks it. Without the cable each card is on its own.
///
pub fn selection_for(card: usize, reference: Reference, cable: bool) -> ClockSelection {
    match reference {
        Reference::Recovered(source) if source.card == card => ClockSelection {
            mode: ClockMode::Recovered,
            span: source.span,
            cable,
        },
        Reference::SystemTiming(source) if source.card == card => ClockSelection {
            mode: ClockMode::SystemTiming,
            span: source.span,
            cable,
        },
        Reference::Recovered(_) | Reference::SystemTiming(_) if cable => ClockSelection::TRACKING,
        _ => ClockSelection::FREE_RUN,
    }
}

struct Slot {
    generation: u16,
    sequence: u64,
    spans: Vec<SpanCandidate>,
}

struct Table {
    slots: Vec<Option<Slot>>,
    generations: Vec<u16>,
    sequence: u64,
    reference: Option<Reference>,
}

impl Table {
    fn slot(&mut self, handle: Handle) -> Result<&mut Slot> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Some(slot)) if handle.kind == HandleKind::SyncSlot && slot.generation == handle.generation => Ok(slot),
            _ => Err(Error::StaleHandle(handle)),
        }
    }

    fn first_registered(&self) -> Option<usize> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(card, slot)| slot.as_ref().map(|s| (s.sequence, card)))
            .min()
            .map(|(_, card)| card)
    }

    fn candidates(&self) -> impl Iterator<Item = (usize, &[SpanCandidate])> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(card, slot)| slot.as_ref().map(|s| (card, s.spans.as_slice())))
    }
}

/// The chassis-wide table of sync candidates, one slot per card.
///
/// The lock is held only while the table is read or updated. Cards program
/// their clock-select registers after [`decide`](Self::decide) returns.
///
pub struct SyncRegistry {
    timing_cable: bool,
    table: Mutex<Table>,
}

impl SyncRegistry {
    pub fn new(timing_cable: bool) -> Self {
        Self {
            timing_cable,
            table: Mutex::new(Table {
                slots: Vec::new(),
                generations: Vec::new(),
                sequence: 0,
                reference: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timing_cable(&self) -> bool {
        self.timing_cable
    }

    /// Claim the slot for card ordinal `card`.
    pub fn register(&self, card: usize, spans: usize) -> Result<Handle> {
        let mut table = self.lock();
        if card >= table.slots.len() {
            table.slots.resize_with(card + 1, || None);
            table.generations.resize(card + 1, 0);
        }
        if table.slots[card].is_some() {
            return Err(Error::Config(format!("card {card} already registered for sync")));
        }

        let generation = next_generation(table.generations[card]);
        table.generations[card] = generation;
        table.sequence += 1;
        let sequence = table.sequence;
        table.slots[card] = Some(Slot {
            generation,
            sequence,
            spans: vec![SpanCandidate::default(); spans],
        });
        debug!("sync: card {card} registered");
        Ok(Handle::new(HandleKind::SyncSlot, generation, card as u16))
    }

    pub fn unregister(&self, handle: Handle) -> Result<()> {
        let mut table = self.lock();
        table.slot(handle)?;
        table.slots[handle.index as usize] = None;
        if table.first_registered().is_none() {
            table.reference = None;
        }
        debug!("sync: card {} unregistered", handle.index);
        Ok(())
    }

    pub fn update(&self, handle: Handle, spans: &[SpanCandidate]) -> Result<()> {
        let mut table = self.lock();
        let slot = table.slot(handle)?;
        slot.spans.clear();
        slot.spans.extend_from_slice(spans);
        Ok(())
    }

    /// Work out how the card holding `handle` should be clocked.
    ///
    /// On the timing cable only the first-registered card runs the
    /// election; the others re-apply its last result, free-running until
    /// there is one. Without the cable every card elects among its own
    /// spans.
    ///
    pub fn decide(&self, handle: Handle) -> Result<ClockSelection> {
        let mut table = self.lock();
        table.slot(handle)?;
        let card = handle.index as usize;

        if !self.timing_cable {
            let spans = table.slots[card].as_ref().map(|s| s.spans.as_slice()).unwrap_or_default();
            let reference = match elect([(card, spans)]) {
                Some(source) => Reference::Recovered(source),
                None => fallback(card, spans),
            };
            return Ok(selection_for(card, reference, false));
        }

        if table.first_registered() == Some(card) {
            let reference = match elect(table.candidates()) {
                Some(source) => Reference::Recovered(source),
                None => {
                    let spans = table.slots[card].as_ref().map(|s| s.spans.as_slice()).unwrap_or_default();
                    fallback(card, spans)
                },
            };
            if table.reference != Some(reference) {
                info!("sync: chassis reference now {reference:?}");
                table.reference = Some(reference);
            }
        }

        Ok(match table.reference {
            Some(reference) => selection_for(card, reference, true),
            None => ClockSelection::FREE_RUN,
        })
    }

    /// The chassis reference last chosen on the timing cable.
    pub fn reference(&self) -> Option<Reference> {
        self.lock().reference
    }
}
