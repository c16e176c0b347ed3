use std::collections::BTreeMap;

use log::debug;

use trunkline_pac::device::{Board, RegisterIo, CHANNELS_PER_SPAN};

use crate::error::{Error, Result};
use crate::handle::{next_generation, Handle, HandleKind};

/// Source written for a destination that has no source.
pub const UNASSIGNED: u16 = 0x7ff;

/// Source that powers a destination slot down.
pub const POWERDOWN: u16 = 0x7fe;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FabricMode {
    /// One TDM stream, up to four spans.
    SingleStream,

    /// Multiplexed stream carrying eight spans.
    Octal,
}

impl FabricMode {
    pub fn for_ports(ports: usize) -> Self {
        if ports > 4 {
            Self::Octal
        } else {
            Self::SingleStream
        }
    }

    pub fn spans(self) -> usize {
        match self {
            Self::SingleStream => 4,
            Self::Octal => 8,
        }
    }

    pub fn slots(self) -> usize {
        self.spans() * CHANNELS_PER_SPAN
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelAddress {
    pub span: usize,
    pub channel: usize,
}

impl ChannelAddress {
    pub fn new(span: usize, channel: usize) -> Self {
        Self {
            span,
            channel,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CrossConnect {
    pub source: ChannelAddress,
    pub destination: ChannelAddress,
    pub handle: Handle,
}

/// The card's time-slot interchange.
///
/// Each destination slot has at most one source. Entries are keyed by
/// destination slot.
///
pub struct CrossConnects {
    mode: FabricMode,
    entries: BTreeMap<u16, CrossConnect>,
    generations: Vec<u16>,
}

impl CrossConnects {
    pub fn new(mode: FabricMode) -> Self {
        Self {
            mode,
            entries: BTreeMap::new(),
            generations: vec![0; mode.slots()],
        }
    }

    pub fn mode(&self) -> FabricMode {
        self.mode
    }

    /// Fabric slot of a channel.
    ///
    /// Panics if the channel lies outside the fabric, which is a caller
    /// bug rather than a runtime condition.
    ///
    pub fn slot(&self, address: ChannelAddress) -> u16 {
        assert!(address.span < self.mode.spans(), "span {} outside {:?} fabric", address.span, self.mode);
        assert!(address.channel < CHANNELS_PER_SPAN, "channel {} outside fabric", address.channel);
        (address.span * CHANNELS_PER_SPAN + address.channel) as u16
    }

    /// Latch a source/destination pair into the fabric. HOLD keeps the
    /// fabric from acting on the pair until both halves are written.
    fn commit<D: RegisterIo + ?Sized>(board: &Board<'_, D>, source: u16, destination: u16) -> Result<()> {
        board.tsicr().modify(|m| m.with_HOLD(1))?;
        board.tsisrc().write(|w| w.with_SLOT(source))?;
        board.tsidst().write(|w| w.with_SLOT(destination))?;
        board.tsicr().modify(|m| m.with_HOLD(0))?;
        Ok(())
    }

    /// Relay `source`'s samples into `destination`, replacing any source
    /// the destination had.
    pub fn assign<D: RegisterIo + ?Sized>(
        &mut self,
        board: &Board<'_, D>,
        source: ChannelAddress,
        destination: ChannelAddress,
    ) -> Result<Handle> {
        let source_slot = self.slot(source);
        let destination_slot = self.slot(destination);

        if self.entries.contains_key(&destination_slot) {
            self.unassign(board, destination)?;
        }

        Self::commit(board, source_slot, destination_slot)?;

        let generation = next_generation(self.generations[destination_slot as usize]);
        self.generations[destination_slot as usize] = generation;
        let handle = Handle::new(HandleKind::CrossConnect, generation, destination_slot);
        self.entries.insert(destination_slot, CrossConnect { source, destination, handle });
        debug!("tsi: {source:?} -> {destination:?}");
        Ok(handle)
    }

    /// Give `destination` no source. Unassigning an idle destination
    /// writes the same state again.
    pub fn unassign<D: RegisterIo + ?Sized>(
        &mut self,
        board: &Board<'_, D>,
        destination: ChannelAddress,
    ) -> Result<()> {
        let destination_slot = self.slot(destination);
        Self::commit(board, UNASSIGNED, destination_slot)?;
        self.entries.remove(&destination_slot);
        Ok(())
    }

    /// Drop the cross-connect a handle refers to.
    pub fn remove<D: RegisterIo + ?Sized>(&mut self, board: &Board<'_, D>, handle: Handle) -> Result<()> {
        let entry = self.lookup(handle)?;
        self.unassign(board, entry.destination)
    }

    /// Tear down every cross-connect touching a closing channel.
    pub fn release_channel<D: RegisterIo + ?Sized>(
        &mut self,
        board: &Board<'_, D>,
        channel: ChannelAddress,
    ) -> Result<()> {
        let destinations: Vec<ChannelAddress> = self.entries.values()
            .filter(|entry| entry.source == channel || entry.destination == channel)
            .map(|entry| entry.destination)
            .collect();
        for destination in destinations {
            self.unassign(board, destination)?;
        }
        Ok(())
    }

    /// Park a destination slot in power-down.
    pub fn power_down<D: RegisterIo + ?Sized>(
        &mut self,
        board: &Board<'_, D>,
        destination: ChannelAddress,
    ) -> Result<()> {
        let destination_slot = self.slot(destination);
        Self::commit(board, POWERDOWN, destination_slot)?;
        self.entries.remove(&destination_slot);
        Ok(())
    }

    pub fn lookup(&self, handle: Handle) -> Result<CrossConnect> {
        match self.entries.get(&handle.index) {
            Some(entry) if entry.handle == handle => Ok(*entry),
            _ => Err(Error::StaleHandle(handle)),
        }
    }

    pub fn source_of(&self, destination: ChannelAddress) -> Option<ChannelAddress> {
        self.entries.get(&self.slot(destination)).map(|entry| entry.source)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CrossConnect> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryWindow;

    const TSICR: u16 = 0x0020;
    const TSISRC: u16 = 0x0021;
    const TSIDST: u16 = 0x0022;

    fn a(span: usize, channel: usize) -> ChannelAddress {
        ChannelAddress::new(span, channel)
    }

    #[test]
    fn assign_is_held_then_committed() {
        let memory = MemoryWindow::new();
        let board = Board::new(&memory);
        let mut tsi = CrossConnects::new(FabricMode::SingleStream);

        tsi.assign(&board, a(0, 5), a(2, 7)).unwrap();
        assert_eq!(memory.take_journal(), vec![
            (TSICR, 0x8000),
            (TSISRC, 5),
            (TSIDST, 2 * 32 + 7),
            (TSICR, 0x0000),
        ]);
        assert_eq!(tsi.source_of(a(2, 7)), Some(a(0, 5)));
    }

    #[test]
    fn reassign_supersedes_previous_source() {
        let memory = MemoryWindow::new();
        let board = Board::new(&memory);
        let mut tsi = CrossConnects::new(FabricMode::Octal);

        let old = tsi.assign(&board, a(0, 1), a(7, 1)).unwrap();
        memory.take_journal();
        let new = tsi.assign(&board, a(3, 2), a(7, 1)).unwrap();

        let writes: Vec<u16> = memory.take_journal().into_iter()
            .filter(|&(address, _)| address == TSISRC)
            .map(|(_, value)| value)
            .collect();
        assert_eq!(writes, vec![UNASSIGNED, 3 * 32 + 2]);
        assert!(matches!(tsi.lookup(old), Err(Error::StaleHandle(_))));
        assert_eq!(tsi.lookup(new).unwrap().source, a(3, 2));
        assert_eq!(tsi.iter().count(), 1);
    }

    #[test]
    fn unassign_twice_matches_once() {
        let memory = MemoryWindow::new();
        let board = Board::new(&memory);
        let mut tsi = CrossConnects::new(FabricMode::SingleStream);
        tsi.assign(&board, a(1, 1), a(1, 2)).unwrap();

        tsi.unassign(&board, a(1, 2)).unwrap();
        let once = (memory.peek(TSICR), memory.peek(TSISRC), memory.peek(TSIDST), tsi.iter().count());
        tsi.unassign(&board, a(1, 2)).unwrap();
        let twice = (memory.peek(TSICR), memory.peek(TSISRC), memory.peek(TSIDST), tsi.iter().count());

        assert_eq!(once, twice);
        assert_eq!(once, (0, UNASSIGNED, 34, 0));
    }

    #[test]
    fn closing_a_channel_drops_both_directions() {
        let memory = MemoryWindow::new();
        let board = Board::new(&memory);
        let mut tsi = CrossConnects::new(FabricMode::SingleStream);
        tsi.assign(&board, a(0, 0), a(1, 0)).unwrap();
        tsi.assign(&board, a(1, 0), a(0, 0)).unwrap();
        tsi.assign(&board, a(2, 0), a(3, 0)).unwrap();

        tsi.release_channel(&board, a(1, 0)).unwrap();
        let left: Vec<_> = tsi.iter().map(|e| (e.source, e.destination)).collect();
        assert_eq!(left, vec![(a(2, 0), a(3, 0))]);
    }

    #[test]
    fn power_down_uses_reserved_slot() {
        let memory = MemoryWindow::new();
        let board = Board::new(&memory);
        let mut tsi = CrossConnects::new(FabricMode::SingleStream);
        tsi.power_down(&board, a(3, 31)).unwrap();
        assert_eq!(memory.peek(TSISRC), POWERDOWN);
        assert_eq!(memory.peek(TSIDST), 127);
    }

    #[test]
    #[should_panic(expected="outside SingleStream fabric")]
    fn single_stream_fabric_rejects_fifth_span() {
        let memory = MemoryWindow::new();
        let board = Board::new(&memory);
        let mut tsi = CrossConnects::new(FabricMode::SingleStream);
        let _ = tsi.assign(&board, a(4, 0), a(0, 0));
    }

    #[test]
    #[should_panic(expected="channel 32 outside fabric")]
    fn channel_beyond_span_rejected() {
        let tsi = CrossConnects::new(FabricMode::Octal);
        let _ = tsi.slot(a(0, 32));
    }
}
