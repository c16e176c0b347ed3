//! Stand-ins for hardware and host, for simulated cards and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use trunkline_pac::device::{self, Addressing, RegisterAddress, RegisterIo, RegisterValue};

use crate::alarm::AlarmMask;
use crate::echo::{DspEvent, EchoCanceller, ToneEvent};
use crate::error::Result;
use crate::hdlc::{HdlcAbort, HdlcChunk};
use crate::host::{Chunk, Host};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Word {
    value: AtomicU16,
    write_one_to_clear: AtomicBool,
    stuck: AtomicBool,
}

struct Memory {
    words: Vec<Word>,
    journal: Mutex<Vec<(RegisterAddress, RegisterValue)>>,
    failing: AtomicBool,
}

/// An in-memory register file.
///
/// Clones share the same memory, so a test (or a simulated line) can keep
/// one to inspect and poke registers while a card owns another. Writes
/// through [`RegisterIo`] are recorded in a journal; `poke` is not.
///
#[derive(Clone)]
pub struct MemoryWindow {
    memory: Arc<Memory>,
}

impl MemoryWindow {
    pub fn new() -> Self {
        let words = (0..Addressing::WINDOW_LEN)
            .map(|_| Word {
                value: AtomicU16::new(0),
                write_one_to_clear: AtomicBool::new(false),
                stuck: AtomicBool::new(false),
            })
            .collect();

        Self {
            memory: Arc::new(Memory {
                words,
                journal: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
            }),
        }
    }

    fn word(&self, address: RegisterAddress) -> device::Result<&Word> {
        if self.memory.failing.load(Ordering::Relaxed) {
            return Err(device::Error::Bus);
        }
        self.memory.words.get(address as usize).ok_or(device::Error::Unmapped(address))
    }

    /// Set a register's value as the hardware would, bypassing write
    /// semantics and the journal.
    pub fn poke(&self, address: RegisterAddress, value: RegisterValue) {
        if let Some(word) = self.memory.words.get(address as usize) {
            word.value.store(value, Ordering::Relaxed);
        }
    }

    pub fn peek(&self, address: RegisterAddress) -> RegisterValue {
        self.memory.words.get(address as usize)
            .map(|word| word.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Make writes to `address` clear the bits written as ones.
    pub fn set_write_one_to_clear(&self, address: RegisterAddress) {
        if let Some(word) = self.memory.words.get(address as usize) {
            word.write_one_to_clear.store(true, Ordering::Relaxed);
        }
    }

    /// Make writes to `address` have no effect.
    pub fn set_stuck(&self, address: RegisterAddress) {
        if let Some(word) = self.memory.words.get(address as usize) {
            word.stuck.store(true, Ordering::Relaxed);
        }
    }

    /// Fail every access with a bus error.
    pub fn set_failing(&self, failing: bool) {
        self.memory.failing.store(failing, Ordering::Relaxed);
    }

    pub fn take_journal(&self) -> Vec<(RegisterAddress, RegisterValue)> {
        std::mem::take(&mut *locked(&self.memory.journal))
    }
}

impl Default for MemoryWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for MemoryWindow {
    fn read(&self, address: RegisterAddress) -> device::Result<RegisterValue> {
        Ok(self.word(address)?.value.load(Ordering::Relaxed))
    }

    fn write(&self, address: RegisterAddress, value: RegisterValue) -> device::Result<()> {
        let word = self.word(address)?;
        locked(&self.memory.journal).push((address, value));
        if word.stuck.load(Ordering::Relaxed) {
            return Ok(());
        }
        if word.write_one_to_clear.load(Ordering::Relaxed) {
            word.value.fetch_and(!value, Ordering::Relaxed);
        } else {
            word.value.store(value, Ordering::Relaxed);
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct DspState {
    registers: HashMap<u32, u32>,
    channels: HashMap<usize, usize>,
    events: VecDeque<DspEvent>,
}

/// Echo canceller with plain register storage and a queue of events to
/// report. Clones share state.
#[derive(Clone, Default)]
pub struct SimEchoCanceller {
    state: Arc<Mutex<DspState>>,
}

impl SimEchoCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, event: DspEvent) {
        locked(&self.state).events.push_back(event);
    }

    pub fn channel(&self, index: usize) -> Option<usize> {
        locked(&self.state).channels.get(&index).copied()
    }

    pub fn register(&self, address: u32) -> Option<u32> {
        locked(&self.state).registers.get(&address).copied()
    }
}

impl EchoCanceller for SimEchoCanceller {
    fn get_register(&mut self, address: u32) -> Result<u32> {
        Ok(locked(&self.state).registers.get(&address).copied().unwrap_or(0))
    }

    fn set_register(&mut self, address: u32, value: u32) -> Result<()> {
        locked(&self.state).registers.insert(address, value);
        Ok(())
    }

    fn set_channel(&mut self, channel: usize, taps: Option<usize>) -> Result<()> {
        let mut state = locked(&self.state);
        match taps {
            Some(taps) => state.channels.insert(channel, taps),
            None => state.channels.remove(&channel),
        };
        Ok(())
    }

    fn poll_event(&mut self) -> Result<Option<DspEvent>> {
        Ok(locked(&self.state).events.pop_front())
    }
}

///////////////////////////////////////////////////////////////////////

/// Everything a [`RecordingHost`] was told, except sample traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Alarm(usize, AlarmMask),
    Signaling(usize, usize, u8),
    HdlcPartial(usize, Vec<u8>),
    HdlcFrame(usize, Vec<u8>),
    HdlcAbort(usize, HdlcAbort),
    Dsp(usize, usize, ToneEvent),
}

#[derive(Default)]
struct Recording {
    events: Vec<HostEvent>,
    received: HashMap<(usize, usize), Vec<u8>>,
    transmit_fill: HashMap<(usize, usize), u8>,
    hdlc_queue: HashMap<usize, VecDeque<Vec<u8>>>,
}

/// A host that records what the card reports. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingHost {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        locked(&self.recording).events.clone()
    }

    pub fn take_events(&self) -> Vec<HostEvent> {
        std::mem::take(&mut locked(&self.recording).events)
    }

    /// All samples received on a channel so far.
    pub fn received(&self, span: usize, channel: usize) -> Vec<u8> {
        locked(&self.recording).received.get(&(span, channel)).cloned().unwrap_or_default()
    }

    /// Transmit `value` on a channel from now on.
    pub fn set_transmit(&self, span: usize, channel: usize, value: u8) {
        locked(&self.recording).transmit_fill.insert((span, channel), value);
    }

    /// Queue an HDLC message for transmission on `span`.
    pub fn queue_hdlc(&self, span: usize, message: &[u8]) {
        locked(&self.recording).hdlc_queue.entry(span).or_default().push_back(message.to_vec());
    }
}

impl Host for RecordingHost {
    fn receive(&mut self, span: usize, channel: usize, chunk: &Chunk) {
        locked(&self.recording).received.entry((span, channel)).or_default().extend_from_slice(chunk);
    }

    fn transmit(&mut self, span: usize, channel: usize, chunk: &mut Chunk) {
        if let Some(&value) = locked(&self.recording).transmit_fill.get(&(span, channel)) {
            chunk.fill(value);
        }
    }

    fn alarm_changed(&mut self, span: usize, mask: AlarmMask) {
        locked(&self.recording).events.push(HostEvent::Alarm(span, mask));
    }

    fn signaling_changed(&mut self, span: usize, channel: usize, abcd: u8) {
        locked(&self.recording).events.push(HostEvent::Signaling(span, channel, abcd));
    }

    fn hdlc_partial(&mut self, span: usize, data: &[u8]) {
        locked(&self.recording).events.push(HostEvent::HdlcPartial(span, data.to_vec()));
    }

    fn hdlc_frame(&mut self, span: usize, data: &[u8]) {
        locked(&self.recording).events.push(HostEvent::HdlcFrame(span, data.to_vec()));
    }

    fn hdlc_abort(&mut self, span: usize, reason: HdlcAbort) {
        locked(&self.recording).events.push(HostEvent::HdlcAbort(span, reason));
    }

    fn hdlc_next_transmit(&mut self, span: usize, buffer: &mut [u8]) -> Option<HdlcChunk> {
        let mut recording = locked(&self.recording);
        let queue = recording.hdlc_queue.get_mut(&span)?;
        let message = queue.front_mut()?;

        let len = message.len().min(buffer.len());
        buffer[..len].copy_from_slice(&message[..len]);
        message.drain(..len);
        let end = message.is_empty();
        if end {
            queue.pop_front();
        }
        Some(HdlcChunk { len, end })
    }

    fn dsp_event(&mut self, span: usize, channel: usize, event: ToneEvent) {
        locked(&self.recording).events.push(HostEvent::Dsp(span, channel, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_one_to_clear_register() {
        let memory = MemoryWindow::new();
        memory.set_write_one_to_clear(0x0000);
        memory.poke(0x0000, 0xc07f);

        memory.write(0x0000, 0x8000).unwrap();
        assert_eq!(memory.read(0x0000).unwrap(), 0x407f);
        assert_eq!(memory.take_journal(), vec![(0x0000, 0x8000)]);
    }

    #[test]
    fn out_of_window_access_is_unmapped() {
        let memory = MemoryWindow::new();
        assert_eq!(memory.read(0x0900), Err(device::Error::Unmapped(0x0900)));
    }

    #[test]
    fn burst_walks_consecutive_addresses() {
        let memory = MemoryWindow::new();
        memory.write_burst(0x01e0, &[1, 2, 3]).unwrap();
        memory.write_smear(0x0120, 0x000f, 2).unwrap();

        let mut back = [0u16; 3];
        memory.read_burst(0x01e0, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3]);
        assert_eq!(memory.peek(0x0121), 0x000f);
        assert_eq!(memory.peek(0x0122), 0);
    }

    #[test]
    fn host_hands_out_hdlc_in_chunks() {
        let mut host = RecordingHost::new();
        host.queue_hdlc(0, &[0xaa; 40]);

        let mut buffer = [0u8; 32];
        assert_eq!(host.hdlc_next_transmit(0, &mut buffer), Some(HdlcChunk { len: 32, end: false }));
        assert_eq!(host.hdlc_next_transmit(0, &mut buffer), Some(HdlcChunk { len: 8, end: true }));
        assert_eq!(host.hdlc_next_transmit(0, &mut buffer), None);
    }
}
