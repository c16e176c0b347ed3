use std::collections::HashMap;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::handle::{next_generation, Handle, HandleKind};
use crate::host::Host;

/// Echo canceller tap lengths the DSP accepts.
pub const TAP_LENGTHS: [usize; 6] = [32, 64, 128, 256, 512, 1024];

/// Events drained per poll, so one poll cannot run unbounded.
pub const POLL_BUDGET: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ToneEvent {
    Begin(char),
    End(char),
}

/// An event raised by the DSP, for the channel at flat index `channel`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DspEvent {
    pub channel: usize,
    pub event: ToneEvent,
}

/// The echo canceller DSP attached to a card.
pub trait EchoCanceller: Send {
    fn get_register(&mut self, address: u32) -> Result<u32>;
    fn set_register(&mut self, address: u32, value: u32) -> Result<()>;

    /// Enable cancellation with `taps` taps on the channel at flat index
    /// `channel`, or disable it with `None`.
    fn set_channel(&mut self, channel: usize, taps: Option<usize>) -> Result<()>;

    /// Take the next pending event, if any.
    fn poll_event(&mut self) -> Result<Option<DspEvent>>;
}

/// Channel-level echo cancellation for one card.
///
/// The DSP keys channels by a flat index with the span number in the low
/// `span_bits` bits and the channel number above it.
///
pub struct EchoControl {
    dsp: Box<dyn EchoCanceller>,
    span_bits: u32,
    generations: Vec<u16>,
    enabled: HashMap<usize, usize>,
}

impl EchoControl {
    pub fn new(dsp: Box<dyn EchoCanceller>, spans: usize) -> Self {
        let span_bits = spans.max(1).next_power_of_two().trailing_zeros();
        Self {
            dsp,
            span_bits,
            generations: vec![0; spans],
            enabled: HashMap::new(),
        }
    }

    pub fn flat_index(&self, span: usize, channel: usize) -> usize {
        (channel << self.span_bits) | span
    }

    fn split_index(&self, index: usize) -> (usize, usize) {
        let span_mask = (1 << self.span_bits) - 1;
        (index & span_mask, index >> self.span_bits)
    }

    fn handle(&self, span: usize, channel: usize) -> Handle {
        Handle::new(HandleKind::EchoChannel, self.generations[span], self.flat_index(span, channel) as u16)
    }

    fn check(&self, handle: Handle) -> Result<usize> {
        let index = handle.index as usize;
        let (span, _) = self.split_index(index);
        let current = self.generations.get(span).copied();
        if handle.kind != HandleKind::EchoChannel
            || current != Some(handle.generation)
            || !self.enabled.contains_key(&index)
        {
            return Err(Error::StaleHandle(handle));
        }
        Ok(index)
    }

    pub fn enable(&mut self, span: usize, channel: usize, taps: usize) -> Result<Handle> {
        if !TAP_LENGTHS.contains(&taps) {
            return Err(Error::TapLength(taps));
        }
        let index = self.flat_index(span, channel);
        self.dsp.set_channel(index, Some(taps))?;
        self.enabled.insert(index, taps);
        debug!("echo: span {span} channel {channel} enabled with {taps} taps");
        Ok(self.handle(span, channel))
    }

    pub fn disable(&mut self, handle: Handle) -> Result<()> {
        let index = self.check(handle)?;
        self.dsp.set_channel(index, None)?;
        self.enabled.remove(&index);
        Ok(())
    }

    /// Disable cancellation on a channel being closed, whatever handle it
    /// was enabled under.
    pub fn disable_channel(&mut self, span: usize, channel: usize) -> Result<()> {
        let index = self.flat_index(span, channel);
        if self.enabled.remove(&index).is_some() {
            self.dsp.set_channel(index, None)?;
        }
        Ok(())
    }

    pub fn taps(&self, handle: Handle) -> Result<usize> {
        let index = self.check(handle)?;
        Ok(self.enabled[&index])
    }

    /// Drop every channel on `span`. Outstanding handles for the span
    /// become stale.
    pub fn invalidate_span(&mut self, span: usize) -> Result<()> {
        self.generations[span] = next_generation(self.generations[span]);

        let mut indices: Vec<usize> = self.enabled.keys()
            .copied()
            .filter(|&index| self.split_index(index).0 == span)
            .collect();
        indices.sort_unstable();
        for index in indices {
            self.enabled.remove(&index);
            self.dsp.set_channel(index, None)?;
        }
        Ok(())
    }

    pub fn get_register(&mut self, address: u32) -> Result<u32> {
        self.dsp.get_register(address)
    }

    pub fn set_register(&mut self, address: u32, value: u32) -> Result<()> {
        self.dsp.set_register(address, value)
    }

    /// Forward pending DSP events to the host. Deferred context only.
    pub fn poll(&mut self, host: &mut dyn Host) -> Result<usize> {
        let mut count = 0;
        while count < POLL_BUDGET {
            let Some(event) = self.dsp.poll_event()? else {
                break;
            };
            let (span, channel) = self.split_index(event.channel);
            if span < self.generations.len() {
                host.dsp_event(span, channel, event.event);
            } else {
                warn!("echo: event for unknown channel index {}", event.channel);
            }
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{HostEvent, RecordingHost, SimEchoCanceller};

    fn control(spans: usize) -> (EchoControl, SimEchoCanceller) {
        let dsp = SimEchoCanceller::new();
        (EchoControl::new(Box::new(dsp.clone()), spans), dsp)
    }

    #[test]
    fn flat_index_interleaves_spans() {
        let (echo, _) = control(4);
        assert_eq!(echo.flat_index(0, 0), 0);
        assert_eq!(echo.flat_index(3, 0), 3);
        assert_eq!(echo.flat_index(1, 5), 21);

        let (echo, _) = control(8);
        assert_eq!(echo.flat_index(7, 23), (23 << 3) | 7);
    }

    #[test]
    fn enable_rejects_unknown_tap_length() {
        let (mut echo, dsp) = control(4);
        assert!(matches!(echo.enable(0, 1, 100), Err(Error::TapLength(100))));
        assert_eq!(dsp.channel(1 << 2), None);
    }

    #[test]
    fn enable_disable_round_trip() {
        let (mut echo, dsp) = control(4);
        let handle = echo.enable(2, 3, 128).unwrap();
        assert_eq!(echo.taps(handle).unwrap(), 128);
        assert_eq!(dsp.channel((3 << 2) | 2), Some(128));

        echo.disable(handle).unwrap();
        assert_eq!(dsp.channel((3 << 2) | 2), None);
        assert!(matches!(echo.disable(handle), Err(Error::StaleHandle(_))));
    }

    #[test]
    fn line_change_invalidates_handles() {
        let (mut echo, dsp) = control(4);
        let stale = echo.enable(1, 0, 64).unwrap();
        let other = echo.enable(2, 0, 64).unwrap();

        echo.invalidate_span(1).unwrap();
        assert!(matches!(echo.taps(stale), Err(Error::StaleHandle(_))));
        assert_eq!(dsp.channel(1), None);
        assert_eq!(echo.taps(other).unwrap(), 64);

        let fresh = echo.enable(1, 0, 32).unwrap();
        assert_ne!(fresh, stale);
    }

    #[test]
    fn poll_forwards_events_by_span_and_channel() {
        let (mut echo, dsp) = control(4);
        dsp.push_event(DspEvent { channel: (5 << 2) | 1, event: ToneEvent::Begin('5') });
        dsp.push_event(DspEvent { channel: (5 << 2) | 1, event: ToneEvent::End('5') });

        let mut host = RecordingHost::new();
        assert_eq!(echo.poll(&mut host).unwrap(), 2);
        assert_eq!(host.events(), vec![
            HostEvent::Dsp(1, 5, ToneEvent::Begin('5')),
            HostEvent::Dsp(1, 5, ToneEvent::End('5')),
        ]);
    }

    #[test]
    fn register_passthrough() {
        let (mut echo, dsp) = control(4);
        echo.set_register(0x120, 0xdead).unwrap();
        assert_eq!(echo.get_register(0x120).unwrap(), 0xdead);
        assert_eq!(dsp.register(0x120), Some(0xdead));
    }
}
