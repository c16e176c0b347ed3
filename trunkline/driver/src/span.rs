use serde::{Deserialize, Serialize};

use trunkline_pac::register::LineMode;

use crate::alarm::{AlarmMachine, AlarmMask};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::handle::next_generation;
use crate::hdlc::HdlcController;
use crate::maintenance::Maintenance;
use crate::sync::SpanCandidate;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineType {
    T1,
    E1,
    J1,
}

impl LineType {
    pub fn framer_mode(self) -> LineMode {
        match self {
            Self::T1 => LineMode::T1,
            Self::E1 => LineMode::E1,
            Self::J1 => LineMode::J1,
        }
    }

    /// Channels the span carries.
    pub fn channels(self) -> usize {
        match self {
            Self::T1 | Self::J1 => 24,
            Self::E1 => 31,
        }
    }

    /// Timeslot carrying `channel`. E1 timeslot 0 carries framing.
    pub fn timeslot(self, channel: usize) -> usize {
        match self {
            Self::T1 | Self::J1 => channel,
            Self::E1 => channel + 1,
        }
    }

    /// Idle code for the line's companding law: mu-law on T1 and J1,
    /// A-law on E1.
    pub fn idle_code(self) -> u8 {
        match self {
            Self::T1 | Self::J1 => 0xff,
            Self::E1 => 0xd5,
        }
    }

    /// Line carries robbed-bit signaling.
    pub fn robbed_bit(self) -> bool {
        matches!(self, Self::T1 | Self::J1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    pub index: usize,
    pub open: bool,
    pub rx_signaling: u8,
    pub tx_signaling: u8,
}

impl Channel {
    fn new(index: usize) -> Self {
        Self {
            index,
            open: false,
            rx_signaling: 0,
            tx_signaling: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanCounters {
    pub signaling_changes: u64,
}

/// One line interface of a card.
pub struct Span {
    index: usize,
    line: LineType,
    generation: u16,
    pub(crate) alarms: AlarmMachine,
    pub(crate) maintenance: Maintenance,
    pub(crate) sync_priority: u8,
    pub(crate) running: bool,
    pub(crate) hdlc: HdlcController,
    pub(crate) channels: Vec<Channel>,
    pub(crate) counters: SpanCounters,
}

impl Span {
    pub fn new(index: usize, config: &DriverConfig) -> Self {
        let line = config.line_type;
        Self {
            index,
            line,
            generation: 0,
            alarms: AlarmMachine::new(config),
            maintenance: Maintenance::None,
            sync_priority: 0,
            running: false,
            hdlc: HdlcController::new(index),
            channels: (0..line.channels()).map(Channel::new).collect(),
            counters: SpanCounters::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn line(&self) -> LineType {
        self.line
    }

    /// Bumped every time the channel set is rebuilt.
    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn alarms(&self) -> AlarmMask {
        self.alarms.mask()
    }

    pub fn maintenance(&self) -> Maintenance {
        self.maintenance
    }

    pub fn sync_priority(&self) -> u8 {
        self.sync_priority
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn counters(&self) -> SpanCounters {
        self.counters
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Switch line type. Channels are rebuilt closed and alarm debounce
    /// starts over.
    pub fn configure(&mut self, line: LineType) {
        self.line = line;
        self.generation = next_generation(self.generation);
        self.channels = (0..line.channels()).map(Channel::new).collect();
        self.alarms.reset();
    }

    pub fn channel_mut(&mut self, channel: usize) -> Result<&mut Channel> {
        let span = self.index;
        self.channels.get_mut(channel).ok_or(Error::ChannelIndex { span, channel })
    }

    pub fn any_open(&self) -> bool {
        self.channels.iter().any(|c| c.open)
    }

    /// A span in loopback is not a timing candidate even before the next
    /// alarm pass reports LOOPBACK.
    pub fn candidate(&self) -> SpanCandidate {
        SpanCandidate {
            priority: self.sync_priority,
            alarm_free: self.alarms.mask().sync_eligible() && !self.maintenance.is_loopback(),
            running: self.running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_type_sets_channel_count() {
        let mut span = Span::new(0, &DriverConfig::default());
        assert_eq!(span.channels().len(), 24);

        span.channel_mut(3).unwrap().open = true;
        span.configure(LineType::E1);
        assert_eq!(span.channels().len(), 31);
        assert!(!span.any_open());
        assert_eq!(span.generation(), 1);
        assert_eq!(LineType::E1.timeslot(0), 1);
    }

    #[test]
    fn channel_out_of_range() {
        let mut span = Span::new(2, &DriverConfig::default());
        assert!(matches!(span.channel_mut(24), Err(Error::ChannelIndex { span: 2, channel: 24 })));
    }
}
