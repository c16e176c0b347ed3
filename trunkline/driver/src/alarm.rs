use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use trunkline_pac::register::FRSR;

use crate::config::DriverConfig;

/// Public alarm state of a span, as reported to the host.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct AlarmMask(u16);

impl AlarmMask {
    pub const NONE: Self = Self(0);
    /// Loss of signal or loss of frame alignment.
    pub const RED: Self = Self(1 << 0);
    pub const LOS: Self = Self(1 << 1);
    /// Alarm indication signal.
    pub const BLUE: Self = Self(1 << 2);
    /// Remote alarm indication.
    pub const YELLOW: Self = Self(1 << 3);
    /// An alarm condition cleared recently and is settling.
    pub const RECOVER: Self = Self(1 << 4);
    /// No channel on the span is open.
    pub const NOTOPEN: Self = Self(1 << 5);
    pub const LOOPBACK: Self = Self(1 << 6);

    /// Conditions that disqualify a span as a timing source.
    pub const UNSYNCABLE: Self = Self(Self::RED.0 | Self::BLUE.0 | Self::LOOPBACK.0);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & 0x7f)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn sync_eligible(self) -> bool {
        !self.intersects(Self::UNSYNCABLE)
    }
}

impl BitOr for AlarmMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AlarmMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AlarmMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(AlarmMask, &str); 7] = [
            (AlarmMask::RED, "RED"),
            (AlarmMask::LOS, "LOS"),
            (AlarmMask::BLUE, "BLUE"),
            (AlarmMask::YELLOW, "YELLOW"),
            (AlarmMask::RECOVER, "RECOVER"),
            (AlarmMask::NOTOPEN, "NOTOPEN"),
            (AlarmMask::LOOPBACK, "LOOPBACK"),
        ];

        if self.is_empty() {
            return write!(f, "AlarmMask(NONE)");
        }

        write!(f, "AlarmMask(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// Undebounced receive conditions for one tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawStatus {
    pub los: bool,
    pub lfa: bool,
    pub ais: bool,
    pub rai: bool,
}

impl From<FRSR> for RawStatus {
    fn from(frsr: FRSR) -> Self {
        Self {
            los: frsr.LOS() != 0,
            lfa: frsr.LFA() != 0,
            ais: frsr.AIS() != 0,
            rai: frsr.RAI() != 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConditionState {
    Clear,
    Pending { deadline: u64 },
    Asserted,
    Recovering { until: u64 },
}

#[derive(Copy, Clone, Debug)]
struct Condition {
    state: ConditionState,
    debounce_ms: u64,
}

impl Condition {
    fn new(debounce_ms: u64) -> Self {
        Self {
            state: ConditionState::Clear,
            debounce_ms,
        }
    }

    fn step(&mut self, raw: bool, now: u64, settle_ms: u64) {
        use ConditionState::*;

        self.state = match (self.state, raw) {
            (Clear, false) => Clear,
            (Clear, true) => Pending { deadline: now.saturating_add(self.debounce_ms) },
            (Pending { .. }, false) => Clear,
            (Pending { deadline }, true) => Pending { deadline },
            (Asserted, true) => Asserted,
            (Asserted, false) => Recovering { until: now.saturating_add(settle_ms) },
            (Recovering { .. }, true) => Asserted,
            (Recovering { until }, false) => {
                if now >= until { Clear } else { Recovering { until } }
            },
        };

        if let Pending { deadline } = self.state {
            if now >= deadline {
                self.state = Asserted;
            }
        }
    }

    fn asserted(&self) -> bool {
        self.state == ConditionState::Asserted
    }

    fn recovering(&self) -> bool {
        matches!(self.state, ConditionState::Recovering { .. })
    }
}

/// Result of one [`AlarmMachine::evaluate`] tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Evaluation {
    pub mask: AlarmMask,

    /// The mask differs from the previous tick.
    pub changed: bool,

    /// Sync eligibility flipped, so the timing source must be re-elected.
    pub resync: bool,
}

/// Debounced alarm state of one span.
///
/// Deadlines are absolute millisecond timestamps compared against the
/// caller's monotonic clock. A deadline is dropped simply by moving the
/// condition to another state.
///
#[derive(Clone, Debug)]
pub struct AlarmMachine {
    los: Condition,
    lfa: Condition,
    ais: Condition,
    yellow: Condition,
    settle_ms: u64,
    simulated: Option<AlarmMask>,
    forced_red: bool,
    mask: AlarmMask,
}

impl AlarmMachine {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            los: Condition::new(config.los_debounce_ms),
            lfa: Condition::new(config.lfa_debounce_ms),
            ais: Condition::new(config.ais_debounce_ms),
            yellow: Condition::new(config.yellow_debounce_ms),
            settle_ms: config.settle_ms,
            simulated: None,
            forced_red: false,
            mask: AlarmMask::NONE,
        }
    }

    pub fn mask(&self) -> AlarmMask {
        self.mask
    }

    pub fn states(&self) -> [ConditionState; 4] {
        [self.los.state, self.lfa.state, self.ais.state, self.yellow.state]
    }

    pub fn evaluate(&mut self, raw: RawStatus, now: u64, not_open: bool, loopback: bool) -> Evaluation {
        let mut mask = if let Some(simulated) = self.simulated {
            simulated
        } else {
            self.los.step(raw.los, now, self.settle_ms);
            self.lfa.step(raw.lfa, now, self.settle_ms);
            self.ais.step(raw.ais, now, self.settle_ms);
            self.yellow.step(raw.rai, now, self.settle_ms);
            self.debounced()
        };

        if self.forced_red {
            mask |= AlarmMask::RED;
        }
        if not_open {
            mask |= AlarmMask::NOTOPEN;
        }
        if loopback {
            mask |= AlarmMask::LOOPBACK;
        }

        self.publish(mask)
    }

    fn debounced(&self) -> AlarmMask {
        let mut mask = AlarmMask::NONE;
        if self.los.asserted() {
            mask |= AlarmMask::RED | AlarmMask::LOS;
        }
        if self.lfa.asserted() {
            mask |= AlarmMask::RED;
        }
        if self.ais.asserted() {
            mask |= AlarmMask::BLUE;
        }
        if self.yellow.asserted() {
            mask |= AlarmMask::YELLOW;
        }
        if [&self.los, &self.lfa, &self.ais, &self.yellow].iter().any(|c| c.recovering()) {
            mask |= AlarmMask::RECOVER;
        }
        mask
    }

    fn publish(&mut self, mask: AlarmMask) -> Evaluation {
        let previous = self.mask;
        self.mask = mask;
        Evaluation {
            mask,
            changed: previous != mask,
            resync: previous.sync_eligible() != mask.sync_eligible()
                 || previous.is_empty() != mask.is_empty(),
        }
    }

    /// Forget all debounce state. Used when the span's line type changes.
    pub fn reset(&mut self) {
        for condition in [&mut self.los, &mut self.lfa, &mut self.ais, &mut self.yellow] {
            condition.state = ConditionState::Clear;
        }
        self.forced_red = false;
    }

    /// Report `mask` verbatim until cleared with `None`, bypassing the
    /// debounce timers.
    pub fn simulate(&mut self, mask: Option<AlarmMask>) {
        if self.simulated.is_some() && mask.is_none() {
            self.reset();
        }
        self.simulated = mask;
    }

    pub fn simulated(&self) -> Option<AlarmMask> {
        self.simulated
    }

    /// Hold RED until the next [`reset`](Self::reset). Used when the card
    /// fails to come up.
    pub fn force_red(&mut self) -> Evaluation {
        self.forced_red = true;
        self.publish(self.mask | AlarmMask::RED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> AlarmMachine {
        AlarmMachine::new(&DriverConfig::default())
    }

    fn los() -> RawStatus {
        RawStatus { los: true, ..Default::default() }
    }

    fn quiet() -> RawStatus {
        RawStatus::default()
    }

    #[test]
    fn transient_shorter_than_debounce_never_asserts() {
        let mut m = machine();
        for now in (0..2400).step_by(100) {
            assert_eq!(m.evaluate(los(), now, false, false).mask, AlarmMask::NONE);
        }
        assert_eq!(m.evaluate(quiet(), 2400, false, false).mask, AlarmMask::NONE);
        assert_eq!(m.states()[0], ConditionState::Clear);

        // The next assertion starts a fresh debounce window.
        assert_eq!(m.evaluate(los(), 2500, false, false).mask, AlarmMask::NONE);
        assert_eq!(m.evaluate(los(), 4900, false, false).mask, AlarmMask::NONE);
    }

    #[test]
    fn continuous_condition_asserts_at_deadline() {
        let mut m = machine();
        assert!(!m.evaluate(los(), 1000, false, false).changed);
        assert_eq!(m.evaluate(los(), 3499, false, false).mask, AlarmMask::NONE);

        let e = m.evaluate(los(), 3500, false, false);
        assert_eq!(e.mask, AlarmMask::RED | AlarmMask::LOS);
        assert!(e.changed);
        assert!(e.resync);
    }

    #[test]
    fn debounce_property_over_tick_sequences() {
        // Raw bit runs of varying length, sampled every millisecond tick.
        for run in [0u64, 1, 499, 500, 501, 2000] {
            let mut m = machine();
            let mut asserted_at = None;
            for now in 0..=run + 10 {
                let raw = RawStatus { rai: now < run, ..Default::default() };
                if m.evaluate(raw, now, false, false).mask.contains(AlarmMask::YELLOW) && asserted_at.is_none() {
                    asserted_at = Some(now);
                }
            }
            if run > 500 {
                assert_eq!(asserted_at, Some(500), "run {run}");
            } else {
                assert_eq!(asserted_at, None, "run {run}");
            }
        }
    }

    #[test]
    fn recovery_settles_then_clears() {
        let mut m = machine();
        m.evaluate(los(), 0, false, false);
        assert!(m.evaluate(los(), 2500, false, false).mask.contains(AlarmMask::RED));

        let e = m.evaluate(quiet(), 3000, false, false);
        assert_eq!(e.mask, AlarmMask::RECOVER);
        assert!(e.resync);

        assert_eq!(m.evaluate(quiet(), 7999, false, false).mask, AlarmMask::RECOVER);
        let e = m.evaluate(quiet(), 8000, false, false);
        assert_eq!(e.mask, AlarmMask::NONE);
        assert!(e.resync);
    }

    #[test]
    fn condition_returning_while_recovering_reasserts() {
        let mut m = machine();
        m.evaluate(los(), 0, false, false);
        m.evaluate(los(), 2500, false, false);
        m.evaluate(quiet(), 3000, false, false);
        assert_eq!(m.evaluate(los(), 3100, false, false).mask, AlarmMask::RED | AlarmMask::LOS);
    }

    #[test]
    fn line_type_change_clears_pending_deadlines() {
        let mut m = machine();
        m.evaluate(los(), 0, false, false);
        m.reset();
        assert_eq!(m.states(), [ConditionState::Clear; 4]);
        assert_eq!(m.evaluate(los(), 2500, false, false).mask, AlarmMask::NONE);
    }

    #[test]
    fn simulation_bypasses_debounce_and_clears() {
        let mut m = machine();
        m.simulate(Some(AlarmMask::BLUE));
        assert_eq!(m.evaluate(quiet(), 0, false, false).mask, AlarmMask::BLUE);

        m.simulate(None);
        let e = m.evaluate(quiet(), 1, false, false);
        assert_eq!(e.mask, AlarmMask::NONE);
        assert!(e.changed);
    }

    #[test]
    fn external_flags_are_ored_in() {
        let mut m = machine();
        let e = m.evaluate(quiet(), 0, true, true);
        assert_eq!(e.mask, AlarmMask::NOTOPEN | AlarmMask::LOOPBACK);
        assert!(!e.mask.sync_eligible());
    }

    #[test]
    fn yellow_alone_keeps_span_eligible() {
        let mask = AlarmMask::YELLOW | AlarmMask::RECOVER | AlarmMask::NOTOPEN;
        assert!(mask.sync_eligible());
        assert_eq!(format!("{mask:?}"), "AlarmMask(YELLOW|RECOVER|NOTOPEN)");
    }
}
