use serde::{Deserialize, Serialize};

use crate::dma::DEPTH_MAX;
use crate::error::{Error, Result};
use crate::span::LineType;

/// Per-card driver settings.
///
/// Missing fields take their defaults when loaded from JSON, so a config
/// file only needs to name what it changes.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Initial DMA ring depth, in frames.
    pub latency: usize,

    /// Ceiling for automatic latency increases.
    pub max_latency: usize,

    /// DMA ticks (milliseconds) per interrupt.
    pub ticks_per_irq: usize,

    pub los_debounce_ms: u64,
    pub lfa_debounce_ms: u64,
    pub ais_debounce_ms: u64,
    pub yellow_debounce_ms: u64,

    /// Time an alarm keeps reporting RECOVER after its condition clears.
    pub settle_ms: u64,

    /// Elect one timing source across every card on the timing cable,
    /// instead of letting each card pick from its own spans.
    pub timing_cable: bool,

    pub sync_period_ms: u64,
    pub dsp_poll_ms: u64,

    /// Register polls allowed for an HDLC controller reset to finish.
    pub hdlc_reset_poll_limit: u32,

    /// How long start-up waits for the first interrupt. Zero skips the
    /// check.
    pub interrupt_wait_ms: u64,

    pub line_type: LineType,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            latency: 2,
            max_latency: 16,
            ticks_per_irq: 1,
            los_debounce_ms: 2500,
            lfa_debounce_ms: 2500,
            ais_debounce_ms: 2500,
            yellow_debounce_ms: 500,
            settle_ms: 5000,
            timing_cable: false,
            sync_period_ms: 1000,
            dsp_poll_ms: 100,
            hdlc_reset_poll_limit: 1000,
            interrupt_wait_ms: 1000,
            line_type: LineType::T1,
        }
    }
}

impl DriverConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let (config, _): (Self, usize) = serde_json_core::from_str(text)
            .map_err(|e| Error::Config(format!("{e:?}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_latency == 0 || self.max_latency > DEPTH_MAX {
            return Err(Error::Config(format!("max_latency {} not in 1..={DEPTH_MAX}", self.max_latency)));
        }
        if self.latency == 0 || self.latency > self.max_latency {
            return Err(Error::Config(format!("latency {} not in 1..={}", self.latency, self.max_latency)));
        }
        if self.ticks_per_irq == 0 || self.ticks_per_irq > self.latency {
            return Err(Error::Config(format!("ticks_per_irq {} not in 1..={}", self.ticks_per_irq, self.latency)));
        }
        if self.sync_period_ms == 0 {
            return Err(Error::Config("sync_period_ms must be nonzero".into()));
        }
        if self.dsp_poll_ms == 0 {
            return Err(Error::Config("dsp_poll_ms must be nonzero".into()));
        }
        if self.hdlc_reset_poll_limit == 0 {
            return Err(Error::Config("hdlc_reset_poll_limit must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(DriverConfig::default().validate().is_ok());
    }

    #[test]
    fn json_overrides_only_named_fields() {
        let config = DriverConfig::from_json(r#"{"latency":4,"timing_cable":true,"line_type":"E1"}"#).unwrap();
        assert_eq!(config.latency, 4);
        assert!(config.timing_cable);
        assert_eq!(config.line_type, LineType::E1);
        assert_eq!(config.max_latency, 16);
        assert_eq!(config.yellow_debounce_ms, 500);
    }

    #[test]
    fn latency_above_maximum_rejected() {
        let config = DriverConfig {
            latency: 20,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(DriverConfig::from_json("{\"latency\":"), Err(Error::Config(_))));
    }
}
