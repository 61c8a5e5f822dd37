use doser_icd::FlowRate;
use embassy_time::Duration;

/// Timing and identity of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModuleConfig {
    /// Advertised max flow rate of every channel, ml/min.
    pub max_flow_rate: FlowRate,
    /// Registration attempts before giving up.
    pub retry_max: u32,
    /// How long each registration attempt waits for the controller.
    pub response_timeout: Duration,
    /// Pause between registration attempts.
    pub retry_delay: Duration,
    /// How long a freshly powered downstream module has to announce itself.
    pub probe_timeout: Duration,
    /// Back-off after a failed receive.
    pub poll_interval: Duration,
    /// On and off time of the fault code blink.
    pub blink_period: Duration,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            max_flow_rate: 60,
            retry_max: 10_000,
            response_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_ticks(0),
            probe_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1),
            blink_period: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControllerConfig {
    /// Give up enumeration after this long without any frame. `None` waits
    /// for the last module forever.
    pub idle_timeout: Option<Duration>,
}
