use serde::Deserialize;
use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSettings {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    #[serde(default = "BackoffSettings::default_multiplier")]
    pub multiplier: f64,
}

impl BackoffSettings {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: Self::default_multiplier(),
        }
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    pub fn validate(&self, section: &str) -> Result<(), String> {
        if self.initial.is_zero() {
            return Err(format!("{}: initial backoff must be positive", section));
        }
        if self.max < self.initial {
            return Err(format!("{}: max backoff is below the initial one", section));
        }
        if !(self.multiplier > 1.0) {
            return Err(format!("{}: backoff multiplier must be above 1", section));
        }
        Ok(())
    }
}

/// Delay sequence `initial, initial * m, initial * m^2, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    settings: BackoffSettings,
    next: Duration,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        let next = settings.initial;
        Self { settings, next }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let grown =
            Duration::from_nanos((delay.as_nanos() as f64 * self.settings.multiplier).round() as u64);
        self.next = grown.min(self.settings.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.settings.initial;
    }
}
