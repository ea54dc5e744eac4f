use std::time::Duration;

/// No attempt waits longer than this, whatever the growth settings.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub growth: f64,
    pub exponent_cap: u32,
    /// 0 retries forever.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            growth: 2.0,
            exponent_cap: 5,
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay once the exponent cap is reached, or `None` when that exceeds
    /// [`MAX_DELAY`].
    pub fn ceiling(&self) -> Option<Duration> {
        let factor = self.growth.powi(clamp_exponent(self.exponent_cap));
        let secs = self.base_delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|delay| *delay <= MAX_DELAY)
    }
}

fn clamp_exponent(exponent: u32) -> i32 {
    i32::try_from(exponent).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    Scheduled { attempt: u32, delay: Duration },
    AlreadyPending,
    Exhausted { attempts: u32 },
}

/// Exponential backoff bookkeeping. Owns no timer; callers arm one for the
/// returned delay and call [`ReconnectPolicy::fire`] when it runs.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    attempts: u32,
    pending: bool,
}

impl ReconnectPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            pending: false,
        }
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(self.config.exponent_cap);
        let factor = self.config.growth.powi(clamp_exponent(exponent));
        Duration::try_from_secs_f64(self.config.base_delay.as_secs_f64() * factor)
            .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
    }

    pub fn schedule(&mut self) -> ScheduleDecision {
        if self.pending {
            return ScheduleDecision::AlreadyPending;
        }
        if self.config.max_attempts != 0 && self.attempts >= self.config.max_attempts {
            return ScheduleDecision::Exhausted {
                attempts: self.attempts,
            };
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        self.pending = true;
        ScheduleDecision::Scheduled {
            attempt: self.attempts,
            delay,
        }
    }

    pub fn fire(&mut self) {
        self.pending = false;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.pending = false;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}
