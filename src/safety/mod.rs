//! Deadman switch for controller-driven UI locking ("slave mode").
//!
//! The lock only holds state; the dispatcher applies the page side effects
//! and the peer event loop sleeps until [`SafetyLock::deadline`].

use tokio::time::{Duration, Instant};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SafetyLock {
    timeout: Duration,
    active: bool,
    reason: Option<String>,
    last_command_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl Default for SafetyLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl SafetyLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: false,
            reason: None,
            last_command_at: None,
            deadline: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Engages the lock or restarts its timer. Returns true when the lock was
    /// not already held.
    pub fn lock(&mut self, reason: Option<String>, now: Instant) -> bool {
        let engaged = !self.active;
        self.active = true;
        if reason.is_some() {
            self.reason = reason;
        }
        self.arm(now);
        if engaged {
            tracing::info!(timeout_ms = self.timeout.as_millis() as u64, "safety lock engaged");
        }
        engaged
    }

    /// Records controller activity; extends the deadline while locked.
    pub fn touch(&mut self, now: Instant) -> bool {
        if !self.active {
            return false;
        }
        self.arm(now);
        true
    }

    pub fn unlock(&mut self) -> bool {
        let was_active = self.active;
        self.release();
        if was_active {
            tracing::info!("safety lock released");
        }
        was_active
    }

    /// Releases the lock once its deadline has passed. Returns the idle time
    /// since the last command, at most once per engagement.
    pub fn expire_if_due(&mut self, now: Instant) -> Option<Duration> {
        let deadline = self.deadline?;
        if !self.active || now < deadline {
            return None;
        }
        let idle = self
            .last_command_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(self.timeout);
        self.release();
        tracing::warn!(idle_ms = idle.as_millis() as u64, "safety lock timed out, releasing");
        Some(idle)
    }

    /// Puts back a lock whose release the page refused. The next expiry is
    /// one timeout from `now`; idle time still counts from the last command.
    pub fn reinstate(&mut self, reason: Option<String>, now: Instant) {
        self.active = true;
        self.reason = reason;
        self.deadline = Some(now + self.timeout);
    }

    fn arm(&mut self, now: Instant) {
        self.last_command_at = Some(now);
        self.deadline = Some(now + self.timeout);
    }

    fn release(&mut self) {
        self.active = false;
        self.reason = None;
        self.deadline = None;
    }
}
