//! See [`ServiceGate`].

use web_time::Duration;

/// How long one quick wait lasts.
pub const QUICK_WAIT: Duration = Duration::from_millis(1);

/// How many quick waits a tick of work buys.
pub const QUICK_WAIT_CREDITS: u8 = 3;

/// Computes the limit for the service thread's single adaptive wait.
///
/// After any tick that did at least one unit of work, the next
/// [`QUICK_WAIT_CREDITS`] waits are forced down to [`QUICK_WAIT`] so
/// follow-on work is picked up with low latency; once the credits run out
/// the wait stretches back to the caller's idle limit. This is the primary
/// latency-versus-CPU knob of the service loop.
///
/// ```
/// use tether_proto::service::ServiceGate;
/// use web_time::Duration;
///
/// let idle = Duration::from_millis(100);
/// let mut gate = ServiceGate::new();
/// assert_eq!(idle, gate.next_wait(idle));
///
/// gate.note_work(2);
/// assert_eq!(Duration::from_millis(1), gate.next_wait(idle));
/// assert_eq!(Duration::from_millis(1), gate.next_wait(idle));
/// assert_eq!(Duration::from_millis(1), gate.next_wait(idle));
/// assert_eq!(idle, gate.next_wait(idle));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServiceGate {
    credits: u8,
}

impl ServiceGate {
    /// Creates a gate with no quick-wait credit.
    #[must_use]
    pub const fn new() -> Self {
        Self { credits: 0 }
    }

    /// Reports how much work the last tick did.
    pub const fn note_work(&mut self, work: u32) {
        if work > 0 {
            self.credits = QUICK_WAIT_CREDITS;
        }
    }

    /// The limit to pass to `wait_for_something_to_do` for the next tick.
    pub fn next_wait(&mut self, idle_limit: Duration) -> Duration {
        if self.credits > 0 {
            self.credits -= 1;
            QUICK_WAIT.min(idle_limit)
        } else {
            idle_limit
        }
    }
}
