//! Keepalive state machine.

use std::fmt;

use tokio::time::Instant;

/// Liveness state of the connection.
///
/// At most one ping is outstanding at a time. The deadline is armed when a
/// ping goes out and disarmed by the first pong that answers it; pongs that
/// arrive while idle are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Liveness {
    /// No ping outstanding.
    Idle,
    /// A ping is out; a pong must arrive before the deadline.
    AwaitingPong {
        /// Instant by which the pong must arrive.
        deadline: Instant,
    },
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Liveness::Idle
    }

    /// Whether a new ping may be sent.
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, Liveness::Idle)
    }

    /// The armed pong deadline, if a ping is outstanding.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match self {
            Liveness::Idle => None,
            Liveness::AwaitingPong { deadline } => Some(*deadline),
        }
    }

    /// Record that a ping went out and arm the pong deadline.
    pub(crate) fn ping_sent(&mut self, deadline: Instant) {
        *self = Liveness::AwaitingPong { deadline };
    }

    /// Record an inbound pong. Returns true if it answered an outstanding
    /// ping; false for an unsolicited pong, which leaves the state as-is.
    pub(crate) fn pong_received(&mut self) -> bool {
        match self {
            Liveness::Idle => false,
            Liveness::AwaitingPong { .. } => {
                *self = Liveness::Idle;
                true
            }
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Idle => write!(f, "idle"),
            Liveness::AwaitingPong { .. } => write!(f, "awaiting_pong"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ping_arms_deadline() {
        let mut liveness = Liveness::new();
        assert!(liveness.is_idle());
        assert!(liveness.deadline().is_none());

        let deadline = Instant::now() + Duration::from_millis(45);
        liveness.ping_sent(deadline);
        assert!(!liveness.is_idle());
        assert_eq!(liveness.deadline(), Some(deadline));
    }

    #[test]
    fn test_pong_answers_outstanding_ping() {
        let mut liveness = Liveness::new();
        liveness.ping_sent(Instant::now() + Duration::from_millis(45));

        assert!(liveness.pong_received());
        assert!(liveness.is_idle());
        assert!(liveness.deadline().is_none());
    }

    #[test]
    fn test_unsolicited_pong_is_ignored() {
        let mut liveness = Liveness::new();
        assert!(!liveness.pong_received());
        assert!(liveness.is_idle());

        // A burst of unsolicited pongs changes nothing.
        assert!(!liveness.pong_received());
        assert!(!liveness.pong_received());
        assert!(liveness.is_idle());
    }
}
