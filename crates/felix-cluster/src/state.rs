// Broker lifecycle state.
use std::fmt;

/// Lifecycle of a broker, ordered from startup to shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BrokerState {
    #[default]
    Initializing,
    Operating,
    Quiescing,
    QuiesceCompleted,
    ShutdownStarted,
    ShutdownFailover,
    ShutdownComplete,
    FailoverPending,
    FailoverStarted,
    FailoverComplete,
}

impl BrokerState {
    /// Whether this lifecycle has ended and a new one may begin.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ShutdownComplete | Self::FailoverComplete)
    }

    /// Normal transitions only move forward. A broker that finished shutting
    /// down or was failed over may start a new lifecycle from any state.
    pub fn can_transition_to(self, next: Self) -> bool {
        self.is_terminal() || next >= self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Operating => "OPERATING",
            Self::Quiescing => "QUIESCE_STARTED",
            Self::QuiesceCompleted => "QUIESCE_COMPLETED",
            Self::ShutdownStarted => "SHUTDOWN_STARTED",
            Self::ShutdownFailover => "SHUTDOWN_FAILOVER",
            Self::ShutdownComplete => "SHUTDOWN_COMPLETE",
            Self::FailoverPending => "FAILOVER_PENDING",
            Self::FailoverStarted => "FAILOVER_STARTED",
            Self::FailoverComplete => "FAILOVER_COMPLETE",
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::BrokerState;

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(BrokerState::Initializing.can_transition_to(BrokerState::Operating));
        assert!(BrokerState::Operating.can_transition_to(BrokerState::Quiescing));
        assert!(BrokerState::Operating.can_transition_to(BrokerState::ShutdownComplete));
        assert!(BrokerState::Operating.can_transition_to(BrokerState::Operating));
    }

    #[test]
    fn backward_transitions_are_refused() {
        assert!(!BrokerState::Operating.can_transition_to(BrokerState::Initializing));
        assert!(!BrokerState::QuiesceCompleted.can_transition_to(BrokerState::Operating));
        assert!(!BrokerState::FailoverStarted.can_transition_to(BrokerState::FailoverPending));
    }

    #[test]
    fn terminal_states_restart_lifecycle() {
        assert!(BrokerState::ShutdownComplete.can_transition_to(BrokerState::Operating));
        assert!(BrokerState::FailoverComplete.can_transition_to(BrokerState::Initializing));
    }

    #[test]
    fn shutdown_in_progress_can_fail_over() {
        assert!(BrokerState::ShutdownStarted.can_transition_to(BrokerState::FailoverPending));
    }

    #[test]
    fn display_uses_upper_snake_names() {
        assert_eq!(BrokerState::Quiescing.to_string(), "QUIESCE_STARTED");
        assert_eq!(BrokerState::default(), BrokerState::Initializing);
    }
}
