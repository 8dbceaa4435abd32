/// Counters kept by one orchestrator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ElectionStats {
    /// Records confirmed on the active-heartbeat node
    pub heartbeats_pushed: u64,
    /// Heartbeats picked up from the listeners node as a standby
    pub heartbeats_observed: u64,
    /// Listeners reads triggered by a suspicious drift
    pub cross_checks: u64,
    pub failovers_started: u64,
    pub failovers_won: u64,
    pub failovers_lost: u64,
    /// Times this participant created the active-heartbeat node
    pub elections_won: u64,
    /// Operations re-issued after `Timeout` or `AuthFailed`
    pub retried_operations: u64,
    /// Versioned writes rejected with `BadVersion`
    pub rejected_writes: u64,
    /// Decisions taken on the local clock
    pub time_source_fallbacks: u64,
    /// Flag blocks cleared after the very long wait
    pub forced_flag_clears: u64,
    pub malformed_payloads: u64,
}
