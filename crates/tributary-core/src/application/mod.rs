/// Execution journal (state-machine idempotency primitive)
pub mod journal;

/// Progress counters with duplicate-key retry
pub mod progress;
