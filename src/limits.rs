use crate::model::Ms;

/// Element and group display names.
pub const MAX_NAME_LEN: usize = 255;

/// Free-text reason attached to a rejected or noted commitment.
pub const MAX_REASON_LEN: usize = 1024;

/// Hard ceiling on group nesting. The configured depth is clamped to this.
pub const MAX_GROUP_DEPTH: usize = 64;

/// Default for `SchedulerConfig::retry_attempts`.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Widest window the free-slot finder will scan (one year).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

/// Upper bound on element ids accepted by a multi-element query.
pub const MAX_IN_CLAUSE_IDS: usize = 1_000;
