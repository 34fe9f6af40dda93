//! Hard caps applied at the engine and wire boundaries.

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DEPARTMENT_LEN: usize = 32;
pub const MAX_REASON_LEN: usize = 1_000;
/// Live drafts (pending, not yet blocking) in one (resource, date) partition.
/// Rejected entries do not count, and blocking ones are bounded by the
/// no-overlap rule.
pub const MAX_DRAFTS_PER_DAY: usize = 512;
/// Live drafts one requester may hold in a single partition.
pub const MAX_DRAFTS_PER_REQUESTER_DAY: usize = 8;
/// Days a single batch request may expand to.
pub const MAX_BATCH_DAYS: usize = 366;
/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
pub const MAX_CONNECTIONS_DEFAULT: usize = 256;
