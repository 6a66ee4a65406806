//! The pull and push engines plus the cross-process status file they share.
//!
//! One engine invocation runs single-threaded with a single IMAP
//! connection and exactly one outstanding FETCH/APPEND at a time; the
//! status file serializes engine runs per working tree.

pub mod pull;
pub mod push;
pub mod status;

pub use pull::{PullEngine, PullOptions, PullSummary};
pub use push::{PushEngine, PushOptions, PushSummary};
pub use status::{read_status, StatusWriter, SyncStatus};
