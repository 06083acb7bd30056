//! Persistence layer modules.
//!
//! All state lives as plain files under `<workspace>/.agent-loop/`:
//! per-agent session records, the shared claim ledger, and the
//! append-only transition log.

pub mod atomic;
pub mod claim_ledger;
pub mod session_store;
pub mod transition_log;

pub use atomic::RetryPolicy;
pub use claim_ledger::{ClaimReader, WorkQueue};
pub use session_store::{SessionReader, SessionStore};
pub use transition_log::TransitionLog;
