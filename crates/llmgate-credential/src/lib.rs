//! Credential pool: owns upstream API keys and their runtime health state.
//!
//! Deliberately free of HTTP/async-runtime dependencies — `pool.lease`
//! never blocks on I/O, so there is nothing here
//! for `tokio` to schedule around.

pub mod pool;
pub mod state;

pub use pool::{AcquireError, Credential, CredentialId, CredentialPool, CredentialSnapshot};
pub use state::{CoolingPeriods, CredentialState, FailureKind};
