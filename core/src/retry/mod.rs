// Retry module: reconnect delay policy

pub mod backoff;

pub use backoff::{BackoffConfig, BackoffError, BackoffSequence, JitterRange};
