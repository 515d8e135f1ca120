// Controller lifecycle notifications for hosts that render progress

use super::state::{ConnectionState, DeviceSummary, SessionEnd};
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Buffered events per receiver before the slowest one starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the controller did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A scan cycle started
    Scanning {
        target: String,
        pinned_address: Option<String>,
    },
    Connected {
        device: DeviceSummary,
    },
    Disconnected {
        device: DeviceSummary,
        /// How long the session lasted
        session: Duration,
    },
    /// A scan or connect attempt failed
    AttemptFailed {
        error: TransportError,
    },
    /// Waiting `delay` before reconnect cycle `attempt`
    Reconnecting {
        attempt: u64,
        delay: Duration,
    },
    RetryExhausted {
        attempts: u64,
    },
    /// The run is over
    Finished {
        outcome: SessionEnd,
    },
}
