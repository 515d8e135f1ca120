// nuslog core: resilient line stream from a BLE Nordic UART peripheral
//
// The controller discovers the target, connects, supervises the session and
// reconnects with jittered backoff. Inbound bytes are reassembled into lines
// and fanned out to subscribers, a bounded tail and an optional log sink.

pub mod controller;
pub mod error;
pub mod format;
pub mod retry;
pub mod signal;
pub mod sink;
pub mod stream;
pub mod transport;

pub use controller::{
    ConnectionManager, ConnectionState, ControllerEvent, DeviceSummary, ReconnectPolicy,
    SessionEnd, Settings, Status,
};
pub use error::LoggerError;
pub use format::{LineFormat, LineFormatter, TimestampMode};
pub use retry::{BackoffConfig, BackoffError, BackoffSequence};
pub use signal::{StopHandle, StopSignal};
pub use sink::{FileSink, LogSink, MemorySink};
pub use stream::{Broadcaster, LineAssembler, Subscription};
pub use transport::{
    Advertisement, DiscoveredDevice, ScanFilter, Session, Transport, TransportError,
    NUS_RX_CHAR_UUID, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID,
};
