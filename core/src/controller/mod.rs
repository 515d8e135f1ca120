// Controller module: connection lifecycle state machine

pub mod events;
pub mod manager;
pub mod settings;
pub mod state;

pub use events::{ControllerEvent, EVENT_CHANNEL_CAPACITY};
pub use manager::ConnectionManager;
pub use settings::{ReconnectPolicy, Settings};
pub use state::{ConnectionState, DeviceSummary, SessionEnd, Status};
