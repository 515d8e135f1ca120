// Stream module: inbound byte reassembly and line fan-out

pub mod assembler;
pub mod broadcaster;

pub use assembler::{LineAssembler, DEFAULT_MAX_PENDING};
pub use broadcaster::{
    Broadcaster, SubscriberId, Subscription, DEFAULT_SUBSCRIBER_CAPACITY, DEFAULT_TAIL_CAPACITY,
};
