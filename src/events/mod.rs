//! Control-plane event bus
//!
//! Components announce changes (pods, services, mesh config, certificate
//! rotations) by kind; interested components subscribe to the kinds they
//! care about.

pub mod bus;
pub mod kind;

pub use bus::{DEFAULT_SUBSCRIBER_CAPACITY, EventBus, Message, Subscription};
pub use kind::{Kind, UnknownKind};
