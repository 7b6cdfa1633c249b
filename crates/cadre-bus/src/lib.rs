//! # cadre-bus
//!
//! Decoupled publish/subscribe backbone for Cadre.
//!
//! Every component communicates through the bus rather than holding direct
//! references to its peers. Delivery is synchronous and in registration
//! order; a misbehaving subscriber is logged and skipped, never allowed to
//! break the publisher or starve later subscribers. The bus retains a
//! bounded ring of recent events for history queries.

mod bus;
mod event;
pub mod topics;

pub use bus::{EventBus, EventHandler, Subscription};
pub use event::{Event, EventFilter};
