//! Event bus for cross-component and cross-master notification.
//!
//! Messages are routed by tuple-shaped keys such as
//! `("buildrequests", <builder>, "new")`. Subscriptions use the same shape
//! with `*` as a single-segment wildcard.

pub mod bus;

pub use bus::{BusMessage, EventBus, LocalBus, MqError, MqResult, RoutingKey};
