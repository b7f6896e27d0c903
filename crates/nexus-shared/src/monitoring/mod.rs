//! Monitoring plane: event schema and the best-effort event bus.

mod bus;
mod events;

pub use bus::EventBus;
pub use events::{MonitoringEvent, MonitoringEventType};
