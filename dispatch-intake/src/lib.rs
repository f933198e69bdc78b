pub mod consumer;
pub mod service;

pub use service::{IntakeTally, NotificationEvent, NotificationIntake, PayloadOutcome};
