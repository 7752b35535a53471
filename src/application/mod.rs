pub mod event_gate;

pub use event_gate::{ConsumeDecision, EventGate, SkipReason};
