pub mod event_version;
pub mod events;
pub mod outbox;

pub use event_version::*;
pub use events::*;
pub use outbox::*;
