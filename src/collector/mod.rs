pub mod buffer;
pub mod idle;
pub mod session;

pub use buffer::{LogBuffer, Window};
pub use idle::IdleTracker;
pub use session::{CollectSession, SessionObserver, SessionOutcome, BATCH_CHANNEL_CAPACITY};
