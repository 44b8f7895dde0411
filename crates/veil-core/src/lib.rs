pub mod account;
pub mod clock;
pub mod constants;
pub mod conversation;
pub mod error;
pub mod message;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::VeilError;
