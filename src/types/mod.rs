//! Shared types: errors, money, time.

pub mod clock;
pub mod error;
pub mod money;

pub use clock::{Clock, ManualClock, SystemClock, TimestampMs};
pub use error::{ErrorBody, HelmsmanError, Result};
pub use money::Credits;
