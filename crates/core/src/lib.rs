#![forbid(unsafe_code)]

pub mod error;
pub mod model;
pub mod streak;
pub mod time;

pub use error::RecordError;
pub use time::{CalendarZone, Clock};
