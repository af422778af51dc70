//! Event model for the delivery pipeline.
//!
//! Everything here is plain data plus validation: no IO, no async. The
//! infrastructure crate moves these values between stores and stages.

pub mod event;
pub mod lane;
pub mod name;
pub mod outcome;

pub use event::{Category, Event, Priority, ValidationError};
pub use lane::Lane;
pub use name::EventName;
pub use outcome::{AttemptFailure, DeliveryResult, FailureReason};
