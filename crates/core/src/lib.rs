//! `herald-core`: identifiers and validation primitives shared by every crate.
//!
//! This crate carries no infrastructure concerns and no async.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{CorrelationId, DeliveryId, EventId, WorkerId};
