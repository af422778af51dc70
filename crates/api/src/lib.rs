//! HTTP surface: the operator API and the HTTP downstream handler.

pub mod app;
pub mod webhook;

pub use webhook::HttpBatchHandler;
