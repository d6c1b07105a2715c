//! numlog: bounded-admission TCP ingestion of nine digit numbers.
//!
//! Clients send newline-terminated lines; exact nine decimal digit numbers
//! are deduplicated across the process lifetime and first sightings are
//! appended to a durable log in batches. The reserved `terminate` line shuts
//! the whole service down from any connection.

pub mod codec;
pub mod handler;
pub mod journal;
pub mod permit;
pub mod server;
pub mod service;

pub use codec::LineCodec;
pub use handler::{HandlerError, handle_connection};
pub use journal::{ActivityReport, Journal, RecordError, RecordOutcome, TERMINATE_SEQUENCE};
pub use permit::{Permit, PermitPool};
pub use server::{Server, ServerConfig, ServerError};
pub use service::{FlushPolicy, Service, ServiceConfig, ServiceError};
