//! Service layer for the csbus middleware.
//!
//! A [`Server`] hosts one [`ServiceProvider`] per service identifier; a
//! [`Client`] hands out one [`ServiceRequester`] per service it talks to.
//! Providers answer requests, own property caches, and fan status updates
//! and signals out to their registered subscribers. Requesters correlate
//! responses back to the originating call, run subscription callbacks on
//! the component that created them, and track service availability.
//!
//! Both endpoints sit on top of `csbus-routing` for in-process delivery
//! and fall back to a pluggable [`Transport`] for everything else.

pub mod client;
pub mod error;
pub mod provider;
pub mod requester;
pub mod server;
pub mod transport;

pub use client::Client;
pub use error::{Result, ServiceError};
pub use provider::{Request, ServiceProvider};
pub use requester::ServiceRequester;
pub use server::Server;
pub use transport::{Transport, TransportStatus};

pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
