//! Tenantgate - A reverse proxy that gives every subdomain its own backend
//!
//! This library provides a multi-tenant router that:
//! - Derives a tenant from the leftmost label of the Host header
//! - Spawns one backend per tenant on first request, on an OS-assigned port
//! - Guarantees a single backend per tenant even under concurrent first requests
//! - Holds the first request until the backend passes a bounded readiness probe
//! - Relays traffic to the tenant's backend through a pooled HTTP client

pub mod config;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod pool;
pub mod port;
pub mod probe;
pub mod proxy;
pub mod tenant;

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
