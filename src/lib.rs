//! deviceauth-service: device admission control and authentication
//! core for an IoT fleet management platform.
//!
//! Devices present signed authentication requests; operators (or
//! preauthorization records) decide which requests become accepted
//! authentication sets; accepted devices receive session tokens that
//! the verification pipeline checks on every forwarded API call.

pub mod access;
pub mod cache;
pub mod clients;
pub mod config;
pub mod context;
pub mod devauth;
pub mod error;
pub mod jwt;
pub mod models;
pub mod store;
pub mod utils;

pub use config::DevAuthConfig;
pub use context::{Identity, RequestContext};
pub use devauth::{Config, DevAuth};
pub use error::DevAuthError;
