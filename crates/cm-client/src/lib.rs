//! Connects a [`cm_core::Engine`] to the hosting runtime over HTTP.

pub mod config;
pub mod error;
pub mod http;

pub use config::{ModuleConfig, OAuthConfig};
pub use error::ClientError;
pub use http::{HttpJobSource, MODULE_AUTH_TOKEN_HEADER};
