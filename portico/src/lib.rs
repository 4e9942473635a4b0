//! # portico
//!
//! A configurable HTTP/HTTPS front door: a host-based reverse proxy and
//! static-file server. Each incoming request routes by host and path
//! prefix into a composable *action pipeline* that can rewrite headers,
//! redirect, serve a filesystem, proxy to an HTTP or WebSocket upstream,
//! and modify upstream responses on the way back. TLS terminates locally,
//! with either automatic ACME issuance (plus OCSP stapling) or cached
//! static certificates per host.
//!
//! ## Action pipeline
//!
//! Rules are lists of action strings, applied outermost first:
//!
//! ```yaml
//! rules:
//!   - /:
//!       - set-rsp-header Strict-Transport-Security max-age=31536000
//!       - proxy-cookie front.example backend.example
//!       - filter-content ://backend.example/ ://front.example/
//!       - proxy http://{up:backend}{fullpath}
//! ```
//!
//! Arguments may embed `{...}` variables evaluated per request; see
//! [`action::variable`] for the full grammar.

pub mod acme;
pub mod action;
pub mod certs;
pub mod config;
pub mod error;
pub mod observability;
pub mod ocsp;
pub mod router;
pub mod server;
pub mod tls;
pub mod upstream;

pub use action::{compile_rule, ActionHandler};
pub use config::Config;
pub use error::{Error, Result};
