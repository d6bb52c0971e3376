//! A configurable multi-endpoint web server core.
//!
//! `whey` terminates TLS for one or more listening sockets, classifies each
//! inbound request against a hierarchical hostname/path routing table,
//! applies per-endpoint admission control and rate limiting, and dispatches
//! to named [applications](crate::app::Application) with fallthrough when an
//! application declines. Every long-running element (endpoints, services,
//! applications, log sinks) runs under one supervised
//! [component lifecycle](crate::component).
//!
//! The crate is transport-complete but deliberately policy-light: the
//! config-file parser, the on-disk log writer, and concrete request handlers
//! beyond the bundled [redirector](crate::app::Redirector) are external
//! collaborators that plug in through the interfaces defined here.
//!
//! # Overview
//!
//! ```text
//! socket -> (admission: connection bucket) -> TLS -> HTTP
//!        -> RequestContext -> (admission: request bucket)
//!        -> RoutingTable::find -> Application::handle -> Response
//!        -> (data bucket writer) -> socket
//! ```
//!
//! A [`ComponentTree`](crate::component::ComponentTree) built from a
//! [`ServerConfig`](crate::config::ServerConfig) owns every piece; `start`
//! brings services up in dependency order and endpoints begin listening,
//! `stop` drains in reverse order under a shared deadline.

pub mod app;
pub mod body;
pub mod component;
pub mod config;
pub mod endpoint;
pub mod event;
pub mod host;
pub mod limit;
pub mod monitor;
pub mod problem;
pub mod routing;

mod error;

pub use body::Body;
pub use error::{Error, ErrorKind};

/// A type-erased error, used at the seams where hyper and tower want one.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
