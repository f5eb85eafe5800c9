#![deny(
    missing_docs,
    unsafe_code,
    rustdoc::invalid_rust_codeblocks,
    rustdoc::broken_intra_doc_links,
    missing_copy_implementations,
    unused_doc_comments
)]
// Make docs.rs generate better docs
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Panic interception and request capture for HTTP handlers.
//!
//! ## Overview
//!
//! When a request handler panics, the most useful thing to know is which
//! request it was serving. This crate wraps handlers in a [`Recovery`]
//! interceptor that catches the panic, snapshots the request with secrets
//! redacted, captures a short stack trace at the panic site, and hands the
//! resulting [`Packet`] to a [`Reporter`]. The client then gets an error
//! status, and the panic is either contained or re-raised.
//!
//! ## Quick Example
//!
//! ```
//! use faultline::{Packet, Tags, recovery_handler, reporter};
//!
//! reporter::install_reporter(|packet: Packet, _tags: Option<&Tags>| {
//!     eprintln!("{} while serving {}", packet.message, packet.request.url());
//! })
//! .expect("reporter already installed");
//!
//! let handler = recovery_handler(
//!     |_response: &mut http::Response<String>, request: &http::Request<()>| {
//!         if request.uri().path() == "/boom" {
//!             panic!("boom");
//!         }
//!     },
//! );
//!
//! let request = http::Request::get("http://example.com/boom?password=hunter2")
//!     .body(())
//!     .unwrap();
//! let mut response = http::Response::new(String::new());
//! handler(&mut response, &request);
//! assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
//! ```
//!
//! ## Redaction
//!
//! Query parameters and headers whose names contain `password`,
//! `passphrase`, `passwd` or `secret` (case-insensitively) are replaced by
//! [`redaction::REDACTED`] in every snapshot. More name fragments can be
//! added at any time with [`register_redaction_field`]; they are never
//! removed.
//!
//! ## Panic hook
//!
//! Creating a [`Recovery`] installs a [panic hook](panic_hook) that records
//! the stack while the panicking frames still exist. It runs before any
//! previously installed hook, and only does work while an interceptor on
//! the same thread is running a handler.
//!
//! ## Features
//!
//! - `backtrace` (default): resolves stack frames. Without it packets carry
//!   no stack trace.

mod global_lock;

pub mod config;
pub mod context;
pub mod intercept;
pub mod packet;
pub mod panic_hook;
pub mod redaction;
pub mod reporter;
pub mod request;
pub mod stacktrace;

pub use self::{
    config::EnvOptions,
    context::{RemoteEnv, RequestContext, RequestData, SnapshotOptions, split_host_port},
    intercept::{
        Outcome, Recovery, RecoveryMode, RecoveryOptions, ResponseStatus, panic_message,
        recovery_handler, report_handler,
    },
    packet::{Exception, Level, Mechanism, Packet, Tags},
    redaction::register_redaction_field,
    reporter::Reporter,
    request::{ConnectionInfo, InboundRequest},
    stacktrace::{Frame, StackPolicy, Stacktrace},
};
