//! Recovery interceptors for request handlers.
//!
//! A [`Recovery`] runs a handler and, if it panics, reports the panic
//! together with a redacted snapshot of the request, writes an error status
//! and then either contains the panic or re-raises it:
//!
//! ```text
//! Running ──panic──▶ PanicCaught ──▶ Reported ──┬──▶ Suppressed
//!    │                                          └──▶ Repropagated
//!    └──return──▶ Completed
//! ```
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//!
//! use faultline::{Outcome, Packet, Recovery, RecoveryMode, RecoveryOptions, Tags};
//!
//! fn handler(_response: &mut http::Response<()>, _request: &http::Request<()>) {
//!     panic!("boom");
//! }
//!
//! let packets: Arc<Mutex<Vec<Packet>>> = Arc::default();
//! let sink = Arc::clone(&packets);
//! let recovery = Recovery::new(handler, RecoveryOptions::new(RecoveryMode::Suppress))
//!     .with_reporter(move |packet: Packet, _tags: Option<&Tags>| {
//!         sink.lock().unwrap().push(packet);
//!     });
//!
//! let request = http::Request::new(());
//! let mut response = http::Response::new(());
//! assert_eq!(recovery.call(&mut response, &request), Outcome::Suppressed);
//! assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
//!
//! let packets = packets.lock().unwrap();
//! assert_eq!(packets.len(), 1);
//! assert_eq!(packets[0].message, "boom");
//! ```

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
};

use http::StatusCode;
use triomphe::Arc;

use crate::{
    config::EnvOptions,
    context::{RequestContext, SnapshotOptions},
    packet::{Exception, Level, Mechanism, Packet, Tags},
    panic_hook::{self, PanicSite},
    redaction,
    reporter::{self, Reporter},
    request::InboundRequest,
    stacktrace::{StackPolicy, Stacktrace},
};

/// Where a response status can be written.
pub trait ResponseStatus {
    /// Overwrites the status.
    fn set_status(&mut self, status: StatusCode);
}

impl<B> ResponseStatus for http::Response<B> {
    fn set_status(&mut self, status: StatusCode) {
        *self.status_mut() = status;
    }
}

impl ResponseStatus for http::response::Parts {
    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }
}

impl ResponseStatus for StatusCode {
    fn set_status(&mut self, status: StatusCode) {
        *self = status;
    }
}

impl<T: ResponseStatus + ?Sized> ResponseStatus for &mut T {
    fn set_status(&mut self, status: StatusCode) {
        (**self).set_status(status);
    }
}

/// What happens to a panic once it has been reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RecoveryMode {
    /// The panic stops at the interceptor.
    #[default]
    Suppress,
    /// The panic is re-raised with its original payload.
    Repropagate,
}

/// How an intercepted call ended, when it returned at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The handler returned normally.
    Completed,
    /// The handler panicked; the panic was reported and contained.
    Suppressed,
}

/// Settings for a [`Recovery`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Whether a reported panic is contained or re-raised.
    pub mode: RecoveryMode,
    /// Status written when a handler panics. A status that is not a client
    /// or server error is written as `500 Internal Server Error`.
    pub status: StatusCode,
    /// How the request is snapshotted.
    pub snapshot: SnapshotOptions,
    /// Which frames end up in the exception's stack trace.
    pub stack: StackPolicy,
    /// Passed to the reporter with every packet.
    pub tags: Tags,
}

impl RecoveryOptions {
    /// Defaults for `mode`: status 500, trusted `X-Forwarded-Proto`, a
    /// three-frame stack and no tags.
    pub fn new(mode: RecoveryMode) -> Self {
        Self {
            mode,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            snapshot: SnapshotOptions::DEFAULT,
            stack: StackPolicy::DEFAULT,
            tags: Tags::new(),
        }
    }

    /// Defaults for `mode`, overridden by the environment.
    ///
    /// Fragments listed in `FAULTLINE_REDACT` are registered process-wide.
    /// See [`config`](crate::config) for the variables.
    pub fn from_env(mode: RecoveryMode) -> Self {
        let env = EnvOptions::get();
        for field in &env.redact {
            redaction::register_redaction_field(field);
        }

        let mut options = Self::new(mode);
        if let Some(trust) = env.trust_forwarded_proto {
            options.snapshot.trust_forwarded_proto = trust;
        }
        if let Some(stack) = env.stack {
            options.stack = stack;
        }
        options
    }

    /// Sets the status written on panic.
    ///
    /// Only client and server error statuses are accepted. Anything else is
    /// replaced by `500 Internal Server Error`.
    #[must_use]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = error_status(status);
        self
    }

    /// Sets whether `X-Forwarded-Proto` is trusted.
    #[must_use]
    pub fn trust_forwarded_proto(mut self, trust: bool) -> Self {
        self.snapshot.trust_forwarded_proto = trust;
        self
    }

    /// Sets the stack capture policy.
    #[must_use]
    pub fn stack(mut self, stack: StackPolicy) -> Self {
        self.stack = stack;
        self
    }

    /// Adds a tag passed to the reporter with every packet.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self::new(RecoveryMode::default())
    }
}

/// A handler wrapped with panic reporting.
///
/// Handlers take the response first and the request second, and are called
/// through [`Recovery::call`].
pub struct Recovery<H> {
    handler: H,
    options: RecoveryOptions,
    reporter: Option<Arc<dyn Reporter>>,
}

impl<H> Recovery<H> {
    /// Wraps `handler`.
    ///
    /// Also installs the [panic-site hook](crate::panic_hook) if it is not
    /// installed yet.
    pub fn new(handler: H, options: RecoveryOptions) -> Self {
        panic_hook::install();
        Self {
            handler,
            options,
            reporter: None,
        }
    }

    /// Wraps `handler` so that panics are reported and contained.
    pub fn suppressing(handler: H) -> Self {
        Self::new(handler, RecoveryOptions::new(RecoveryMode::Suppress))
    }

    /// Wraps `handler` so that panics are reported and re-raised.
    pub fn repropagating(handler: H) -> Self {
        Self::new(handler, RecoveryOptions::new(RecoveryMode::Repropagate))
    }

    /// Sends packets to `reporter` instead of the process-wide reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: impl Reporter) -> Self {
        self.reporter = Some(reporter::into_shared(reporter));
        self
    }

    /// The options this interceptor was built with.
    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    /// Runs the handler.
    ///
    /// Returns [`Outcome::Completed`] if the handler returned, without
    /// touching the response. If it panicked, the panic is reported and the
    /// configured status is written; then [`Outcome::Suppressed`] is
    /// returned, or, in [`RecoveryMode::Repropagate`], the original panic is
    /// resumed.
    pub fn call<Q, W>(&self, response: &mut W, request: &Q) -> Outcome
    where
        H: Fn(&mut W, &Q),
        Q: InboundRequest + ?Sized,
        W: ResponseStatus + ?Sized,
    {
        let armed = panic_hook::arm(self.options.stack);
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(response, request)));
        drop(armed);

        let Err(payload) = result else {
            return Outcome::Completed;
        };

        let message = panic_message(&*payload);
        tracing::debug!(state = "panic_caught", "intercepted handler panic");
        tracing::error!(
            panic.message = %message,
            http.method = request.method(),
            http.path = request.path(),
            mode = ?self.options.mode,
            "request handler panicked"
        );

        let site = panic_hook::take().unwrap_or_else(|| PanicSite {
            stacktrace: Stacktrace::capture(&self.options.stack),
            location: None,
        });
        let restore = (self.options.mode == RecoveryMode::Repropagate).then(|| site.clone());

        self.report(&message, site, request);
        tracing::debug!(state = "reported", "packet submitted");

        response.set_status(error_status(self.options.status));

        match self.options.mode {
            RecoveryMode::Suppress => {
                tracing::debug!(state = "suppressed", "panic contained");
                Outcome::Suppressed
            }
            RecoveryMode::Repropagate => {
                tracing::debug!(state = "repropagated", "resuming panic");
                if let Some(site) = restore {
                    panic_hook::restore(site);
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Builds and submits the packet. Never panics: a failing snapshot or
    /// reporter is logged and otherwise ignored.
    fn report<Q>(&self, message: &str, site: PanicSite, request: &Q)
    where
        Q: InboundRequest + ?Sized,
    {
        let submitted = panic::catch_unwind(AssertUnwindSafe(|| {
            let packet = self.build_packet(message, site, request);
            let tags = (!self.options.tags.is_empty()).then_some(&self.options.tags);
            match &self.reporter {
                Some(reporter) => reporter.capture(packet, tags),
                None => reporter::capture(packet, tags),
            }
        }));

        if let Err(payload) = submitted {
            tracing::warn!(
                reporter.panic = %panic_message(&*payload),
                "reporting an intercepted panic failed"
            );
        }
    }

    fn build_packet<Q>(&self, message: &str, site: PanicSite, request: &Q) -> Packet
    where
        Q: InboundRequest + ?Sized,
    {
        let handled = self.options.mode == RecoveryMode::Suppress;
        let exception = Exception::new(message, site.stacktrace)
            .with_location(site.location)
            .with_mechanism(Mechanism::recovery(handled));
        let request =
            RequestContext::snapshot_with(request, &self.options.snapshot, &redaction::rules());

        Packet::new(message, exception, request).with_level(if handled {
            Level::Error
        } else {
            Level::Fatal
        })
    }
}

impl<H> fmt::Debug for Recovery<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recovery")
            .field("options", &self.options)
            .field("reporter", &self.reporter.is_some())
            .finish_non_exhaustive()
    }
}

/// Wraps `handler` so that panics are reported to the process-wide reporter
/// and contained, answering with `500 Internal Server Error`.
pub fn recovery_handler<Q, W, H>(handler: H) -> impl Fn(&mut W, &Q)
where
    H: Fn(&mut W, &Q),
    Q: InboundRequest + ?Sized,
    W: ResponseStatus + ?Sized,
{
    let recovery = Recovery::suppressing(handler);
    move |response: &mut W, request: &Q| {
        recovery.call(response, request);
    }
}

/// Wraps `handler` so that panics are reported to the process-wide reporter,
/// answered with `500 Internal Server Error`, and then re-raised.
pub fn report_handler<Q, W, H>(handler: H) -> impl Fn(&mut W, &Q)
where
    H: Fn(&mut W, &Q),
    Q: InboundRequest + ?Sized,
    W: ResponseStatus + ?Sized,
{
    let recovery = Recovery::repropagating(handler);
    move |response: &mut W, request: &Q| {
        recovery.call(response, request);
    }
}

/// `status` if it is a 4xx or 5xx status, `500` otherwise.
fn error_status(status: StatusCode) -> StatusCode {
    if status.is_client_error() || status.is_server_error() {
        status
    } else {
        tracing::debug!(%status, "not an error status, using 500");
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// The message of a panic payload.
///
/// Payloads from `panic!` are `&'static str` or `String`. Anything else is
/// rendered the way the standard panic hook does.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}
