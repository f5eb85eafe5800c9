#![deny(
    missing_docs,
    unsafe_code,
    rustdoc::invalid_rust_codeblocks,
    rustdoc::broken_intra_doc_links,
    missing_copy_implementations,
    unused_doc_comments
)]

//! Tracing integration for faultline.
//!
//! # Span tags
//!
//! A panic report is much easier to act on when it says which request id,
//! tenant or route was being served. [`SpanTags`] wraps any
//! [`Reporter`] and copies the fields of the tracing spans that are active
//! around the interceptor into the packet's tags:
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use faultline::{Packet, Recovery, Tags};
//! use faultline_tracing::{FaultlineLayer, SpanTags};
//! use tracing_subscriber::{Registry, layer::SubscriberExt};
//!
//! // 1. Capture span fields (required for span tags)
//! let subscriber = Registry::default()
//!     .with(FaultlineLayer)
//!     .with(tracing_subscriber::fmt::layer());
//! tracing::subscriber::set_global_default(subscriber).expect("failed to set subscriber");
//!
//! // 2. Decorate the reporter
//! let packets: Arc<Mutex<Vec<Packet>>> = Arc::default();
//! let sink = Arc::clone(&packets);
//! let reporter = SpanTags::new(move |packet: Packet, _tags: Option<&Tags>| {
//!     sink.lock().unwrap().push(packet);
//! });
//!
//! fn handler(_status: &mut http::StatusCode, _request: &http::Request<()>) {
//!     panic!("boom");
//! }
//! let recovery = Recovery::suppressing(handler).with_reporter(reporter);
//!
//! // 3. Serve requests inside a span
//! let span = tracing::info_span!("request", request_id = 42);
//! let _entered = span.enter();
//! recovery.call(&mut http::StatusCode::OK, &http::Request::new(()));
//!
//! let packets = packets.lock().unwrap();
//! assert_eq!(packets[0].tags["span"], "request");
//! assert_eq!(packets[0].tags["span.request.request_id"], "42");
//! ```
//!
//! Spans entered inside the handler itself have already been exited when the
//! panic reaches the interceptor. Only the spans around the interceptor are
//! recorded.
//!
//! # Log reporting
//!
//! [`LogReporter`] turns packets into `tracing` events, for deployments
//! without a collector.
//!
//! # Environment Variables
//!
//! - `FAULTLINE_TRACING` - Comma-separated options:
//!   - `innermost` - Only tag the fields of the innermost span

use std::{fmt, sync::OnceLock};

use faultline::{Packet, Reporter, Tags};
use tracing::{
    Span,
    field::{Field, Visit},
};
use tracing_subscriber::registry::LookupSpan;

/// Field values recorded for a span, in declaration order.
#[derive(Clone, Debug, Default)]
struct CapturedFields(Vec<(&'static str, String)>);

impl CapturedFields {
    fn set(&mut self, name: &'static str, value: String) {
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name, value)),
        }
    }
}

impl Visit for CapturedFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field.name(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set(field.name(), format!("{value:?}"));
    }
}

/// A tracing layer that records span field values for [`SpanTags`].
///
/// Add it to the subscriber next to the other layers. It does not emit
/// anything itself.
///
/// # Examples
///
/// ```
/// use faultline_tracing::FaultlineLayer;
/// use tracing_subscriber::{Registry, layer::SubscriberExt};
///
/// let subscriber = Registry::default()
///     .with(FaultlineLayer)
///     .with(tracing_subscriber::fmt::layer());
///
/// tracing::subscriber::set_global_default(subscriber).expect("failed to set subscriber");
/// ```
#[derive(Copy, Clone, Debug, Default)]
pub struct FaultlineLayer;

impl<S> tracing_subscriber::Layer<S> for FaultlineLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = CapturedFields::default();
        attrs.record(&mut fields);
        span.extensions_mut().insert(fields);
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<CapturedFields>() {
            Some(fields) => values.record(fields),
            None => {
                let mut fields = CapturedFields::default();
                values.record(&mut fields);
                extensions.insert(fields);
            }
        }
    }
}

#[derive(Debug)]
struct FaultlineTracingEnvOptions {
    innermost_only: bool,
}

impl FaultlineTracingEnvOptions {
    fn get() -> &'static Self {
        static FAULTLINE_TRACING_FLAGS: OnceLock<FaultlineTracingEnvOptions> = OnceLock::new();

        FAULTLINE_TRACING_FLAGS.get_or_init(|| {
            let mut innermost_only = false;

            if let Some(var) = std::env::var_os("FAULTLINE_TRACING") {
                for v in var.to_string_lossy().split(',') {
                    if v.trim().eq_ignore_ascii_case("innermost") {
                        innermost_only = true;
                    }
                }
            }

            FaultlineTracingEnvOptions { innermost_only }
        })
    }
}

/// A [`Reporter`] decorator that tags packets with the current span scope.
///
/// Adds a `span` tag listing the active span names from the outermost to
/// the innermost, joined by ` > `, and one `span.{name}.{field}` tag per
/// recorded field. Tags already present on the packet are kept.
///
/// Requires [`FaultlineLayer`] on a [`tracing_subscriber::Registry`]; without
/// it packets pass through unchanged.
#[derive(Clone, Debug)]
pub struct SpanTags<R> {
    inner: R,
    /// Whether to tag only the fields of the innermost span.
    pub innermost_only: bool,
}

impl<R> SpanTags<R> {
    /// Wraps `inner`.
    ///
    /// # Environment Variables
    ///
    /// - `FAULTLINE_TRACING` - Comma-separated options:
    ///   - `innermost` - Only tag the fields of the innermost span
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            innermost_only: FaultlineTracingEnvOptions::get().innermost_only,
        }
    }

    /// The wrapped reporter.
    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: Reporter> Reporter for SpanTags<R> {
    fn capture(&self, mut packet: Packet, tags: Option<&Tags>) {
        add_span_tags(&mut packet.tags, self.innermost_only);
        self.inner.capture(packet, tags);
    }
}

fn add_span_tags(tags: &mut Tags, innermost_only: bool) {
    Span::current().with_subscriber(|(id, dispatch)| {
        let Some(registry) = dispatch.downcast_ref::<tracing_subscriber::Registry>() else {
            return;
        };
        let Some(span) = registry.span(id) else {
            return;
        };

        let mut names = Vec::new();
        for (depth, ancestor) in span.scope().enumerate() {
            names.push(ancestor.name());
            if innermost_only && depth > 0 {
                continue;
            }
            let extensions = ancestor.extensions();
            let Some(fields) = extensions.get::<CapturedFields>() else {
                continue;
            };
            for (field, value) in &fields.0 {
                tags.entry(format!("span.{}.{field}", ancestor.name()))
                    .or_insert_with(|| value.clone());
            }
        }

        names.reverse();
        tags.entry("span".to_owned())
            .or_insert_with(|| names.join(" > "));
    });
}

/// A [`Reporter`] that emits every packet as an `ERROR` event.
///
/// The event carries the panic message, the culprit, the request method and
/// URL, and the tags.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn capture(&self, packet: Packet, tags: Option<&Tags>) {
        tracing::error!(
            panic.message = %packet.message,
            panic.level = ?packet.level,
            panic.culprit = packet.culprit.as_deref(),
            http.method = packet.request.method(),
            http.url = packet.request.url(),
            tags = ?tags.into_iter().chain([&packet.tags]).flatten().collect::<Vec<_>>(),
            "handler panic intercepted"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use faultline::{Exception, RequestContext};
    use tracing_subscriber::{Registry, layer::SubscriberExt};

    use super::*;

    fn packet() -> Packet {
        let request = http::Request::get("http://example.com/orders").body(()).unwrap();
        Packet::new(
            "boom",
            Exception::new("boom", None),
            RequestContext::snapshot(&request),
        )
    }

    type Captured = Arc<Mutex<Vec<Packet>>>;

    fn recording(innermost_only: bool) -> (SpanTags<impl Reporter>, Captured) {
        let captured = Captured::default();
        let sink = Arc::clone(&captured);
        let mut reporter = SpanTags::new(move |packet: Packet, _tags: Option<&Tags>| {
            sink.lock().unwrap().push(packet);
        });
        reporter.innermost_only = innermost_only;
        (reporter, captured)
    }

    #[test]
    fn test_span_scope_tags() {
        let subscriber = Registry::default().with(FaultlineLayer);
        let (reporter, captured) = recording(false);

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("request", request_id = 7, route = "/orders");
            let _outer = outer.enter();
            let inner = tracing::info_span!("handler", tenant = tracing::field::Empty);
            inner.record("tenant", "acme");
            let _inner = inner.enter();

            let mut packet = packet();
            packet.tags.insert("span".to_owned(), "preset".to_owned());
            reporter.capture(packet, None);
        });

        let packets = captured.lock().unwrap();
        let tags = &packets[0].tags;
        assert_eq!(tags["span"], "preset");
        assert_eq!(tags["span.request.request_id"], "7");
        assert_eq!(tags["span.request.route"], "/orders");
        assert_eq!(tags["span.handler.tenant"], "acme");
    }

    #[test]
    fn test_innermost_only() {
        let subscriber = Registry::default().with(FaultlineLayer);
        let (reporter, captured) = recording(true);

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("request", request_id = 7);
            let _outer = outer.enter();
            let inner = tracing::info_span!("handler", tenant = "acme");
            let _inner = inner.enter();
            reporter.capture(packet(), None);
        });

        let packets = captured.lock().unwrap();
        let tags = &packets[0].tags;
        assert_eq!(tags["span"], "request > handler");
        assert_eq!(tags["span.handler.tenant"], "acme");
        assert!(!tags.contains_key("span.request.request_id"));
    }

    fn failing_handler(_status: &mut http::StatusCode, _request: &http::Request<()>) {
        panic!("boom");
    }

    #[test]
    fn test_span_tags_through_recovery() {
        let subscriber = Registry::default().with(FaultlineLayer);
        let (reporter, captured) = recording(false);
        let recovery = faultline::Recovery::suppressing(failing_handler).with_reporter(reporter);

        let mut status = http::StatusCode::OK;
        let outcome = tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("request", request_id = 42, route = "/orders");
            let _entered = span.enter();
            recovery.call(&mut status, &http::Request::new(()))
        });

        assert_eq!(outcome, faultline::Outcome::Suppressed);
        assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);

        let packets = captured.lock().unwrap();
        assert_eq!(packets.len(), 1);
        let tags = &packets[0].tags;
        assert_eq!(packets[0].message, "boom");
        assert_eq!(tags["span"], "request");
        assert_eq!(tags["span.request.request_id"], "42");
        assert_eq!(tags["span.request.route"], "/orders");
    }

    #[test]
    fn test_without_span() {
        let (reporter, captured) = recording(false);
        reporter.capture(packet(), None);
        assert!(captured.lock().unwrap()[0].tags.is_empty());
    }

    #[derive(Clone, Default)]
    struct EventLayer(Arc<Mutex<Vec<CapturedFields>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventLayer {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut fields = CapturedFields::default();
            event.record(&mut fields);
            self.0.lock().unwrap().push(fields);
        }
    }

    #[test]
    fn test_log_reporter() {
        let events = EventLayer::default();
        let subscriber = Registry::default().with(events.clone());

        tracing::subscriber::with_default(subscriber, || {
            let mut tags = Tags::new();
            tags.insert("service".to_owned(), "billing".to_owned());
            LogReporter.capture(packet(), Some(&tags));
        });

        let events = events.0.lock().unwrap();
        let field = |name: &str| {
            events[0]
                .0
                .iter()
                .find(|(field, _)| *field == name)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(field("panic.message").as_deref(), Some("boom"));
        assert_eq!(field("http.url").as_deref(), Some("http://example.com/orders"));
        assert_eq!(field("http.method").as_deref(), Some("GET"));
        assert!(field("tags").is_some_and(|tags| tags.contains("billing")));
    }
}
