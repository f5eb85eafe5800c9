//! The reportable unit handed to a [`Reporter`](crate::Reporter).

use std::borrow::Cow;

use indexmap::IndexMap;
use serde::Serialize;

use crate::{context::RequestContext, stacktrace::Stacktrace};

/// Free-form string metadata attached to a packet.
pub type Tags = IndexMap<String, String>;

/// Severity of a packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Diagnostic detail.
    Debug,
    /// Informational.
    Info,
    /// Something unexpected that was handled.
    Warning,
    /// A failure that was contained.
    #[default]
    Error,
    /// A failure that kept propagating.
    Fatal,
}

/// How an exception was caught.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mechanism {
    /// Identifier of the catching component.
    #[serde(rename = "type")]
    pub ty: Cow<'static, str>,
    /// Whether the exception stopped at the catching component.
    pub handled: bool,
}

impl Mechanism {
    /// Mechanism recorded by the recovery interceptor.
    pub const RECOVERY: &'static str = "faultline.recovery";

    /// A mechanism of type [`Mechanism::RECOVERY`].
    pub fn recovery(handled: bool) -> Self {
        Self {
            ty: Cow::Borrowed(Self::RECOVERY),
            handled,
        }
    }
}

/// An exception record built from a panic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Exception {
    /// Kind of exception; `panic` for intercepted panics.
    #[serde(rename = "type")]
    pub ty: String,
    /// The panic message.
    pub value: String,
    /// Source location of the panic as `file:line:column`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// How the panic was caught.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<Mechanism>,
    /// Stack at the failure site.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Stacktrace>,
}

impl Exception {
    /// A `panic` exception with message `value`.
    pub fn new(value: impl Into<String>, stacktrace: Option<Stacktrace>) -> Self {
        Self {
            ty: "panic".to_string(),
            value: value.into(),
            module: None,
            mechanism: None,
            stacktrace,
        }
    }

    /// Records where the panic happened.
    #[must_use]
    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.module = location;
        self
    }

    /// Records how the panic was caught.
    #[must_use]
    pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }
}

/// A message, an exception and the request that was being served.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Packet {
    /// Human-readable summary, the panic message.
    pub message: String,
    /// Severity.
    pub level: Level,
    /// Where the failure originated: the innermost application frame, or the
    /// panic location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub culprit: Option<String>,
    /// The exception record.
    pub exception: Exception,
    /// Snapshot of the request.
    pub request: RequestContext,
    /// Metadata added by reporters or decorators.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub tags: Tags,
}

impl Packet {
    /// Assembles a packet at [`Level::Error`].
    pub fn new(message: impl Into<String>, exception: Exception, request: RequestContext) -> Self {
        let culprit = exception
            .stacktrace
            .as_ref()
            .and_then(Stacktrace::culprit)
            .map(|frame| frame.function.clone())
            .or_else(|| exception.module.clone());

        Self {
            message: message.into(),
            level: Level::Error,
            culprit,
            exception,
            request,
            tags: Tags::new(),
        }
    }

    /// Sets the severity.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}
