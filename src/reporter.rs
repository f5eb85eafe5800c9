//! The seam between packet assembly and packet delivery.
//!
//! Encoding packets and sending them to a collector is the job of a
//! [`Reporter`]. A reporter can be passed to a single
//! [`Recovery`](crate::Recovery) or installed process-wide:
//!
//! ```rust
//! use faultline::{Packet, Tags, reporter};
//!
//! struct Stderr;
//!
//! impl reporter::Reporter for Stderr {
//!     fn capture(&self, packet: Packet, _tags: Option<&Tags>) {
//!         eprintln!("{}: {}", packet.request.url(), packet.message);
//!     }
//! }
//!
//! reporter::install_reporter(Stderr).expect("reporter already installed");
//! ```

use core::fmt;

use triomphe::Arc;
use unsize::CoerceUnsize;

use crate::{
    global_lock::GlobalLock,
    packet::{Packet, Tags},
};

static REPORTER: GlobalLock<Arc<dyn Reporter>> = GlobalLock::new();

/// Receives packets built from intercepted panics.
///
/// `capture` runs on the request's thread, before the error status is
/// written. It may block, queue the packet, or hand it to a background
/// sender. Panics raised by `capture` are caught and logged by the
/// interceptor.
pub trait Reporter: 'static + Send + Sync {
    /// Delivers `packet`. `tags` are call-site metadata to merge into it.
    fn capture(&self, packet: Packet, tags: Option<&Tags>);
}

impl<F> Reporter for F
where
    F: Fn(Packet, Option<&Tags>) + 'static + Send + Sync,
{
    fn capture(&self, packet: Packet, tags: Option<&Tags>) {
        self(packet, tags)
    }
}

pub(crate) fn into_shared(reporter: impl Reporter) -> Arc<dyn Reporter> {
    Arc::new(reporter).unsize(unsize::Coercion!(to dyn Reporter))
}

/// Error returned by [`install_reporter`] when a reporter is already
/// installed.
///
/// Contains the reporter that was rejected.
pub struct ReporterAlreadyInstalledError(pub Arc<dyn Reporter>);

impl fmt::Debug for ReporterAlreadyInstalledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReporterAlreadyInstalledError").finish()
    }
}

impl fmt::Display for ReporterAlreadyInstalledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a reporter is already installed globally")
    }
}

impl core::error::Error for ReporterAlreadyInstalledError {}

/// Installs the process-wide reporter.
///
/// Fails if one is already installed; see [`replace_reporter`] to swap it.
pub fn install_reporter(reporter: impl Reporter) -> Result<(), ReporterAlreadyInstalledError> {
    let reporter = into_shared(reporter);
    let mut guard = REPORTER.write();
    let slot = guard.get();
    if slot.is_some() {
        return Err(ReporterAlreadyInstalledError(reporter));
    }
    *slot = Some(reporter);
    Ok(())
}

/// Installs the process-wide reporter, returning the previous one.
pub fn replace_reporter(reporter: impl Reporter) -> Option<Arc<dyn Reporter>> {
    REPORTER.write().get().replace(into_shared(reporter))
}

/// The process-wide reporter, if one is installed.
pub fn installed_reporter() -> Option<Arc<dyn Reporter>> {
    REPORTER.read().get().cloned()
}

/// Sends `packet` to the process-wide reporter.
///
/// Without an installed reporter the packet is dropped.
pub fn capture(packet: Packet, tags: Option<&Tags>) {
    match installed_reporter() {
        Some(reporter) => reporter.capture(packet, tags),
        None => tracing::debug!(
            packet.message = %packet.message,
            "no reporter installed, dropping packet"
        ),
    }
}
