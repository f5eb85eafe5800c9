//! Shallow stack traces scoped to the failure site.
//!
//! A trace starts at the innermost frame that belongs to neither the Rust
//! runtime nor this crate, which for a panic is the function that panicked.
//! [`StackPolicy`] decides how many further frames are skipped and how many
//! are kept.
//!
//! Frames are only resolved when the `backtrace` feature is enabled. Without
//! it, [`Stacktrace::capture`] always returns `None`.
//!
//! To get useful symbols in release builds, keep debug info:
//!
//! ```toml
//! [profile.release]
//! debug = "line-tables-only"
//! ```

use serde::Serialize;

/// Crates whose frames are never part of a trace while
/// [`StackPolicy::elide_runtime`] is set.
pub const ELIDED_CRATES: &[&str] = &[
    "backtrace",
    "faultline",
    "std",
    "core",
    "alloc",
    "panic_unwind",
];

/// Which frames of the stack end up in a [`Stacktrace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackPolicy {
    /// Frames to drop after the elided ones.
    pub skip: usize,
    /// Maximum number of frames to keep.
    pub limit: usize,
    /// Drop frames from [`ELIDED_CRATES`] wherever they appear.
    pub elide_runtime: bool,
}

impl StackPolicy {
    /// The failing function and up to two of its callers.
    pub const DEFAULT: Self = Self {
        skip: 0,
        limit: 3,
        elide_runtime: true,
    };

    /// Every frame, runtime included.
    pub const FULL: Self = Self {
        skip: 0,
        limit: usize::MAX,
        elide_runtime: false,
    };
}

impl Default for StackPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A captured stack trace, innermost frame first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Stacktrace {
    /// The kept frames.
    pub frames: Vec<Frame>,
}

/// One frame of a [`Stacktrace`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Demangled symbol, without the trailing hash.
    pub function: String,
    /// Name of the crate the frame belongs to, when it could be determined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Source path shortened to the crate-relative part for std and registry
    /// crates, the full path otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Full source path as recorded in the debug info.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abs_path: Option<String>,
    /// Line number in `filename`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    /// The frame belongs to application code rather than std or a
    /// dependency.
    pub in_app: bool,
}

impl Stacktrace {
    /// Innermost frame that belongs to application code.
    pub fn culprit(&self) -> Option<&Frame> {
        self.frames.iter().find(|frame| frame.in_app)
    }
}

#[cfg(feature = "backtrace")]
fn is_ident_start(c: char) -> bool {
    unicode_ident::is_xid_start(c)
}

#[cfg(feature = "backtrace")]
fn is_ident_continue(c: char) -> bool {
    unicode_ident::is_xid_continue(c)
}

#[cfg(not(feature = "backtrace"))]
fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

#[cfg(not(feature = "backtrace"))]
fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Crate name from the leading path segment of a demangled symbol, e.g.
/// `faultline` for `<faultline::Recovery<H>>::call`.
fn symbol_crate(function: &str) -> Option<&str> {
    let (head, _) = function.trim_start_matches('<').split_once("::")?;
    let mut chars = head.chars();
    let first = chars.next()?;
    (is_ident_start(first) && chars.all(is_ident_continue)).then_some(head)
}

fn is_elided(crate_name: &str) -> bool {
    ELIDED_CRATES
        .iter()
        .any(|elided| elided.eq_ignore_ascii_case(&crate_name.replace('-', "_")))
}

#[cfg(feature = "backtrace")]
mod capture {
    use std::sync::OnceLock;

    use backtrace::BytesOrWideString;

    use super::{Frame, StackPolicy, Stacktrace, is_elided, symbol_crate};

    /// Source location details derived from a frame's file path.
    struct FramePath {
        raw_path: String,
        crate_name: Option<String>,
        /// Crate-relative part of the path for std and registry crates.
        suffix: Option<String>,
    }

    impl FramePath {
        fn new(path: BytesOrWideString<'_>) -> Self {
            static REGEXES: OnceLock<[regex::Regex; 2]> = OnceLock::new();
            let [std_regex, registry_regex] = REGEXES.get_or_init(|| {
                [
                    // - /lib/rustlib/src/rust/library/{crate}/src/...
                    // - /rustc/{40-char-hash}/library/{crate}/src/...
                    regex::Regex::new(
                        r"(?:/lib/rustlib/src/rust|^/rustc/[0-9a-f]{40})/library/(std|core|alloc|panic_unwind)/src/.*$",
                    )
                    .expect("built-in regex pattern for std library paths should be valid"),
                    // - /.cargo/registry/src/{index}-{16-char-hash}/{crate}-{version}/src/...
                    regex::Regex::new(
                        r"/\.cargo/registry/src/[^/]+-[0-9a-f]{16}/([^./]+)-[0-9]+\.[^/]*/src/.*$",
                    )
                    .expect("built-in regex pattern for cargo registry paths should be valid"),
                ]
            });

            let raw_path = path.to_str_lossy().into_owned();
            let captures = std_regex
                .captures(&raw_path)
                .or_else(|| registry_regex.captures(&raw_path));

            match captures.and_then(|captures| captures.get(1)) {
                Some(crate_capture) => Self {
                    crate_name: Some(crate_capture.as_str().to_owned()),
                    suffix: Some(raw_path[crate_capture.start()..].to_owned()),
                    raw_path,
                },
                None => Self {
                    raw_path,
                    crate_name: None,
                    suffix: None,
                },
            }
        }
    }

    impl Stacktrace {
        /// Captures the current stack according to `policy`.
        ///
        /// Returns `None` when no frame with symbol and file information
        /// survives the policy, e.g. in builds without debug info.
        pub fn capture(policy: &StackPolicy) -> Option<Self> {
            let mut frames: Vec<Frame> = Vec::new();
            let mut to_skip = policy.skip;

            backtrace::trace(|frame| {
                backtrace::resolve_frame(frame, |symbol| {
                    let (Some(sym), Some(filename_raw)) = (symbol.name(), symbol.filename_raw())
                    else {
                        return;
                    };
                    if frames.len() >= policy.limit {
                        return;
                    }

                    let function = format!("{sym:#}");
                    let path = FramePath::new(filename_raw);
                    let from_path = path.crate_name.is_some();
                    let module = path
                        .crate_name
                        .or_else(|| symbol_crate(&function).map(str::to_owned));

                    if policy.elide_runtime && module.as_deref().is_some_and(is_elided) {
                        return;
                    }
                    if to_skip > 0 {
                        to_skip -= 1;
                        return;
                    }

                    frames.push(Frame {
                        function,
                        module,
                        filename: Some(path.suffix.unwrap_or_else(|| path.raw_path.clone())),
                        abs_path: Some(path.raw_path),
                        lineno: symbol.lineno(),
                        in_app: !from_path,
                    });
                });

                frames.len() < policy.limit
            });

            if frames.is_empty() {
                None
            } else {
                Some(Self { frames })
            }
        }
    }
}

#[cfg(not(feature = "backtrace"))]
impl Stacktrace {
    /// Stack capture is disabled without the `backtrace` feature.
    pub fn capture(_policy: &StackPolicy) -> Option<Self> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_crate() {
        assert_eq!(
            symbol_crate("faultline::intercept::Recovery<H>::call"),
            Some("faultline")
        );
        assert_eq!(
            symbol_crate("<alloc::boxed::Box<F,A> as core::ops::function::Fn<Args>>::call"),
            Some("alloc")
        );
        assert_eq!(symbol_crate("rust_begin_unwind"), None);
        assert_eq!(symbol_crate("{{closure}}::x"), None);
    }

    #[test]
    fn test_elided_crates() {
        assert!(is_elided("std"));
        assert!(is_elided("faultline"));
        assert!(is_elided("panic-unwind"));
        assert!(!is_elided("faultline_tracing"));
        assert!(!is_elided("my_app"));
    }

    #[test]
    fn test_culprit_is_first_in_app_frame() {
        let frame = |function: &str, in_app: bool| Frame {
            function: function.to_string(),
            module: None,
            filename: None,
            abs_path: None,
            lineno: None,
            in_app,
        };
        let trace = Stacktrace {
            frames: vec![
                frame("serde_json::de::from_str", false),
                frame("app::load", true),
                frame("app::main", true),
            ],
        };
        assert_eq!(
            trace.culprit().map(|frame| frame.function.as_str()),
            Some("app::load")
        );
    }
}
