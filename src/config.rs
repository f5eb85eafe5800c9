//! Settings read from the environment.
//!
//! - `FAULTLINE_TRUST_FORWARDED_PROTO` - `0`, `false`, `no` or `off` stop
//!   `X-Forwarded-Proto` from deciding the recorded scheme.
//! - `FAULTLINE_STACK` - comma-separated `skip=N`, `limit=N` and `full`.
//!   `full` keeps every frame, runtime included.
//! - `FAULTLINE_REDACT` - comma-separated extra redaction fragments.
//!
//! `RUST_BACKTRACE=full` implies `FAULTLINE_STACK=full` unless
//! `FAULTLINE_STACK` is set.

use std::{ffi::OsString, sync::OnceLock};

use crate::stacktrace::StackPolicy;

/// Options parsed from the environment, read once per process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvOptions {
    /// Override for [`SnapshotOptions::trust_forwarded_proto`](crate::SnapshotOptions::trust_forwarded_proto).
    pub trust_forwarded_proto: Option<bool>,
    /// Override for the stack capture policy.
    pub stack: Option<StackPolicy>,
    /// Extra redaction fragments.
    pub redact: Vec<String>,
}

impl EnvOptions {
    /// The options of the current process.
    pub fn get() -> &'static Self {
        static OPTIONS: OnceLock<EnvOptions> = OnceLock::new();
        OPTIONS.get_or_init(|| Self::from_vars(|name| std::env::var_os(name)))
    }

    /// Parses options from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<OsString>) -> Self {
        let lossy = |name: &str| var(name).map(|v| v.to_string_lossy().into_owned());

        let trust_forwarded_proto = lossy("FAULTLINE_TRUST_FORWARDED_PROTO").map(|v| {
            !["0", "false", "no", "off"]
                .iter()
                .any(|off| v.trim().eq_ignore_ascii_case(off))
        });

        let stack = match lossy("FAULTLINE_STACK") {
            Some(spec) => Some(parse_stack(&spec)),
            None if lossy("RUST_BACKTRACE").is_some_and(|v| v == "full") => {
                Some(StackPolicy::FULL)
            }
            None => None,
        };

        let redact = lossy("FAULTLINE_REDACT")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            trust_forwarded_proto,
            stack,
            redact,
        }
    }
}

/// Unknown or malformed entries are ignored.
fn parse_stack(spec: &str) -> StackPolicy {
    let mut policy = StackPolicy::DEFAULT;
    for entry in spec.split(',').map(str::trim) {
        if entry.eq_ignore_ascii_case("full") {
            policy = StackPolicy::FULL;
        } else if let Some((key, value)) = entry.split_once('=') {
            let Ok(value) = value.trim().parse::<usize>() else {
                continue;
            };
            match key.trim() {
                "skip" => policy.skip = value,
                "limit" => policy.limit = value,
                _ => {}
            }
        }
    }
    policy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(vars: &[(&str, &str)]) -> EnvOptions {
        EnvOptions::from_vars(|name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| OsString::from(v))
        })
    }

    #[test]
    fn test_empty_environment() {
        assert_eq!(parse(&[]), EnvOptions::default());
    }

    #[test]
    fn test_trust_forwarded_proto() {
        let off = parse(&[("FAULTLINE_TRUST_FORWARDED_PROTO", "Off")]);
        assert_eq!(off.trust_forwarded_proto, Some(false));
        let on = parse(&[("FAULTLINE_TRUST_FORWARDED_PROTO", "1")]);
        assert_eq!(on.trust_forwarded_proto, Some(true));
    }

    #[test]
    fn test_stack_policy() {
        let custom = parse(&[("FAULTLINE_STACK", "skip=1, limit=8,bogus,limit=x")]);
        assert_eq!(
            custom.stack,
            Some(StackPolicy {
                skip: 1,
                limit: 8,
                ..StackPolicy::DEFAULT
            })
        );

        let full = parse(&[("RUST_BACKTRACE", "full")]);
        assert_eq!(full.stack, Some(StackPolicy::FULL));

        let explicit = parse(&[("RUST_BACKTRACE", "full"), ("FAULTLINE_STACK", "limit=5")]);
        assert_eq!(explicit.stack.map(|p| p.limit), Some(5));

        assert_eq!(parse(&[("RUST_BACKTRACE", "1")]).stack, None);
    }

    #[test]
    fn test_redact_fields() {
        let options = parse(&[("FAULTLINE_REDACT", "token, api_key,,")]);
        assert_eq!(options.redact, ["token", "api_key"]);
    }
}
