//! Wrapper Options
//!
//! Configuration resolved once per wrapped server. Caller-supplied values
//! are merged over the documented defaults field by field; nested
//! transport options are shared by reference, never deep-copied.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

/// Resolved configuration, shared read-only by every connection of one
/// wrapped server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Reject connections that do not begin with a PROXY header.
    pub strict: bool,

    /// Close strict-mode rejections silently instead of delivering the
    /// error to the connection's error channel.
    pub ignore_strict_exceptions: bool,

    /// Overwrite the generic remote address/port accessors with the
    /// decoded client identity.
    pub override_remote: bool,

    /// Opaque transport configuration passed through verbatim to the
    /// wrapped server. Shared by `Arc` reference across resolutions.
    #[serde(skip)]
    pub transport: Option<Arc<TransportOptions>>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            strict: true,
            ignore_strict_exceptions: false,
            override_remote: true,
            transport: None,
        }
    }
}

impl ProxyOptions {
    /// Merge a caller-supplied patch over the defaults, field by field.
    ///
    /// `None` (no options at all) and an empty patch both resolve to the
    /// defaults. The nested `transport` value is moved in as the same
    /// shared reference the caller holds; it is never cloned deeply.
    pub fn resolve(patch: Option<OptionsPatch>) -> Self {
        let defaults = Self::default();
        let Some(patch) = patch else {
            return defaults;
        };
        Self {
            strict: patch.strict.unwrap_or(defaults.strict),
            ignore_strict_exceptions: patch
                .ignore_strict_exceptions
                .unwrap_or(defaults.ignore_strict_exceptions),
            override_remote: patch.override_remote.unwrap_or(defaults.override_remote),
            transport: patch.transport,
        }
    }
}

/// Partial options as supplied by the caller; unset fields fall back to
/// the defaults during resolution.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OptionsPatch {
    pub strict: Option<bool>,
    pub ignore_strict_exceptions: Option<bool>,
    pub override_remote: Option<bool>,
    #[serde(skip)]
    pub transport: Option<Arc<TransportOptions>>,
}

/// Transport-level settings the wrapper forwards to the server it wraps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Connection inactivity timeout in seconds, applied when no explicit
    /// per-server timeout has been set.
    pub idle_timeout_secs: Option<u64>,

    /// TCP_NODELAY on accepted sockets.
    pub nodelay: Option<bool>,
}

impl TransportOptions {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
