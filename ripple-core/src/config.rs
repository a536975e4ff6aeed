//! Configuration for resources and operations.
//!
//! Lifetimes are plain data and can be read from JSON alongside the rest of
//! an application's settings:
//!
//! ```rust
//! use ripple_core::config::CacheLifetime;
//! use std::time::Duration;
//!
//! let lifetime: CacheLifetime = serde_json::from_str(r#"{"after_ms": 250}"#).unwrap();
//! assert_eq!(lifetime, CacheLifetime::After(Duration::from_millis(250)));
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::debug::DebugSink;
use crate::error::QueryError;

/// How long an unreferenced cache entry is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLifetime {
    /// Evict as soon as the last reference is released.
    Immediate,
    /// Never evict on reference count.
    Forever,
    /// Evict once no reference was taken for this long.
    #[serde(rename = "after_ms")]
    After(#[serde(with = "millis")] Duration),
}

impl CacheLifetime {
    /// `0` means [`Immediate`](CacheLifetime::Immediate).
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::Immediate
        } else {
            Self::After(Duration::from_millis(ms))
        }
    }

    /// `false` means [`Forever`](CacheLifetime::Forever), `true` means
    /// [`Immediate`](CacheLifetime::Immediate).
    pub fn from_flag(evict: bool) -> Self {
        if evict {
            Self::Immediate
        } else {
            Self::Forever
        }
    }
}

impl Default for CacheLifetime {
    fn default() -> Self {
        Self::After(Duration::from_secs(60))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Settings for a [`Resource`](crate::query::Resource).
#[derive(Clone)]
pub struct ResourceConfig {
    pub name: String,
    pub cache_lifetime: CacheLifetime,
    pub debug_sink: Option<Arc<dyn DebugSink>>,
}

impl ResourceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn cache_lifetime(mut self, lifetime: CacheLifetime) -> Self {
        self.cache_lifetime = lifetime;
        self
    }

    pub fn debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = Some(sink);
        self
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            name: "resource".into(),
            cache_lifetime: CacheLifetime::default(),
            debug_sink: None,
        }
    }
}

impl fmt::Debug for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("name", &self.name)
            .field("cache_lifetime", &self.cache_lifetime)
            .field("debug_sink", &self.debug_sink.is_some())
            .finish()
    }
}

/// Settings for an [`Operation`](crate::query::Operation).
///
/// Operation attempts are never shared, so their entries always use
/// [`CacheLifetime::Immediate`].
#[derive(Clone)]
pub struct OperationConfig {
    pub name: String,
    pub debug_sink: Option<Arc<dyn DebugSink>>,
}

impl OperationConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    pub fn cache_lifetime(&self) -> CacheLifetime {
        CacheLifetime::Immediate
    }
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            name: "operation".into(),
            debug_sink: None,
        }
    }
}

impl fmt::Debug for OperationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationConfig")
            .field("name", &self.name)
            .field("debug_sink", &self.debug_sink.is_some())
            .finish()
    }
}

/// Receives every query error once, when it is stored.
pub trait ErrorSink: Send + Sync {
    fn report(&self, source: &str, error: &QueryError);
}

impl<F> ErrorSink for F
where
    F: Fn(&str, &QueryError) + Send + Sync,
{
    fn report(&self, source: &str, error: &QueryError) {
        self(source, error)
    }
}

fn error_sink() -> &'static RwLock<Option<Arc<dyn ErrorSink>>> {
    static SINK: OnceLock<RwLock<Option<Arc<dyn ErrorSink>>>> = OnceLock::new();
    SINK.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide error sink, replacing any previous one.
pub fn set_error_sink(sink: Arc<dyn ErrorSink>) {
    *error_sink().write() = Some(sink);
}

pub fn clear_error_sink() {
    *error_sink().write() = None;
}

/// Log `error` and hand it to the installed sink, if any.
pub(crate) fn report_error(source: &str, error: &QueryError) {
    tracing::warn!(%source, %error, "query failed");
    let sink = error_sink().read().clone();
    if let Some(sink) = sink {
        sink.report(source, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn lifetime_serde_forms() {
        assert_eq!(serde_json::to_string(&CacheLifetime::Immediate).unwrap(), r#""immediate""#);
        assert_eq!(serde_json::to_string(&CacheLifetime::Forever).unwrap(), r#""forever""#);
        assert_eq!(
            serde_json::to_string(&CacheLifetime::After(Duration::from_millis(1500))).unwrap(),
            r#"{"after_ms":1500}"#
        );

        let parsed: CacheLifetime = serde_json::from_str(r#""forever""#).unwrap();
        assert_eq!(parsed, CacheLifetime::Forever);
    }

    #[test]
    fn lifetime_shorthands() {
        assert_eq!(CacheLifetime::from_millis(0), CacheLifetime::Immediate);
        assert_eq!(
            CacheLifetime::from_millis(100),
            CacheLifetime::After(Duration::from_millis(100))
        );
        assert_eq!(CacheLifetime::from_flag(false), CacheLifetime::Forever);
        assert_eq!(CacheLifetime::default(), CacheLifetime::After(Duration::from_secs(60)));
    }

    #[test]
    fn builders() {
        let config = ResourceConfig::new("users").cache_lifetime(CacheLifetime::Forever);
        assert_eq!(config.name, "users");
        assert_eq!(config.cache_lifetime, CacheLifetime::Forever);
        assert!(config.debug_sink.is_none());

        let operation = OperationConfig::new("save");
        assert_eq!(operation.cache_lifetime(), CacheLifetime::Immediate);
    }

    #[test]
    fn error_sink_receives_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        set_error_sink(Arc::new(move |source: &str, error: &QueryError| {
            seen_clone.lock().push(format!("{source}: {error}"));
        }));

        report_error("config-test", &QueryError::msg("nope"));
        clear_error_sink();
        report_error("config-test", &QueryError::msg("unseen"));

        let seen = seen.lock();
        let ours: Vec<_> = seen.iter().filter(|s| s.starts_with("config-test")).collect();
        assert_eq!(ours, vec!["config-test: nope"]);
    }
}
