//! # Extraction and Measurement Collaborators
//!
//! The tracing core knows nothing about any vendor's request or response
//! shapes. Everything vendor-specific (which field holds the model name,
//! where token counts live, what the prompt payload looks like) sits behind
//! the [`Extraction`] trait, implemented per provider by the host.
//!
//! Every method on these traits is total: implementations degrade to a
//! default rather than fail, so a malformed response can never break the
//! traced call. [`NoExtraction`] is the everything-defaults implementation.
//!
//! This module also holds the two small measurement seams the adapter needs:
//! [`CallIdentity`] with its deterministic [`stable_hash`](CallIdentity::stable_hash)
//! (the cross-call correlation id), and [`MemoryProbe`] for resident-memory
//! sampling.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::component::TokenUsage;

/// The addressed identity of an instrumented method: which client object and
/// which method on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallIdentity {
    pub target: String,
    pub method: String,
}

impl CallIdentity {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
        }
    }

    /// Deterministic hash of the callable identity. A pure function of
    /// (target, method): repeated invocations of the same instrumented
    /// method always share one hash. Correlation only, not security.
    pub fn stable_hash(&self) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.target.hash(&mut hasher);
        self.method.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

impl std::fmt::Display for CallIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.target, self.method)
    }
}

/// Vendor-specific extraction of trace fields from raw calls.
///
/// `res` is `None` on the failure path, where only request-derived fields
/// are available.
pub trait Extraction<Req, Res>: Send + Sync {
    /// The model the call addressed, when recognizable.
    fn model_name(&self, _req: &Req, _res: Option<&Res>) -> Option<String> {
        None
    }

    /// Token usage reported by the response.
    fn token_usage(&self, _res: &Res) -> TokenUsage {
        TokenUsage::default()
    }

    /// Call parameters as loose key/value pairs, structured values included.
    fn parameters(&self, _req: &Req) -> Map<String, Value> {
        Map::new()
    }

    /// The input payload worth keeping on the trace record.
    fn input_data(&self, _req: &Req, _res: Option<&Res>) -> Value {
        Value::Null
    }

    /// The output payload worth keeping on the trace record.
    fn output(&self, _res: &Res) -> Option<Value> {
        None
    }

    /// Scrubs secrets from a payload before it lands on the record.
    fn redact(&self, value: Value) -> Value {
        value
    }
}

/// Extraction that yields defaults for every field.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtraction;

impl<Req, Res> Extraction<Req, Res> for NoExtraction {}

/// Samples the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Current resident set size in bytes; 0 when unavailable.
    fn resident_bytes(&self) -> u64;
}

/// Probe that always reports zero. Useful in tests and on platforms where
/// resident memory is not exposed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl MemoryProbe for NoProbe {
    fn resident_bytes(&self) -> u64 {
        0
    }
}

/// Default probe: reads `VmRSS` from `/proc/self/status` on Linux and
/// degrades to 0 everywhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct RssProbe;

impl MemoryProbe for RssProbe {
    #[cfg(target_os = "linux")]
    fn resident_bytes(&self) -> u64 {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return 0;
        };
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                return kb * 1024;
            }
        }
        0
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_is_pure() {
        let a = CallIdentity::new("openai.chat.completions", "create");
        let b = CallIdentity::new("openai.chat.completions", "create");
        assert_eq!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn test_stable_hash_distinguishes_methods() {
        let create = CallIdentity::new("anthropic.messages", "create");
        let stream = CallIdentity::new("anthropic.messages", "stream");
        assert_ne!(create.stable_hash(), stream.stable_hash());
    }

    #[test]
    fn test_identity_display() {
        let identity = CallIdentity::new("litellm", "completion");
        assert_eq!(identity.to_string(), "litellm.completion");
    }

    #[test]
    fn test_no_extraction_defaults() {
        let extraction = NoExtraction;
        let req = serde_json::json!({"model": "gpt-4o"});
        let res = serde_json::json!({"usage": {"prompt_tokens": 7}});

        assert_eq!(
            Extraction::<Value, Value>::model_name(&extraction, &req, Some(&res)),
            None
        );
        assert_eq!(
            Extraction::<Value, Value>::token_usage(&extraction, &res),
            TokenUsage::default()
        );
        assert_eq!(
            Extraction::<Value, Value>::input_data(&extraction, &req, None),
            Value::Null
        );
        let payload = serde_json::json!({"api_key": "sk-123"});
        assert_eq!(
            Extraction::<Value, Value>::redact(&extraction, payload.clone()),
            payload
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_probe_reports_resident_memory() {
        assert!(RssProbe.resident_bytes() > 0);
    }

    #[test]
    fn test_no_probe_is_zero() {
        assert_eq!(NoProbe.resident_bytes(), 0);
    }
}
