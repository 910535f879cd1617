//! Request fingerprints and the per-request option bag.
//!
//! A [`RequestFingerprint`] is the cache key used to dedup upstream
//! subscriptions: two requests are equivalent iff their fingerprints are
//! byte-equal. It carries no semantic interpretation beyond that.

use std::fmt;

use serde_json::Value;

use crate::error::{Error, Result};

/// Canonical byte sequence derived from a structured request descriptor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestFingerprint(Vec<u8>);

impl RequestFingerprint {
    /// Build a fingerprint from raw canonical bytes (already-serialized request).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Build a fingerprint from a parsed request descriptor by canonicalizing it.
    ///
    /// Canonicalization re-serializes through [`serde_json::to_vec`] after
    /// sorting object keys, so that two descriptors differing only in key
    /// order produce the same fingerprint.
    pub fn from_request(request: &Value) -> Self {
        let canonical = canonicalize(request);
        Self(serde_json::to_vec(&canonical).unwrap_or_default())
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// `record._options.process` — advisory, see the open question in §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOption {
    /// Always process
    True,
    /// Never process
    False,
    /// Process only if the record is passive
    Passive,
}

/// Parsed, validated `record._options` sub-tree of a request descriptor.
///
/// Unknown options produce a warning (pushed to `warnings`) and are ignored,
/// per §6.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// `record._options.queueSize`, default 2
    pub queue_size: usize,
    /// `record._options.atomic`
    pub atomic: Option<bool>,
    /// `record._options.process`
    pub process: Option<ProcessOption>,
    /// `record._options.block` — advisory; a conflict with `process` is
    /// resolved in favor of not blocking (§9 open question).
    pub block: bool,
    /// Unknown-option warnings collected while parsing
    pub warnings: Vec<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            queue_size: 2,
            atomic: None,
            process: None,
            block: false,
            warnings: Vec::new(),
        }
    }
}

impl RequestOptions {
    /// Parse `record._options` out of a request descriptor.
    ///
    /// `request` is the full descriptor; only the `record._options` object,
    /// if present, is consulted.
    pub fn parse(request: &Value) -> Result<Self> {
        let mut opts = Self::default();

        let Some(options) = request
            .get("record")
            .and_then(|r| r.get("_options"))
            .and_then(|o| o.as_object())
        else {
            return Ok(opts);
        };

        for (key, value) in options {
            match key.as_str() {
                "queueSize" => {
                    opts.queue_size = value.as_u64().ok_or_else(|| {
                        Error::TypeMismatch("record._options.queueSize must be an unsigned integer".into())
                    })? as usize;
                }
                "atomic" => {
                    opts.atomic = Some(value.as_bool().ok_or_else(|| {
                        Error::TypeMismatch("record._options.atomic must be a boolean".into())
                    })?);
                }
                "process" => {
                    let s = value.as_str().ok_or_else(|| {
                        Error::TypeMismatch("record._options.process must be a string".into())
                    })?;
                    opts.process = Some(match s {
                        "true" => ProcessOption::True,
                        "false" => ProcessOption::False,
                        "passive" => ProcessOption::Passive,
                        other => {
                            opts.warnings
                                .push(format!("unknown record._options.process value '{other}'"));
                            continue;
                        }
                    });
                }
                "block" => {
                    opts.block = value.as_bool().ok_or_else(|| {
                        Error::TypeMismatch("record._options.block must be a boolean".into())
                    })?;
                }
                other => {
                    opts.warnings
                        .push(format!("unknown record._options key '{other}'"));
                }
            }
        }

        // Advisory conflict resolution: "block" and non-default "process" can't both hold;
        // prefer the safer non-blocking behavior.
        if opts.block && !matches!(opts.process, None | Some(ProcessOption::Passive)) {
            opts.warnings
                .push("record._options.block conflicts with process; ignoring block".into());
            opts.block = false;
        }

        Ok(opts)
    }
}
