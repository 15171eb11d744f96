// Redactor: replaces sensitive substrings of command output before it is persisted.
// Built per job from the union of worker-level and job-level redacted values.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Replacement used when a redacted value maps to an empty replacement.
pub const DEFAULT_REPLACEMENT: &str = "******";

/// A thread-safe set of `secret → replacement` pairs applied to output strings.
///
/// Longer secrets are applied first so a secret that is a substring of another
/// never leaves a partially-masked tail behind. A secret that shares any text
/// with a replacement (contains it, sits inside it, or overlaps one of its
/// ends) is rejected at registration time, so a second pass can never find a
/// secret that the first pass produced. This makes [`Redactor::redact`]
/// idempotent.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    inner: Arc<RwLock<RedactorInner>>,
}

#[derive(Debug, Default)]
struct RedactorInner {
    /// Registered pairs, sorted by secret length descending.
    pairs: Vec<(String, String)>,
    min_secret_length: usize,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a redactor from the union of several value maps. Later maps win
    /// when the same secret appears with different replacements.
    pub fn from_maps<'a>(maps: impl IntoIterator<Item = &'a HashMap<String, String>>) -> Self {
        let redactor = Self::new();
        for map in maps {
            for (secret, replacement) in map {
                redactor.add_value(secret, replacement);
            }
        }
        redactor
    }

    /// Register a value to be replaced by `replacement`.
    /// Empty secrets are ignored.
    pub fn add_value(&self, secret: &str, replacement: &str) {
        if secret.is_empty() {
            return;
        }
        let replacement = if replacement.is_empty() {
            DEFAULT_REPLACEMENT
        } else {
            replacement
        };

        let mut inner = self.inner.write();
        inner.pairs.retain(|(s, _)| s != secret);
        inner.pairs.push((secret.to_string(), replacement.to_string()));

        // Repeat until stable: dropping a pair also drops its replacement.
        loop {
            let replacements: Vec<String> = inner.pairs.iter().map(|(_, r)| r.clone()).collect();
            let before = inner.pairs.len();
            inner.pairs.retain(|(s, _)| {
                let collides = replacements.iter().any(|r| overlaps(s, r));
                if collides {
                    tracing::warn!("ignoring redacted value that overlaps a replacement");
                }
                !collides
            });
            if inner.pairs.len() == before {
                break;
            }
        }

        inner.pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        inner.min_secret_length = inner.pairs.iter().map(|(s, _)| s.len()).min().unwrap_or(0);
    }

    /// Replace every registered secret in `input`.
    pub fn redact(&self, input: &str) -> String {
        let inner = self.inner.read();

        if inner.pairs.is_empty() || input.len() < inner.min_secret_length {
            return input.to_string();
        }

        let mut result = input.to_string();
        for (secret, replacement) in &inner.pairs {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), replacement);
            }
        }
        result
    }

    /// Number of registered secrets.
    pub fn len(&self) -> usize {
        self.inner.read().pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether `secret` could match text that includes part of `replacement`.
fn overlaps(secret: &str, replacement: &str) -> bool {
    if secret.contains(replacement) || replacement.contains(secret) {
        return true;
    }
    let max = secret.len().min(replacement.len());
    (1..max).any(|k| {
        let head = replacement.is_char_boundary(k) && secret.ends_with(&replacement[..k]);
        let tail_at = replacement.len() - k;
        let tail =
            replacement.is_char_boundary(tail_at) && secret.starts_with(&replacement[tail_at..]);
        head || tail
    })
}
