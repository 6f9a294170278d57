//! Handles: stable, environment-independent slugs.
//!
//! A handle is the external half of the two-layer key. It is normalised
//! (trimmed, lowercased) on parse so lookups are case-insensitive, and its
//! alphabet is restricted to `[a-z0-9_-]` so generated slugs and
//! hand-assigned handles share one namespace.

use std::collections::HashSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::models::SurrogateKey;

/// Longest accepted handle.
pub const MAX_HANDLE_LEN: usize = 100;

static NON_SLUG_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));
static HANDLE_ALPHABET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("valid regex"));

/// A validated, normalised handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    /// Normalise and validate a raw handle.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(Error::InvalidInput("handle cannot be empty".to_string()));
        }
        if normalized.len() > MAX_HANDLE_LEN {
            return Err(Error::InvalidInput(format!(
                "handle '{}' exceeds {} characters",
                normalized, MAX_HANDLE_LEN
            )));
        }
        if !HANDLE_ALPHABET.is_match(&normalized) {
            return Err(Error::InvalidInput(format!(
                "handle '{}' may only contain a-z, 0-9, '_' and '-'",
                normalized
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Handle {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Handle::parse(&value)
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Convert free text to a slug: lowercase, runs of non-alphanumerics become
/// `_`, leading/trailing underscores stripped, truncated to `max_len`.
pub fn slugify(text: &str, max_len: usize) -> String {
    let lowered = text.trim().to_lowercase();
    let replaced = NON_SLUG_RUN.replace_all(&lowered, "_");
    let trimmed = replaced.trim_matches('_');
    let mut slug: String = trimmed.chars().take(max_len).collect();
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

/// Base handle for a row: the slug of its seed text, or `<kind>_<key>` when
/// the seed slugs to nothing.
pub fn base_handle(kind: EntityKind, key: SurrogateKey, seed: &str) -> String {
    let slug = slugify(seed, kind.slug_max_len().min(MAX_HANDLE_LEN));
    if slug.is_empty() {
        format!("{}_{}", kind.as_str(), key)
    } else {
        slug
    }
}

/// Hands out collision-free handles from base slugs by appending `_2`, `_3`, ...
#[derive(Debug, Default, Clone)]
pub struct HandleAllocator {
    used: HashSet<String>,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the allocator with handles already taken.
    pub fn with_used<I, S>(used: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            used: used.into_iter().map(Into::into).collect(),
        }
    }

    /// Mark a handle as taken (e.g. one lost to a concurrent writer).
    pub fn reserve(&mut self, handle: &str) {
        self.used.insert(handle.to_string());
    }

    pub fn is_used(&self, handle: &str) -> bool {
        self.used.contains(handle)
    }

    /// Allocate the first free handle derived from `base` and reserve it.
    pub fn allocate(&mut self, base: &str) -> Result<Handle> {
        let mut candidate = base.to_string();
        let mut n = 2u32;
        while self.used.contains(&candidate) {
            let suffix = format!("_{}", n);
            let room = MAX_HANDLE_LEN.saturating_sub(suffix.len());
            let stem: String = base.chars().take(room).collect();
            candidate = format!("{}{}", stem.trim_end_matches('_'), suffix);
            n += 1;
        }
        let handle = Handle::parse(&candidate)?;
        self.used.insert(handle.as_str().to_string());
        Ok(handle)
    }
}
