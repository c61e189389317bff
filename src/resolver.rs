//! Query resolution.
//!
//! A resolver maps one request text to exactly one response text. The
//! server shares a single resolver across all connections, so
//! implementations must be `Send + Sync` and must not block.

use indexmap::IndexMap;

/// Response returned when no table entry matches.
pub const DEFAULT_RESPONSE: &str = "Error: Unknown SQL command";

/// Maps a request to its response. Total: every input yields a response.
pub trait Resolver: Send + Sync {
    fn resolve(&self, request: &str) -> String;
}

/// Exact-match lookup table with a fallback response.
///
/// Entries keep their insertion order. The table is read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverTable {
    entries: IndexMap<String, String>,
    default: String,
}

impl ResolverTable {
    /// Build a table from ordered `(request, response)` pairs.
    ///
    /// A later duplicate request replaces the earlier response but keeps its
    /// position.
    pub fn new<I, K, V>(entries: I, default: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            default: default.into(),
        }
    }

    /// The sample table served out of the box.
    pub fn builtin() -> Self {
        Self::new(builtin_entries(), DEFAULT_RESPONSE)
    }

    /// Case-sensitive exact lookup, falling back to the default response.
    pub fn lookup(&self, request: &str) -> &str {
        self.entries
            .get(request)
            .map(String::as_str)
            .unwrap_or(&self.default)
    }

    pub fn default_response(&self) -> &str {
        &self.default
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Default for ResolverTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Resolver for ResolverTable {
    fn resolve(&self, request: &str) -> String {
        self.lookup(request).to_string()
    }
}

/// Entries of the built-in sample table.
pub fn builtin_entries() -> IndexMap<String, String> {
    IndexMap::from([
        (
            "SELECT name FROM users WHERE id = 1;".to_string(),
            "John Doe".to_string(),
        ),
        ("SELECT version();".to_string(), "SimpleDB 1.0".to_string()),
    ])
}
