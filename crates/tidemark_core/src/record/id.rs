//! The interned record identifier type and canonical-form parsing.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug)]
struct RecordIdInner {
    table: String,
    key: String,
    canonical: String,
}

/// An interned `(table, key)` record identifier.
///
/// Two `RecordId`s compare equal iff their canonical strings are equal.
/// Identifiers obtained from the same [`IdentityCache`](super::IdentityCache)
/// are additionally pointer-identical, which [`RecordId::same_ref`] observes.
#[derive(Clone)]
pub struct RecordId(Arc<RecordIdInner>);

impl RecordId {
    /// Builds an identifier from already-validated parts.
    ///
    /// Returns `None` when `table` does not have the required shape
    /// (`[A-Za-z_][A-Za-z0-9_-]*`) or `key` is empty.
    pub fn from_parts(table: &str, key: &str) -> Option<Self> {
        if !is_table_name(table) || key.is_empty() {
            return None;
        }
        let canonical = format!("{table}:{key}");
        Some(Self(Arc::new(RecordIdInner {
            table: table.to_owned(),
            key: key.to_owned(),
            canonical,
        })))
    }

    /// Parses any textual variant of a record identifier.
    ///
    /// Accepts the canonical form, the canonical form wrapped in one layer
    /// of matching single, double, or backtick quotes, and keys wrapped in
    /// one layer of ASCII `<>` or Unicode `⟨⟩` angle brackets plus one layer
    /// of matching outer quotes. Returns `None` for anything else.
    pub fn parse(input: &str) -> Option<Self> {
        let (table, key) = parse_canonical(input)?;
        Self::from_parts(table, &key)
    }

    /// The table portion.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.0.table
    }

    /// The key portion (everything after the first `:`, unwrapped).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.0.key
    }

    /// The canonical `"<table>:<key>"` form.
    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.0.canonical
    }

    /// Returns true if both handles point at the same interned allocation.
    #[must_use]
    pub fn same_ref(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl PartialEq for RecordId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.canonical == other.0.canonical
    }
}

impl Eq for RecordId {}

impl Hash for RecordId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.canonical.hash(state);
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.canonical.cmp(&other.0.canonical)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.canonical)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0.canonical)
    }
}

/// Checks the table-name shape `[A-Za-z_][A-Za-z0-9_-]*`.
pub(crate) fn is_table_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Splits an accepted textual variant into `(table, key)`.
///
/// Only the first `:` separates table from key; the key may itself contain
/// colons, brackets, or quotes. The key is unwrapped of one layer of angle
/// brackets and one layer of matching outer quotes.
pub(crate) fn parse_canonical(input: &str) -> Option<(&str, String)> {
    let whole = strip_outer_quotes(input);
    let (table, raw_key) = whole.split_once(':')?;
    if !is_table_name(table) {
        return None;
    }
    let key = strip_outer_quotes(strip_angle_brackets(raw_key));
    if key.is_empty() {
        return None;
    }
    Some((table, key.to_owned()))
}

fn strip_angle_brackets(s: &str) -> &str {
    if let Some(inner) = s.strip_prefix('<').and_then(|r| r.strip_suffix('>')) {
        return inner;
    }
    if let Some(inner) = s.strip_prefix('⟨').and_then(|r| r.strip_suffix('⟩')) {
        return inner;
    }
    s
}

fn strip_outer_quotes(s: &str) -> &str {
    for quote in ['\'', '"', '`'] {
        if s.len() >= 2 {
            if let Some(inner) = s
                .strip_prefix(quote)
                .and_then(|r| r.strip_suffix(quote))
            {
                return inner;
            }
        }
    }
    s
}
