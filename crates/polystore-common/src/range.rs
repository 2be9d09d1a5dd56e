//! The two axes of the fragment space
//!
//! A fragment is the product of a [`ColumnsRange`] over column paths and a
//! [`KeyInterval`] over the time/sequence key axis. Both are half-open.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Open upper bound of the key axis
pub const KEY_MAX: i64 = i64::MAX;

/// Character appended to a prefix to obtain the smallest string above every
/// path under that prefix
pub const MAX_CHAR: char = '~';

/// Half-open key interval `[start, end)`; `end == KEY_MAX` is open-ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyInterval {
    start: i64,
    end: i64,
}

impl KeyInterval {
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// `[start, KEY_MAX)`
    #[must_use]
    pub const fn from_start(start: i64) -> Self {
        Self::new(start, KEY_MAX)
    }

    /// `[0, KEY_MAX)`
    #[must_use]
    pub const fn full() -> Self {
        Self::new(0, KEY_MAX)
    }

    #[must_use]
    pub const fn start(&self) -> i64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> i64 {
        self.end
    }

    /// Whether the interval is still open-ended
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.end == KEY_MAX
    }

    #[must_use]
    pub const fn contains(&self, key: i64) -> bool {
        self.start <= key && key < self.end
    }

    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether this interval lies entirely at or after the end of `other`
    #[must_use]
    pub const fn is_after(&self, other: &Self) -> bool {
        self.start >= other.end
    }

    /// Same start, closed at `end`
    #[must_use]
    pub const fn closed_at(&self, end: i64) -> Self {
        Self::new(self.start, end)
    }
}

impl fmt::Display for KeyInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "[{}, MAX)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

/// Compare a column path against a range border
///
/// `None` borders are unbounded. A path containing `*` is compared by the
/// prefix before the wildcard and is considered to reach into every border
/// that extends that prefix.
#[must_use]
pub fn compare_column(column: &str, border: Option<&str>, is_start: bool) -> Ordering {
    let edge = if is_start {
        Ordering::Greater
    } else {
        Ordering::Less
    };
    let Some(border) = border else {
        return edge;
    };
    if column == "*" {
        return edge;
    }
    match column.find('*') {
        Some(idx) => {
            let prefix = &column[..idx];
            if border == prefix {
                Ordering::Greater
            } else if border.starts_with(prefix) {
                edge
            } else {
                prefix.cmp(border)
            }
        }
        None => column.cmp(border),
    }
}

/// Half-open columns range `[start, end)` over column paths
///
/// `None` on either side is unbounded. Dummy fragments carry a schema prefix
/// that is prepended to both borders when matching column paths. Equality,
/// hashing and ordering only consider the two borders.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ColumnsRange {
    start: Option<String>,
    end: Option<String>,
    #[serde(default)]
    schema_prefix: Option<String>,
}

impl ColumnsRange {
    pub fn new(start: Option<impl Into<String>>, end: Option<impl Into<String>>) -> Self {
        Self {
            start: start.map(Into::into),
            end: end.map(Into::into),
            schema_prefix: None,
        }
    }

    /// `[start, end)` with both borders set
    pub fn bounded(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self::new(Some(start), Some(end))
    }

    /// `(-inf, +inf)`
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            start: None,
            end: None,
            schema_prefix: None,
        }
    }

    /// Every column path under `prefix`: `[prefix, prefix~)`
    pub fn prefix(prefix: &str) -> Result<Self> {
        if prefix.contains('*') || prefix.contains("..") || prefix.starts_with('.') {
            return Err(Error::invalid_argument(format!(
                "not a valid column prefix: {prefix}"
            )));
        }
        Ok(Self::bounded(prefix, format!("{prefix}{MAX_CHAR}")))
    }

    #[must_use]
    pub fn with_schema_prefix(mut self, schema_prefix: Option<String>) -> Self {
        self.schema_prefix = schema_prefix;
        self
    }

    #[must_use]
    pub fn start(&self) -> Option<&str> {
        self.start.as_deref()
    }

    #[must_use]
    pub fn end(&self) -> Option<&str> {
        self.end.as_deref()
    }

    #[must_use]
    pub fn schema_prefix(&self) -> Option<&str> {
        self.schema_prefix.as_deref()
    }

    fn real(&self, border: Option<&str>) -> Option<String> {
        match (border, self.schema_prefix.as_deref()) {
            (Some(b), Some(p)) => Some(format!("{p}.{b}")),
            (b, _) => b.map(str::to_string),
        }
    }

    /// Whether `column` falls inside the range (schema prefix applied)
    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        let start = self.real(self.start());
        let end = self.real(self.end());
        Self::contains_between(column, start.as_deref(), end.as_deref())
    }

    /// Whether `column` falls inside the raw borders
    #[must_use]
    pub fn contains_without_prefix(&self, column: &str) -> bool {
        Self::contains_between(column, self.start(), self.end())
    }

    fn contains_between(column: &str, start: Option<&str>, end: Option<&str>) -> bool {
        (start.is_none() || compare_column(column, start, true) != Ordering::Less)
            && (end.is_none() || compare_column(column, end, false) == Ordering::Less)
    }

    /// Whether the whole range sorts at or before `column`
    #[must_use]
    pub fn is_completely_before(&self, column: &str) -> bool {
        self.real(self.end())
            .is_some_and(|end| end.as_str() <= column)
    }

    /// Whether the whole range sorts after `column`
    #[must_use]
    pub fn is_after(&self, column: &str) -> bool {
        let start = self.real(self.start());
        start.is_some() && compare_column(column, start.as_deref(), true) == Ordering::Less
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        let start = self.real(self.start());
        let end = self.real(self.end());
        let lower_ok = match (other.start(), end.as_deref()) {
            (Some(o), Some(_)) => compare_column(o, end.as_deref(), false) == Ordering::Less,
            _ => true,
        };
        let upper_ok = match (other.end(), start.as_deref()) {
            (Some(o), Some(_)) => compare_column(o, start.as_deref(), true) != Ordering::Less,
            _ => true,
        };
        lower_ok && upper_ok
    }

    /// The overlap of two ranges, if any
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.intersects(other) {
            return None;
        }
        let start = self.real(self.start());
        let end = self.real(self.end());
        let new_start = match (start, other.start()) {
            (None, o) => o.map(str::to_string),
            (Some(s), None) => Some(s),
            (Some(s), Some(o)) => {
                if compare_column(o, Some(&s), true) == Ordering::Less {
                    Some(s)
                } else {
                    Some(o.to_string())
                }
            }
        };
        let new_end = match (end, other.end()) {
            (None, o) => o.map(str::to_string),
            (Some(e), None) => Some(e),
            (Some(e), Some(o)) => {
                if compare_column(o, Some(&e), false) == Ordering::Less {
                    Some(o.to_string())
                } else {
                    Some(e)
                }
            }
        };
        Some(Self::new(new_start, new_end))
    }

    /// Whether this range starts after `other` ends
    #[must_use]
    pub fn is_completely_after(&self, other: &Self) -> bool {
        let start = self.real(self.start());
        match (other.end(), start.as_deref()) {
            (Some(o), Some(_)) => compare_column(o, start.as_deref(), true) == Ordering::Less,
            _ => false,
        }
    }
}

fn cmp_border(a: Option<&str>, b: Option<&str>, is_start: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => {
            if is_start {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (Some(_), None) => {
            if is_start {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Some(a), Some(b)) => a.cmp(b),
    }
}

impl PartialEq for ColumnsRange {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.end == other.end
    }
}

impl Eq for ColumnsRange {}

impl Hash for ColumnsRange {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.start.hash(state);
        self.end.hash(state);
    }
}

impl Ord for ColumnsRange {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_border(self.start(), other.start(), true)
            .then_with(|| cmp_border(self.end(), other.end(), false))
    }
}

impl PartialOrd for ColumnsRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ColumnsRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start().unwrap_or("null"),
            self.end().unwrap_or("null")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_interval_relations() {
        let a = KeyInterval::new(0, 100);
        let b = KeyInterval::from_start(100);
        assert!(!a.intersects(&b));
        assert!(b.is_after(&a));
        assert!(b.is_open());
        assert!(a.contains(99));
        assert!(!a.contains(100));
        assert!(KeyInterval::new(150, 151).intersects(&b));
        assert_eq!(b.closed_at(200), KeyInterval::new(100, 200));
        assert_eq!(b.to_string(), "[100, MAX)");
    }

    #[test]
    fn test_columns_contains() {
        let range = ColumnsRange::bounded("a", "m");
        assert!(range.contains("b"));
        assert!(range.contains("a"));
        assert!(!range.contains("m"));
        assert!(!range.contains("z"));
        assert!(ColumnsRange::unbounded().contains("anything"));

        let upper = ColumnsRange::new(Some("m"), None::<String>);
        assert!(upper.contains("zzz"));
        assert!(!upper.contains("b"));
    }

    #[test]
    fn test_columns_wildcard() {
        let range = ColumnsRange::bounded("a.b", "a.c");
        assert!(range.contains("a.b.*"));
        assert!(range.contains("*"));
        assert!(!ColumnsRange::bounded("b", "c").contains("a.*"));
    }

    #[test]
    fn test_columns_intersection() {
        let left = ColumnsRange::bounded("a", "m");
        let right = ColumnsRange::bounded("k", "z");
        assert!(left.intersects(&right));
        assert_eq!(
            left.intersection(&right),
            Some(ColumnsRange::bounded("k", "m"))
        );
        let disjoint = ColumnsRange::bounded("m", "z");
        assert!(!left.intersects(&disjoint));
        assert!(disjoint.is_completely_after(&ColumnsRange::bounded("a", "c")));
        assert_eq!(
            ColumnsRange::unbounded().intersection(&left),
            Some(left.clone())
        );
    }

    #[test]
    fn test_columns_ordering() {
        let mut ranges = vec![
            ColumnsRange::new(Some("m"), None::<String>),
            ColumnsRange::bounded("a", "m"),
            ColumnsRange::new(None::<String>, Some("a")),
            ColumnsRange::bounded("a", "c"),
        ];
        ranges.sort();
        assert_eq!(ranges[0], ColumnsRange::new(None::<String>, Some("a")));
        assert_eq!(ranges[1], ColumnsRange::bounded("a", "c"));
        assert_eq!(ranges[2], ColumnsRange::bounded("a", "m"));
        assert_eq!(ranges[3], ColumnsRange::new(Some("m"), None::<String>));
    }

    #[test]
    fn test_schema_prefix() {
        let range = ColumnsRange::prefix("root")
            .unwrap()
            .with_schema_prefix(Some("db1".into()));
        assert!(range.contains("db1.root.cpu"));
        assert!(!range.contains("root.cpu"));
        assert!(range.contains_without_prefix("root.cpu"));
        assert_eq!(range, ColumnsRange::prefix("root").unwrap());
        assert!(ColumnsRange::prefix("a..b").is_err());
    }
}
