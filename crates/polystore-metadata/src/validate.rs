//! Tiling checks run before any layout is persisted.

use polystore_common::{Error, KEY_MAX, Result};
use polystore_meta_store::FragmentMeta;
use std::collections::BTreeMap;

/// One generation's columns ranges must chain from an unbounded start to
/// an unbounded end, each range ending where the next one starts
fn check_column_chain(generation: &[&FragmentMeta], what: &str) -> Result<()> {
    let mut sorted = generation.to_vec();
    sorted.sort_by(|a, b| a.columns.start().cmp(&b.columns.start()));

    let mut expected: Option<&str> = None;
    for (i, fragment) in sorted.iter().enumerate() {
        let start = fragment.columns.start();
        if start != expected {
            return Err(Error::invalid_layout(format!(
                "{what} leave a gap or overlap at column border {}",
                expected.or(start).unwrap_or("null")
            )));
        }
        match fragment.columns.end() {
            Some(end) => {
                if start.is_some_and(|s| end <= s) {
                    return Err(Error::invalid_layout(format!(
                        "{what} contain the empty columns range {}",
                        fragment.columns
                    )));
                }
                expected = Some(end);
            }
            None if i + 1 == sorted.len() => return Ok(()),
            None => {
                return Err(Error::invalid_layout(format!(
                    "{what} overlap after column border {}",
                    start.unwrap_or("null")
                )));
            }
        }
    }
    Err(Error::invalid_layout(format!(
        "{what} leave columns after {} uncovered",
        expected.unwrap_or("null")
    )))
}

/// Bootstrap fragments must tile `(null, null) x [0, MAX)` exactly
pub fn check_initial_tiling(fragments: &[FragmentMeta]) -> Result<()> {
    if fragments.is_empty() {
        return Err(Error::invalid_layout("no initial fragments"));
    }
    let mut by_start: BTreeMap<i64, Vec<&FragmentMeta>> = BTreeMap::new();
    for fragment in fragments {
        by_start
            .entry(fragment.keys.start())
            .or_default()
            .push(fragment);
    }

    let mut expected = 0;
    let last = by_start.len() - 1;
    for (i, (start, generation)) in by_start.iter().enumerate() {
        if *start != expected {
            return Err(Error::invalid_layout(format!(
                "initial fragments leave a gap or overlap at key {expected}"
            )));
        }
        let end = generation[0].keys.end();
        if generation.iter().any(|f| f.keys.end() != end) {
            return Err(Error::invalid_layout(format!(
                "fragments starting at {start} end at different keys"
            )));
        }
        if end <= *start {
            return Err(Error::invalid_layout(format!(
                "initial fragments contain the empty key interval [{start}, {end})"
            )));
        }
        if (end == KEY_MAX) != (i == last) {
            return Err(Error::invalid_layout(
                "initial fragments must span keys 0 to MAX exactly once",
            ));
        }
        check_column_chain(generation, "initial fragments")?;
        expected = end;
    }
    Ok(())
}

/// A new generation shares one start key, is open-ended and tiles the
/// columns space; returns that start key
pub fn check_generation_tiling(fragments: &[FragmentMeta]) -> Result<i64> {
    let Some(first) = fragments.first() else {
        return Err(Error::invalid_layout("empty fragment generation"));
    };
    let start = first.keys.start();
    for fragment in fragments {
        if fragment.keys.end() != KEY_MAX {
            return Err(Error::invalid_layout(format!(
                "new fragment {} must be open-ended",
                fragment.columns
            )));
        }
        if fragment.keys.start() != start {
            return Err(Error::invalid_layout(
                "new fragments must share one start key",
            ));
        }
    }
    if start < 0 || start == KEY_MAX {
        return Err(Error::invalid_layout(format!(
            "new fragments cannot start at key {start}"
        )));
    }
    let generation: Vec<&FragmentMeta> = fragments.iter().collect();
    check_column_chain(&generation, "new fragments")?;
    Ok(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystore_common::{ColumnsRange, KeyInterval, StorageUnitId};

    fn fragment(start: Option<&str>, end: Option<&str>, keys: KeyInterval) -> FragmentMeta {
        FragmentMeta::new(ColumnsRange::new(start, end), keys, StorageUnitId::from("u0"))
    }

    #[test]
    fn test_single_fragment_tiles() {
        assert!(check_initial_tiling(&[fragment(None, None, KeyInterval::full())]).is_ok());
    }

    #[test]
    fn test_two_generations_tile() {
        let fragments = vec![
            fragment(None, None, KeyInterval::new(0, 100)),
            fragment(None, Some("m"), KeyInterval::from_start(100)),
            fragment(Some("m"), None, KeyInterval::from_start(100)),
        ];
        assert!(check_initial_tiling(&fragments).is_ok());
    }

    #[test]
    fn test_column_gap_rejected() {
        let fragments = vec![
            fragment(None, Some("a"), KeyInterval::full()),
            fragment(Some("b"), None, KeyInterval::full()),
        ];
        assert!(check_initial_tiling(&fragments).is_err());
    }

    #[test]
    fn test_key_gap_rejected() {
        let fragments = vec![
            fragment(None, None, KeyInterval::new(0, 50)),
            fragment(None, None, KeyInterval::from_start(100)),
        ];
        assert!(check_initial_tiling(&fragments).is_err());
        assert!(check_initial_tiling(&[fragment(None, None, KeyInterval::from_start(5))]).is_err());
    }

    #[test]
    fn test_generation_rules() {
        let generation = vec![
            fragment(None, Some("m"), KeyInterval::from_start(100)),
            fragment(Some("m"), None, KeyInterval::from_start(100)),
        ];
        assert_eq!(check_generation_tiling(&generation).unwrap(), 100);

        let closed = vec![fragment(None, None, KeyInterval::new(100, 200))];
        assert!(check_generation_tiling(&closed).is_err());

        let mixed = vec![
            fragment(None, Some("m"), KeyInterval::from_start(100)),
            fragment(Some("m"), None, KeyInterval::from_start(101)),
        ];
        assert!(check_generation_tiling(&mixed).is_err());
        assert!(check_generation_tiling(&[]).is_err());
    }

    #[test]
    fn test_double_covered_layout_rejected() {
        let fragments = vec![
            fragment(None, Some("m"), KeyInterval::full()),
            fragment(Some("m"), None, KeyInterval::full()),
            fragment(None, Some("c"), KeyInterval::full()),
            fragment(Some("c"), None, KeyInterval::full()),
        ];
        assert!(check_initial_tiling(&fragments).is_err());
        assert!(check_generation_tiling(&[
            fragment(None, None, KeyInterval::from_start(100)),
            fragment(None, None, KeyInterval::from_start(100)),
        ])
        .is_err());
    }

    #[test]
    fn test_reversed_ranges_rejected() {
        let keys = vec![
            fragment(None, None, KeyInterval::full()),
            fragment(None, None, KeyInterval::new(10, 20)),
            fragment(None, None, KeyInterval::new(20, 10)),
        ];
        assert!(check_initial_tiling(&keys).is_err());

        let columns = vec![
            fragment(None, Some("m"), KeyInterval::full()),
            fragment(Some("m"), Some("c"), KeyInterval::full()),
            fragment(Some("c"), None, KeyInterval::full()),
        ];
        assert!(check_initial_tiling(&columns).is_err());
    }

    #[test]
    fn test_three_way_column_split_tiles() {
        let fragments = vec![
            fragment(Some("m"), None, KeyInterval::full()),
            fragment(None, Some("c"), KeyInterval::full()),
            fragment(Some("c"), Some("m"), KeyInterval::full()),
        ];
        assert!(check_initial_tiling(&fragments).is_ok());
    }
}
