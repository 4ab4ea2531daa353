//! Plan cache
//!
//! A single dictionary keyed by normalized query text plus parameter
//! shape, with a fixed capacity. Eviction past capacity clears the whole
//! dictionary and admits the new entry: repeated clears only dominate
//! under severe thrash, which indicates a non-parameterized workload that
//! should move to the DIRECT or JIT tiers.

use std::collections::HashMap;

use log::warn;

use crate::types::{ColumnType, Value};

/// Maximum number of cached plans.
pub const PLAN_CACHE_CAPACITY: usize = 1024;

/// Cache key: normalized text plus the ordered parameter shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    normalized: String,
    shape: Vec<(String, ParamType)>,
}

/// Declared type of a bound parameter, for shape matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl From<ColumnType> for ParamType {
    fn from(t: ColumnType) -> ParamType {
        match t {
            ColumnType::Null => ParamType::Null,
            ColumnType::Integer => ParamType::Integer,
            ColumnType::Real => ParamType::Real,
            ColumnType::Text => ParamType::Text,
            ColumnType::Blob => ParamType::Blob,
        }
    }
}

impl CacheKey {
    pub fn new(query: &str, params: &HashMap<String, Value>) -> CacheKey {
        let mut shape: Vec<(String, ParamType)> = params
            .iter()
            .map(|(name, value)| (name.clone(), ParamType::from(value.column_type())))
            .collect();
        shape.sort();
        CacheKey {
            normalized: normalize(query),
            shape,
        }
    }
}

/// Collapse whitespace runs to a single space and fold identifier case.
/// Quoted strings and quoted identifiers pass through untouched.
pub fn normalize(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    let mut pending_space = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '[' => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == ']' {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.extend(c.to_lowercase());
            }
        }
    }
    out
}

/// Fixed-capacity memoization dictionary.
pub struct PlanCache<V> {
    entries: HashMap<CacheKey, V>,
    capacity: usize,
}

impl<V> PlanCache<V> {
    pub fn new() -> PlanCache<V> {
        PlanCache::with_capacity(PLAN_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> PlanCache<V> {
        PlanCache {
            entries: HashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: CacheKey, value: V) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            warn!(
                "plan cache full ({} entries): clearing; consider DIRECT or JIT for \
                 non-parameterized workloads",
                self.entries.len()
            );
            self.entries.clear();
        }
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for PlanCache<V> {
    fn default() -> Self {
        PlanCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(
            normalize("SELECT  Name\n FROM\tUsers"),
            "select name from users"
        );
    }

    #[test]
    fn test_normalize_preserves_string_literals() {
        assert_eq!(
            normalize("SELECT * FROM t WHERE x = 'MiXeD  Case'"),
            "select * from t where x = 'MiXeD  Case'"
        );
    }

    #[test]
    fn test_shape_distinguishes_types() {
        let mut a = HashMap::new();
        a.insert("p".to_string(), Value::Integer(1));
        let mut b = HashMap::new();
        b.insert("p".to_string(), Value::Text("1".into()));
        assert_ne!(CacheKey::new("select 1", &a), CacheKey::new("select 1", &b));
        assert_eq!(CacheKey::new("select 1", &a), CacheKey::new("SELECT  1", &a));
    }

    #[test]
    fn test_clear_on_overflow() {
        let mut cache: PlanCache<u32> = PlanCache::with_capacity(2);
        let none = HashMap::new();
        cache.insert(CacheKey::new("a", &none), 1);
        cache.insert(CacheKey::new("b", &none), 2);
        assert_eq!(cache.len(), 2);
        cache.insert(CacheKey::new("c", &none), 3);
        // Whole dictionary cleared, then the new entry admitted.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&CacheKey::new("c", &none)), Some(&3));
        // Re-inserting an existing key never triggers a clear.
        cache.insert(CacheKey::new("c", &none), 4);
        assert_eq!(cache.len(), 1);
    }
}
