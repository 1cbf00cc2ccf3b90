//! Observable configuration maps.
//!
//! Four independent `string -> T` maps, one per scalar type the runtime's
//! options use (`String`, `i64`, `f64`, `bool`). Keys are normalized so that
//! case and `-`/`_` don't matter: `BUFFER-SIZE`, `buffer_size`, and
//! `Buffer_Size` all address the same entry. Mutations run registered
//! observers *after* releasing the map's lock — running a callback while
//! still holding the lock is how a naive implementation deadlocks against an
//! observer that reads the map it was just notified about.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use weft_error::{weft_error, ErrorKind, WeftError};

/// Normalize a key: uppercase, `-` folded to `_`.
pub fn normalize_key(key: &str) -> String {
    key.to_ascii_uppercase().replace('-', "_")
}

type ObserverId = u64;
static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// A single type-segregated observable map.
pub struct ConfigMap<T: Clone + Send + 'static> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    entries: HashMap<String, T>,
    observers: Vec<(ObserverId, Arc<dyn Fn(&str, &T) + Send + Sync>)>,
}

impl<T: Clone + Send + 'static> Default for ConfigMap<T> {
    fn default() -> Self {
        ConfigMap {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                observers: Vec::new(),
            }),
        }
    }
}

impl<T: Clone + Send + 'static> ConfigMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let key = normalize_key(key);
        self.inner.lock().entries.get(&key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        let key = normalize_key(key);
        self.inner.lock().entries.contains_key(&key)
    }

    /// Set a value, running any observers after the lock is released.
    pub fn set(&self, key: &str, value: T) {
        let key = normalize_key(key);
        let to_notify = {
            let mut guard = self.inner.lock();
            guard.entries.insert(key.clone(), value.clone());
            guard
                .observers
                .iter()
                .map(|(_, f)| Arc::clone(f))
                .collect::<Vec<_>>()
        };
        for f in to_notify {
            f(&key, &value);
        }
    }

    /// Register an observer; returns an id usable with [`Self::unobserve`].
    pub fn observe(&self, f: impl Fn(&str, &T) + Send + Sync + 'static) -> ObserverId {
        let id = NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().observers.push((id, Arc::new(f)));
        id
    }

    pub fn unobserve(&self, id: ObserverId) {
        self.inner.lock().observers.retain(|(oid, _)| *oid != id);
    }

    pub fn snapshot_keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Lock the map without notifying; used by [`Config::try_lock_all`] for
    /// atomic multi-map updates.
    fn try_lock(&self) -> Option<parking_lot::MutexGuard<'_, Inner<T>>> {
        self.inner.try_lock()
    }
}

/// The four scalar config maps plus convenience accessors that render
/// everything to `String` for diagnostics (see `weft-error`'s
/// `config_snapshot` field).
#[derive(Default)]
pub struct Config {
    pub strings: ConfigMap<String>,
    pub ints: ConfigMap<i64>,
    pub floats: ConfigMap<f64>,
    pub bools: ConfigMap<bool>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to lock all four maps at once; returns `None` if any single
    /// map is already locked, so callers can retry rather than deadlock
    /// against a concurrent single-map mutation.
    pub fn try_lock_all(&self) -> Option<AllMapsGuard<'_>> {
        let s = self.strings.try_lock()?;
        let i = match self.ints.try_lock() {
            Some(g) => g,
            None => return None,
        };
        let f = match self.floats.try_lock() {
            Some(g) => g,
            None => return None,
        };
        let b = match self.bools.try_lock() {
            Some(g) => g,
            None => return None,
        };
        Some(AllMapsGuard {
            _strings: s,
            _ints: i,
            _floats: f,
            _bools: b,
        })
    }

    /// Attach the same observer to all four maps, rendering every value to a
    /// `String` before invoking the shared callback.
    pub fn observe_all(self: &Arc<Self>, f: impl Fn(&str, String) + Send + Sync + 'static) {
        let f = Arc::new(f);
        let f1 = Arc::clone(&f);
        self.strings.observe(move |k, v| f1(k, v.clone()));
        let f2 = Arc::clone(&f);
        self.ints.observe(move |k, v| f2(k, v.to_string()));
        let f3 = Arc::clone(&f);
        self.floats.observe(move |k, v| f3(k, v.to_string()));
        self.bools.observe(move |k, v| f(k, v.to_string()));
    }

    /// Render every entry across all four maps to strings, normalized-key
    /// sorted, for inclusion in a [`WeftError`]'s diagnostic payload.
    pub fn snapshot_as_strings(&self) -> std::collections::BTreeMap<String, String> {
        let mut out = std::collections::BTreeMap::new();
        for k in self.strings.snapshot_keys() {
            if let Some(v) = self.strings.get(&k) {
                out.insert(k, v);
            }
        }
        for k in self.ints.snapshot_keys() {
            if let Some(v) = self.ints.get(&k) {
                out.insert(k, v.to_string());
            }
        }
        for k in self.floats.snapshot_keys() {
            if let Some(v) = self.floats.get(&k) {
                out.insert(k, v.to_string());
            }
        }
        for k in self.bools.snapshot_keys() {
            if let Some(v) = self.bools.get(&k) {
                out.insert(k, v.to_string());
            }
        }
        out
    }

    /// Merge an INI-style `[section.subsection]` document, resolving
    /// `$[section.key]` and `${ENVVAR:default}` substitutions before parsing
    /// as TOML (TOML itself has no variable-expansion syntax).
    pub fn merge_ini_like(&self, text: &str, section_prefix: &str) -> Result<(), WeftError> {
        let expanded = expand_variables(text)?;
        let mut doc: toml::Value = toml::from_str(&expanded).map_err(|e| {
            weft_error!(ErrorKind::InvalidConfigSyntax, "failed to parse config: {e}")
        })?;
        // `$[section.key]` markers survive the TOML parse as sentinel
        // strings; resolve them against the document itself now. Bounded to
        // cover a few levels of reference-to-a-reference indirection — stops
        // instead of looping forever on a cycle.
        for _ in 0..8 {
            let snapshot = doc.clone();
            if !resolve_references(&mut doc, &snapshot) {
                break;
            }
        }
        self.merge_toml_value(section_prefix, &doc);
        Ok(())
    }

    fn merge_toml_value(&self, prefix: &str, value: &toml::Value) {
        match value {
            toml::Value::Table(table) => {
                for (k, v) in table {
                    let key = if prefix.is_empty() {
                        k.clone()
                    } else {
                        format!("{prefix}.{k}")
                    };
                    self.merge_toml_value(&key, v);
                }
            }
            toml::Value::String(s) => self.strings.set(prefix, s.clone()),
            toml::Value::Integer(i) => self.ints.set(prefix, *i),
            toml::Value::Float(f) => self.floats.set(prefix, *f),
            toml::Value::Boolean(b) => self.bools.set(prefix, *b),
            _ => tracing::debug!(key = prefix, "unsupported config value type, skipped"),
        }
    }
}

/// RAII guard holding all four maps' locks at once.
pub struct AllMapsGuard<'a> {
    _strings: parking_lot::MutexGuard<'a, Inner<String>>,
    _ints: parking_lot::MutexGuard<'a, Inner<i64>>,
    _floats: parking_lot::MutexGuard<'a, Inner<f64>>,
    _bools: parking_lot::MutexGuard<'a, Inner<bool>>,
}

/// Private-use marker wrapping a `$[section.key]` path through the TOML
/// parse, so [`resolve_references`] can find and replace it afterwards.
const REF_MARK: char = '\u{E000}';

/// Resolve `${ENVVAR:default}` inline, and wrap `$[section.key]` references
/// in a marker TOML string for [`resolve_references`] to substitute once the
/// document has been parsed (TOML itself has no variable syntax, so the
/// self-reference can't be resolved until there's a document to look into).
fn expand_variables(text: &str) -> Result<String, WeftError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c == '$' {
            match chars.peek().map(|(_, c)| *c) {
                Some('{') => {
                    chars.next();
                    let mut expr = String::new();
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        expr.push(c);
                    }
                    let (var, default) = match expr.split_once(':') {
                        Some((v, d)) => (v, Some(d)),
                        None => (expr.as_str(), None),
                    };
                    match std::env::var(var) {
                        Ok(val) => out.push_str(&val),
                        Err(_) => out.push_str(default.unwrap_or("")),
                    }
                }
                Some('[') => {
                    chars.next();
                    let mut expr = String::new();
                    for (_, c) in chars.by_ref() {
                        if c == ']' {
                            break;
                        }
                        expr.push(c);
                    }
                    out.push('"');
                    out.push(REF_MARK);
                    out.push_str(&expr);
                    out.push(REF_MARK);
                    out.push('"');
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Look up a dot-separated path (`section.subsection.key`) in a parsed TOML
/// document.
fn lookup_path<'a>(doc: &'a toml::Value, path: &str) -> Option<&'a toml::Value> {
    let mut cur = doc;
    for part in path.split('.') {
        cur = cur.as_table()?.get(part)?;
    }
    Some(cur)
}

/// Replace every `$[section.key]` marker string in `value` with the value
/// it points to in `root`. Returns whether anything changed, so the caller
/// can re-run against the updated document to follow a chain of references.
fn resolve_references(value: &mut toml::Value, root: &toml::Value) -> bool {
    let mut changed = false;
    match value {
        toml::Value::String(s) => {
            if let Some(path) = s
                .strip_prefix(REF_MARK)
                .and_then(|rest| rest.strip_suffix(REF_MARK))
            {
                if let Some(resolved) = lookup_path(root, path) {
                    *value = resolved.clone();
                    changed = true;
                }
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                changed |= resolve_references(item, root);
            }
        }
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                changed |= resolve_references(v, root);
            }
        }
        _ => {}
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn normalize_folds_case_and_dash() {
        assert_eq!(normalize_key("buffer-size"), normalize_key("BUFFER_SIZE"));
        assert_eq!(normalize_key("Buffer_Size"), "BUFFER_SIZE");
    }

    #[test]
    fn write_read_cross_key_form() {
        let m: ConfigMap<i64> = ConfigMap::new();
        m.set("BUFFER-SIZE", 128);
        assert_eq!(m.get("buffer_size"), Some(128));
    }

    #[test]
    fn observer_fires_once_on_aliased_write() {
        let m: ConfigMap<i64> = ConfigMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        m.observe(move |_, _| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        m.set("buffer_size", 128);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_lock_all_is_all_or_nothing() {
        let cfg = Config::new();
        let _guard = cfg.strings.inner.lock();
        assert!(cfg.try_lock_all().is_none());
    }

    #[test]
    fn expand_env_with_default() {
        std::env::remove_var("WEFT_TEST_DOES_NOT_EXIST");
        let out = expand_variables("x = \"${WEFT_TEST_DOES_NOT_EXIST:fallback}\"").unwrap();
        assert!(out.contains("fallback"));
    }

    #[test]
    fn section_key_reference_resolves_to_the_referenced_value() {
        let cfg = Config::new();
        let text = r#"
            [pool]
            workers = 8

            [queue]
            capacity = "$[pool.workers]"
        "#;
        cfg.merge_ini_like(text, "weft").unwrap();
        assert_eq!(cfg.ints.get("weft.pool.workers"), Some(8));
        assert_eq!(cfg.ints.get("weft.queue.capacity"), Some(8));
    }

    #[test]
    fn section_key_reference_chain_resolves_through_indirection() {
        let cfg = Config::new();
        let text = r#"
            [a]
            value = 42

            [b]
            alias = "$[a.value]"

            [c]
            alias_of_alias = "$[b.alias]"
        "#;
        cfg.merge_ini_like(text, "weft").unwrap();
        assert_eq!(cfg.ints.get("weft.c.alias_of_alias"), Some(42));
    }

    use proptest::prelude::*;

    proptest::proptest! {
        #[test]
        fn prop_key_normalization_commutes(s in "[a-zA-Z_-]{1,16}") {
            let a = normalize_key(&s);
            let b = normalize_key(&normalize_key(&s));
            prop_assert_eq!(a, b);
        }
    }
}
