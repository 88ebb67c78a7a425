//! Indexing by unordered sets of keys.
//!
//! A `KeySetMap` interns key *sets*: looking up the same collection of keys —
//! under any permutation or duplication — yields the same entry. Entries are
//! found through two reverse indices, `key -> size -> entries` (one for
//! primitive keys, one for object keys), plus a dedicated slot for the empty
//! set. Intersection starts from the smallest bucket; interning guarantees at
//! most one entry survives, because two distinct interned sets of the same
//! size sharing every key would have to be the same set.
//!
//! Object keys are held weakly by default. Without finalizers, dead keys are
//! observed lazily: stale entries are skipped during finds, dropped during
//! mutating walks, and collected by the explicit [`KeySetMap::purge`] sweep.

use crate::value::{Body, Obj, Prim, PrimKey, Value, WeakObj};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Error type for key-set operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySetError {
    /// `lookup_set` and friends require an ordered-set value.
    NotASet,
}

impl fmt::Display for KeySetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySetError::NotASet => write!(f, "expected an ordered-set value"),
        }
    }
}

impl std::error::Error for KeySetError {}

/// How one canonical key is held by its entry.
#[derive(Debug, Clone)]
enum KeyHold {
    Prim(Prim),
    /// Weak by default; the entry dies with any of its object keys.
    Weak(WeakObj),
    /// Used when the map was built with `weakness` off.
    Strong(Obj),
}

impl KeyHold {
    fn is_live(&self) -> bool {
        match self {
            KeyHold::Prim(_) | KeyHold::Strong(_) => true,
            KeyHold::Weak(weak) => weak.is_live(),
        }
    }
}

/// Identity key used for index buckets and set membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Prim(PrimKey),
    Ref(usize),
}

impl IndexKey {
    fn of(value: &Value) -> Self {
        match value {
            Value::Prim(p) => IndexKey::Prim(p.key()),
            Value::Obj(o) => IndexKey::Ref(o.addr()),
        }
    }
}

/// The interned identity of one key set.
#[derive(Debug)]
pub struct CanonicalKeys {
    holds: Vec<KeyHold>,
    index_keys: Vec<IndexKey>,
}

impl CanonicalKeys {
    /// Number of distinct keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.holds.len()
    }

    /// Whether this is the empty set's entry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }

    /// Whether every object key is still alive.
    pub fn is_live(&self) -> bool {
        self.holds.iter().all(KeyHold::is_live)
    }

    fn matches(&self, query: &[IndexKey]) -> bool {
        self.index_keys.len() == query.len()
            && self.index_keys.iter().all(|k| query.contains(k))
    }
}

/// One interned entry: the canonical key set plus its payload.
#[derive(Debug)]
pub struct KeysEntry<D> {
    keys: CanonicalKeys,
    data: D,
}

impl<D> KeysEntry<D> {
    /// The canonical key set.
    pub fn keys(&self) -> &CanonicalKeys {
        &self.keys
    }

    /// The payload built by `make_data`.
    pub fn data(&self) -> &D {
        &self.data
    }
}

type SizeIndex<D> = HashMap<usize, Vec<Rc<KeysEntry<D>>>>;

/// Map keyed by unordered sets of values.
pub struct KeySetMap<D> {
    strong: HashMap<PrimKey, SizeIndex<D>>,
    weak: HashMap<usize, SizeIndex<D>>,
    empty: Option<Rc<KeysEntry<D>>>,
    make_data: Box<dyn Fn(&[Value]) -> D>,
    weakness: bool,
}

impl<D> fmt::Debug for KeySetMap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySetMap")
            .field("weakness", &self.weakness)
            .finish_non_exhaustive()
    }
}

impl<D> KeySetMap<D> {
    /// Creates a map holding object keys weakly.
    pub fn new(make_data: impl Fn(&[Value]) -> D + 'static) -> Self {
        Self::with_weakness(true, make_data)
    }

    /// Creates a map with an explicit weakness policy.
    pub fn with_weakness(weakness: bool, make_data: impl Fn(&[Value]) -> D + 'static) -> Self {
        Self {
            strong: HashMap::new(),
            weak: HashMap::new(),
            empty: None,
            make_data: Box::new(make_data),
            weakness,
        }
    }

    /// Deduplicates a key collection into set form, first occurrence wins.
    fn dedupe(keys: &[Value]) -> (Vec<Value>, Vec<IndexKey>) {
        let mut distinct = Vec::new();
        let mut index_keys: Vec<IndexKey> = Vec::new();
        for key in keys {
            let ik = IndexKey::of(key);
            if !index_keys.contains(&ik) {
                index_keys.push(ik);
                distinct.push(key.clone());
            }
        }
        (distinct, index_keys)
    }

    fn bucket(&self, key: &IndexKey, size: usize) -> Option<&Vec<Rc<KeysEntry<D>>>> {
        match key {
            IndexKey::Prim(pk) => self.strong.get(pk)?.get(&size),
            IndexKey::Ref(addr) => self.weak.get(addr)?.get(&size),
        }
    }

    /// Finds the surviving entry for a deduplicated query, if any.
    fn find(&self, index_keys: &[IndexKey]) -> Option<Rc<KeysEntry<D>>> {
        if index_keys.is_empty() {
            return self.empty.clone();
        }
        let size = index_keys.len();
        // Start from the smallest bucket to minimize candidate scans.
        let smallest = index_keys
            .iter()
            .map(|k| self.bucket(k, size))
            .min_by_key(|bucket| bucket.map_or(0, |b| b.len()))?;
        let bucket = smallest?;
        bucket
            .iter()
            .find(|entry| entry.keys.is_live() && entry.keys.matches(index_keys))
            .cloned()
    }

    fn record(&mut self, distinct: Vec<Value>, index_keys: Vec<IndexKey>) -> Rc<KeysEntry<D>> {
        let data = (self.make_data)(&distinct);
        let holds = distinct
            .iter()
            .map(|key| match key {
                Value::Prim(p) => KeyHold::Prim(p.clone()),
                Value::Obj(o) if self.weakness => KeyHold::Weak(o.downgrade()),
                Value::Obj(o) => KeyHold::Strong(o.clone()),
            })
            .collect();
        let entry = Rc::new(KeysEntry {
            keys: CanonicalKeys {
                holds,
                index_keys: index_keys.clone(),
            },
            data,
        });
        if index_keys.is_empty() {
            self.empty = Some(entry.clone());
            return entry;
        }
        let size = index_keys.len();
        for key in &index_keys {
            let index = match key {
                IndexKey::Prim(pk) => self.strong.entry(pk.clone()).or_default(),
                IndexKey::Ref(addr) => self.weak.entry(*addr).or_default(),
            };
            index.entry(size).or_default().push(entry.clone());
        }
        entry
    }

    /// Finds or creates the entry for `keys` (order and duplicates ignored).
    pub fn lookup(&mut self, keys: &[Value]) -> Rc<KeysEntry<D>> {
        let (distinct, index_keys) = Self::dedupe(keys);
        if let Some(entry) = self.find(&index_keys) {
            return entry;
        }
        self.record(distinct, index_keys)
    }

    /// Finds the entry for `keys` without creating one.
    pub fn peek(&self, keys: &[Value]) -> Option<Rc<KeysEntry<D>>> {
        let (_, index_keys) = Self::dedupe(keys);
        self.find(&index_keys)
    }

    /// Removes and returns the entry for `keys`, if present.
    pub fn remove(&mut self, keys: &[Value]) -> Option<Rc<KeysEntry<D>>> {
        let (_, index_keys) = Self::dedupe(keys);
        let entry = self.find(&index_keys)?;
        self.unlink(&entry);
        Some(entry)
    }

    /// [`lookup`](Self::lookup) with the keys taken from an ordered-set value.
    pub fn lookup_set(&mut self, set: &Value) -> Result<Rc<KeysEntry<D>>, KeySetError> {
        let members = Self::set_members(set)?;
        Ok(self.lookup(&members))
    }

    /// [`peek`](Self::peek) with the keys taken from an ordered-set value.
    pub fn peek_set(&self, set: &Value) -> Result<Option<Rc<KeysEntry<D>>>, KeySetError> {
        let members = Self::set_members(set)?;
        Ok(self.peek(&members))
    }

    /// [`remove`](Self::remove) with the keys taken from an ordered-set value.
    pub fn remove_set(&mut self, set: &Value) -> Result<Option<Rc<KeysEntry<D>>>, KeySetError> {
        let members = Self::set_members(set)?;
        Ok(self.remove(&members))
    }

    fn set_members(set: &Value) -> Result<Vec<Value>, KeySetError> {
        let Some(obj) = set.as_obj() else {
            return Err(KeySetError::NotASet);
        };
        match &*obj.body() {
            Body::Set(members) => Ok(members.iter().cloned().collect()),
            _ => Err(KeySetError::NotASet),
        }
    }

    fn unlink(&mut self, entry: &Rc<KeysEntry<D>>) {
        if entry.keys.is_empty() {
            self.empty = None;
            return;
        }
        let size = entry.keys.len();
        for key in &entry.keys.index_keys {
            let gone = match key {
                IndexKey::Prim(pk) => Self::unlink_from(self.strong.get_mut(pk), size, entry),
                IndexKey::Ref(addr) => Self::unlink_from(self.weak.get_mut(addr), size, entry),
            };
            if gone {
                match key {
                    IndexKey::Prim(pk) => {
                        self.strong.remove(pk);
                    }
                    IndexKey::Ref(addr) => {
                        self.weak.remove(addr);
                    }
                }
            }
        }
    }

    /// Returns whether the whole per-key index became empty.
    fn unlink_from(
        index: Option<&mut SizeIndex<D>>,
        size: usize,
        entry: &Rc<KeysEntry<D>>,
    ) -> bool {
        let Some(index) = index else { return false };
        if let Some(bucket) = index.get_mut(&size) {
            bucket.retain(|e| !Rc::ptr_eq(e, entry));
            if bucket.is_empty() {
                index.remove(&size);
            }
        }
        index.is_empty()
    }

    /// Drops entries whose weak keys have died. Returns how many were
    /// collected.
    pub fn purge(&mut self) -> usize {
        let mut dead: Vec<Rc<KeysEntry<D>>> = Vec::new();
        for index in self.strong.values().chain(self.weak.values()) {
            for bucket in index.values() {
                for entry in bucket {
                    if !entry.keys.is_live() && !dead.iter().any(|e| Rc::ptr_eq(e, entry)) {
                        dead.push(entry.clone());
                    }
                }
            }
        }
        for entry in &dead {
            self.unlink(entry);
        }
        if !dead.is_empty() {
            log::trace!("key-set purge collected {} entries", dead.len());
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;
    use std::cell::Cell;

    fn counting_map() -> (KeySetMap<usize>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        let map = KeySetMap::new(move |_keys: &[Value]| {
            calls2.set(calls2.get() + 1);
            calls2.get()
        });
        (map, calls)
    }

    #[test]
    fn permutation_and_duplication_invariant() {
        let (mut map, calls) = counting_map();
        let o = Obj::empty_record();
        let a = map.lookup(&[Value::int(1), Value::str("k"), Value::from(o.clone())]);
        let b = map.lookup(&[
            Value::from(o.clone()),
            Value::int(1),
            Value::str("k"),
            Value::int(1),
        ]);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn distinct_sets_distinct_entries() {
        let (mut map, _) = counting_map();
        let a = map.lookup(&[Value::int(1), Value::int(2)]);
        let b = map.lookup(&[Value::int(1)]);
        let c = map.lookup(&[Value::int(1), Value::int(3)]);
        assert!(!Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn empty_set_has_its_own_slot() {
        let (mut map, calls) = counting_map();
        let a = map.lookup(&[]);
        let b = map.lookup(&[]);
        assert!(Rc::ptr_eq(&a, &b));
        assert!(a.keys().is_empty());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn peek_and_remove() {
        let (mut map, _) = counting_map();
        assert!(map.peek(&[Value::int(5)]).is_none());
        let entry = map.lookup(&[Value::int(5)]);
        assert!(map.peek(&[Value::int(5)]).is_some());
        let removed = map.remove(&[Value::int(5)]).unwrap();
        assert!(Rc::ptr_eq(&entry, &removed));
        assert!(map.peek(&[Value::int(5)]).is_none());
        // A fresh lookup re-creates.
        let again = map.lookup(&[Value::int(5)]);
        assert!(!Rc::ptr_eq(&entry, &again));
    }

    #[test]
    fn set_shaped_entry_points() {
        let (mut map, _) = counting_map();
        let set = Obj::set([Value::int(1), Value::int(2), Value::int(1)]);
        let from_set = map.lookup_set(&set.clone().into()).unwrap();
        let from_slice = map.lookup(&[Value::int(2), Value::int(1)]);
        assert!(Rc::ptr_eq(&from_set, &from_slice));
        assert!(map.peek_set(&set.clone().into()).unwrap().is_some());
        assert!(map.remove_set(&set.into()).unwrap().is_some());
    }

    #[test]
    fn non_set_is_a_type_error() {
        let (mut map, _) = counting_map();
        let err = map.lookup_set(&Value::int(1)).unwrap_err();
        assert_eq!(err, KeySetError::NotASet);
        let err = map.lookup_set(&Obj::list([]).into()).unwrap_err();
        assert_eq!(err, KeySetError::NotASet);
    }

    #[test]
    fn dead_object_key_kills_entry() {
        let (mut map, _) = counting_map();
        let key = Obj::empty_record();
        map.lookup(&[Value::int(1), Value::from(key.clone())]);
        drop(key);
        // The stale entry no longer matches any query...
        assert!(map.peek(&[Value::int(1)]).is_none());
        // ...and the sweep collects it.
        assert_eq!(map.purge(), 1);
        assert_eq!(map.purge(), 0);
    }

    #[test]
    fn strong_mode_survives_key_drop() {
        let mut map: KeySetMap<()> = KeySetMap::with_weakness(false, |_| ());
        let key = Obj::empty_record();
        let entry = map.lookup(&[Value::from(key.clone())]);
        drop(key);
        assert_eq!(map.purge(), 0);
        assert!(entry.keys().is_live());
    }

    #[test]
    fn superset_is_distinct_from_subset() {
        let (mut map, _) = counting_map();
        let rogue = Obj::empty_record();
        let base: Vec<Value> = vec![
            Value::str("a"),
            Value::str("b"),
            Value::str("c"),
            Value::str("d"),
        ];
        let mut with_rogue = base.clone();
        with_rogue.push(Value::from(rogue.clone()));
        let superset = map.lookup(&with_rogue);
        let mut rotated = vec![Value::from(rogue.clone())];
        rotated.extend(base.iter().cloned());
        let superset_again = map.lookup(&rotated);
        let subset = map.lookup(&base);
        assert!(Rc::ptr_eq(&superset, &superset_again));
        assert!(!Rc::ptr_eq(&superset, &subset));
    }
}
