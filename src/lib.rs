//! Palimpsest: memory-conscious canonicalization and contextual propagation.
//!
//! This crate is a collection of building blocks for collapsing deeply equal
//! object graphs to shared frozen representatives and for propagating
//! contextual values through cooperative control flow:
//! - [`WeakTrie`]: path-addressed payloads with weak object keys and tail
//!   compression.
//! - [`TupleInterner`]: immutable fixed-length sequences, identical by
//!   reference iff element-wise identical.
//! - [`Canon`]: deep-structural canonicalization of arbitrary value graphs,
//!   cycles and shared substructure included.
//! - [`Supertext`] / [`Subtext`]: an immutable DAG of contextual values with
//!   scoped activation, interned merges, and user merge/guard hooks.
//! - [`KeySetMap`]: indexing by unordered sets of keys.
//! - [`Task`]: a promise-shaped settlement container with a synchronous
//!   fast path and ambient-context capture.
//!
//! # Name Origin: "Palimpsest"
//!
//! A palimpsest is a manuscript page scraped clean and written over, the
//! earlier text persisting faintly beneath the new. The structures here
//! behave the same way: weak tries and key-set indices hold earlier writings
//! only as long as something else still cares about them, and the
//! canonicalizer lets one authoritative text show through arbitrarily many
//! copies.
//!
//! # Ownership model
//!
//! Everything is single-threaded and cooperative: `Rc`, `Weak`, and interior
//! mutability throughout; nothing is `Send` or `Sync`. Rust has no
//! ephemerons and no ordered finalizers, so weak-key reclamation is observed
//! lazily (on traversal and explicit `purge` sweeps) rather than eagerly;
//! logical behavior is unchanged.
//!
//! # Example
//!
//! ```
//! use palimpsest::prelude::*;
//!
//! let canon = Canon::new();
//! let a = Obj::record([("x".into(), Value::int(1))]);
//! let b = Obj::record([("x".into(), Value::int(1))]);
//! let ca = canon.admit(a.into()).unwrap();
//! let cb = canon.admit(b.into()).unwrap();
//! assert!(ca.same(&cb));
//! assert!(canon.is_canonical(&ca));
//! ```
//!
//! # Citations
//! - Hash consing: Filliâtre & Conchon, "Type-safe modular hash-consing"
//!   (ML Workshop 2006)
//! - Strongly connected components: Tarjan (SICOMP 1972), Gabow (IPL 2000)
//! - Promises: Liskov & Shrira (PLDI 1988)

pub mod canon;
pub mod components;
pub mod digest;
pub mod equal;
pub mod flow;
pub mod handlers;
pub mod keyset;
pub mod scheduler;
pub mod supertext;
pub mod task;
pub mod trie;
pub mod tuple;
pub mod value;

pub use crate::canon::{Canon, CanonError, TraceToken};
pub use crate::components::{partition, Component, Info, Partitioned};
pub use crate::digest::{digest_value, CanonicalBytes, HashValue};
pub use crate::equal::{deep_equal, Equalizer};
pub use crate::flow::{drive, Feed, Step, StepMachine};
pub use crate::handlers::{Handler, Handlers, HandlersError, HookError, Materialize};
pub use crate::keyset::{CanonicalKeys, KeySetError, KeySetMap, KeysEntry};
pub use crate::scheduler::Scheduler;
pub use crate::supertext::{ContextBackend, StackBackend, Subtext, Supertext};
pub use crate::task::{Outcome, Task, TaskContext, TaskFuture, TaskInput, TaskState};
pub use crate::trie::{StrongKey, TrieKey, WeakTrie};
pub use crate::tuple::{Tuple, TupleInterner};
pub use crate::value::{Body, ClassId, Obj, OpaqueEq, Prim, PrimKey, Record, Slot, Value};

/// Prelude for convenient usage.
pub mod prelude {
    pub use crate::canon::{Canon, CanonError};
    pub use crate::digest::{digest_value, HashValue};
    pub use crate::equal::deep_equal;
    pub use crate::handlers::{Handler, Handlers, Materialize};
    pub use crate::keyset::KeySetMap;
    pub use crate::scheduler::Scheduler;
    pub use crate::supertext::{Subtext, Supertext};
    pub use crate::task::{Task, TaskInput, TaskState};
    pub use crate::trie::WeakTrie;
    pub use crate::tuple::{Tuple, TupleInterner};
    pub use crate::value::{Body, ClassId, Obj, Prim, Slot, Value};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use crate::handlers::HookError;
    use std::cell::Cell;
    use std::rc::Rc;

    fn record(pairs: &[(&str, Value)]) -> Obj {
        Obj::record(pairs.iter().map(|(k, v)| (Rc::from(*k), v.clone())))
    }

    fn tail_of(value: &Value) -> Value {
        value.as_obj().unwrap().record_get("tail").unwrap()
    }

    /// Five entry points into one five-cell ring admit to five distinct
    /// frozen cells forming the same canonical ring.
    #[test]
    fn ring_entry_points_share_one_canonical_ring() {
        let canon = Canon::new();

        let last = record(&[("value", Value::int(5)), ("tail", Value::null())]);
        let mut entries = vec![last.clone()];
        let mut head = last.clone();
        for value in [4, 3, 2, 1] {
            head = record(&[
                ("value", Value::int(value)),
                ("tail", Value::from(head.clone())),
            ]);
            entries.push(head.clone());
        }
        entries.reverse(); // entries[0] carries value 1, entries[4] value 5
        let list = entries[0].clone();
        last.record_set("tail", Value::from(list.clone())).unwrap();

        let admitted: Vec<Value> = entries
            .iter()
            .map(|entry| canon.admit(entry.clone().into()).unwrap())
            .collect();

        // Five distinct frozen cells.
        for (i, a) in admitted.iter().enumerate() {
            assert!(a.as_obj().unwrap().is_frozen());
            for b in admitted.iter().skip(i + 1) {
                assert!(!a.same(b));
            }
        }
        // They form one ring: following `tail` from the canonical head walks
        // the other four and returns to the head.
        let head_canonical = &admitted[0];
        let mut cursor = head_canonical.clone();
        for expected in &admitted[1..] {
            cursor = tail_of(&cursor);
            assert!(cursor.same(expected));
        }
        assert!(tail_of(&cursor).same(head_canonical));

        // Going five steps around the input ring lands back on the entry, so
        // admission agrees.
        let mut five_away = Value::from(list.clone());
        for _ in 0..5 {
            five_away = tail_of(&five_away);
        }
        let a = canon.admit(Value::from(list)).unwrap();
        let b = canon.admit(five_away).unwrap();
        assert!(a.same(&b));
    }

    /// Symmetric cross-references collapse to one representative; breaking
    /// the symmetry separates them.
    #[test]
    fn symmetric_cross_references_collapse() {
        let canon = Canon::new();

        let a = record(&[]);
        let b = record(&[]);
        a.record_set("other", Value::from(b.clone())).unwrap();
        a.record_set("self", Value::from(a.clone())).unwrap();
        b.record_set("other", Value::from(a.clone())).unwrap();
        b.record_set("self", Value::from(b.clone())).unwrap();
        let ca = canon.admit(a.into()).unwrap();
        let cb = canon.admit(b.into()).unwrap();
        assert!(ca.same(&cb));

        // Asymmetric variant: a2 names its peer "b", b2 names its peer "a".
        let a2 = record(&[]);
        let b2 = record(&[]);
        a2.record_set("other", Value::from(b2.clone())).unwrap();
        a2.record_set("self", Value::from(a2.clone())).unwrap();
        a2.record_set("b", Value::from(b2.clone())).unwrap();
        b2.record_set("other", Value::from(a2.clone())).unwrap();
        b2.record_set("self", Value::from(b2.clone())).unwrap();
        b2.record_set("a", Value::from(a2.clone())).unwrap();
        let ca2 = canon.admit(a2.into()).unwrap();
        let cb2 = canon.admit(b2.into()).unwrap();
        assert!(!ca2.same(&cb2));
    }

    /// A registered two-step byte-buffer handler collapses separately
    /// allocated equal buffers, and reconstruction observes canonical
    /// children.
    #[test]
    fn byte_buffer_handler_collapses_equal_buffers() {
        let canon = Canon::new();
        let observed_children = Rc::new(Cell::new(0usize));
        let counter = observed_children.clone();
        canon
            .handlers()
            .enable(
                ClassId::BYTES,
                Handler {
                    deconstruct: Rc::new(|obj| match &*obj.body() {
                        Body::Bytes(bytes) => {
                            Ok(bytes.iter().map(|&b| Value::int(b as i64)).collect())
                        }
                        _ => Err(HookError("not bytes".into())),
                    }),
                    materialize: Materialize::Reconstruct(Rc::new(move |children| {
                        counter.set(counter.get() + children.len());
                        let bytes: Result<Vec<u8>, HookError> = children
                            .iter()
                            .map(|child| match child {
                                Value::Prim(Prim::Int(b)) => Ok(*b as u8),
                                _ => Err(HookError("non-canonical child".into())),
                            })
                            .collect();
                        Ok(Obj::bytes(bytes?))
                    })),
                },
            )
            .unwrap();

        let one = Obj::bytes(vec![1, 2, 3]);
        let two = Obj::bytes(vec![1, 2, 3]);
        let c_one = canon.admit(one.into()).unwrap();
        let c_two = canon.admit(two.into()).unwrap();
        assert!(c_one.same(&c_two));
        assert!(c_one.as_obj().unwrap().is_frozen());
        // Reconstruct ran once, over the three canonical children.
        assert_eq!(observed_children.get(), 3);

        // Buffers reached through a containing record collapse the same way.
        let holder = record(&[
            ("left", Value::from(Obj::bytes(vec![9, 9]))),
            ("right", Value::from(Obj::bytes(vec![9, 9]))),
        ]);
        let canonical = canon.admit(holder.into()).unwrap();
        let obj = canonical.as_obj().unwrap();
        assert!(obj
            .record_get("left")
            .unwrap()
            .same(&obj.record_get("right").unwrap()));
    }

    /// A merge conflict between two branches resolves through the slot's
    /// merge hook.
    #[test]
    fn branch_conflict_resolves_through_slot_merge() {
        let slot = Subtext::with_merge(Value::str(""), |older, newer| {
            let (Value::Prim(Prim::Str(o)), Value::Prim(Prim::Str(n))) = (older, newer) else {
                return newer.clone();
            };
            Value::str(&format!("{}.{}", o, n))
        });
        let root = Supertext::empty();
        let left = root.branch(&[(slot.clone(), Value::str("qwer"))]);
        let right = root.branch(&[(slot.clone(), Value::str("zxcv"))]);
        let merged = Supertext::merge(&[left, right]);
        assert!(merged.read(&slot).same(&Value::str("qwer.zxcv")));
    }

    /// A task resolved synchronously inside its executor delivers its
    /// continuation before registration returns.
    #[test]
    fn settled_task_delivers_within_the_same_tick() {
        let delivered = Rc::new(Cell::new(false));
        let task = Task::new(|t| {
            t.resolve(Value::int(1));
            Ok(())
        });
        let flag = delivered.clone();
        task.map(move |v| {
            flag.set(true);
            v
        });
        assert!(delivered.get(), "continuation must run within the same tick");
    }

    /// A key-set superset is stable under permutation and distinct from its
    /// subset.
    #[test]
    fn keyset_superset_is_stable_and_distinct() {
        let mut map = KeySetMap::new(|keys: &[Value]| keys.len());
        let rogue = Obj::empty_record();
        let base = [
            Value::str("a"),
            Value::str("b"),
            Value::str("c"),
            Value::str("d"),
        ];
        let mut rogue_last = base.to_vec();
        rogue_last.push(Value::from(rogue.clone()));
        let mut rogue_first = vec![Value::from(rogue.clone())];
        rogue_first.extend(base.iter().cloned());

        let entry = map.lookup(&rogue_last);
        for _ in 0..8 {
            let again = map.lookup(&rogue_first);
            assert!(Rc::ptr_eq(&entry, &again));
        }
        let subset = map.lookup(&base);
        assert!(!Rc::ptr_eq(&entry, &subset));
        assert_eq!(*entry.data(), 5);
        assert_eq!(*subset.data(), 4);
    }

    /// Admission is idempotent, respects deep equality, and preserves
    /// structure.
    #[test]
    fn admission_invariants() {
        let canon = Canon::new();
        let build = || {
            record(&[
                (
                    "list",
                    Value::from(Obj::list([Value::int(1), Value::float(f64::NAN)])),
                ),
                ("date", Value::from(Obj::date(1234.5))),
            ])
        };
        let x = Value::from(build());
        let snapshot = Value::from(build());
        let cx = canon.admit(x).unwrap();
        assert!(canon.admit(cx.clone()).unwrap().same(&cx));
        let cy = canon.admit(snapshot.clone()).unwrap();
        assert!(cx.same(&cy));
        assert!(deep_equal(&cx, &snapshot));
    }

    /// Canonical cells make good tuple elements, and tuples respect
    /// element identity.
    #[test]
    fn tuples_over_canonical_cells() {
        let canon = Canon::new();
        let mut tuples = TupleInterner::new();
        let a = canon.admit(record(&[("k", Value::int(1))]).into()).unwrap();
        let b = canon.admit(record(&[("k", Value::int(1))]).into()).unwrap();
        // Same canonical cell, so the same interned tuple.
        let ta = tuples.tuple(&[a.clone(), Value::int(0)]);
        let tb = tuples.tuple(&[b, Value::int(0)]);
        assert!(ta.same(&tb));
        let tc = tuples.tuple(&[a, Value::int(1)]);
        assert!(!ta.same(&tc));
    }

    /// Digests agree exactly when admission collapses the inputs.
    #[test]
    fn digests_of_canonical_values() {
        let canon = Canon::new();
        let a = canon.admit(record(&[("x", Value::int(1))]).into()).unwrap();
        let b = canon.admit(record(&[("x", Value::int(1))]).into()).unwrap();
        assert_eq!(digest_value(&a), digest_value(&b));
        let c = canon.admit(record(&[("x", Value::int(2))]).into()).unwrap();
        assert_ne!(digest_value(&a), digest_value(&c));
    }
}
