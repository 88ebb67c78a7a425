//! Class-hook registry: deconstruction and materialization per class.
//!
//! Each registered class carries a `deconstruct` hook plus one of two
//! materialization shapes:
//! - *two-step* (`reconstruct`): for values immutable on construction (byte
//!   buffers, regex-like values, dates). Two-step classes can never appear
//!   inside a reference cycle.
//! - *three-step* (`allocate` + `repair`): allocation produces an empty
//!   shell eagerly so cyclic back-references can point at it before repair
//!   fills it in.
//!
//! Registration is one-way: once a class has been consulted by a lookup,
//! enabling a handler for it fails. A later registration could disagree with
//! the treatment of objects already admitted under the old answer.
//!
//! The registry owns the sorted-keys cache: sorting a record's key list is
//! interned through a trie, so repeated sorts of similar key lists reuse one
//! shared sorted array.

use crate::trie::WeakTrie;
use crate::value::{Body, ClassId, Obj, Prim, Slot, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

/// Failure raised by a user hook; propagates as fatal through admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookError(pub String);

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler hook failed: {}", self.0)
    }
}

impl std::error::Error for HookError {}

/// Materialization shape of a handler.
pub enum Materialize {
    /// Build the finished value from canonical children in one step.
    /// Only legal outside cycles.
    Reconstruct(Rc<dyn Fn(&[Value]) -> Result<Obj, HookError>>),
    /// Allocate an empty shell first, repair it once children are canonical.
    AllocateRepair {
        /// Produces an empty instance shaped like the input.
        allocate: Rc<dyn Fn(&Obj) -> Result<Obj, HookError>>,
        /// Fills the shell from canonical children.
        repair: Rc<dyn Fn(&Obj, &[Value]) -> Result<(), HookError>>,
    },
}

impl fmt::Debug for Materialize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Materialize::Reconstruct(_) => write!(f, "Reconstruct"),
            Materialize::AllocateRepair { .. } => write!(f, "AllocateRepair"),
        }
    }
}

/// Hook record for one class.
pub struct Handler {
    /// Flattens an instance into its child sequence.
    pub deconstruct: Rc<dyn Fn(&Obj) -> Result<Vec<Value>, HookError>>,
    /// How instances are rebuilt from canonical children.
    pub materialize: Materialize,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("materialize", &self.materialize)
            .finish_non_exhaustive()
    }
}

/// Error type for registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlersError {
    /// The class has already been consulted; registration would be
    /// inconsistent with previously admitted objects.
    EnableAfterLookup(ClassId),
    /// The class already has a handler.
    DuplicateHandler(ClassId),
}

impl fmt::Display for HandlersError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlersError::EnableAfterLookup(class) => {
                write!(f, "class {} was already looked up; handlers are frozen", class)
            }
            HandlersError::DuplicateHandler(class) => {
                write!(f, "class {} already has a handler", class)
            }
        }
    }
}

impl std::error::Error for HandlersError {}

type SortedKeys = Rc<[Rc<str>]>;
type SortedCache = Rc<RefCell<WeakTrie<Value, SortedKeys>>>;

/// Class-indexed registry of handlers.
///
/// # Invariants
/// - A consulted class can never gain a handler.
/// - Built-ins (sequence, record, date) are present from construction.
pub struct Handlers {
    map: HashMap<ClassId, Rc<Handler>>,
    consulted: HashSet<ClassId>,
    sorted_cache: SortedCache,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("registered", &self.map.len())
            .field("consulted", &self.consulted.len())
            .finish()
    }
}

impl Handlers {
    /// Creates a registry with the built-in handlers installed.
    pub fn new() -> Self {
        let sorted_cache: SortedCache = Rc::new(RefCell::new(WeakTrie::new(make_sorted)));
        let mut map = HashMap::new();
        map.insert(ClassId::LIST, Rc::new(list_handler()));
        map.insert(ClassId::RECORD, Rc::new(record_handler(sorted_cache.clone())));
        map.insert(ClassId::DATE, Rc::new(date_handler()));
        Self {
            map,
            consulted: HashSet::new(),
            sorted_cache,
        }
    }

    /// Registers a handler for `class`.
    ///
    /// Fails if the class has ever been looked up, or already has a handler.
    pub fn enable(&mut self, class: ClassId, handler: Handler) -> Result<(), HandlersError> {
        if self.consulted.contains(&class) {
            return Err(HandlersError::EnableAfterLookup(class));
        }
        if self.map.contains_key(&class) {
            return Err(HandlersError::DuplicateHandler(class));
        }
        self.map.insert(class, Rc::new(handler));
        Ok(())
    }

    /// Looks up the handler for `class`, marking the class consulted either
    /// way. Classes without a handler are opaque to the canonicalizer.
    pub fn lookup(&mut self, class: ClassId) -> Option<Rc<Handler>> {
        self.consulted.insert(class);
        self.map.get(&class).cloned()
    }

    /// Whether the class has ever been consulted.
    pub fn was_consulted(&self, class: ClassId) -> bool {
        self.consulted.contains(&class)
    }

    /// Interned sorted form of a key list. Equal key lists (by content)
    /// share one result array.
    pub fn sorted_keys(&self, keys: &[Rc<str>]) -> SortedKeys {
        sorted_via(&self.sorted_cache, keys)
    }
}

impl Default for Handlers {
    fn default() -> Self {
        Self::new()
    }
}

fn make_sorted(path: &[Value]) -> SortedKeys {
    let mut keys: Vec<Rc<str>> = path
        .iter()
        .map(|v| match v {
            Value::Prim(Prim::Str(s)) => s.clone(),
            _ => unreachable!("sorted-keys cache paths are strings"),
        })
        .collect();
    keys.sort();
    keys.into()
}

fn sorted_via(cache: &SortedCache, keys: &[Rc<str>]) -> SortedKeys {
    let path: Vec<Value> = keys
        .iter()
        .map(|k| Value::Prim(Prim::Str(k.clone())))
        .collect();
    cache.borrow_mut().lookup_array(&path).clone()
}

/// Built-in sequence handler (three-step; sequences may sit in cycles).
///
/// Child encoding: `[len, idx0, v0, idx1, v1, ...]` with one `(index, value)`
/// pair per *defined* slot. Holes are exactly the missing indices, which
/// keeps them distinguishable from a defined `undefined` in canonical form.
fn list_handler() -> Handler {
    Handler {
        deconstruct: Rc::new(|obj| {
            let body = obj.body();
            let Body::List(slots) = &*body else {
                return Err(HookError("sequence handler on non-sequence".into()));
            };
            let mut children = Vec::with_capacity(1 + slots.len() * 2);
            children.push(Value::int(slots.len() as i64));
            for (at, slot) in slots.iter().enumerate() {
                if let Slot::Val(v) = slot {
                    children.push(Value::int(at as i64));
                    children.push(v.clone());
                }
            }
            Ok(children)
        }),
        materialize: Materialize::AllocateRepair {
            allocate: Rc::new(|_| Ok(Obj::list_with_holes([]))),
            repair: Rc::new(|obj, children| {
                let mut parts = children.iter();
                let Some(Value::Prim(Prim::Int(len))) = parts.next() else {
                    return Err(HookError("sequence children missing length".into()));
                };
                let mut slots = vec![Slot::Hole; *len as usize];
                while let Some(idx) = parts.next() {
                    let (Value::Prim(Prim::Int(at)), Some(v)) = (idx, parts.next()) else {
                        return Err(HookError("malformed sequence children".into()));
                    };
                    slots[*at as usize] = Slot::Val(v.clone());
                }
                match &mut *obj.body_mut().map_err(|e| HookError(e.to_string()))? {
                    Body::List(target) => {
                        *target = slots;
                        Ok(())
                    }
                    _ => Err(HookError("sequence repair on non-sequence".into())),
                }
            }),
        },
    }
}

/// Built-in plain-mapping handler (three-step).
///
/// Child encoding: sorted keys interleaved with values,
/// `[k0, v0, k1, v1, ...]`. Keys whose value is `undefined` are dropped —
/// they are indistinguishable from missing keys under deep equality, so they
/// must not distinguish canonical forms either.
fn record_handler(cache: SortedCache) -> Handler {
    Handler {
        deconstruct: Rc::new(move |obj| {
            let body = obj.body();
            let Body::Record(record) = &*body else {
                return Err(HookError("record handler on non-record".into()));
            };
            let defined: Vec<Rc<str>> = record
                .entries()
                .filter(|(_, v)| !matches!(v, Value::Prim(Prim::Undefined)))
                .map(|(k, _)| k.clone())
                .collect();
            let sorted = sorted_via(&cache, &defined);
            let mut children = Vec::with_capacity(sorted.len() * 2);
            for key in sorted.iter() {
                children.push(Value::Prim(Prim::Str(key.clone())));
                children.push(record.get(key).cloned().unwrap_or(Value::undefined()));
            }
            Ok(children)
        }),
        materialize: Materialize::AllocateRepair {
            allocate: Rc::new(|_| Ok(Obj::empty_record())),
            repair: Rc::new(|obj, children| {
                let mut parts = children.iter();
                while let Some(key) = parts.next() {
                    let (Value::Prim(Prim::Str(k)), Some(v)) = (key, parts.next()) else {
                        return Err(HookError("malformed record children".into()));
                    };
                    obj.record_set(k, v.clone())
                        .map_err(|e| HookError(e.to_string()))?;
                }
                Ok(())
            }),
        },
    }
}

/// Built-in date handler (two-step; dates are immutable on construction).
fn date_handler() -> Handler {
    Handler {
        deconstruct: Rc::new(|obj| {
            let body = obj.body();
            let Body::Date(ms) = &*body else {
                return Err(HookError("date handler on non-date".into()));
            };
            Ok(vec![Value::float(*ms)])
        }),
        materialize: Materialize::Reconstruct(Rc::new(|children| {
            let [Value::Prim(Prim::Float(ms))] = children else {
                return Err(HookError("malformed date children".into()));
            };
            Ok(Obj::date(*ms))
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_present() {
        let mut handlers = Handlers::new();
        assert!(handlers.lookup(ClassId::LIST).is_some());
        assert!(handlers.lookup(ClassId::RECORD).is_some());
        assert!(handlers.lookup(ClassId::DATE).is_some());
        assert!(handlers.lookup(ClassId::BYTES).is_none());
    }

    #[test]
    fn enable_after_lookup_fails() {
        let mut handlers = Handlers::new();
        let class = ClassId::fresh();
        assert!(handlers.lookup(class).is_none());
        let result = handlers.enable(class, date_handler());
        assert_eq!(result, Err(HandlersError::EnableAfterLookup(class)));
    }

    #[test]
    fn enable_then_lookup() {
        let mut handlers = Handlers::new();
        let class = ClassId::fresh();
        handlers.enable(class, date_handler()).unwrap();
        assert!(handlers.lookup(class).is_some());
        // Second enable for the same class is rejected outright.
        let result = handlers.enable(class, date_handler());
        assert!(result.is_err());
    }

    #[test]
    fn sorted_keys_interned() {
        let handlers = Handlers::new();
        let keys: Vec<Rc<str>> = vec!["b".into(), "a".into(), "c".into()];
        let first = handlers.sorted_keys(&keys);
        let second = handlers.sorted_keys(&keys);
        assert!(Rc::ptr_eq(&first, &second));
        let ordered: Vec<&str> = first.iter().map(|k| &**k).collect();
        assert_eq!(ordered, vec!["a", "b", "c"]);
        // A different list interns separately.
        let other = handlers.sorted_keys(&keys[..2]);
        assert!(!Rc::ptr_eq(&first, &other));
    }

    #[test]
    fn record_deconstruct_sorts_and_drops_undefined() {
        let mut handlers = Handlers::new();
        let obj = Obj::empty_record();
        obj.record_set("z", Value::int(1)).unwrap();
        obj.record_set("a", Value::int(2)).unwrap();
        obj.record_set("m", Value::undefined()).unwrap();
        let handler = handlers.lookup(ClassId::RECORD).unwrap();
        let children = (handler.deconstruct)(&obj).unwrap();
        let keys: Vec<String> = children
            .iter()
            .step_by(2)
            .map(|v| v.to_string())
            .collect();
        assert_eq!(keys, vec!["\"a\"", "\"z\""]);
    }

    #[test]
    fn list_roundtrip_preserves_holes() {
        let mut handlers = Handlers::new();
        let obj = Obj::list_with_holes([
            crate::value::Slot::Val(Value::int(1)),
            crate::value::Slot::Hole,
            crate::value::Slot::Val(Value::undefined()),
        ]);
        let handler = handlers.lookup(ClassId::LIST).unwrap();
        let children = (handler.deconstruct)(&obj).unwrap();
        let Materialize::AllocateRepair { allocate, repair } = &handler.materialize else {
            panic!("sequence handler must be three-step");
        };
        let rebuilt = allocate(&obj).unwrap();
        repair(&rebuilt, &children).unwrap();
        match &*rebuilt.body() {
            Body::List(slots) => {
                assert_eq!(slots.len(), 3);
                assert!(slots[0].value().is_some());
                assert!(slots[1].value().is_none());
                assert!(slots[2].value().is_some());
            }
            _ => unreachable!(),
        };
    }
}
