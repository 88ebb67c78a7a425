//! Core value model: primitives, reference cells, and class identity.
//!
//! Every engine in this crate operates on a single dynamic value type,
//! `Value`, which is either a `Prim` (compared by value, never weakly held)
//! or an `Obj` (an `Rc`-backed heap cell with pointer identity, eligible for
//! weak holding). This mirrors the primitive/reference split that drives key
//! classification in the weak trie and the key-set map.
//!
//! Reference cells carry a runtime `ClassId` — the class-identity analog the
//! handler registry dispatches on — and a `Body` describing their structural
//! content. Cells may be frozen; a frozen cell rejects every mutation
//! permanently, which is what makes canonical representatives safe to share.
//!
//! # Invariants
//! - `Obj` equality and hashing are pointer identity; two cells with equal
//!   bodies are distinct values until the canonicalizer says otherwise.
//! - Once `freeze` has been called on a cell, no mutator succeeds.
//! - `PrimKey` is a total `Eq + Hash` encoding of `Prim`: floats compare by
//!   bit pattern with a single canonical NaN, so `NaN` keys behave as one key.
//!
//! # Citations
//! - Weak references and reachability-based reclamation: Hayes, "Ephemerons:
//!   a new finalization mechanism" (OOPSLA 1997)
//! - Pointer identity vs structural equality: Baker, "Equal rights for
//!   functional objects" (1993)

use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

/// Runtime class identity for reference cells.
///
/// The low range is reserved for built-in classes; user classes are allocated
/// from [`ClassId::fresh`]. A cell's class never changes after construction.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(u32);

/// First identifier handed out by [`ClassId::fresh`].
const FIRST_USER_CLASS: u32 = 32;

thread_local! {
    static NEXT_CLASS: Cell<u32> = const { Cell::new(FIRST_USER_CLASS) };
}

impl ClassId {
    /// Sequences and arrays.
    pub const LIST: ClassId = ClassId(0);
    /// Plain string-keyed mappings.
    pub const RECORD: ClassId = ClassId(1);
    /// Calendar dates (milliseconds since the epoch).
    pub const DATE: ClassId = ClassId(2);
    /// Byte buffers.
    pub const BYTES: ClassId = ClassId(3);
    /// Error-like values (name + message).
    pub const ERROR: ClassId = ClassId(4);
    /// Regex-like values compared by string form.
    pub const REGEX: ClassId = ClassId(5);
    /// Boxed numbers.
    pub const BOXED_NUM: ClassId = ClassId(6);
    /// Boxed booleans.
    pub const BOXED_BOOL: ClassId = ClassId(7);
    /// Boxed strings.
    pub const BOXED_STR: ClassId = ClassId(8);
    /// Insertion-ordered sets.
    pub const SET: ClassId = ClassId(9);
    /// Insertion-ordered maps.
    pub const MAP: ClassId = ClassId(10);
    /// Function-like values.
    pub const FUNC: ClassId = ClassId(11);

    /// Allocates a fresh user class identifier.
    ///
    /// Identifiers are unique per thread, which matches the crate's
    /// single-threaded ownership model.
    pub fn fresh() -> Self {
        NEXT_CLASS.with(|next| {
            let id = next.get();
            next.set(id.checked_add(1).expect("class identifier space exhausted"));
            ClassId(id)
        })
    }

    /// Returns the raw `u32` representation.
    #[inline]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this identifier names one of the built-in classes.
    #[inline]
    pub const fn is_builtin(&self) -> bool {
        self.0 < FIRST_USER_CLASS
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ClassId::LIST => write!(f, "list"),
            ClassId::RECORD => write!(f, "record"),
            ClassId::DATE => write!(f, "date"),
            ClassId::BYTES => write!(f, "bytes"),
            ClassId::ERROR => write!(f, "error"),
            ClassId::REGEX => write!(f, "regex"),
            ClassId::BOXED_NUM => write!(f, "boxed-num"),
            ClassId::BOXED_BOOL => write!(f, "boxed-bool"),
            ClassId::BOXED_STR => write!(f, "boxed-str"),
            ClassId::SET => write!(f, "set"),
            ClassId::MAP => write!(f, "map"),
            ClassId::FUNC => write!(f, "func"),
            ClassId(raw) => write!(f, "class#{}", raw),
        }
    }
}

/// Unboxed primitive values, compared by value everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prim {
    /// The missing-by-convention value.
    Undefined,
    /// The deliberate absence value.
    Null,
    /// Booleans.
    Bool(bool),
    /// Signed integers.
    Int(i64),
    /// Floating point numbers. `NaN` compares unequal here but equal in deep
    /// equality and in `PrimKey` form.
    Float(f64),
    /// Immutable strings.
    Str(Rc<str>),
}

impl Prim {
    /// Returns the total-equality key form of this primitive.
    pub fn key(&self) -> PrimKey {
        match self {
            Prim::Undefined => PrimKey::Undefined,
            Prim::Null => PrimKey::Null,
            Prim::Bool(b) => PrimKey::Bool(*b),
            Prim::Int(i) => PrimKey::Int(*i),
            Prim::Float(x) => PrimKey::Float(canonical_float_bits(*x)),
            Prim::Str(s) => PrimKey::Str(s.clone()),
        }
    }
}

/// Collapses every NaN to one bit pattern and `-0.0` to `+0.0` so that float
/// keys have a total, reflexive equality.
#[inline]
fn canonical_float_bits(x: f64) -> u64 {
    if x.is_nan() {
        f64::NAN.to_bits()
    } else if x == 0.0 {
        0u64
    } else {
        x.to_bits()
    }
}

/// Total `Eq + Hash` encoding of a primitive, used as a strong trie key and
/// as an index key in the key-set map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrimKey {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    /// Canonicalized bit pattern (single NaN, positive zero).
    Float(u64),
    Str(Rc<str>),
}

/// A slot in a sequence body: either a defined value or a hole.
///
/// Holes are distinguishable from a defined `undefined` in both deep equality
/// and canonical form.
#[derive(Debug, Clone)]
pub enum Slot {
    /// Index present but never assigned.
    Hole,
    /// A defined value (possibly `Prim::Undefined`).
    Val(Value),
}

impl Slot {
    /// Returns the contained value, or `None` for a hole.
    #[inline]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Slot::Hole => None,
            Slot::Val(v) => Some(v),
        }
    }
}

/// Insertion-ordered string-keyed mapping.
///
/// Iteration follows first-insertion order; updating an existing key keeps
/// its position. Key order is observable, which is why the handler layer
/// sorts keys (through the sorted-keys cache) before building traces.
#[derive(Debug, Clone, Default)]
pub struct Record {
    order: Vec<Rc<str>>,
    map: HashMap<Rc<str>, Value>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of present keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no keys are present.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Whether the key is present (even if its value is `undefined`).
    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or updates a key. New keys append to the order.
    pub fn set(&mut self, key: Rc<str>, value: Value) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push(key);
        }
    }

    /// Removes a key. Returns the previous value if present.
    pub fn delete(&mut self, key: &str) -> Option<Value> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.order.retain(|k| &**k != key);
        }
        removed
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &Rc<str>> {
        self.order.iter()
    }

    /// `(key, value)` pairs in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&Rc<str>, &Value)> {
        self.order.iter().map(move |k| (k, &self.map[k]))
    }
}

/// Membership key for ordered sets and maps: identity for references,
/// value for primitives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MemberKey {
    Prim(PrimKey),
    Ref(usize),
}

impl MemberKey {
    fn of(value: &Value) -> Self {
        match value {
            Value::Prim(p) => MemberKey::Prim(p.key()),
            Value::Obj(o) => MemberKey::Ref(o.addr()),
        }
    }
}

/// Insertion-ordered set with identity-or-value membership.
#[derive(Debug, Clone, Default)]
pub struct OrderedSet {
    entries: Vec<Value>,
    index: HashSet<MemberKey>,
}

impl OrderedSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no members.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a member if not already present. Returns whether it was added.
    pub fn add(&mut self, value: Value) -> bool {
        if self.index.insert(MemberKey::of(&value)) {
            self.entries.push(value);
            true
        } else {
            false
        }
    }

    /// Membership test.
    pub fn contains(&self, value: &Value) -> bool {
        self.index.contains(&MemberKey::of(value))
    }

    /// Members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter()
    }
}

/// Insertion-ordered map with identity-or-value keys.
#[derive(Debug, Clone, Default)]
pub struct OrderedMap {
    entries: Vec<(Value, Value)>,
    index: HashMap<MemberKey, usize>,
}

impl OrderedMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or updates a key.
    pub fn set(&mut self, key: Value, value: Value) {
        match self.index.get(&MemberKey::of(&key)) {
            Some(&at) => self.entries[at].1 = value,
            None => {
                self.index.insert(MemberKey::of(&key), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Looks up a key.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.index
            .get(&MemberKey::of(key))
            .map(|&at| &self.entries[at].1)
    }

    /// Whether the key is present.
    pub fn has(&self, key: &Value) -> bool {
        self.index.contains_key(&MemberKey::of(key))
    }

    /// `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

/// Function-like content. Calling is out of scope; only the identity-or-source
/// equality rule needs representation.
#[derive(Debug, Clone)]
pub struct FuncBody {
    /// Stringified source, when available.
    pub source: Option<Rc<str>>,
    /// Whether the source form is censored (native), which defeats
    /// source-based equality.
    pub native: bool,
}

/// Extension point for equality over otherwise-opaque reference cells.
///
/// Consulted symmetrically: both sides must agree before two opaque cells
/// compare equal. `recurse` re-enters the deep-equality engine (cycle guard
/// included) for nested values.
pub trait OpaqueEq: fmt::Debug {
    /// Structural comparison against another cell.
    fn deep_equals(&self, other: &Obj, recurse: &mut dyn FnMut(&Value, &Value) -> bool) -> bool;
}

/// Structural content of a reference cell.
#[derive(Debug, Clone)]
pub enum Body {
    /// Sequence with holes.
    List(Vec<Slot>),
    /// Plain string-keyed mapping.
    Record(Record),
    /// Byte buffer.
    Bytes(Vec<u8>),
    /// Milliseconds since the epoch; NaN means an invalid date.
    Date(f64),
    /// Error-like value.
    Error {
        /// Error class name.
        name: Rc<str>,
        /// Human-readable message.
        message: Rc<str>,
    },
    /// Regex-like value compared by its string form.
    Regex(Rc<str>),
    /// Boxed number.
    BoxedNum(f64),
    /// Boxed boolean.
    BoxedBool(bool),
    /// Boxed string.
    BoxedStr(Rc<str>),
    /// Insertion-ordered set.
    Set(OrderedSet),
    /// Insertion-ordered map.
    Map(OrderedMap),
    /// Function-like value.
    Func(FuncBody),
    /// User-defined content with optional equality adapter.
    Opaque(Rc<dyn OpaqueEq>),
}

/// Error type for value mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueError {
    /// The cell is frozen; mutation is permanently rejected.
    Frozen,
    /// The body kind does not support the requested operation.
    KindMismatch,
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueError::Frozen => write!(f, "cell is frozen"),
            ValueError::KindMismatch => write!(f, "body kind does not support this operation"),
        }
    }
}

impl std::error::Error for ValueError {}

/// Heap cell behind an [`Obj`].
///
/// # Invariants
/// - `class` never changes after construction.
/// - After `frozen` flips to true it never flips back, and `body` is never
///   mutated again.
pub struct ObjCell {
    class: ClassId,
    frozen: Cell<bool>,
    body: RefCell<Body>,
}

impl fmt::Debug for ObjCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjCell")
            .field("class", &self.class)
            .field("frozen", &self.frozen.get())
            .field("body", &*self.body.borrow())
            .finish()
    }
}

/// A reference-like value: shared ownership of a heap cell with pointer
/// identity.
#[derive(Debug, Clone)]
pub struct Obj {
    cell: Rc<ObjCell>,
}

/// Weak counterpart of [`Obj`], used wherever keys must not keep their
/// referents alive.
#[derive(Debug, Clone)]
pub struct WeakObj {
    cell: Weak<ObjCell>,
    /// Address captured at downgrade time, for index bookkeeping after the
    /// cell has died.
    addr: usize,
}

impl WeakObj {
    /// Attempts to restore a strong reference.
    pub fn upgrade(&self) -> Option<Obj> {
        self.cell.upgrade().map(|cell| Obj { cell })
    }

    /// Address the referent had when this weak handle was created.
    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Whether the referent is still alive.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.cell.strong_count() > 0
    }
}

impl Obj {
    /// Creates a cell with an explicit class (user classes).
    pub fn with_class(class: ClassId, body: Body) -> Self {
        Obj {
            cell: Rc::new(ObjCell {
                class,
                frozen: Cell::new(false),
                body: RefCell::new(body),
            }),
        }
    }

    /// Creates a sequence cell from defined values (no holes).
    pub fn list<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Self::with_class(
            ClassId::LIST,
            Body::List(items.into_iter().map(Slot::Val).collect()),
        )
    }

    /// Creates a sequence cell from slots, preserving holes.
    pub fn list_with_holes<I: IntoIterator<Item = Slot>>(slots: I) -> Self {
        Self::with_class(ClassId::LIST, Body::List(slots.into_iter().collect()))
    }

    /// Creates a record cell from `(key, value)` pairs.
    pub fn record<I: IntoIterator<Item = (Rc<str>, Value)>>(pairs: I) -> Self {
        let mut record = Record::new();
        for (k, v) in pairs {
            record.set(k, v);
        }
        Self::with_class(ClassId::RECORD, Body::Record(record))
    }

    /// Creates an empty record cell.
    pub fn empty_record() -> Self {
        Self::with_class(ClassId::RECORD, Body::Record(Record::new()))
    }

    /// Creates a byte-buffer cell.
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self::with_class(ClassId::BYTES, Body::Bytes(bytes))
    }

    /// Creates a date cell.
    pub fn date(epoch_ms: f64) -> Self {
        Self::with_class(ClassId::DATE, Body::Date(epoch_ms))
    }

    /// Creates an error-like cell.
    pub fn error(name: &str, message: &str) -> Self {
        Self::with_class(
            ClassId::ERROR,
            Body::Error {
                name: name.into(),
                message: message.into(),
            },
        )
    }

    /// Creates a regex-like cell from its string form.
    pub fn regex(source: &str) -> Self {
        Self::with_class(ClassId::REGEX, Body::Regex(source.into()))
    }

    /// Creates a boxed number cell.
    pub fn boxed_num(value: f64) -> Self {
        Self::with_class(ClassId::BOXED_NUM, Body::BoxedNum(value))
    }

    /// Creates a boxed boolean cell.
    pub fn boxed_bool(value: bool) -> Self {
        Self::with_class(ClassId::BOXED_BOOL, Body::BoxedBool(value))
    }

    /// Creates a boxed string cell.
    pub fn boxed_str(value: &str) -> Self {
        Self::with_class(ClassId::BOXED_STR, Body::BoxedStr(value.into()))
    }

    /// Creates an ordered-set cell.
    pub fn set<I: IntoIterator<Item = Value>>(items: I) -> Self {
        let mut set = OrderedSet::new();
        for item in items {
            set.add(item);
        }
        Self::with_class(ClassId::SET, Body::Set(set))
    }

    /// Creates an ordered-map cell.
    pub fn map<I: IntoIterator<Item = (Value, Value)>>(pairs: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in pairs {
            map.set(k, v);
        }
        Self::with_class(ClassId::MAP, Body::Map(map))
    }

    /// Creates a function-like cell with visible source.
    pub fn func(source: &str) -> Self {
        Self::with_class(
            ClassId::FUNC,
            Body::Func(FuncBody {
                source: Some(source.into()),
                native: false,
            }),
        )
    }

    /// Creates a function-like cell whose source form is censored.
    pub fn native_func() -> Self {
        Self::with_class(
            ClassId::FUNC,
            Body::Func(FuncBody {
                source: None,
                native: true,
            }),
        )
    }

    /// Creates an opaque cell with a user equality adapter and a fresh class.
    pub fn opaque(ext: Rc<dyn OpaqueEq>) -> Self {
        Self::with_class(ClassId::fresh(), Body::Opaque(ext))
    }

    /// The cell's class identity.
    #[inline]
    pub fn class(&self) -> ClassId {
        self.cell.class
    }

    /// Pointer identity as an address. Stable for the cell's lifetime.
    #[inline]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.cell) as usize
    }

    /// Whether `self` and `other` are the same cell.
    #[inline]
    pub fn same(&self, other: &Obj) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    /// Creates a weak handle.
    pub fn downgrade(&self) -> WeakObj {
        WeakObj {
            cell: Rc::downgrade(&self.cell),
            addr: self.addr(),
        }
    }

    /// Whether the cell has been frozen.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.cell.frozen.get()
    }

    /// Freezes the cell. Idempotent; mutation is rejected from here on.
    pub fn freeze(&self) {
        self.cell.frozen.set(true);
    }

    /// Read access to the body.
    pub fn body(&self) -> std::cell::Ref<'_, Body> {
        self.cell.body.borrow()
    }

    /// Mutable access to the body, rejected once frozen.
    pub fn body_mut(&self) -> Result<std::cell::RefMut<'_, Body>, ValueError> {
        if self.is_frozen() {
            return Err(ValueError::Frozen);
        }
        Ok(self.cell.body.borrow_mut())
    }

    /// Appends to a sequence body.
    pub fn list_push(&self, value: Value) -> Result<(), ValueError> {
        match &mut *self.body_mut()? {
            Body::List(slots) => {
                slots.push(Slot::Val(value));
                Ok(())
            }
            _ => Err(ValueError::KindMismatch),
        }
    }

    /// Sets a record field.
    pub fn record_set(&self, key: &str, value: Value) -> Result<(), ValueError> {
        match &mut *self.body_mut()? {
            Body::Record(record) => {
                record.set(key.into(), value);
                Ok(())
            }
            _ => Err(ValueError::KindMismatch),
        }
    }

    /// Reads a record field. `None` when missing or not a record.
    pub fn record_get(&self, key: &str) -> Option<Value> {
        match &*self.body() {
            Body::Record(record) => record.get(key).cloned(),
            _ => None,
        }
    }
}

impl PartialEq for Obj {
    /// Pointer identity.
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Obj {}

impl std::hash::Hash for Obj {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

/// A dynamic value: primitive or reference cell.
#[derive(Debug, Clone)]
pub enum Value {
    /// Compared by value, held strongly everywhere.
    Prim(Prim),
    /// Compared by identity, eligible for weak holding.
    Obj(Obj),
}

impl Value {
    /// Shorthand for `Prim::Undefined`.
    pub const fn undefined() -> Self {
        Value::Prim(Prim::Undefined)
    }

    /// Shorthand for `Prim::Null`.
    pub const fn null() -> Self {
        Value::Prim(Prim::Null)
    }

    /// Shorthand for an integer primitive.
    pub const fn int(i: i64) -> Self {
        Value::Prim(Prim::Int(i))
    }

    /// Shorthand for a float primitive.
    pub const fn float(x: f64) -> Self {
        Value::Prim(Prim::Float(x))
    }

    /// Shorthand for a boolean primitive.
    pub const fn bool(b: bool) -> Self {
        Value::Prim(Prim::Bool(b))
    }

    /// Shorthand for a string primitive.
    pub fn str(s: &str) -> Self {
        Value::Prim(Prim::Str(s.into()))
    }

    /// Whether this is a reference cell.
    #[inline]
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    /// The reference cell, if any.
    pub fn as_obj(&self) -> Option<&Obj> {
        match self {
            Value::Obj(o) => Some(o),
            Value::Prim(_) => None,
        }
    }

    /// Identity-or-value equality: the "identical" relation of the data
    /// model. `NaN` is identical to `NaN`.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Prim(a), Value::Prim(b)) => a.key() == b.key(),
            (Value::Obj(a), Value::Obj(b)) => a.same(b),
            _ => false,
        }
    }
}

impl From<Obj> for Value {
    fn from(o: Obj) -> Self {
        Value::Obj(o)
    }
}

impl From<Prim> for Value {
    fn from(p: Prim) -> Self {
        Value::Prim(p)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Prim(Prim::Undefined) => write!(f, "undefined"),
            Value::Prim(Prim::Null) => write!(f, "null"),
            Value::Prim(Prim::Bool(b)) => write!(f, "{}", b),
            Value::Prim(Prim::Int(i)) => write!(f, "{}", i),
            Value::Prim(Prim::Float(x)) => write!(f, "{}", x),
            Value::Prim(Prim::Str(s)) => write!(f, "{:?}", s),
            Value::Obj(o) => write!(f, "<{} @{:x}>", o.class(), o.addr()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_vs_structure() {
        let a = Obj::list([Value::int(1)]);
        let b = Obj::list([Value::int(1)]);
        assert!(a.same(&a));
        assert!(!a.same(&b));
        assert!(Value::from(a.clone()).same(&Value::from(a.clone())));
    }

    #[test]
    fn prim_key_totality() {
        assert_eq!(
            Prim::Float(f64::NAN).key(),
            Prim::Float(f64::from_bits(0x7ff8_dead_beef_0001)).key()
        );
        assert_eq!(Prim::Float(0.0).key(), Prim::Float(-0.0).key());
        assert_ne!(Prim::Int(1).key(), Prim::Float(1.0).key());
        assert!(Value::float(f64::NAN).same(&Value::float(f64::NAN)));
    }

    #[test]
    fn freeze_rejects_mutation() {
        let o = Obj::empty_record();
        o.record_set("a", Value::int(1)).unwrap();
        o.freeze();
        assert!(o.is_frozen());
        assert_eq!(o.record_set("b", Value::int(2)), Err(ValueError::Frozen));
        assert!(o.record_get("a").unwrap().same(&Value::int(1)));
    }

    #[test]
    fn record_insertion_order() {
        let o = Obj::empty_record();
        o.record_set("b", Value::int(1)).unwrap();
        o.record_set("a", Value::int(2)).unwrap();
        o.record_set("b", Value::int(3)).unwrap();
        match &*o.body() {
            Body::Record(r) => {
                let keys: Vec<_> = r.keys().map(|k| k.to_string()).collect();
                assert_eq!(keys, vec!["b", "a"]);
                assert!(r.get("b").unwrap().same(&Value::int(3)));
            }
            _ => unreachable!(),
        };
    }

    #[test]
    fn ordered_set_membership() {
        let shared = Obj::empty_record();
        let mut set = OrderedSet::new();
        assert!(set.add(Value::from(shared.clone())));
        assert!(!set.add(Value::from(shared.clone())));
        assert!(set.add(Value::int(1)));
        assert!(set.contains(&Value::int(1)));
        assert!(set.contains(&Value::from(shared)));
        assert!(!set.contains(&Value::from(Obj::empty_record())));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn weak_obj_dies_with_referent() {
        let o = Obj::empty_record();
        let w = o.downgrade();
        assert!(w.is_live());
        assert!(w.upgrade().is_some());
        drop(o);
        assert!(!w.is_live());
        assert!(w.upgrade().is_none());
    }

    #[test]
    fn fresh_classes_are_distinct() {
        let a = ClassId::fresh();
        let b = ClassId::fresh();
        assert_ne!(a, b);
        assert!(!a.is_builtin());
        assert!(ClassId::LIST.is_builtin());
    }

    #[test]
    fn holes_are_not_undefined() {
        let o = Obj::list_with_holes([Slot::Hole, Slot::Val(Value::undefined())]);
        match &*o.body() {
            Body::List(slots) => {
                assert!(slots[0].value().is_none());
                assert!(slots[1].value().is_some());
            }
            _ => unreachable!(),
        };
    }
}
