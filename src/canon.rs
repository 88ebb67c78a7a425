//! Deep-structural canonicalization: deeply equal object graphs collapse to
//! shared frozen representatives.
//!
//! `admit` partitions the input graph into strongly connected components
//! (leaves first), then resolves one component at a time. Each component is
//! *scanned* into a trace — a flat, reference-free fingerprint starting from
//! one member — and the trace is interned through a weak trie pool. A pool
//! hit reuses the existing canonical cell; a miss materializes a new one
//! (allocate-then-repair for cycle-capable classes, reconstruct for
//! immutable ones), freezes it, and adds it to the known set.
//!
//! A trace entry is a class marker, a canonical leaf value, or a numeric
//! back-reference to the position where an in-component child was first
//! scanned. The back-reference lives in its own token namespace, so it can
//! never collide with an ordinary child value.
//!
//! Admission quotients by bisimilarity: members of a symmetric component
//! produce identical traces and therefore share one representative. The scan
//! is repeated per member with a re-labelling loop until the member-to-node
//! assignment converges; the canonicalizer never re-partitions inside a
//! component.
//!
//! Callers must not reuse input objects after admission. The canonicalizer
//! may observe them again, and opaque branches pass through by reference.
//!
//! # Citations
//! - Hash consing: Filliâtre & Conchon, "Type-safe modular hash-consing"
//!   (ML Workshop 2006)
//! - Canonical forms of cyclic structures: Mauborgne, "Incremental unique
//!   representation of directed acyclic graphs" (1999)

use crate::components::{partition, Partitioned};
use crate::handlers::{Handlers, HookError, Materialize};
use crate::trie::{Classified, StrongKey, TrieKey, WeakTrie};
use crate::value::{ClassId, Obj, Value, WeakObj};
use std::cell::{Cell, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// One entry of a canonical trace.
///
/// The sum type is what keeps token namespaces apart: a `BackRef` can never
/// be confused with a numeric leaf, and a `Class` marker can never be
/// confused with user data.
#[derive(Debug, Clone)]
pub enum TraceToken {
    /// Class marker opening one scanned member.
    Class(ClassId),
    /// A child outside the component: a primitive, an opaque reference, or
    /// an already-canonical cell.
    Leaf(Value),
    /// Trace position at which an in-component child was first scanned.
    BackRef(usize),
}

impl TrieKey for TraceToken {
    type Guard = WeakObj;

    fn classify(&self) -> Classified<WeakObj> {
        match self {
            TraceToken::Class(class) => Classified::Strong(StrongKey::Class(class.as_u32())),
            TraceToken::BackRef(at) => Classified::Strong(StrongKey::Index(*at as u64)),
            TraceToken::Leaf(value) => value.classify(),
        }
    }
}

/// Error type for canonicalization.
///
/// Everything except `Hook` indicates an internal invariant violation; none
/// of these arise on well-formed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonError {
    /// The root was mapped as canonical mid-admission.
    RootAlreadyCanonical,
    /// Reentrant admission (a hook called back into `admit`).
    AlreadyPartitioning,
    /// A member's canonical reference could not be resolved.
    UnresolvedKnown,
    /// A two-step class participates in a cycle; cycle-capable classes must
    /// register allocate + repair.
    CycleNeedsAllocator(ClassId),
    /// A user hook failed; admission aborts without committing.
    Hook(HookError),
}

impl fmt::Display for CanonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonError::RootAlreadyCanonical => write!(f, "root already canonical"),
            CanonError::AlreadyPartitioning => write!(f, "already partitioning"),
            CanonError::UnresolvedKnown => write!(f, "could not resolve known value"),
            CanonError::CycleNeedsAllocator(class) => {
                write!(f, "class {} is cyclic but registered two-step handlers", class)
            }
            CanonError::Hook(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CanonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CanonError::Hook(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HookError> for CanonError {
    fn from(err: HookError) -> Self {
        CanonError::Hook(err)
    }
}

/// Scan identity of a member: its assigned node once one exists, itself
/// before that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScanKey {
    Member(usize),
    Node(usize),
}

fn scan_key(assign: &HashMap<usize, Obj>, m: usize) -> ScanKey {
    match assign.get(&m) {
        Some(node) => ScanKey::Node(node.addr()),
        None => ScanKey::Member(m),
    }
}

/// The canonicalizer: handler registry, trace pool, and known set.
///
/// # Invariants
/// - Every member of the known set is frozen and never mutated again.
/// - For deeply equal, handler-covered inputs `a` and `b`,
///   `admit(a)` and `admit(b)` return the same reference.
pub struct Canon {
    handlers: RefCell<Handlers>,
    pool: RefCell<WeakTrie<TraceToken, Option<WeakObj>>>,
    known: RefCell<HashMap<usize, WeakObj>>,
    admitting: Cell<bool>,
}

impl fmt::Debug for Canon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canon")
            .field("known", &self.known.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Canon {
    /// Creates a canonicalizer with the built-in handlers.
    pub fn new() -> Self {
        Self::with_handlers(Handlers::new())
    }

    /// Creates a canonicalizer over a prepared registry.
    pub fn with_handlers(handlers: Handlers) -> Self {
        Self {
            handlers: RefCell::new(handlers),
            pool: RefCell::new(WeakTrie::new(|_| None)),
            known: RefCell::new(HashMap::new()),
            admitting: Cell::new(false),
        }
    }

    /// Mutable access to the handler registry.
    ///
    /// Do not hold the borrow across an `admit` call.
    pub fn handlers(&self) -> RefMut<'_, Handlers> {
        self.handlers.borrow_mut()
    }

    /// Whether `value` is a primitive or a member of the known set.
    pub fn is_canonical(&self, value: &Value) -> bool {
        match value {
            Value::Prim(_) => true,
            Value::Obj(obj) => self.known_live(obj),
        }
    }

    fn known_live(&self, obj: &Obj) -> bool {
        let mut known = self.known.borrow_mut();
        match known.get(&obj.addr()) {
            Some(weak) if weak.is_live() => true,
            Some(_) => {
                // A dead canonical's address was reused by this new cell.
                known.remove(&obj.addr());
                false
            }
            None => false,
        }
    }

    fn admit_known(&self, obj: &Obj) {
        obj.freeze();
        self.known.borrow_mut().insert(obj.addr(), obj.downgrade());
    }

    /// Canonicalizes `value`.
    ///
    /// Primitives, known canonicals, and opaque references pass through.
    /// Otherwise returns the frozen representative that every deeply equal,
    /// handler-covered input shares.
    pub fn admit(&self, value: Value) -> Result<Value, CanonError> {
        let root = match &value {
            Value::Prim(_) => return Ok(value),
            Value::Obj(obj) => obj.clone(),
        };
        if self.known_live(&root) {
            return Ok(value);
        }
        if self.handlers.borrow_mut().lookup(root.class()).is_none() {
            return Ok(value);
        }
        if self.admitting.replace(true) {
            return Err(CanonError::AlreadyPartitioning);
        }
        let result = self.admit_root(&root);
        self.admitting.set(false);
        result.map(Value::from)
    }

    fn admit_root(&self, root: &Obj) -> Result<Obj, CanonError> {
        let mut parted = {
            let mut handlers = self.handlers.borrow_mut();
            let exclude = |obj: &Obj| self.known_live(obj);
            partition(root, &mut handlers, &exclude)?
        };
        log::debug!(
            "admit: {} inputs, {} components",
            parted.infos.len(),
            parted.components.len()
        );
        for comp_index in 0..parted.components.len() {
            self.resolve_component(&mut parted, comp_index)?;
        }
        let at = parted
            .info_of(root)
            .ok_or(CanonError::RootAlreadyCanonical)?;
        parted.infos[at]
            .known
            .clone()
            .ok_or(CanonError::UnresolvedKnown)
    }

    /// Resolves one component: scan each member, intern traces, then repair
    /// and freeze every freshly allocated cell.
    fn resolve_component(
        &self,
        parted: &mut Partitioned,
        comp_index: usize,
    ) -> Result<(), CanonError> {
        let members = parted.components[comp_index].members.clone();
        let cyclic = members.len() > 1
            || members
                .iter()
                .any(|&m| self.has_in_component_child(parted, comp_index, m));
        if cyclic {
            for &m in &members {
                if matches!(
                    parted.infos[m].handler.materialize,
                    Materialize::Reconstruct(_)
                ) {
                    return Err(CanonError::CycleNeedsAllocator(
                        parted.infos[m].obj.class(),
                    ));
                }
            }
        }

        // Scan every member, intern, and re-scan with each member re-labelled
        // by its assigned node, until the assignment stops moving. Members
        // whose traces coincide share a node; the next round scans the
        // quotient that sharing induces, so bisimilar unfoldings (a two-cell
        // ring of identical cells, say) keep collapsing until the component
        // reaches its minimal form. Merged members never separate again, so
        // the round bound is the member count.
        // Each coarsening step costs at most two rounds (one to merge, one
        // to confirm the quotient against the pool), so twice the member
        // count bounds the loop.
        let mut assign: HashMap<usize, Obj> = HashMap::new();
        for round in 0..2 * members.len() + 2 {
            let mut next: HashMap<usize, Obj> = HashMap::new();
            for &m in &members {
                let trace = self.scan(parted, comp_index, m, &assign)?;
                let node = self.intern(parted, &trace, m)?;
                next.insert(m, node);
            }
            let converged = !assign.is_empty()
                && members
                    .iter()
                    .all(|m| assign.get(m).zip(next.get(m)).is_some_and(|(a, b)| a.same(b)));
            assign = next;
            if converged {
                log::trace!("component {} converged after {} rounds", comp_index, round + 1);
                break;
            }
        }

        for &m in &members {
            parted.infos[m].known = Some(assign[&m].clone());
        }

        // Repair pass: exactly once per fresh cell, even when several
        // members share it.
        let mut repaired: HashSet<usize> = HashSet::new();
        for &m in &members {
            let node = assign[&m].clone();
            if node.is_frozen() || !repaired.insert(node.addr()) {
                continue;
            }
            let children = self.canonical_children(parted, m)?;
            match &parted.infos[m].handler.materialize {
                Materialize::AllocateRepair { repair, .. } => {
                    (repair)(&node, &children)?;
                    self.admit_known(&node);
                }
                Materialize::Reconstruct(_) => return Err(CanonError::UnresolvedKnown),
            }
        }
        Ok(())
    }

    fn has_in_component_child(
        &self,
        parted: &Partitioned,
        comp_index: usize,
        m: usize,
    ) -> bool {
        parted.infos[m].children.iter().any(|child| match child {
            Value::Obj(o) => parted
                .info_of(o)
                .is_some_and(|j| parted.infos[j].comp == Some(comp_index)),
            Value::Prim(_) => false,
        })
    }

    /// Builds the canonical trace of a component starting at `start`, in the
    /// quotient induced by `assign` (empty on the first round).
    fn scan(
        &self,
        parted: &Partitioned,
        comp_index: usize,
        start: usize,
        assign: &HashMap<usize, Obj>,
    ) -> Result<Vec<TraceToken>, CanonError> {
        let mut trace = Vec::new();
        let mut seen: HashMap<ScanKey, usize> = HashMap::new();
        self.scan_member(parted, comp_index, start, assign, &mut trace, &mut seen)?;
        Ok(trace)
    }

    /// Appends one member's run to the trace. Every child occupies exactly
    /// one token in its parent's run: a leaf, or a back-reference to the
    /// position where the child's own run begins. First encounters splice
    /// the child's run in before the back-reference, so the token stream
    /// decodes unambiguously. Members sharing an assigned node share one
    /// scan identity.
    fn scan_member(
        &self,
        parted: &Partitioned,
        comp_index: usize,
        m: usize,
        assign: &HashMap<usize, Obj>,
        trace: &mut Vec<TraceToken>,
        seen: &mut HashMap<ScanKey, usize>,
    ) -> Result<(), CanonError> {
        let key = scan_key(assign, m);
        debug_assert!(!seen.contains_key(&key));
        seen.insert(key, trace.len());
        let info = &parted.infos[m];
        trace.push(TraceToken::Class(info.obj.class()));
        for child in &info.children {
            match child {
                Value::Prim(_) => trace.push(TraceToken::Leaf(child.clone())),
                Value::Obj(o) => match parted.info_of(o) {
                    Some(j) if parted.infos[j].comp == Some(comp_index) => {
                        match seen.get(&scan_key(assign, j)) {
                            Some(&first_seen) => {
                                trace.push(TraceToken::BackRef(first_seen))
                            }
                            None => {
                                let start = trace.len();
                                self.scan_member(
                                    parted, comp_index, j, assign, trace, seen,
                                )?;
                                trace.push(TraceToken::BackRef(start));
                            }
                        }
                    }
                    Some(j) => {
                        // Outside the component: resolved earlier, leaves
                        // first.
                        let known = parted.infos[j]
                            .known
                            .clone()
                            .ok_or(CanonError::UnresolvedKnown)?;
                        trace.push(TraceToken::Leaf(Value::from(known)));
                    }
                    None => trace.push(TraceToken::Leaf(child.clone())),
                },
            }
        }
        Ok(())
    }

    /// Interns a trace in the pool: reuse on hit, materialize on miss.
    fn intern(
        &self,
        parted: &Partitioned,
        trace: &[TraceToken],
        m: usize,
    ) -> Result<Obj, CanonError> {
        let mut pool = self.pool.borrow_mut();
        let slot = pool.lookup_array(trace);
        if let Some(weak) = slot {
            if let Some(existing) = weak.upgrade() {
                return Ok(existing);
            }
        }
        let info = &parted.infos[m];
        let node = match &info.handler.materialize {
            Materialize::AllocateRepair { allocate, .. } => (allocate)(&info.obj)?,
            Materialize::Reconstruct(reconstruct) => {
                // Two-step cells never sit in cycles, so their children are
                // canonical by the time this component resolves.
                let children = self.canonical_children(parted, m)?;
                let node = (reconstruct)(&children)?;
                self.admit_known(&node);
                node
            }
        };
        *slot = Some(node.downgrade());
        Ok(node)
    }

    fn canonical_children(
        &self,
        parted: &Partitioned,
        m: usize,
    ) -> Result<Vec<Value>, CanonError> {
        parted.infos[m]
            .children
            .iter()
            .map(|child| match child {
                Value::Prim(_) => Ok(child.clone()),
                Value::Obj(o) => match parted.info_of(o) {
                    Some(j) => parted.infos[j]
                        .known
                        .clone()
                        .map(Value::from)
                        .ok_or(CanonError::UnresolvedKnown),
                    None => Ok(child.clone()),
                },
            })
            .collect()
    }

    /// Drops pool and known entries whose cells have died.
    pub fn purge(&self) -> usize {
        let mut removed = self.pool.borrow_mut().purge();
        let mut known = self.known.borrow_mut();
        let before = known.len();
        known.retain(|_, weak| weak.is_live());
        removed += before - known.len();
        removed
    }
}

impl Default for Canon {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equal::deep_equal;
    use crate::handlers::{Handler, HookError, Materialize};
    use crate::value::{Body, Obj, Slot};
    use std::rc::Rc;

    fn record(pairs: &[(&str, Value)]) -> Obj {
        Obj::record(pairs.iter().map(|(k, v)| (Rc::from(*k), v.clone())))
    }

    #[test]
    fn admit_is_idempotent() {
        let canon = Canon::new();
        let input = record(&[("x", Value::int(1))]);
        let first = canon.admit(input.into()).unwrap();
        let second = canon.admit(first.clone()).unwrap();
        assert!(first.same(&second));
        assert!(canon.is_canonical(&first));
    }

    #[test]
    fn deeply_equal_inputs_collapse() {
        let canon = Canon::new();
        let a = record(&[("x", Value::int(1)), ("y", Value::str("s"))]);
        let b = record(&[("y", Value::str("s")), ("x", Value::int(1))]);
        let ca = canon.admit(a.into()).unwrap();
        let cb = canon.admit(b.into()).unwrap();
        assert!(ca.same(&cb));
    }

    #[test]
    fn admitted_is_deeply_equal_to_input() {
        let canon = Canon::new();
        let input = record(&[
            ("nested", Value::from(record(&[("k", Value::int(7))]))),
            ("list", Value::from(Obj::list([Value::int(1), Value::int(2)]))),
        ]);
        let snapshot = record(&[
            ("nested", Value::from(record(&[("k", Value::int(7))]))),
            ("list", Value::from(Obj::list([Value::int(1), Value::int(2)]))),
        ]);
        let canonical = canon.admit(input.into()).unwrap();
        assert!(deep_equal(&canonical, &snapshot.into()));
    }

    #[test]
    fn canonical_cells_are_frozen() {
        let canon = Canon::new();
        let canonical = canon
            .admit(record(&[("x", Value::int(1))]).into())
            .unwrap();
        let obj = canonical.as_obj().unwrap();
        assert!(obj.is_frozen());
        assert!(obj.record_set("y", Value::int(2)).is_err());
    }

    #[test]
    fn shared_children_share_representatives() {
        let canon = Canon::new();
        // Two equal leaves reached through different paths.
        let top = record(&[
            ("left", Value::from(record(&[("v", Value::int(5))]))),
            ("right", Value::from(record(&[("v", Value::int(5))]))),
        ]);
        let canonical = canon.admit(top.into()).unwrap();
        let obj = canonical.as_obj().unwrap();
        let left = obj.record_get("left").unwrap();
        let right = obj.record_get("right").unwrap();
        assert!(left.same(&right));
    }

    #[test]
    fn opaque_passes_through_unchanged() {
        let canon = Canon::new();
        let opaque = Obj::bytes(vec![1, 2, 3]);
        let result = canon.admit(opaque.clone().into()).unwrap();
        assert!(result.as_obj().unwrap().same(&opaque));
        assert!(!opaque.is_frozen());
    }

    #[test]
    fn primitives_pass_through() {
        let canon = Canon::new();
        let v = canon.admit(Value::int(42)).unwrap();
        assert!(v.same(&Value::int(42)));
        assert!(canon.is_canonical(&Value::str("any")));
    }

    #[test]
    fn holes_distinguish_canonical_forms() {
        let canon = Canon::new();
        let holed = Obj::list_with_holes([Slot::Hole]);
        let defined = Obj::list([Value::undefined()]);
        let ch = canon.admit(holed.into()).unwrap();
        let cd = canon.admit(defined.into()).unwrap();
        assert!(!ch.same(&cd));
        match &*ch.as_obj().unwrap().body() {
            Body::List(slots) => assert!(slots[0].value().is_none()),
            _ => unreachable!(),
        };
    }

    #[test]
    fn undefined_record_values_are_missing() {
        let canon = Canon::new();
        let a = record(&[("x", Value::int(1)), ("gone", Value::undefined())]);
        let b = record(&[("x", Value::int(1))]);
        let ca = canon.admit(a.into()).unwrap();
        let cb = canon.admit(b.into()).unwrap();
        assert!(ca.same(&cb));
    }

    #[test]
    fn dates_collapse_through_two_step() {
        let canon = Canon::new();
        let a = canon.admit(Obj::date(1_000.0).into()).unwrap();
        let b = canon.admit(Obj::date(1_000.0).into()).unwrap();
        let c = canon.admit(Obj::date(2_000.0).into()).unwrap();
        assert!(a.same(&b));
        assert!(!a.same(&c));
        assert!(a.as_obj().unwrap().is_frozen());
    }

    #[test]
    fn self_loop_collapses_to_fixed_point() {
        let canon = Canon::new();
        let a = record(&[]);
        a.record_set("next", Value::from(a.clone())).unwrap();
        let ca = canon.admit(a.into()).unwrap();
        let obj = ca.as_obj().unwrap();
        let next = obj.record_get("next").unwrap();
        assert!(next.same(&ca));

        // A bisimilar two-cell ring admits to the same fixed point.
        let x = record(&[]);
        let y = record(&[]);
        x.record_set("next", Value::from(y.clone())).unwrap();
        y.record_set("next", Value::from(x.clone())).unwrap();
        let cx = canon.admit(x.into()).unwrap();
        assert!(cx.same(&ca));
    }

    #[test]
    fn two_step_in_cycle_is_rejected() {
        let canon = Canon::new();
        let class = ClassId::fresh();
        canon
            .handlers()
            .enable(
                class,
                Handler {
                    deconstruct: Rc::new(|obj| {
                        Ok(match &*obj.body() {
                            Body::Record(r) => {
                                r.entries().map(|(_, v)| v.clone()).collect()
                            }
                            _ => Vec::new(),
                        })
                    }),
                    materialize: Materialize::Reconstruct(Rc::new(|_| {
                        Err(HookError("unreachable".into()))
                    })),
                },
            )
            .unwrap();
        let cell = Obj::with_class(class, Body::Record(crate::value::Record::new()));
        cell.record_set("me", Value::from(cell.clone())).unwrap();
        let err = canon.admit(cell.into()).unwrap_err();
        assert_eq!(err, CanonError::CycleNeedsAllocator(class));
    }

    #[test]
    fn hook_errors_propagate() {
        let canon = Canon::new();
        let class = ClassId::fresh();
        canon
            .handlers()
            .enable(
                class,
                Handler {
                    deconstruct: Rc::new(|_| Err(HookError("deconstruct broke".into()))),
                    materialize: Materialize::Reconstruct(Rc::new(|_| {
                        Err(HookError("unreachable".into()))
                    })),
                },
            )
            .unwrap();
        let cell = Obj::with_class(class, Body::Record(crate::value::Record::new()));
        let err = canon.admit(cell.into()).unwrap_err();
        assert!(matches!(err, CanonError::Hook(_)));
    }

    #[test]
    fn nested_equal_graphs_share_everything() {
        let canon = Canon::new();
        let build = || {
            record(&[(
                "outer",
                Value::from(record(&[(
                    "inner",
                    Value::from(Obj::list([Value::int(1), Value::str("x")])),
                )])),
            )])
        };
        let a = canon.admit(build().into()).unwrap();
        let b = canon.admit(build().into()).unwrap();
        assert!(a.same(&b));
    }
}
