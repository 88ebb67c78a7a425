//! Immutable contextual-value DAG: typed slots, branching, interned merges,
//! and scoped activation.
//!
//! A `Subtext` is a slot identity with a default value, an optional
//! `merge(older, newer)` conflict resolver, and an optional `guard`
//! normalizer applied on write. A `Supertext` is an immutable node with a
//! frozen parent list and a local slot map; reading a slot walks the DAG
//! lazily, deduplicates contributions rightmost-wins, folds them through the
//! slot's merge, and caches the answer — safe because the logical value of
//! any slot on any node never changes.
//!
//! `merge` construction is interned: the deduplicated parent list keys a weak
//! trie, so merging the same parents twice yields the same node. `branch`
//! construction is deliberately not interned; each branch is a fresh child.
//!
//! The ambient "current" node lives behind a [`ContextBackend`] seam. The
//! default backend is an explicit cooperative stack in a thread local — the
//! portable fallback when no host async-context primitive exists. Schedulers
//! that hop between logical tasks must snapshot and restore the stack across
//! their boundaries, or install a backend that does.
//!
//! # Citations
//! - Dynamic binding with fluid variables: Steele & Sussman, "The Art of the
//!   Interpreter" (MIT AI Memo 453, 1978)
//! - Zone-style context propagation: Dart `Zone` / TC39 Async Context
//!   proposal (stage 2)

use crate::trie::{Classified, TrieKey, WeakTrie};
use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Merge hook: combines an older and a newer contribution.
pub type MergeFn = Rc<dyn Fn(&Value, &Value) -> Value>;
/// Guard hook: normalizes a value on write.
pub type GuardFn = Rc<dyn Fn(Value) -> Value>;

struct SubtextInner {
    default: Value,
    merge: Option<MergeFn>,
    guard: Option<GuardFn>,
}

/// A typed slot identity with default, merge, and guard.
#[derive(Clone)]
pub struct Subtext {
    inner: Rc<SubtextInner>,
}

impl fmt::Debug for Subtext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subtext")
            .field("id", &self.id())
            .field("default", &self.inner.default.to_string())
            .finish()
    }
}

impl Subtext {
    /// Creates a slot with a default value and no hooks.
    pub fn new(default: Value) -> Self {
        Self::with_hooks(default, None, None)
    }

    /// Creates a slot with a merge hook.
    pub fn with_merge(default: Value, merge: impl Fn(&Value, &Value) -> Value + 'static) -> Self {
        Self::with_hooks(default, Some(Rc::new(merge)), None)
    }

    /// Creates a slot with a guard hook.
    pub fn with_guard(default: Value, guard: impl Fn(Value) -> Value + 'static) -> Self {
        Self::with_hooks(default, None, Some(Rc::new(guard)))
    }

    /// Creates a slot with explicit hooks.
    pub fn with_hooks(default: Value, merge: Option<MergeFn>, guard: Option<GuardFn>) -> Self {
        Self {
            inner: Rc::new(SubtextInner {
                default,
                merge,
                guard,
            }),
        }
    }

    /// The slot's default, returned by reads that find no contribution.
    pub fn default_value(&self) -> &Value {
        &self.inner.default
    }

    /// Slot identity.
    #[inline]
    fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    fn guard(&self, value: Value) -> Value {
        match &self.inner.guard {
            Some(guard) => guard(value),
            None => value,
        }
    }

    /// Folds contributions, oldest first. Default policy keeps the newest.
    fn fold(&self, values: Vec<Value>) -> Value {
        let mut iter = values.into_iter();
        let mut acc = iter.next().expect("fold requires a contribution");
        for next in iter {
            acc = match &self.inner.merge {
                Some(merge) => merge(&acc, &next),
                None => next,
            };
        }
        acc
    }
}

/// Slot maps keep the `Subtext` alive alongside its value: slot identity is
/// an address, and pinning the slot stops that address from being reused
/// while any node still remembers it.
pub struct SupertextInner {
    parents: Box<[Supertext]>,
    local: HashMap<usize, (Subtext, Value)>,
    /// Read cache; `None` records a confirmed miss.
    cache: RefCell<HashMap<usize, (Subtext, Option<Value>)>>,
}

/// An immutable node of the context DAG.
#[derive(Clone)]
pub struct Supertext {
    inner: Rc<SupertextInner>,
}

impl fmt::Debug for Supertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supertext")
            .field("parents", &self.inner.parents.len())
            .field("local", &self.inner.local.len())
            .finish()
    }
}

impl TrieKey for Supertext {
    type Guard = Weak<SupertextInner>;

    fn classify(&self) -> Classified<Weak<SupertextInner>> {
        Classified::Reference {
            addr: Rc::as_ptr(&self.inner) as usize,
            guard: Rc::downgrade(&self.inner),
        }
    }
}

thread_local! {
    static EMPTY: Supertext = Supertext {
        inner: Rc::new(SupertextInner {
            parents: Box::new([]),
            local: HashMap::new(),
            cache: RefCell::new(HashMap::new()),
        }),
    };
    static MERGE_TRIE: RefCell<WeakTrie<Supertext, Option<Weak<SupertextInner>>>> =
        RefCell::new(WeakTrie::new(|_| None));
}

impl Supertext {
    /// The root node: no parents, no slots.
    pub fn empty() -> Supertext {
        EMPTY.with(Supertext::clone)
    }

    /// The ambient current node (the root when nothing is active).
    pub fn current() -> Supertext {
        with_backend(|backend| backend.current())
    }

    /// Whether `self` and `other` are the same node.
    #[inline]
    pub fn same(&self, other: &Supertext) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Creates a child of `self` carrying the given writes, each normalized
    /// through its slot's guard. Never interned: every branch is new.
    pub fn branch(&self, writes: &[(Subtext, Value)]) -> Supertext {
        let mut local = HashMap::with_capacity(writes.len());
        for (subtext, value) in writes {
            local.insert(
                subtext.id(),
                (subtext.clone(), subtext.guard(value.clone())),
            );
        }
        Supertext {
            inner: Rc::new(SupertextInner {
                parents: Box::new([self.clone()]),
                local,
                cache: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Merges parent contexts into one node.
    ///
    /// Parents are deduplicated preferring the rightmost occurrence, then
    /// interned: the same deduplicated sequence always yields the same node.
    /// A single surviving parent is returned as-is; no parents yield the
    /// root.
    pub fn merge(parents: &[Supertext]) -> Supertext {
        let mut deduped: Vec<Supertext> = Vec::with_capacity(parents.len());
        for parent in parents.iter().rev() {
            if !deduped.iter().any(|p| p.same(parent)) {
                deduped.push(parent.clone());
            }
        }
        deduped.reverse();
        match deduped.len() {
            0 => Supertext::empty(),
            1 => deduped.into_iter().next().expect("one parent"),
            _ => MERGE_TRIE.with(|trie| {
                let mut trie = trie.borrow_mut();
                let slot = trie.lookup_array(&deduped);
                if let Some(weak) = slot {
                    if let Some(inner) = weak.upgrade() {
                        return Supertext { inner };
                    }
                }
                let inner = Rc::new(SupertextInner {
                    parents: deduped.into_boxed_slice(),
                    local: HashMap::new(),
                    cache: RefCell::new(HashMap::new()),
                });
                *slot = Some(Rc::downgrade(&inner));
                Supertext { inner }
            }),
        }
    }

    /// Reads a slot: the local write, or the merged parent contributions, or
    /// the slot's default. Referentially transparent and cached.
    pub fn read(&self, subtext: &Subtext) -> Value {
        self.read_contribution(subtext)
            .unwrap_or_else(|| subtext.default_value().clone())
    }

    /// Whether this node (or its ancestry) contributes a value for the slot.
    pub fn has(&self, subtext: &Subtext) -> bool {
        self.read_contribution(subtext).is_some()
    }

    /// `None` is the missing sentinel, distinct from any user value; misses
    /// are cached too, including on the root.
    fn read_contribution(&self, subtext: &Subtext) -> Option<Value> {
        let id = subtext.id();
        if let Some((_, cached)) = self.inner.cache.borrow().get(&id) {
            return cached.clone();
        }
        let result = match self.inner.local.get(&id) {
            Some((_, value)) => Some(value.clone()),
            None => {
                let mut contributions: Vec<Value> = Vec::new();
                for parent in self.inner.parents.iter() {
                    if let Some(value) = parent.read_contribution(subtext) {
                        contributions.push(value);
                    }
                }
                // Rightmost occurrence wins among duplicates.
                let mut deduped: Vec<Value> = Vec::with_capacity(contributions.len());
                for value in contributions.iter().rev() {
                    if !deduped.iter().any(|v| v.same(value)) {
                        deduped.push(value.clone());
                    }
                }
                deduped.reverse();
                if deduped.is_empty() {
                    None
                } else {
                    Some(subtext.fold(deduped))
                }
            }
        };
        self.inner
            .cache
            .borrow_mut()
            .insert(id, (subtext.clone(), result.clone()));
        result
    }

    /// Runs `f` with `self` as the ambient current node, restoring the
    /// previous node on exit — including panic exits.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        with_backend(|backend| backend.enter(self.clone()));
        let _restore = ExitGuard;
        f()
    }

    /// Wraps `f` to run under the merge of the context captured now and the
    /// context current at call time.
    pub fn bind<R>(f: impl Fn() -> R + 'static) -> impl Fn() -> R {
        let captured = Supertext::current();
        move || {
            let merged = Supertext::merge(&[captured.clone(), Supertext::current()]);
            merged.run(&f)
        }
    }

    /// One-shot variant of [`bind`](Self::bind).
    pub fn bind_once<R>(f: impl FnOnce() -> R + 'static) -> impl FnOnce() -> R {
        let captured = Supertext::current();
        move || {
            let merged = Supertext::merge(&[captured, Supertext::current()]);
            merged.run(f)
        }
    }

    /// Wraps `f` to run under only the context captured now.
    pub fn bind_only<R>(f: impl Fn() -> R + 'static) -> impl Fn() -> R {
        let captured = Supertext::current();
        move || captured.run(&f)
    }
}

/// Storage seam for the ambient current node.
///
/// `enter`/`exit` bracket one activation; `current` answers the innermost
/// active node. Implementations must keep activations balanced.
pub trait ContextBackend {
    /// The innermost active node, or the root.
    fn current(&self) -> Supertext;
    /// Pushes an activation.
    fn enter(&self, context: Supertext);
    /// Pops the innermost activation.
    fn exit(&self);
}

/// Default backend: an explicit cooperative stack in a thread local.
pub struct StackBackend {
    stack: RefCell<Vec<Supertext>>,
}

impl StackBackend {
    /// Creates an empty stack backend.
    pub fn new() -> Self {
        Self {
            stack: RefCell::new(Vec::new()),
        }
    }

    /// Snapshot of the activation stack, for schedulers that must restore it
    /// across scheduling boundaries.
    pub fn snapshot(&self) -> Vec<Supertext> {
        self.stack.borrow().clone()
    }

    /// Restores a snapshot taken by [`snapshot`](Self::snapshot).
    pub fn restore(&self, snapshot: Vec<Supertext>) {
        *self.stack.borrow_mut() = snapshot;
    }
}

impl Default for StackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBackend for StackBackend {
    fn current(&self) -> Supertext {
        self.stack
            .borrow()
            .last()
            .cloned()
            .unwrap_or_else(Supertext::empty)
    }

    fn enter(&self, context: Supertext) {
        self.stack.borrow_mut().push(context);
    }

    fn exit(&self) {
        self.stack.borrow_mut().pop();
    }
}

thread_local! {
    static BACKEND: RefCell<Rc<dyn ContextBackend>> = RefCell::new(Rc::new(StackBackend::new()));
}

/// Installs a context backend, replacing the default stack. Returns the
/// previous backend so callers can restore it.
pub fn set_backend(backend: Rc<dyn ContextBackend>) -> Rc<dyn ContextBackend> {
    BACKEND.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), backend))
}

fn with_backend<R>(f: impl FnOnce(&dyn ContextBackend) -> R) -> R {
    BACKEND.with(|slot| {
        let backend = slot.borrow().clone();
        f(&*backend)
    })
}

struct ExitGuard;

impl Drop for ExitGuard {
    fn drop(&mut self) {
        with_backend(|backend| backend.exit());
    }
}
