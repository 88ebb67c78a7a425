//! Weak prefix trie: path-addressed payloads with weak object keys.
//!
//! A `WeakTrie` maps *paths* — sequences of keys — to lazily created payloads.
//! Keys are classified through the [`TrieKey`] trait: primitive-like keys are
//! compared by value and held strongly; reference-like keys are compared by
//! identity and held weakly (unless the trie was built with `weakness` off).
//! A reclaimed weak key drops the entire subtrie below it.
//!
//! Unshared suffixes are not expanded into chains of single-child nodes.
//! They are stored flattened as a *tail* record `(remaining_keys, data)` and
//! promoted to a real node the moment a divergent path crosses them.
//!
//! Rust has no ephemerons and no ordered finalizers, so reclamation of dead
//! weak keys is observed lazily: stale entries are dropped when traversal
//! crosses them and by the explicit [`WeakTrie::purge`] sweep. Logical
//! behavior is the same as eager finalization; only the memory release is
//! deferred to the next access.
//!
//! # Complexity
//! Each operation is linear in path length, constant per key hop.
//!
//! # Citations
//! - Tries: Fredkin, "Trie memory" (CACM 1960)
//! - Path compression: Morrison, "PATRICIA" (JACM 1968)
//! - Weak tables: Hayes, "Ephemerons: a new finalization mechanism" (1997)

use crate::value::{Obj, PrimKey, Value, WeakObj};
use std::collections::HashMap;
use std::fmt;

/// Strong-map key space for primitive-like trie keys.
///
/// `Class` and `Index` are reserved namespaces used by canonical traces;
/// they can never collide with a `Prim` user value. This is the typed form
/// of the boxed-number-token trick.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StrongKey {
    /// An ordinary primitive value.
    Prim(PrimKey),
    /// A class marker (canonical traces).
    Class(u32),
    /// A numeric token (canonical trace back-references).
    Index(u64),
}

/// Key classification for one path element.
pub enum Classified<G> {
    /// Primitive-like: compared by value, held strongly.
    Strong(StrongKey),
    /// Reference-like: compared by identity, weakly holdable.
    Reference {
        /// Stable address for the identity map.
        addr: usize,
        /// Weak handle used when the trie holds keys weakly.
        guard: G,
    },
}

/// A guard over a reference-like key: answers liveness.
pub trait KeyGuard: Clone {
    /// Whether the guarded key is still alive.
    fn is_live(&self) -> bool;
}

impl KeyGuard for WeakObj {
    fn is_live(&self) -> bool {
        WeakObj::is_live(self)
    }
}

impl<T> KeyGuard for std::rc::Weak<T> {
    fn is_live(&self) -> bool {
        self.strong_count() > 0
    }
}

/// Types that can serve as trie path elements.
pub trait TrieKey: Clone {
    /// Weak handle type for reference-like keys.
    type Guard: KeyGuard;

    /// Classifies the key as primitive-like or reference-like.
    fn classify(&self) -> Classified<Self::Guard>;

    /// Identity-or-value equality between two keys.
    fn same_key(&self, other: &Self) -> bool {
        match (self.classify(), other.classify()) {
            (Classified::Strong(a), Classified::Strong(b)) => a == b,
            (
                Classified::Reference { addr: a, .. },
                Classified::Reference { addr: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

impl TrieKey for Value {
    type Guard = WeakObj;

    fn classify(&self) -> Classified<WeakObj> {
        match self {
            Value::Prim(p) => Classified::Strong(StrongKey::Prim(p.key())),
            Value::Obj(o) => Classified::Reference {
                addr: o.addr(),
                guard: o.downgrade(),
            },
        }
    }
}

impl TrieKey for Obj {
    type Guard = WeakObj;

    fn classify(&self) -> Classified<WeakObj> {
        Classified::Reference {
            addr: self.addr(),
            guard: self.downgrade(),
        }
    }
}

/// How a reference-like key is held by its entry.
enum Hold<K: TrieKey> {
    /// `weakness` off: the key itself keeps the referent alive.
    Strong(#[allow(dead_code)] K),
    /// `weakness` on: a dead guard marks the entry (and its subtrie) stale.
    Weak(K::Guard),
}

impl<K: TrieKey> Hold<K> {
    fn is_live(&self) -> bool {
        match self {
            Hold::Strong(_) => true,
            Hold::Weak(guard) => guard.is_live(),
        }
    }
}

/// Flattened unshared suffix: the rest of one path plus its payload.
struct TailRec<K: TrieKey, D> {
    rest: Vec<K>,
    data: D,
}

/// Outgoing edge: a full node, or a tail.
enum Edge<K: TrieKey, D> {
    Node(Box<TrieNode<K, D>>),
    Tail(TailRec<K, D>),
}

/// Entry for a reference-like key.
struct RefEntry<K: TrieKey, D> {
    hold: Hold<K>,
    edge: Edge<K, D>,
}

/// Interior node: one map per key class, plus an optional payload for the
/// path ending here.
struct TrieNode<K: TrieKey, D> {
    strong: HashMap<StrongKey, Edge<K, D>>,
    by_ref: HashMap<usize, RefEntry<K, D>>,
    data: Option<D>,
}

impl<K: TrieKey, D> TrieNode<K, D> {
    fn new() -> Self {
        Self {
            strong: HashMap::new(),
            by_ref: HashMap::new(),
            data: None,
        }
    }
}

/// Prefix trie with weak object keys and tail compression.
pub struct WeakTrie<K: TrieKey, D> {
    root: TrieNode<K, D>,
    make_data: Box<dyn Fn(&[K]) -> D>,
    weakness: bool,
}

impl<K: TrieKey, D> fmt::Debug for WeakTrie<K, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTrie")
            .field("weakness", &self.weakness)
            .finish_non_exhaustive()
    }
}

impl<K: TrieKey, D> WeakTrie<K, D> {
    /// Creates a trie holding reference keys weakly.
    pub fn new(make_data: impl Fn(&[K]) -> D + 'static) -> Self {
        Self::with_weakness(true, make_data)
    }

    /// Creates a trie with an explicit weakness policy. With `weakness` off,
    /// every key is held strongly; semantics are identical, memory behavior
    /// is not.
    pub fn with_weakness(weakness: bool, make_data: impl Fn(&[K]) -> D + 'static) -> Self {
        Self {
            root: TrieNode::new(),
            make_data: Box::new(make_data),
            weakness,
        }
    }

    /// Whether reference keys are held weakly.
    #[inline]
    pub fn weakness(&self) -> bool {
        self.weakness
    }

    /// Walks (creating as needed) to the payload for `path`. The path may be
    /// empty; the payload is built once by `make_data(path)` and returned by
    /// mutable reference thereafter.
    pub fn lookup(&mut self, path: &[K]) -> &mut D {
        let weakness = self.weakness;
        Self::descend(&mut self.root, path, path, &self.make_data, weakness)
    }

    /// Alias of [`lookup`](Self::lookup) for slice-shaped call sites.
    #[inline]
    pub fn lookup_array(&mut self, path: &[K]) -> &mut D {
        self.lookup(path)
    }

    /// Walks to the payload for `path` without creating anything.
    pub fn peek(&self, path: &[K]) -> Option<&D> {
        let mut node = &self.root;
        let mut at = 0;
        while at < path.len() {
            let edge = match path[at].classify() {
                Classified::Strong(sk) => node.strong.get(&sk)?,
                Classified::Reference { addr, .. } => {
                    let entry = node.by_ref.get(&addr)?;
                    if !entry.hold.is_live() {
                        return None;
                    }
                    &entry.edge
                }
            };
            match edge {
                Edge::Node(next) => {
                    node = next;
                    at += 1;
                }
                Edge::Tail(tail) => {
                    let rest = &path[at + 1..];
                    if tail.rest.len() == rest.len()
                        && tail.rest.iter().zip(rest).all(|(a, b)| a.same_key(b))
                    {
                        return Some(&tail.data);
                    }
                    return None;
                }
            }
        }
        node.data.as_ref()
    }

    /// Removes entries whose weak keys have died, dropping the subtries
    /// below them. Returns the number of edges removed.
    pub fn purge(&mut self) -> usize {
        let removed = Self::purge_node(&mut self.root);
        if removed > 0 {
            log::trace!("weak trie purge removed {} dead edges", removed);
        }
        removed
    }

    fn purge_node(node: &mut TrieNode<K, D>) -> usize {
        let before = node.by_ref.len();
        node.by_ref.retain(|_, entry| entry.hold.is_live());
        let mut removed = before - node.by_ref.len();
        for entry in node.by_ref.values_mut() {
            if let Edge::Node(next) = &mut entry.edge {
                removed += Self::purge_node(next);
            }
        }
        for edge in node.strong.values_mut() {
            if let Edge::Node(next) = edge {
                removed += Self::purge_node(next);
            }
        }
        removed
    }

    fn hold_for(key: &K, weakness: bool) -> Hold<K> {
        if weakness {
            match key.classify() {
                Classified::Reference { guard, .. } => Hold::Weak(guard),
                Classified::Strong(_) => unreachable!("hold_for on primitive key"),
            }
        } else {
            Hold::Strong(key.clone())
        }
    }

    /// Recursive walk. All structural edits at one level happen before the
    /// walk descends, so each recursion step hands out exactly one borrow.
    fn descend<'a>(
        node: &'a mut TrieNode<K, D>,
        path: &[K],
        full: &[K],
        make_data: &dyn Fn(&[K]) -> D,
        weakness: bool,
    ) -> &'a mut D {
        let Some((key, rest)) = path.split_first() else {
            return node.data.get_or_insert_with(|| make_data(full));
        };

        let edge: &mut Edge<K, D> = match key.classify() {
            Classified::Strong(sk) => node.strong.entry(sk).or_insert_with(|| {
                Edge::Tail(TailRec {
                    rest: rest.to_vec(),
                    data: make_data(full),
                })
            }),
            Classified::Reference { addr, .. } => {
                // An address can be reused after its cell dies; a dead hold
                // under this address is a stale entry, not a hit.
                if node
                    .by_ref
                    .get(&addr)
                    .is_some_and(|entry| !entry.hold.is_live())
                {
                    node.by_ref.remove(&addr);
                }
                let entry = node.by_ref.entry(addr).or_insert_with(|| RefEntry {
                    hold: Self::hold_for(key, weakness),
                    edge: Edge::Tail(TailRec {
                        rest: rest.to_vec(),
                        data: make_data(full),
                    }),
                });
                &mut entry.edge
            }
        };

        // A tail either matches the remaining path exactly or gets promoted
        // to a real node that the walk continues through.
        if let Edge::Tail(tail) = edge {
            let matches = tail.rest.len() == rest.len()
                && tail.rest.iter().zip(rest).all(|(a, b)| a.same_key(b));
            if matches {
                return match edge {
                    Edge::Tail(tail) => &mut tail.data,
                    Edge::Node(_) => unreachable!(),
                };
            }
            let old = std::mem::replace(
                edge,
                Edge::Node(Box::new(TrieNode::new())),
            );
            let Edge::Tail(old_tail) = old else {
                unreachable!()
            };
            let Edge::Node(next) = edge else {
                unreachable!()
            };
            Self::reinsert_tail(next, old_tail, weakness);
        }

        match edge {
            Edge::Node(next) => Self::descend(next, rest, full, make_data, weakness),
            Edge::Tail(_) => unreachable!("tail handled above"),
        }
    }

    /// Re-hangs a promoted tail's suffix one level down.
    fn reinsert_tail(node: &mut TrieNode<K, D>, tail: TailRec<K, D>, weakness: bool) {
        let TailRec { mut rest, data } = tail;
        if rest.is_empty() {
            node.data = Some(data);
            return;
        }
        let head = rest.remove(0);
        let edge = Edge::Tail(TailRec { rest, data });
        match head.classify() {
            Classified::Strong(sk) => {
                node.strong.insert(sk, edge);
            }
            Classified::Reference { addr, .. } => {
                node.by_ref.insert(
                    addr,
                    RefEntry {
                        hold: Self::hold_for(&head, weakness),
                        edge,
                    },
                );
            }
        }
    }
}
