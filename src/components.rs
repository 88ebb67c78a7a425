//! Strongly-connected-component partition of an input graph.
//!
//! One pass over the graph rooted at a value assigns each first-seen input an
//! increasing order number and maintains two stacks: a root stack of
//! candidates for the root of the current component, popped whenever a later
//! edge proves a candidate shares a component with an earlier node, and a
//! component stack of nodes possibly belonging to the current component.
//! When the walk unwinds to the node on top of the root stack, the suffix of
//! the component stack from that node is spliced off as one component.
//!
//! Components complete children-first, so the emission order is topological
//! with leaves first — exactly the order the canonicalizer needs to resolve
//! child components before their parents.
//!
//! Inputs without a handler (and inputs the caller excludes, e.g. already
//! canonical ones) terminate the walk without being mapped.
//!
//! # Citations
//! - Tarjan, "Depth-first search and linear graph algorithms" (SICOMP 1972)
//! - Gabow, "Path-based depth-first search for strong and biconnected
//!   components" (IPL 2000) — the two-stack formulation used here

use crate::handlers::{Handler, Handlers, HookError};
use crate::value::{Obj, Value};
use std::collections::HashMap;
use std::rc::Rc;

/// Per-input metadata computed during one partition, consumed during
/// materialization.
#[derive(Debug)]
pub struct Info {
    /// The input node itself.
    pub obj: Obj,
    /// First-seen order number.
    pub order: usize,
    /// Cached deconstruction children.
    pub children: Vec<Value>,
    /// Handler for the input's class.
    pub handler: Rc<Handler>,
    /// Index of the component this input belongs to, once assigned.
    pub comp: Option<usize>,
    /// Chosen canonical reference, once established.
    pub known: Option<Obj>,
}

/// One strongly connected component: an ordered snapshot of its members
/// (info indices, in discovery order).
#[derive(Debug)]
pub struct Component {
    /// Member info indices.
    pub members: Vec<usize>,
}

/// Result of one partition pass.
#[derive(Debug)]
pub struct Partitioned {
    /// Per-input metadata, indexed by discovery order.
    pub infos: Vec<Info>,
    /// Input address to info index.
    pub by_addr: HashMap<usize, usize>,
    /// Components in topological order, leaves first.
    pub components: Vec<Component>,
}

impl Partitioned {
    /// Info index for an input, if it was mapped.
    pub fn info_of(&self, obj: &Obj) -> Option<usize> {
        self.by_addr.get(&obj.addr()).copied()
    }
}

struct Walk<'a> {
    handlers: &'a mut Handlers,
    exclude: &'a dyn Fn(&Obj) -> bool,
    infos: Vec<Info>,
    by_addr: HashMap<usize, usize>,
    root_stack: Vec<usize>,
    comp_stack: Vec<usize>,
    components: Vec<Component>,
}

impl Walk<'_> {
    /// Visits an object. Returns its info index, or `None` for opaque and
    /// excluded inputs.
    fn visit(&mut self, obj: &Obj) -> Result<Option<usize>, HookError> {
        if let Some(&at) = self.by_addr.get(&obj.addr()) {
            // Seen before. If it is still on the component stack, every root
            // candidate younger than it collapses into its component.
            if self.infos[at].comp.is_none() {
                let order = self.infos[at].order;
                while let Some(&candidate) = self.root_stack.last() {
                    if self.infos[candidate].order > order {
                        self.root_stack.pop();
                    } else {
                        break;
                    }
                }
            }
            return Ok(Some(at));
        }
        if (self.exclude)(obj) {
            return Ok(None);
        }
        let Some(handler) = self.handlers.lookup(obj.class()) else {
            // Opaque: terminates the walk, never mapped.
            return Ok(None);
        };
        let children = (handler.deconstruct)(obj)?;

        let at = self.infos.len();
        self.infos.push(Info {
            obj: obj.clone(),
            order: at,
            children,
            handler,
            comp: None,
            known: None,
        });
        self.by_addr.insert(obj.addr(), at);
        self.root_stack.push(at);
        self.comp_stack.push(at);

        let children: Vec<Value> = self.infos[at].children.clone();
        for child in &children {
            if let Value::Obj(o) = child {
                self.visit(o)?;
            }
        }

        // Unwound back to the root candidate: splice off the component.
        if self.root_stack.last() == Some(&at) {
            self.root_stack.pop();
            let split = self
                .comp_stack
                .iter()
                .rposition(|&m| m == at)
                .expect("component stack lost its root");
            let members: Vec<usize> = self.comp_stack.split_off(split);
            let comp_index = self.components.len();
            for &member in &members {
                self.infos[member].comp = Some(comp_index);
            }
            self.components.push(Component { members });
        }
        Ok(Some(at))
    }
}

/// Partitions the graph rooted at `root` into strongly connected components.
///
/// `exclude` short-circuits inputs the caller already considers resolved
/// (canonical references); they are treated like opaque leaves.
pub fn partition(
    root: &Obj,
    handlers: &mut Handlers,
    exclude: &dyn Fn(&Obj) -> bool,
) -> Result<Partitioned, HookError> {
    let mut walk = Walk {
        handlers,
        exclude,
        infos: Vec::new(),
        by_addr: HashMap::new(),
        root_stack: Vec::new(),
        comp_stack: Vec::new(),
        components: Vec::new(),
    };
    walk.visit(root)?;
    debug_assert!(walk.root_stack.is_empty());
    debug_assert!(walk.comp_stack.is_empty());
    log::trace!(
        "partition: {} inputs across {} components",
        walk.infos.len(),
        walk.components.len()
    );
    Ok(Partitioned {
        infos: walk.infos,
        by_addr: walk.by_addr,
        components: walk.components,
    })
}
