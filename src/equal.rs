//! Deep structural equality with cycle tolerance.
//!
//! `equal(a, b)` dispatches on the runtime body kind of its operands and
//! recurses structurally. A pair cache of in-progress comparisons makes the
//! traversal terminate on cyclic inputs: re-encountering a pair answers
//! `true` provisionally, and the provisional answer stands exactly when no
//! contradicting `false` arises elsewhere in the traversal — the standard
//! greatest-fixed-point reading of equality on rational structures.
//!
//! Traversal state is pooled and reused across calls so repeated comparisons
//! do not churn allocations.
//!
//! The user adapter returns `bool` by construction, so there is no malformed
//! adapter result to coerce; equality as a whole never fails.
//!
//! # Citations
//! - Bisimulation and coinductive equality: Milner, "Communication and
//!   Concurrency" (1989)
//! - Equality on cyclic structures: Adams, "Efficient sets — a balancing act"
//!   appendix on cycle detection (JFP 1993)

use crate::value::{Body, Obj, Prim, Slot, Value};
use std::cell::RefCell;
use std::collections::HashSet;

/// One traversal's worth of state: the in-progress pair set.
#[derive(Default)]
struct Checker {
    in_progress: HashSet<(usize, usize)>,
}

impl Checker {
    fn pair(a: &Obj, b: &Obj) -> (usize, usize) {
        let (x, y) = (a.addr(), b.addr());
        if x <= y {
            (x, y)
        } else {
            (y, x)
        }
    }

    fn check(&mut self, a: &Value, b: &Value) -> bool {
        if a.same(b) {
            return true;
        }
        let (Some(ao), Some(bo)) = (a.as_obj(), b.as_obj()) else {
            // Distinct primitives, or primitive against reference.
            return false;
        };
        let pair = Self::pair(ao, bo);
        if !self.in_progress.insert(pair) {
            // Already comparing this pair further up the stack.
            return true;
        }
        let result = self.check_cells(ao, bo);
        self.in_progress.remove(&pair);
        result
    }

    fn check_cells(&mut self, ao: &Obj, bo: &Obj) -> bool {
        let a_body = ao.body();
        let b_body = bo.body();
        // The opaque path delegates the tag question to the adapters; every
        // structured kind requires matching class identity first.
        if !matches!((&*a_body, &*b_body), (Body::Opaque(_), Body::Opaque(_)))
            && ao.class() != bo.class()
        {
            return false;
        }
        match (&*a_body, &*b_body) {
            (Body::List(xs), Body::List(ys)) => {
                xs.len() == ys.len()
                    && xs.iter().zip(ys).all(|(x, y)| match (x, y) {
                        (Slot::Hole, Slot::Hole) => true,
                        (Slot::Val(x), Slot::Val(y)) => self.check(x, y),
                        // A hole is not a defined `undefined`.
                        _ => false,
                    })
            }
            (Body::Record(xs), Body::Record(ys)) => {
                // Keys whose value is `undefined` count as missing.
                let defined =
                    |v: &&Value| !matches!(v, Value::Prim(Prim::Undefined));
                let a_defined = xs.entries().filter(|(_, v)| defined(v));
                let b_count = ys.entries().filter(|(_, v)| defined(v)).count();
                let mut a_count = 0;
                for (key, val) in a_defined {
                    a_count += 1;
                    match ys.get(key) {
                        Some(other) if self.check(val, other) => {}
                        _ => return false,
                    }
                }
                a_count == b_count
            }
            (
                Body::Error { name: an, message: am },
                Body::Error { name: bn, message: bm },
            ) => an == bn && am == bm,
            (Body::Date(x), Body::Date(y))
            | (Body::BoxedNum(x), Body::BoxedNum(y)) => num_same(*x, *y),
            (Body::BoxedBool(x), Body::BoxedBool(y)) => x == y,
            (Body::Regex(x), Body::Regex(y)) => x == y,
            (Body::BoxedStr(x), Body::BoxedStr(y)) => x == y,
            (Body::Set(xs), Body::Set(ys)) => {
                xs.len() == ys.len() && xs.iter().all(|member| ys.contains(member))
            }
            (Body::Map(xs), Body::Map(ys)) => {
                xs.len() == ys.len()
                    && xs.iter().all(|(key, val)| match ys.get(key) {
                        Some(other) => self.check(val, other),
                        None => false,
                    })
            }
            (Body::Bytes(xs), Body::Bytes(ys)) => xs == ys,
            (Body::Func(x), Body::Func(y)) => {
                // Identity was handled before dispatch; source equality only
                // counts when neither side is censored.
                match (&x.source, &y.source) {
                    (Some(xs), Some(ys)) => !x.native && !y.native && xs == ys,
                    _ => false,
                }
            }
            (Body::Opaque(x), Body::Opaque(y)) => {
                let mut recurse_a = |p: &Value, q: &Value| self.check(p, q);
                if !x.deep_equals(bo, &mut recurse_a) {
                    return false;
                }
                let mut recurse_b = |p: &Value, q: &Value| self.check(p, q);
                y.deep_equals(ao, &mut recurse_b)
            }
            _ => false,
        }
    }
}

/// Numeric sameness: `NaN` equals `NaN`, zero sign ignored.
#[inline]
fn num_same(x: f64, y: f64) -> bool {
    Prim::Float(x).key() == Prim::Float(y).key()
}

/// Deep-equality engine with a reusable checker pool.
#[derive(Default)]
pub struct Equalizer {
    pool: RefCell<Vec<Checker>>,
}

impl Equalizer {
    /// Creates an engine with an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural equality of `a` and `b`. Never fails; terminates on any
    /// cyclic input.
    pub fn equal(&self, a: &Value, b: &Value) -> bool {
        let mut checker = self.pool.borrow_mut().pop().unwrap_or_default();
        let result = checker.check(a, b);
        checker.in_progress.clear();
        self.pool.borrow_mut().push(checker);
        result
    }
}

thread_local! {
    static SHARED: Equalizer = Equalizer::new();
}

/// Structural equality through a shared per-thread engine.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    SHARED.with(|eq| eq.equal(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Obj, OpaqueEq, Slot, Value};
    use std::rc::Rc;

    fn rec(pairs: &[(&str, Value)]) -> Obj {
        Obj::record(pairs.iter().map(|(k, v)| (Rc::from(*k), v.clone())))
    }

    #[test]
    fn primitives() {
        assert!(deep_equal(&Value::int(3), &Value::int(3)));
        assert!(!deep_equal(&Value::int(3), &Value::float(3.0)));
        assert!(deep_equal(&Value::float(f64::NAN), &Value::float(f64::NAN)));
        assert!(!deep_equal(&Value::null(), &Value::undefined()));
    }

    #[test]
    fn lists_and_holes() {
        let a = Obj::list([Value::int(1), Value::int(2)]);
        let b = Obj::list([Value::int(1), Value::int(2)]);
        assert!(deep_equal(&a.into(), &b.into()));

        let hole = Obj::list_with_holes([Slot::Hole]);
        let undef = Obj::list([Value::undefined()]);
        assert!(!deep_equal(&hole.into(), &undef.into()));
    }

    #[test]
    fn records_missing_is_undefined() {
        let a = rec(&[("x", Value::int(1)), ("gone", Value::undefined())]);
        let b = rec(&[("x", Value::int(1))]);
        assert!(deep_equal(&a.clone().into(), &b.clone().into()));
        assert!(deep_equal(&b.into(), &a.into()));

        let c = rec(&[("x", Value::int(2))]);
        assert!(!deep_equal(
            &rec(&[("x", Value::int(1))]).into(),
            &c.into()
        ));
    }

    #[test]
    fn record_key_order_irrelevant() {
        let a = rec(&[("x", Value::int(1)), ("y", Value::int(2))]);
        let b = rec(&[("y", Value::int(2)), ("x", Value::int(1))]);
        assert!(deep_equal(&a.into(), &b.into()));
    }

    #[test]
    fn boxed_and_stringly_kinds() {
        assert!(deep_equal(
            &Obj::boxed_num(f64::NAN).into(),
            &Obj::boxed_num(f64::NAN).into()
        ));
        assert!(deep_equal(&Obj::date(0.0).into(), &Obj::date(-0.0).into()));
        assert!(deep_equal(&Obj::regex("a+").into(), &Obj::regex("a+").into()));
        assert!(!deep_equal(&Obj::regex("a+").into(), &Obj::regex("a*").into()));
        assert!(deep_equal(
            &Obj::error("TypeError", "nope").into(),
            &Obj::error("TypeError", "nope").into()
        ));
        assert!(!deep_equal(
            &Obj::error("TypeError", "nope").into(),
            &Obj::error("RangeError", "nope").into()
        ));
        assert!(deep_equal(
            &Obj::bytes(vec![1, 2, 3]).into(),
            &Obj::bytes(vec![1, 2, 3]).into()
        ));
        assert!(!deep_equal(
            &Obj::bytes(vec![1, 2]).into(),
            &Obj::bytes(vec![1, 2, 3]).into()
        ));
    }

    #[test]
    fn sets_by_membership() {
        let shared = Obj::empty_record();
        let a = Obj::set([Value::int(1), Value::from(shared.clone())]);
        let b = Obj::set([Value::from(shared.clone()), Value::int(1)]);
        assert!(deep_equal(&a.into(), &b.into()));
        // Structurally equal but non-identical members do not match.
        let c = Obj::set([Value::from(Obj::empty_record())]);
        let d = Obj::set([Value::from(Obj::empty_record())]);
        assert!(!deep_equal(&c.into(), &d.into()));
    }

    #[test]
    fn maps_keys_by_identity_values_deeply() {
        let key = Obj::empty_record();
        let a = Obj::map([(Value::from(key.clone()), Value::from(rec(&[("v", Value::int(1))])))]);
        let b = Obj::map([(Value::from(key.clone()), Value::from(rec(&[("v", Value::int(1))])))]);
        assert!(deep_equal(&a.into(), &b.into()));
    }

    #[test]
    fn functions_by_identity_or_source() {
        let f = Obj::func("x => x");
        assert!(deep_equal(&f.clone().into(), &f.clone().into()));
        assert!(deep_equal(&f.into(), &Obj::func("x => x").into()));
        assert!(!deep_equal(
            &Obj::func("x => x").into(),
            &Obj::func("y => y").into()
        ));
        assert!(!deep_equal(
            &Obj::native_func().into(),
            &Obj::native_func().into()
        ));
    }

    #[test]
    fn cycles_terminate_and_compare() {
        // a -> a and b -> b: bisimilar rings.
        let a = Obj::empty_record();
        a.record_set("next", Value::from(a.clone())).unwrap();
        let b = Obj::empty_record();
        b.record_set("next", Value::from(b.clone())).unwrap();
        assert!(deep_equal(&a.clone().into(), &b.into()));

        // A two-step ring against a one-step ring is still bisimilar.
        let c = Obj::empty_record();
        let d = Obj::empty_record();
        c.record_set("next", Value::from(d.clone())).unwrap();
        d.record_set("next", Value::from(c.clone())).unwrap();
        assert!(deep_equal(&a.into(), &c.into()));
    }

    #[test]
    fn cyclic_mismatch_is_false() {
        let a = Obj::empty_record();
        a.record_set("next", Value::from(a.clone())).unwrap();
        a.record_set("tag", Value::int(1)).unwrap();
        let b = Obj::empty_record();
        b.record_set("next", Value::from(b.clone())).unwrap();
        b.record_set("tag", Value::int(2)).unwrap();
        assert!(!deep_equal(&a.into(), &b.into()));
    }

    #[test]
    fn reflexive_and_symmetric() {
        let v = Value::from(rec(&[("k", Value::str("v"))]));
        assert!(deep_equal(&v, &v));
        let w = Value::from(rec(&[("k", Value::str("v"))]));
        assert_eq!(deep_equal(&v, &w), deep_equal(&w, &v));
    }

    #[derive(Debug)]
    struct ByLabel(&'static str);

    impl OpaqueEq for ByLabel {
        fn deep_equals(
            &self,
            other: &Obj,
            _recurse: &mut dyn FnMut(&Value, &Value) -> bool,
        ) -> bool {
            match &*other.body() {
                crate::value::Body::Opaque(ext) => {
                    format!("{:?}", ext) == format!("{:?}", ByLabel(self.0))
                }
                _ => false,
            }
        }
    }

    #[test]
    fn opaque_adapter_consulted_symmetrically() {
        let a = Obj::opaque(Rc::new(ByLabel("same")));
        let b = Obj::opaque(Rc::new(ByLabel("same")));
        let c = Obj::opaque(Rc::new(ByLabel("other")));
        assert!(deep_equal(&a.clone().into(), &b.into()));
        assert!(!deep_equal(&a.into(), &c.into()));
    }

    #[test]
    fn no_adapter_means_unequal() {
        let a = rec(&[("x", Value::int(1))]);
        let b = Obj::bytes(vec![]);
        assert!(!deep_equal(&a.into(), &b.into()));
    }
}
