use std::rc::Rc;

use derive_ex::derive_ex;

use crate::{
    Scope, Step,
    core::{Equal, NodeKind, ObserverNode},
};


/// Cached computation. Eager by default: the function runs at construction
/// and again when marked by the scheduler. [`Memo::lazy`] defers every run to
/// the next read instead.
#[derive_ex(Clone, bound())]
pub struct Memo<T: 'static>(pub(crate) Rc<ObserverNode<T>>);

impl<T: PartialEq + 'static> Memo<T> {
    /// Memo with value equality: when a recompute produces an equal value,
    /// downstream observers do not run.
    pub fn new(sc: &mut Scope, f: impl FnMut(&mut Scope) -> T + 'static) -> Self {
        Self::with_equal(sc, f, Equal::value())
    }

    /// Lazy variant: the first run happens at the first read, later runs at
    /// the first read after a dependency changed.
    pub fn lazy(sc: &mut Scope, f: impl FnMut(&mut Scope) -> T + 'static) -> Self {
        Self::lazy_with_equal(sc, f, Equal::value())
    }
}

impl<T: 'static> Memo<T> {
    pub fn with_equal(
        sc: &mut Scope,
        mut f: impl FnMut(&mut Scope) -> T + 'static,
        equal: Equal<T>,
    ) -> Self {
        Memo(ObserverNode::create(
            sc.rt(),
            NodeKind::Memo,
            Some(Box::new(move |sc| Step::Done(f(sc)))),
            None,
            equal,
            None,
            true,
        ))
    }

    pub fn lazy_with_equal(
        sc: &mut Scope,
        mut f: impl FnMut(&mut Scope) -> T + 'static,
        equal: Equal<T>,
    ) -> Self {
        Memo(ObserverNode::create(
            sc.rt(),
            NodeKind::Computed,
            Some(Box::new(move |sc| Step::Done(f(sc)))),
            None,
            equal,
            None,
            false,
        ))
    }

    /// Memo whose computation may suspend or fail; the previously committed
    /// value survives both.
    pub fn from_step(
        sc: &mut Scope,
        f: impl FnMut(&mut Scope) -> Step<T> + 'static,
        initial: Option<T>,
        equal: Equal<T>,
    ) -> Self {
        Memo(ObserverNode::create(
            sc.rt(),
            NodeKind::Memo,
            Some(Box::new(f)),
            initial,
            equal,
            None,
            true,
        ))
    }

    /// Read the cached value, recomputing first when it may be out of date.
    ///
    /// Panics when the memo has never produced a value (a lazy memo whose
    /// first run suspended); use [`Memo::try_get`] for that case.
    pub fn get(&self, sc: &mut Scope) -> T
    where
        T: Clone,
    {
        self.try_get(sc)
            .expect("memo read before it produced a value")
    }

    pub fn try_get(&self, sc: &mut Scope) -> Option<T>
    where
        T: Clone,
    {
        self.0.read_with(sc.rt(), |v| v.clone())
    }

    /// Borrow-style read.
    pub fn with<R>(&self, sc: &mut Scope, f: impl FnOnce(&T) -> R) -> R {
        self.0.read_with(sc.rt(), |v| {
            f(v.as_ref().expect("memo read before it produced a value"))
        })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.value.try_borrow() {
            Ok(value) => match &*value {
                Some(value) => value.fmt(f),
                None => write!(f, "<unevaluated>"),
            },
            Err(_) => write!(f, "<running>"),
        }
    }
}
