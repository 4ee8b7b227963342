use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use derive_ex::derive_ex;
use serde::{Deserialize, Serialize};

use crate::{
    Scope,
    core::{
        ChangeEntry, Equal, Runtime, SubRecord, Slot, Upstream, collect_subscribers, mark_stale,
        track, unsubscribe_at,
    },
};


/// Writable observable cell. Reads track the running observer; writes stage a
/// value and propagate through the scheduler.
#[derive_ex(Clone, bound())]
pub struct Source<T: 'static>(pub(crate) Rc<SourceNode<T>>);

pub(crate) struct SourceNode<T: 'static> {
    value: RefCell<T>,
    staged: RefCell<Option<T>>,
    pub(crate) sub: RefCell<SubRecord>,
    locks: Cell<u32>,
    in_changes: Cell<bool>,
    equal: Equal<T>,
}

impl<T: PartialEq + 'static> Source<T> {
    /// Create a source that short-circuits writes of an equal value.
    pub fn new(value: T) -> Self {
        Self::with_equal(value, Equal::value())
    }
}

impl<T: 'static> Source<T> {
    pub fn with_equal(value: T, equal: Equal<T>) -> Self {
        Source(Rc::new(SourceNode {
            value: RefCell::new(value),
            staged: RefCell::new(None),
            sub: RefCell::new(SubRecord::default()),
            locks: Cell::new(0),
            in_changes: Cell::new(false),
            equal,
        }))
    }

    /// Read the committed value, adding a dependency when tracking is on.
    /// A staged value is never visible here.
    pub fn get(&self, sc: &mut Scope) -> T
    where
        T: Clone,
    {
        self.with(sc, T::clone)
    }

    /// Borrow-style read for payloads that are expensive to clone.
    pub fn with<R>(&self, sc: &mut Scope, f: impl FnOnce(&T) -> R) -> R {
        track(self.0.clone(), &self.0.sub, sc.rt());
        let value = self.0.value.borrow();
        f(&value)
    }

    /// Stage `value` and propagate. Outside a scheduler run the write drains
    /// the queues before returning; inside a run it is enqueued once.
    pub fn set(&self, value: T, sc: &mut Scope) {
        let unchanged = {
            let staged = self.0.staged.borrow();
            let committed = self.0.value.borrow();
            let current = staged.as_ref().unwrap_or(&committed);
            self.0.equal.check(current, &value)
        };
        if unchanged {
            return;
        }
        *self.0.staged.borrow_mut() = Some(value);
        self.push_staged(sc.rt());
    }

    /// Write computed from the current committed-or-staged value.
    pub fn update(&self, f: impl FnOnce(&T) -> T, sc: &mut Scope) {
        let next = {
            let staged = self.0.staged.borrow();
            let committed = self.0.value.borrow();
            f(staged.as_ref().unwrap_or(&committed))
        };
        self.set(next, sc);
    }

    fn push_staged(&self, rt: &mut Runtime) {
        let node = &self.0;
        if node.locks.get() > 0 {
            return;
        }
        if rt.is_running() {
            node.enqueue(rt, &self.0);
            return;
        }
        if node.sub.borrow().is_empty() {
            // no dependents: commit in place
            if let Some(v) = node.staged.borrow_mut().take() {
                *node.value.borrow_mut() = v;
            }
            return;
        }
        node.enqueue(rt, &self.0);
        rt.run_queues();
    }

    /// Freeze propagation. While locked, writes keep staging but subscribers
    /// only see the committed value.
    pub fn lock(&self) {
        self.0.locks.set(self.0.locks.get() + 1);
    }

    /// Release one lock. Dropping the last lock commits the staged value,
    /// synchronously when no run is in progress.
    pub fn unlock(&self, sc: &mut Scope) {
        let node = &self.0;
        let n = node.locks.get();
        assert!(n > 0, "unlock of a source that is not locked");
        node.locks.set(n - 1);
        if n == 1 && node.staged.borrow().is_some() {
            let rt = sc.rt();
            node.enqueue(rt, &self.0);
            if !rt.is_running() {
                rt.run_queues();
            }
        }
    }

    pub fn lock_handle(&self) -> LockHandle {
        LockHandle(self.0.clone())
    }

    /// Split into a read half and a write half sharing this cell.
    pub fn split(&self) -> (ReadSource<T>, WriteSource<T>) {
        (ReadSource(self.clone()), WriteSource(self.clone()))
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.0.sub.borrow().is_empty()
    }
}

impl<T: 'static> SourceNode<T> {
    fn enqueue(&self, rt: &mut Runtime, this: &Rc<SourceNode<T>>) {
        if !self.in_changes.replace(true) {
            rt.schedule_change(this.clone());
        }
    }
}

impl<T: 'static> ChangeEntry for SourceNode<T> {
    fn commit(self: Rc<Self>, rt: &mut Runtime) {
        self.in_changes.set(false);
        if self.locks.get() > 0 {
            // deferred until the lock drops; the staged value stays put
            return;
        }
        let Some(v) = self.staged.borrow_mut().take() else {
            return;
        };
        *self.value.borrow_mut() = v;
        for d in collect_subscribers(&self.sub) {
            mark_stale(&d, rt);
        }
    }
}

impl<T: 'static> Upstream for SourceNode<T> {
    fn unsubscribe(&self, slot: Slot) {
        unsubscribe_at(&self.sub, slot);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.value.try_borrow() {
            Ok(value) => std::fmt::Debug::fmt(&*value, f),
            Err(_) => write!(f, "<borrowed>"),
        }
    }
}

impl<T> Serialize for Source<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        match self.0.value.try_borrow() {
            Ok(value) => T::serialize(&value, serializer),
            Err(_) => Err(serde::ser::Error::custom("borrowed")),
        }
    }
}

impl<'de, T> Deserialize<'de> for Source<T>
where
    T: Deserialize<'de> + PartialEq,
{
    fn deserialize<D>(deserializer: D) -> Result<Source<T>, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Source::new)
    }
}

/// Read half of a source.
#[derive_ex(Clone, bound())]
pub struct ReadSource<T: 'static>(pub(crate) Source<T>);

impl<T: 'static> ReadSource<T> {
    pub fn get(&self, sc: &mut Scope) -> T
    where
        T: Clone,
    {
        self.0.get(sc)
    }
    pub fn with<R>(&self, sc: &mut Scope, f: impl FnOnce(&T) -> R) -> R {
        self.0.with(sc, f)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReadSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Write half of a source.
#[derive_ex(Clone, bound())]
pub struct WriteSource<T: 'static>(pub(crate) Source<T>);

impl<T: 'static> WriteSource<T> {
    pub fn set(&self, value: T, sc: &mut Scope) {
        self.0.set(value, sc);
    }
    pub fn update(&self, f: impl FnOnce(&T) -> T, sc: &mut Scope) {
        self.0.update(f, sc);
    }
}

/// Create a read/write pair backed by one cell.
pub fn signal_pair<T: PartialEq + 'static>(initial: T) -> (ReadSource<T>, WriteSource<T>) {
    Source::new(initial).split()
}

pub(crate) trait Lockable: 'static {
    fn lock_raw(&self);
    fn unlock_raw(self: Rc<Self>, rt: &mut Runtime);
}

impl<T: 'static> Lockable for SourceNode<T> {
    fn lock_raw(&self) {
        self.locks.set(self.locks.get() + 1);
    }

    fn unlock_raw(self: Rc<Self>, rt: &mut Runtime) {
        let n = self.locks.get();
        debug_assert!(n > 0);
        self.locks.set(n - 1);
        if n == 1 && self.staged.borrow().is_some() && !self.in_changes.replace(true) {
            // re-enter the changes queue now that propagation may resume
            rt.schedule_change(self);
        }
    }
}

/// Type-erased lock on a source, held by pipeline actions for their
/// duration.
#[derive(Clone)]
pub struct LockHandle(pub(crate) Rc<dyn Lockable>);

impl LockHandle {
    pub(crate) fn acquire(&self) {
        self.0.lock_raw();
    }
    pub(crate) fn release(&self, rt: &mut Runtime) {
        self.0.clone().unlock_raw(rt);
    }
}
