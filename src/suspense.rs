use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    HostError, Memo, Scope, Step,
    asynx::spawn_future,
    core::{Equal, NodeKind, NodeRef, ObserverNode, Runtime, WeakNode, mark_stale},
    owner::ContextKey,
    source::Source,
};

#[cfg(test)]
mod tests;

/// Pending-count boundary: while any suspended work is outstanding the
/// content computation's output is replaced by the fallback.
pub(crate) struct Boundary {
    pending: Cell<u32>,
    is_suspended: Source<bool>,
    error: Source<Option<HostError>>,
    content: RefCell<Option<WeakNode>>,
}

impl Boundary {
    pub(crate) fn increment(&self, rt: &mut Runtime) {
        let n = self.pending.get() + 1;
        self.pending.set(n);
        if n == 1 {
            self.is_suspended.set(true, Scope::new(rt));
        }
    }

    pub(crate) fn decrement(&self, rt: &mut Runtime) {
        let n = self.pending.get();
        debug_assert!(n > 0, "suspense pending count underflow");
        let n = n.saturating_sub(1);
        self.pending.set(n);
        if n == 0 {
            // rerun the content first, then let the swap observe it
            let content = self.content.borrow().clone().and_then(|w| w.upgrade());
            if let Some(content) = content {
                mark_stale(&content, rt);
            }
            self.is_suspended.set(false, Scope::new(rt));
            if !rt.is_running() {
                rt.run_queues();
            }
        }
    }

    fn fail(&self, e: HostError, rt: &mut Runtime) {
        self.error.set(Some(e), Scope::new(rt));
        self.decrement(rt);
    }
}

fn suspense_key() -> ContextKey<Rc<Boundary>> {
    static ID: OnceLock<u64> = OnceLock::new();
    static NEXT: AtomicU64 = AtomicU64::new(u64::MAX / 2);
    ContextKey::from_raw(*ID.get_or_init(|| NEXT.fetch_add(1, Ordering::Relaxed)))
}

pub(crate) fn current_boundary(sc: &Scope) -> Option<Rc<Boundary>> {
    sc.use_context(suspense_key()).map(|b| (*b).clone())
}

impl Scope {
    /// Suspend the current computation on `fut`: the enclosing boundary swaps
    /// to its fallback until the future resolves. Yields the step to return.
    pub fn suspend<T>(
        &mut self,
        fut: impl Future<Output = Result<(), HostError>> + 'static,
    ) -> Step<T> {
        let Some(boundary) = current_boundary(self) else {
            return Step::Failed(HostError::msg("suspension outside a suspense boundary"));
        };
        let rt = self.rt();
        boundary.increment(rt);
        spawn_future(rt, fut, move |result, rt| match result {
            Ok(()) => boundary.decrement(rt),
            Err(e) => boundary.fail(e, rt),
        });
        Step::Suspended
    }

    /// Whether the enclosing boundary currently has pending work.
    pub fn is_suspended(&mut self) -> bool {
        match current_boundary(self) {
            Some(b) => b.pending.get() > 0,
            None => false,
        }
    }
}

/// Build a suspense boundary: `content` may suspend; while it is pending (or
/// has never produced a value) the returned memo yields `fallback` output.
pub fn suspense<T: Clone + 'static>(
    sc: &mut Scope,
    content: impl FnMut(&mut Scope) -> Step<T> + 'static,
    mut fallback: impl FnMut(&mut Scope) -> T + 'static,
) -> Memo<T> {
    let boundary = Rc::new(Boundary {
        pending: Cell::new(0),
        is_suspended: Source::new(false),
        error: Source::with_equal(None, Equal::never()),
        content: RefCell::new(None),
    });
    let rt = sc.rt();
    // the content node carries the boundary in its context so that suspend()
    // inside the computation finds it, including on the first run
    let content_node = ObserverNode::create(
        rt,
        NodeKind::Memo,
        Some(Box::new(content)),
        None,
        Equal::never(),
        None,
        false,
    );
    content_node.core.contexts.borrow_mut().insert(
        suspense_key().raw(),
        Rc::new(boundary.clone()) as Rc<dyn std::any::Any>,
    );
    {
        let node: NodeRef = content_node.clone();
        *boundary.content.borrow_mut() = Some(Rc::downgrade(&node));
        sc.rt().batch_run(move |rt| crate::core::run_refresh(node, rt));
    }
    let content = Memo(content_node);
    let suspended = boundary.is_suspended.clone();
    Memo::with_equal(
        sc,
        move |sc| {
            let pending = suspended.get(sc);
            match content.try_get(sc) {
                Some(v) if !pending => v,
                _ => fallback(sc),
            }
        },
        Equal::never(),
    )
}

/// Error published by the enclosing boundary, if any.
pub fn suspense_error(sc: &mut Scope) -> Option<HostError> {
    let b = current_boundary(sc)?;
    b.error.get(sc)
}
