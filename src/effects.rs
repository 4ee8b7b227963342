use std::{cell::RefCell, collections::HashMap, hash::Hash, rc::Rc};

use crate::{
    Scope, Step,
    asynx::Sched,
    core::{Equal, NodeKind, ObserverNode, mark_stale},
    source::Source,
};

#[cfg(test)]
mod tests;

fn unit_node(
    sc: &mut Scope,
    kind: NodeKind,
    mut f: impl FnMut(&mut Scope) + 'static,
    defer: Option<Sched>,
    run_now: bool,
) -> Rc<ObserverNode<()>> {
    ObserverNode::create(
        sc.rt(),
        kind,
        Some(Box::new(move |sc| {
            f(sc);
            Step::Done(())
        })),
        None,
        Equal::never(),
        defer,
        run_now,
    )
}

/// Eager observer: runs once now, then again in the update phase whenever a
/// dependency changes.
pub fn observe(sc: &mut Scope, f: impl FnMut(&mut Scope) + 'static) {
    unit_node(sc, NodeKind::Observer, f, None, true);
}

/// Effect-phase observer that runs before after-effects.
pub fn render_effect(sc: &mut Scope, f: impl FnMut(&mut Scope) + 'static) {
    unit_node(sc, NodeKind::RenderEffect, f, None, true);
}

/// Effect-phase observer that runs after all render effects.
pub fn after_effect(sc: &mut Scope, f: impl FnMut(&mut Scope) + 'static) {
    unit_node(sc, NodeKind::AfterEffect, f, None, true);
}

/// Run `f` once, untracked, in the next after-effect phase.
pub fn on_mount(sc: &mut Scope, f: impl FnOnce(&mut Scope) + 'static) {
    let mut f = Some(f);
    let node = unit_node(
        sc,
        NodeKind::AfterEffect,
        move |sc| {
            if let Some(f) = f.take() {
                sc.untrack(f);
            }
        },
        None,
        false,
    );
    let node: crate::core::NodeRef = node;
    mark_stale(&node, sc.rt());
}

/// Observer whose re-runs coalesce through an AsynX source: marks arriving
/// within one frame cause a single deferred run.
pub fn asynx_observe(sc: &mut Scope, sched: Sched, f: impl FnMut(&mut Scope) + 'static) {
    unit_node(sc, NodeKind::Observer, f, Some(sched), true);
}

pub fn asynx_render_effect(sc: &mut Scope, sched: Sched, f: impl FnMut(&mut Scope) + 'static) {
    unit_node(sc, NodeKind::RenderEffect, f, Some(sched), true);
}

pub fn asynx_after_effect(sc: &mut Scope, sched: Sched, f: impl FnMut(&mut Scope) + 'static) {
    unit_node(sc, NodeKind::AfterEffect, f, Some(sched), true);
}

/// Wrap a computation so it only depends on `deps`. The body runs untracked
/// with the captured dependency value; with `on_changes` the first run is
/// skipped and `None` is returned.
pub fn restrict_to<D: 'static, T>(
    mut deps: impl FnMut(&mut Scope) -> D + 'static,
    mut f: impl FnMut(&mut Scope, &D) -> T + 'static,
    on_changes: bool,
) -> impl FnMut(&mut Scope) -> Option<T> + 'static {
    let mut first = true;
    move |sc| {
        let d = deps(sc);
        let skip = on_changes && std::mem::take(&mut first);
        sc.untrack(|sc| if skip { None } else { Some(f(sc, &d)) })
    }
}

/// Key-match observable: `selected(k)` only notifies observers whose match
/// state actually flipped when the selection source changes.
pub struct Selector<K: 'static> {
    keys: Rc<RefCell<HashMap<K, Source<bool>>>>,
    current: Rc<RefCell<Option<K>>>,
}

impl<K> Clone for Selector<K> {
    fn clone(&self) -> Self {
        Selector {
            keys: self.keys.clone(),
            current: self.current.clone(),
        }
    }
}

pub fn selector<K>(
    sc: &mut Scope,
    mut source: impl FnMut(&mut Scope) -> K + 'static,
) -> Selector<K>
where
    K: Clone + Eq + Hash + 'static,
{
    let keys: Rc<RefCell<HashMap<K, Source<bool>>>> = Rc::new(RefCell::new(HashMap::new()));
    let current: Rc<RefCell<Option<K>>> = Rc::new(RefCell::new(None));
    observe(sc, {
        let keys = keys.clone();
        let current = current.clone();
        move |sc| {
            let next = source(sc);
            let prev = current.borrow_mut().replace(next.clone());
            if prev.as_ref() == Some(&next) {
                return;
            }
            // flip both ends unconditionally; equality on the per-key
            // sources suppresses the no-op side
            let prev_src = prev.and_then(|p| keys.borrow().get(&p).cloned());
            let next_src = keys.borrow().get(&next).cloned();
            if let Some(s) = prev_src {
                s.set(false, sc);
            }
            if let Some(s) = next_src {
                s.set(true, sc);
            }
            keys.borrow_mut()
                .retain(|k, s| s.has_subscribers() || Some(k) == current.borrow().as_ref());
        }
    });
    Selector { keys, current }
}

impl<K> Selector<K>
where
    K: Clone + Eq + Hash + 'static,
{
    /// Whether `key` is the selected one; tracks only the flip of this key.
    pub fn selected(&self, key: K, sc: &mut Scope) -> bool {
        let src = {
            let mut keys = self.keys.borrow_mut();
            keys.entry(key.clone())
                .or_insert_with(|| Source::new(Some(&key) == self.current.borrow().as_ref()))
                .clone()
        };
        src.get(sc)
    }
}
