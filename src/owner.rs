use std::{
    any::Any,
    marker::PhantomData,
    rc::Rc,
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    Scope,
    core::{
        NodeKind, NodeRef, ObserverNode, Runtime, Step, UnownedDisposalError, WeakNode,
        dispose_detached, run_refresh,
    },
    core::Equal,
};


/// Opaque typed key into the owner context chain.
pub struct ContextKey<T: 'static> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ContextKey<T> {}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

impl<T: 'static> ContextKey<T> {
    pub fn new() -> Self {
        Self::from_raw(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(id: u64) -> Self {
        ContextKey {
            id,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(self) -> u64 {
        self.id
    }
}

impl<T: 'static> Default for ContextKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Attach `value` to the current owner under `key`; visible to this owner
    /// and everything it owns.
    pub fn provide_context<T: 'static>(&mut self, key: ContextKey<T>, value: T) {
        self.provide_context_raw(key.id, Rc::new(value) as Rc<dyn Any>);
    }

    /// Look `key` up along the owner chain.
    pub fn use_context<T: 'static>(&self, key: ContextKey<T>) -> Option<Rc<T>> {
        self.use_context_raw(key.id)
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Handle to the current owner, usable for remounting and disposal.
    pub fn owner(&self) -> OwnerHandle {
        OwnerHandle(Rc::downgrade(&self.current_owner_node()))
    }
}

/// Weak handle to an owner node.
#[derive(Clone)]
pub struct OwnerHandle(pub(crate) WeakNode);

impl OwnerHandle {
    /// Dispose the owned subtree. Panics on the runtime's unowned root.
    pub fn dispose(&self, sc: &mut Scope) {
        let Some(node) = self.0.upgrade() else {
            return;
        };
        let rt = sc.rt();
        if std::ptr::addr_eq(Rc::as_ptr(&node), Rc::as_ptr(&rt.unowned)) {
            panic!("{}", UnownedDisposalError::new());
        }
        request_dispose(node, rt);
    }
}

/// Disposal handle for a root; scheduling honors the run in progress.
#[derive(Clone)]
pub struct Disposer(pub(crate) NodeRef);

impl Disposer {
    pub fn dispose(self, sc: &mut Scope) {
        request_dispose(self.0, sc.rt());
    }
}

fn request_dispose(node: NodeRef, rt: &mut Runtime) {
    if rt.is_running() {
        rt.schedule_dispose(node);
    } else {
        dispose_detached(&node, rt);
    }
}

fn make_root(rt: &mut Runtime, detached: bool) -> NodeRef {
    let prev = if detached {
        rt.owner.replace(rt.unowned.clone())
    } else {
        rt.owner.clone()
    };
    let node: NodeRef = ObserverNode::<()>::create(
        rt,
        NodeKind::Root,
        None,
        None,
        Equal::never(),
        None,
        false,
    );
    rt.owner = prev;
    node
}

fn under_root<R>(rt: &mut Runtime, root: &NodeRef, f: impl FnOnce(&mut Scope) -> R) -> R {
    let prev_owner = rt.owner.replace(root.clone());
    let prev_listener = rt.listener.take();
    let r = f(Scope::new(rt));
    rt.owner = prev_owner;
    rt.listener = prev_listener;
    r
}

/// Create an owner root under the current owner and run `f` inside it,
/// untracked. `f` receives the root's disposer.
pub fn root<R>(sc: &mut Scope, f: impl FnOnce(&mut Scope, Disposer) -> R) -> R {
    let rt = sc.rt();
    let node = make_root(rt, false);
    let disposer = Disposer(node.clone());
    under_root(rt, &node, |sc| f(sc, disposer))
}

/// Application context installed by [`app_root`].
pub struct AppContext {
    root: OwnerHandle,
}

impl AppContext {
    /// Owner of the application root; detached work mounts under it.
    pub fn owner(&self) -> OwnerHandle {
        self.root.clone()
    }
}

fn app_context_key_id() -> u64 {
    static ID: OnceLock<u64> = OnceLock::new();
    *ID.get_or_init(|| NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn app_context_key() -> ContextKey<AppContext> {
    ContextKey::from_raw(app_context_key_id())
}

/// Application root: detached from the current owner, with an [`AppContext`]
/// visible to everything inside.
pub fn app_root<R>(sc: &mut Scope, f: impl FnOnce(&mut Scope, Disposer) -> R) -> R {
    app_root_with(sc, |_| {}, f)
}

/// [`app_root`] with an initializer that runs inside the root before `f`.
pub fn app_root_with<R>(
    sc: &mut Scope,
    init: impl FnOnce(&mut Scope),
    f: impl FnOnce(&mut Scope, Disposer) -> R,
) -> R {
    let rt = sc.rt();
    let node = make_root(rt, true);
    let disposer = Disposer(node.clone());
    under_root(rt, &node, |sc| {
        sc.provide_context(
            app_context_key(),
            AppContext {
                root: OwnerHandle(Rc::downgrade(&node)),
            },
        );
        init(sc);
        f(sc, disposer)
    })
}

/// Root whose body can be re-run in place via [`remount`]. Cleanups of the
/// previous run fire with `final=false`; owned observers are rebuilt.
pub fn remountable_root(
    sc: &mut Scope,
    mut f: impl FnMut(&mut Scope, &Disposer) + 'static,
) -> OwnerHandle {
    let rt = sc.rt();
    let node = Rc::new_cyclic(|weak: &std::rc::Weak<ObserverNode<()>>| {
        let weak = weak.clone();
        let body: crate::core::Computation<()> = Box::new(move |sc| {
            if let Some(this) = weak.upgrade() {
                let disposer = Disposer(this);
                f(sc, &disposer);
            }
            Step::Done(())
        });
        ObserverNode::bare(NodeKind::RemountableRoot, Some(body))
    });
    let owner = rt.current_owner();
    *node.core.owner.borrow_mut() = Some(Rc::downgrade(&owner));
    owner.core().owned.borrow_mut().push(node.clone());
    let nref: NodeRef = node;
    {
        // writes performed by the first run commit when it returns
        let node = nref.clone();
        rt.batch_run(move |rt| run_refresh(node, rt));
    }
    OwnerHandle(Rc::downgrade(&nref))
}

/// Re-run a remountable root's body in place.
pub fn remount(sc: &mut Scope, owner: &OwnerHandle) {
    let Some(node) = owner.0.upgrade() else {
        return;
    };
    let rt = sc.rt();
    if std::ptr::addr_eq(Rc::as_ptr(&node), Rc::as_ptr(&rt.unowned)) {
        panic!("{}", UnownedDisposalError::new());
    }
    assert!(
        node.core().kind == NodeKind::RemountableRoot,
        "remount target is not a remountable root"
    );
    rt.batch_run(move |rt| run_refresh(node, rt));
}
