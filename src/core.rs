use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
};

use parse_display::Display;

use crate::{asynx, clock::HostClock, clock::ManualClock, utils::DrainQueue};


/// Rounds of eager-queue work a single flush may perform before the runtime
/// assumes feedback will never settle.
const RUNAWAY_ROUNDS: u32 = 100_000;

pub(crate) mod state {
    pub const ACTUAL: u8 = 0;
    pub const STALE: u8 = 1;
    pub const PENDING: u8 = 2;
    pub const PENDING_DISPOSAL: u8 = 4;
    pub const RUNNING: u8 = 8;
    pub const DISPOSED: u8 = 16;
    /// Bits that mean "an upstream resolution is still outstanding".
    pub const UPSTREAMABLE: u8 = PENDING | PENDING_DISPOSAL;
    /// Bits that force a read to bring the value up to date first.
    pub const LIFTABLE: u8 = STALE | PENDING | PENDING_DISPOSAL;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum NodeKind {
    Memo,
    Observer,
    RenderEffect,
    AfterEffect,
    Computed,
    Root,
    RemountableRoot,
}

impl NodeKind {
    pub(crate) fn is_lazy(self) -> bool {
        self == NodeKind::Computed
    }
    pub(crate) fn is_root(self) -> bool {
        matches!(self, NodeKind::Root | NodeKind::RemountableRoot)
    }
    fn tracks(self) -> bool {
        !self.is_root()
    }
}

/// Back-index into the other side of a subscription. `PRIMARY` addresses the
/// scalar slot, non-negative values index the parallel vectors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Slot(pub(crate) i32);

impl Slot {
    pub(crate) const PRIMARY: Slot = Slot(-1);
    pub(crate) fn is_primary(self) -> bool {
        self.0 < 0
    }
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Equality predicate carried by every source and memo. `Never` is the
/// never-equal sentinel that disables the short-circuit end to end.
pub enum Equal<T: ?Sized> {
    Never,
    With(Rc<dyn Fn(&T, &T) -> bool>),
}

impl<T: ?Sized> Clone for Equal<T> {
    fn clone(&self) -> Self {
        match self {
            Equal::Never => Equal::Never,
            Equal::With(f) => Equal::With(f.clone()),
        }
    }
}

impl<T: ?Sized> Equal<T> {
    pub fn never() -> Self {
        Equal::Never
    }
    pub fn by(f: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Equal::With(Rc::new(f))
    }
    pub fn value() -> Self
    where
        T: PartialEq,
    {
        Self::by(|a, b| a == b)
    }
    pub(crate) fn has(&self) -> bool {
        matches!(self, Equal::With(_))
    }
    pub(crate) fn check(&self, a: &T, b: &T) -> bool {
        match self {
            Equal::Never => false,
            Equal::With(f) => f(a, b),
        }
    }
}

/// Result of one computation run. `Suspended` and `Failed` leave the
/// previously committed value in place.
pub enum Step<T> {
    Done(T),
    Suspended,
    Failed(HostError),
}

/// A failure raised by user code and routed through owner error handlers.
#[derive(Clone)]
pub struct HostError(Rc<str>);

impl HostError {
    pub fn msg(message: impl Into<String>) -> Self {
        HostError(message.into().into())
    }
    pub fn from_error(e: impl std::error::Error) -> Self {
        Self::msg(e.to_string())
    }
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostError({:?})", &*self.0)
    }
}

impl std::error::Error for HostError {}

#[derive(Display, Debug)]
#[display("circular dependency detected: observer read while it is running")]
pub struct CircularError {
    _private: (),
}

impl CircularError {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

impl std::error::Error for CircularError {}

#[derive(Display, Debug)]
#[display("runaway scheduler: eager queues failed to settle")]
pub struct RunawayError {
    _private: (),
}

impl RunawayError {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

impl std::error::Error for RunawayError {}

#[derive(Display, Debug)]
#[display("the unowned root cannot be disposed or remounted")]
pub struct UnownedDisposalError {
    _private: (),
}

impl UnownedDisposalError {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

impl std::error::Error for UnownedDisposalError {}

/// The source side of a subscription: an observer connects to it and later
/// detaches by slot.
pub(crate) trait Upstream: 'static {
    fn unsubscribe(&self, slot: Slot);
}

/// Type-erased observer node as seen by the scheduler and by subscriptions.
pub(crate) trait AnyNode: 'static {
    fn core(&self) -> &NodeCore;
    /// Recompute the value in place. Returns whether the value changed under
    /// the node's equality.
    fn refresh(self: Rc<Self>, rt: &mut Runtime) -> bool;
    /// Drop the computation and the value on disposal.
    fn clear_body(&self);
}

pub(crate) type NodeRef = Rc<dyn AnyNode>;
pub(crate) type WeakNode = Weak<dyn AnyNode>;

/// Observer-side half of one subscription edge.
pub(crate) struct SourceEdge {
    pub(crate) source: Rc<dyn Upstream>,
    pub(crate) slot: Slot,
}

/// Source-side subscriber record: a primary scalar back-edge plus parallel
/// vectors, each entry holding the back-index into its observer's inputs.
#[derive(Default)]
pub(crate) struct SubRecord {
    ob1: Option<WeakNode>,
    slot1: Slot,
    obs: Vec<WeakNode>,
    slots: Vec<Slot>,
}

impl Default for Slot {
    fn default() -> Self {
        Slot::PRIMARY
    }
}

impl SubRecord {
    pub(crate) fn is_empty(&self) -> bool {
        self.ob1.is_none() && self.obs.is_empty()
    }
}

/// Unified observer record shared by every node kind.
pub(crate) struct NodeCore {
    pub(crate) kind: NodeKind,
    pub(crate) state: Cell<u8>,
    pub(crate) age: Cell<u64>,
    pub(crate) has_equal: bool,
    source1: RefCell<Option<SourceEdge>>,
    sources: RefCell<Vec<SourceEdge>>,
    pending_deps: RefCell<Vec<Option<NodeRef>>>,
    deps_cursor: Cell<usize>,
    pub(crate) owner: RefCell<Option<WeakNode>>,
    pub(crate) owned: RefCell<Vec<NodeRef>>,
    pub(crate) cleanups: RefCell<Vec<Box<dyn FnOnce(bool)>>>,
    pub(crate) error_handler: RefCell<Option<Rc<dyn Fn(&mut Scope, &HostError)>>>,
    pub(crate) contexts: RefCell<HashMap<u64, Rc<dyn Any>>>,
    pub(crate) sub: RefCell<SubRecord>,
    pub(crate) defer: Cell<Option<asynx::Sched>>,
    pub(crate) defer_queued: Cell<bool>,
}

impl NodeCore {
    fn new(kind: NodeKind, has_equal: bool, defer: Option<asynx::Sched>) -> Self {
        Self {
            kind,
            state: Cell::new(state::ACTUAL),
            age: Cell::new(0),
            has_equal,
            source1: RefCell::new(None),
            sources: RefCell::new(Vec::new()),
            pending_deps: RefCell::new(Vec::new()),
            deps_cursor: Cell::new(0),
            owner: RefCell::new(None),
            owned: RefCell::new(Vec::new()),
            cleanups: RefCell::new(Vec::new()),
            error_handler: RefCell::new(None),
            contexts: RefCell::new(HashMap::new()),
            sub: RefCell::new(SubRecord::default()),
            defer: Cell::new(defer),
            defer_queued: Cell::new(false),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.get() & state::DISPOSED != 0
    }
}

pub(crate) type Computation<T> = Box<dyn FnMut(&mut Scope) -> Step<T>>;

pub(crate) struct ObserverNode<T: 'static> {
    pub(crate) core: NodeCore,
    pub(crate) value: RefCell<Option<T>>,
    pub(crate) f: RefCell<Option<Computation<T>>>,
    pub(crate) equal: Equal<T>,
}

impl<T: 'static> ObserverNode<T> {
    /// Node with no owner attachment and no initial run; the caller wires it
    /// into the tree.
    pub(crate) fn bare(kind: NodeKind, f: Option<Computation<T>>) -> ObserverNode<T> {
        ObserverNode {
            core: NodeCore::new(kind, false, None),
            value: RefCell::new(None),
            f: RefCell::new(f),
            equal: Equal::never(),
        }
    }

    pub(crate) fn create(
        rt: &mut Runtime,
        kind: NodeKind,
        f: Option<Computation<T>>,
        initial: Option<T>,
        equal: Equal<T>,
        defer: Option<asynx::Sched>,
        run_now: bool,
    ) -> Rc<Self> {
        let node = Rc::new(ObserverNode {
            core: NodeCore::new(kind, equal.has(), defer),
            value: RefCell::new(initial),
            f: RefCell::new(f),
            equal,
        });
        let owner = rt.current_owner();
        *node.core.owner.borrow_mut() = Some(Rc::downgrade(&owner));
        owner.core().owned.borrow_mut().push(node.clone());
        if run_now && !kind.is_lazy() && node.f.borrow().is_some() {
            // writes performed by the first run commit when it returns
            let n = node.clone();
            rt.batch_run(move |rt| run_refresh(n, rt));
        }
        node
    }

    /// Ensure the value is current, then connect to the tracking listener and
    /// hand the value slot to `read`.
    pub(crate) fn read_with<R>(
        self: &Rc<Self>,
        rt: &mut Runtime,
        read: impl FnOnce(&Option<T>) -> R,
    ) -> R {
        let node: NodeRef = self.clone();
        let core = &self.core;
        if core.state.get() & state::RUNNING != 0 {
            panic!("{}", CircularError::new());
        }
        if !core.is_disposed() {
            if self.value.borrow().is_none() && self.f.borrow().is_some() {
                // first read of a lazy node computes in place
                let n = node.clone();
                rt.batch_run(move |rt| run_refresh(n, rt));
            } else if core.state.get() & state::LIFTABLE != 0 {
                let n = node.clone();
                rt.batch_run(move |rt| lift_node(&n, rt));
            }
        }
        track(self.clone(), &core.sub, rt);
        read(&self.value.borrow())
    }
}

impl<T: 'static> AnyNode for ObserverNode<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn refresh(self: Rc<Self>, rt: &mut Runtime) -> bool {
        let this: NodeRef = self.clone();
        run_cleanups(&self.core, false);
        dispose_owned(&self.core, rt);
        disconnect_inputs(&self.core);
        self.core.pending_deps.borrow_mut().clear();
        self.core.deps_cursor.set(0);
        self.core.state.set(state::RUNNING);
        let prev_owner = rt.owner.replace(this.clone());
        let prev_listener = if self.core.kind.tracks() {
            rt.listener.replace(this.clone())
        } else {
            rt.listener.take()
        };
        let step = {
            let mut f = self.f.borrow_mut();
            match f.as_mut() {
                Some(f) => f(Scope::new(rt)),
                None => Step::Suspended,
            }
        };
        rt.owner = prev_owner;
        rt.listener = prev_listener;
        self.core.state.set(state::ACTUAL);
        match step {
            Step::Done(v) => {
                let mut slot = self.value.borrow_mut();
                let changed = match slot.as_ref() {
                    Some(old) => !self.equal.check(old, &v),
                    None => true,
                };
                *slot = Some(v);
                changed
            }
            Step::Suspended => false,
            Step::Failed(e) => {
                route_error(&this, rt, e);
                false
            }
        }
    }

    fn clear_body(&self) {
        *self.f.borrow_mut() = None;
        *self.value.borrow_mut() = None;
    }
}

impl<T: 'static> Upstream for ObserverNode<T> {
    fn unsubscribe(&self, slot: Slot) {
        unsubscribe_at(&self.core.sub, slot);
    }
}

/// Connect the running listener to `sub`, recording matching slot indices on
/// both sides.
pub(crate) fn track(source: Rc<impl Upstream>, sub: &RefCell<SubRecord>, rt: &mut Runtime) {
    let source: Rc<dyn Upstream> = source;
    let Some(listener) = rt.listener.clone() else {
        return;
    };
    let core = listener.core();
    if let Some(e1) = &*core.source1.borrow() {
        if std::ptr::addr_eq(Rc::as_ptr(&e1.source), Rc::as_ptr(&source)) {
            // already connected through the primary edge; its back-slot must
            // point straight back at the scalar
            debug_assert!(!e1.slot.is_primary() || sub.borrow().slot1.is_primary());
            return;
        }
    }
    let at = if core.source1.borrow().is_none() {
        Slot::PRIMARY
    } else {
        Slot(core.sources.borrow().len() as i32)
    };
    let slot = {
        let mut s = sub.borrow_mut();
        if s.ob1.is_none() {
            s.ob1 = Some(Rc::downgrade(&listener));
            s.slot1 = at;
            Slot::PRIMARY
        } else {
            s.obs.push(Rc::downgrade(&listener));
            s.slots.push(at);
            Slot(s.obs.len() as i32 - 1)
        }
    };
    let edge = SourceEdge { source, slot };
    if at.is_primary() {
        *core.source1.borrow_mut() = Some(edge);
    } else {
        core.sources.borrow_mut().push(edge);
    }
}

/// Detach one subscriber by slot: O(1) swap-with-last plus back-index patch
/// on whichever observer the last entry belonged to.
pub(crate) fn unsubscribe_at(sub: &RefCell<SubRecord>, slot: Slot) {
    let moved = {
        let mut s = sub.borrow_mut();
        if slot.is_primary() {
            s.ob1 = None;
            None
        } else {
            let i = slot.index();
            s.obs.swap_remove(i);
            s.slots.swap_remove(i);
            if i < s.obs.len() {
                Some((s.obs[i].clone(), s.slots[i], Slot(i as i32)))
            } else {
                None
            }
        }
    };
    if let Some((observer, at, new_slot)) = moved {
        if let Some(observer) = observer.upgrade() {
            retarget(observer.core(), at, new_slot);
        }
    }
}

fn retarget(core: &NodeCore, at: Slot, new_slot: Slot) {
    if at.is_primary() {
        if let Some(e) = core.source1.borrow_mut().as_mut() {
            e.slot = new_slot;
        }
    } else if let Some(e) = core.sources.borrow_mut().get_mut(at.index()) {
        e.slot = new_slot;
    }
}

/// Drop all input edges of an observer before a re-run or disposal.
pub(crate) fn disconnect_inputs(core: &NodeCore) {
    loop {
        // pop one edge per step: the unsubscribe may patch back-indices of
        // our remaining edges, so the borrow must not be held across it
        let edge = core.sources.borrow_mut().pop();
        match edge {
            Some(e) => e.source.unsubscribe(e.slot),
            None => break,
        }
    }
    let e1 = core.source1.borrow_mut().take();
    if let Some(e) = e1 {
        e.source.unsubscribe(e.slot);
    }
}

pub(crate) fn collect_subscribers(sub: &RefCell<SubRecord>) -> Vec<NodeRef> {
    let s = sub.borrow();
    s.ob1
        .iter()
        .chain(s.obs.iter())
        .filter_map(|w| w.upgrade())
        .collect()
}

/// Marking kernels. A definite change marks Stale; a change behind an
/// equality-bearing ancestor marks Pending with that ancestor recorded as an
/// outstanding dep. State bits plus lift-on-read keep stray queue entries
/// harmless.
pub(crate) fn mark_stale(node: &NodeRef, rt: &mut Runtime) {
    let core = node.core();
    if core.is_disposed() {
        return;
    }
    let first = core.age.get() < rt.tick;
    core.age.set(rt.tick);
    let had_work = core.state.get() & (state::STALE | state::PENDING) != 0;
    core.state.set(core.state.get() | state::STALE);
    if !had_work {
        rt.schedule(node.clone());
    }
    if first {
        mark_owned_dropping(core);
        downstream(node, rt, None);
    }
}

pub(crate) fn mark_pending(node: &NodeRef, rt: &mut Runtime, ancestor: &NodeRef) {
    let core = node.core();
    if core.is_disposed() {
        return;
    }
    let first = core.age.get() < rt.tick;
    core.age.set(rt.tick);
    core.state.set(core.state.get() | state::PENDING);
    core.pending_deps.borrow_mut().push(Some(ancestor.clone()));
    // one queue entry per outstanding dep
    rt.schedule(node.clone());
    if first {
        mark_owned_soft(core);
        downstream(node, rt, Some(ancestor));
    }
}

/// Commit notification from an equality-bearing ancestor whose value did
/// change.
pub(crate) fn mark_stale_pending(node: &NodeRef, rt: &mut Runtime) {
    let core = node.core();
    if core.is_disposed() {
        return;
    }
    if core.age.get() < rt.tick {
        core.age.set(rt.tick);
    }
    let st = core.state.get();
    let had_work = st & (state::STALE | state::PENDING) != 0;
    if st & state::PENDING != 0 {
        core.pending_deps.borrow_mut().clear();
        core.deps_cursor.set(0);
    }
    core.state.set((st & !state::PENDING) | state::STALE);
    if !had_work {
        rt.schedule(node.clone());
    }
    mark_owned_dropping(core);
    if !core.has_equal {
        for d in collect_subscribers(&core.sub) {
            mark_stale_pending(&d, rt);
        }
    }
}

fn downstream(node: &NodeRef, rt: &mut Runtime, inherited: Option<&NodeRef>) {
    let core = node.core();
    let mode = if core.has_equal {
        Some(node.clone())
    } else {
        inherited.cloned()
    };
    for d in collect_subscribers(&core.sub) {
        match &mode {
            Some(ancestor) => mark_pending(&d, rt, ancestor),
            None => mark_stale(&d, rt),
        }
    }
}

fn mark_owned_dropping(core: &NodeCore) {
    for c in core.owned.borrow().iter() {
        let cc = c.core();
        cc.state.set(cc.state.get() | state::DISPOSED);
        mark_owned_dropping(cc);
    }
}

fn mark_owned_soft(core: &NodeCore) {
    for c in core.owned.borrow().iter() {
        let cc = c.core();
        cc.state.set(cc.state.get() | state::PENDING_DISPOSAL);
        mark_owned_soft(cc);
    }
}

fn clear_owned_soft(core: &NodeCore) {
    for c in core.owned.borrow().iter() {
        let cc = c.core();
        cc.state.set(cc.state.get() & !state::PENDING_DISPOSAL);
        clear_owned_soft(cc);
    }
}

/// One queue entry: drain a pending dep, fall through to a recompute when
/// Stale, lift first when the owner's fate is still open.
pub(crate) fn process_node(node: NodeRef, rt: &mut Runtime) {
    let core = node.core();
    if core.is_disposed() {
        return;
    }
    if core.state.get() & state::PENDING != 0 {
        let cur = core.deps_cursor.get();
        {
            let mut deps = core.pending_deps.borrow_mut();
            if cur < deps.len() {
                deps[cur] = None;
            }
        }
        core.deps_cursor.set(cur + 1);
        if core.deps_cursor.get() < core.pending_deps.borrow().len() {
            return;
        }
        core.pending_deps.borrow_mut().clear();
        core.deps_cursor.set(0);
        let st = core.state.get();
        if st & state::STALE == 0 {
            // the maybe never committed; release the owned subtrees too
            core.state.set(st & !state::UPSTREAMABLE);
            clear_owned_soft(core);
            return;
        }
        core.state.set(st & !state::PENDING);
    }
    let st = core.state.get();
    if st & state::STALE != 0 {
        if st & state::PENDING_DISPOSAL != 0 {
            lift_node(&node, rt);
        } else {
            refresh_and_propagate(node, rt);
        }
    }
}

fn refresh_and_propagate(node: NodeRef, rt: &mut Runtime) {
    let core = node.core();
    if let Some(sched) = core.defer.get() {
        if !core.defer_queued.replace(true) {
            asynx::defer_refresh(rt, node, sched);
        }
        return;
    }
    run_refresh(node, rt);
}

/// Recompute and, for equality-bearing nodes, commit or decline toward the
/// pending-marked downstream.
pub(crate) fn run_refresh(node: NodeRef, rt: &mut Runtime) {
    let changed = node.clone().refresh(rt);
    if changed && node.core().has_equal {
        for d in collect_subscribers(&node.core().sub) {
            mark_stale_pending(&d, rt);
        }
    }
}

/// Force a node current out of queue order, resolving its owner's fate and
/// its outstanding ancestors first.
pub(crate) fn lift_node(node: &NodeRef, rt: &mut Runtime) {
    let core = node.core();
    if core.is_disposed() {
        return;
    }
    if core.state.get() & state::PENDING_DISPOSAL != 0 {
        let owner = core.owner.borrow().clone().and_then(|w| w.upgrade());
        if let Some(owner) = owner {
            lift_node(&owner, rt);
        }
        if core.is_disposed() {
            return;
        }
        core.state.set(core.state.get() & !state::PENDING_DISPOSAL);
    }
    if core.state.get() & state::PENDING != 0 {
        let cursor = core.deps_cursor.get();
        let ancestors: Vec<NodeRef> = core
            .pending_deps
            .borrow()
            .iter()
            .skip(cursor)
            .flatten()
            .cloned()
            .collect();
        for a in ancestors {
            lift_node(&a, rt);
        }
        core.pending_deps.borrow_mut().clear();
        core.deps_cursor.set(0);
        core.state.set(core.state.get() & !state::PENDING);
        if core.state.get() & state::STALE == 0 {
            clear_owned_soft(core);
        }
    }
    if core.state.get() & state::STALE != 0 {
        run_refresh(node.clone(), rt);
    }
}

pub(crate) fn run_cleanups(core: &NodeCore, last: bool) {
    let cleanups = std::mem::take(&mut *core.cleanups.borrow_mut());
    for f in cleanups {
        f(last);
    }
}

fn dispose_owned(core: &NodeCore, rt: &mut Runtime) {
    loop {
        let child = core.owned.borrow_mut().pop();
        match child {
            Some(c) => dispose_node(&c, rt),
            None => break,
        }
    }
}

/// Hard disposal: depth-first post-order, cleanups with `final=true`, inputs
/// disconnected, body dropped. Idempotent because every step drains.
pub(crate) fn dispose_node(node: &NodeRef, rt: &mut Runtime) {
    let core = node.core();
    core.state.set(core.state.get() | state::DISPOSED);
    dispose_owned(core, rt);
    run_cleanups(core, true);
    node.clear_body();
    disconnect_inputs(core);
    core.pending_deps.borrow_mut().clear();
    core.deps_cursor.set(0);
    core.contexts.borrow_mut().clear();
    *core.error_handler.borrow_mut() = None;
}

/// Dispose and drop the back-reference from the owner's owned list, for
/// out-of-band teardown (explicit disposers, projection entries).
pub(crate) fn dispose_detached(node: &NodeRef, rt: &mut Runtime) {
    let owner = node.core().owner.borrow().clone().and_then(|w| w.upgrade());
    if let Some(owner) = owner {
        let mut owned = owner.core().owned.borrow_mut();
        if let Some(i) = owned
            .iter()
            .position(|c| std::ptr::addr_eq(Rc::as_ptr(c), Rc::as_ptr(node)))
        {
            owned.swap_remove(i);
        }
    }
    dispose_node(node, rt);
}

/// Route a failure to the nearest owner error handler, or re-raise to the
/// host when none is installed.
pub(crate) fn route_error(from: &NodeRef, rt: &mut Runtime, error: HostError) {
    let mut cursor = Some(from.clone());
    while let Some(node) = cursor {
        let handler = node.core().error_handler.borrow().clone();
        if let Some(handler) = handler {
            let prev_owner = rt.owner.replace(node.clone());
            let prev_listener = rt.listener.take();
            handler(Scope::new(rt), &error);
            rt.owner = prev_owner;
            rt.listener = prev_listener;
            return;
        }
        cursor = node.core().owner.borrow().clone().and_then(|w| w.upgrade());
    }
    panic!("unhandled reactive error: {error}");
}

/// Run `f` under `owner` as a fresh child root, with tracking off. Returns
/// the result and the root node.
pub(crate) fn owned_root<R>(
    rt: &mut Runtime,
    owner: &NodeRef,
    f: impl FnOnce(&mut Scope) -> R,
) -> (R, NodeRef) {
    let prev_owner = rt.owner.replace(owner.clone());
    let prev_listener = rt.listener.take();
    let node = ObserverNode::<()>::create(
        rt,
        NodeKind::Root,
        None,
        None,
        Equal::never(),
        None,
        false,
    );
    let root: NodeRef = node;
    rt.owner = Some(root.clone());
    let r = f(Scope::new(rt));
    rt.owner = prev_owner;
    rt.listener = prev_listener;
    (r, root)
}

/// A staged source waiting in the Changes queue.
pub(crate) trait ChangeEntry {
    fn commit(self: Rc<Self>, rt: &mut Runtime);
}

#[derive(Default)]
struct Queues {
    changes: DrainQueue<Rc<dyn ChangeEntry>>,
    updates: DrainQueue<NodeRef>,
    disposes: DrainQueue<NodeRef>,
    render_effects: DrainQueue<NodeRef>,
    after_effects: DrainQueue<NodeRef>,
}

/// Reactive runtime: the single-threaded owner of the graph, the queues and
/// the tick clock.
pub struct Runtime {
    queues: Queues,
    pub(crate) tick: u64,
    running: bool,
    pub(crate) listener: Option<NodeRef>,
    pub(crate) owner: Option<NodeRef>,
    pub(crate) unowned: NodeRef,
    pub(crate) clock: Rc<dyn HostClock>,
    pub(crate) asynx: asynx::AsynxState,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_clock(Rc::new(ManualClock::new()))
    }

    pub fn with_clock(clock: Rc<dyn HostClock>) -> Self {
        let unowned: NodeRef = Rc::new(ObserverNode::<()>::bare(NodeKind::Root, None));
        Self {
            queues: Queues::default(),
            tick: 0,
            running: false,
            listener: None,
            owner: None,
            unowned,
            clock,
            asynx: asynx::AsynxState::default(),
        }
    }

    pub fn scope(&mut self) -> &mut Scope {
        Scope::new(self)
    }

    pub fn clock(&self) -> Rc<dyn HostClock> {
        self.clock.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn current_owner(&self) -> NodeRef {
        self.owner.clone().unwrap_or_else(|| self.unowned.clone())
    }

    pub(crate) fn schedule(&mut self, node: NodeRef) {
        match node.core().kind {
            NodeKind::Computed => {}
            NodeKind::RenderEffect => self.queues.render_effects.push(node),
            NodeKind::AfterEffect => self.queues.after_effects.push(node),
            _ => self.queues.updates.push(node),
        }
    }

    pub(crate) fn schedule_change(&mut self, entry: Rc<dyn ChangeEntry>) {
        self.queues.changes.push(entry);
    }

    pub(crate) fn schedule_dispose(&mut self, node: NodeRef) {
        self.queues.disposes.push(node);
    }

    fn eager_pending(&self) -> bool {
        !self.queues.changes.is_empty()
            || !self.queues.updates.is_empty()
            || !self.queues.disposes.is_empty()
    }

    fn effects_pending(&self) -> bool {
        !self.queues.render_effects.is_empty() || !self.queues.after_effects.is_empty()
    }

    /// Perform all scheduled work: wake-ups, then the queue drain.
    pub fn flush(&mut self) {
        asynx::apply_wakes(self);
        self.run_queues();
    }

    /// Run `f` with writes deferred, then drain once.
    pub(crate) fn batch_run<R>(&mut self, f: impl FnOnce(&mut Runtime) -> R) -> R {
        if self.running {
            return f(self);
        }
        self.running = true;
        let r = f(self);
        self.running = false;
        self.run_queues();
        r
    }

    /// The fixed-phase drain: Changes then Updates then Disposes per tick,
    /// effects deferred while eager work remains, render effects before
    /// after effects, repeated while the effect phase schedules eager work.
    pub(crate) fn run_queues(&mut self) {
        if self.running {
            return;
        }
        if !self.eager_pending() && !self.effects_pending() {
            return;
        }
        self.running = true;
        self.tick += 1;
        let mut rounds: u32 = 0;
        loop {
            rounds += 1;
            let mut deferred_render: Vec<NodeRef> = Vec::new();
            let mut deferred_after: Vec<NodeRef> = Vec::new();
            let mut first = true;
            while self.eager_pending() {
                if !first {
                    self.tick += 1;
                }
                first = false;
                rounds += 1;
                if rounds > RUNAWAY_ROUNDS {
                    self.running = false;
                    panic!("{}", RunawayError::new());
                }
                let mut batch = self.queues.changes.take();
                for entry in batch.drain(..) {
                    entry.commit(self);
                }
                self.queues.changes.restore(batch);
                let mut batch = self.queues.updates.take();
                for node in batch.drain(..) {
                    process_node(node, self);
                }
                self.queues.updates.restore(batch);
                let mut batch = self.queues.disposes.take();
                for node in batch.drain(..) {
                    dispose_node(&node, self);
                }
                self.queues.disposes.restore(batch);
                if self.effects_pending() && self.eager_pending() {
                    let mut taken = self.queues.render_effects.take();
                    deferred_render.append(&mut taken);
                    self.queues.render_effects.restore(taken);
                    let mut taken = self.queues.after_effects.take();
                    deferred_after.append(&mut taken);
                    self.queues.after_effects.restore(taken);
                }
            }
            let mut render = self.queues.render_effects.take();
            let mut after = self.queues.after_effects.take();
            if deferred_render.is_empty()
                && deferred_after.is_empty()
                && render.is_empty()
                && after.is_empty()
            {
                self.queues.render_effects.restore(render);
                self.queues.after_effects.restore(after);
                break;
            }
            for node in deferred_render.drain(..) {
                process_node(node, self);
            }
            for node in render.drain(..) {
                process_node(node, self);
            }
            for node in deferred_after.drain(..) {
                process_node(node, self);
            }
            for node in after.drain(..) {
                process_node(node, self);
            }
            self.queues.render_effects.restore(render);
            self.queues.after_effects.restore(after);
            if self.eager_pending() {
                self.tick += 1;
                continue;
            }
            if self.effects_pending() {
                continue;
            }
            break;
        }
        self.running = false;
    }
}

/// Context handed to computations: the runtime viewed from inside a tracking
/// run.
#[repr(transparent)]
pub struct Scope(Runtime);

impl Scope {
    pub(crate) fn new(rt: &mut Runtime) -> &mut Scope {
        unsafe { &mut *(rt as *mut Runtime as *mut Scope) }
    }

    pub(crate) fn rt(&mut self) -> &mut Runtime {
        &mut self.0
    }

    /// Run `f` with dependency tracking off.
    pub fn untrack<R>(&mut self, f: impl FnOnce(&mut Scope) -> R) -> R {
        let saved = self.0.listener.take();
        let r = f(self);
        self.0.listener = saved;
        r
    }

    pub fn is_tracking(&self) -> bool {
        self.0.listener.is_some()
    }

    /// Register a cleanup on the current owner. It runs with `false` before
    /// each re-run of the owning computation and with `true` on disposal.
    pub fn on_cleanup(&mut self, f: impl FnOnce(bool) + 'static) {
        self.0
            .current_owner()
            .core()
            .cleanups
            .borrow_mut()
            .push(Box::new(f));
    }

    /// Install an error handler on the current owner. Failures from owned
    /// computations unwind to the nearest handler.
    pub fn on_error(&mut self, f: impl Fn(&mut Scope, &HostError) + 'static) {
        *self.0.current_owner().core().error_handler.borrow_mut() = Some(Rc::new(f));
    }

    pub(crate) fn provide_context_raw(&mut self, id: u64, value: Rc<dyn Any>) {
        self.0
            .current_owner()
            .core()
            .contexts
            .borrow_mut()
            .insert(id, value);
    }

    pub(crate) fn use_context_raw(&self, id: u64) -> Option<Rc<dyn Any>> {
        let mut cursor = Some(self.0.current_owner());
        while let Some(node) = cursor {
            if let Some(v) = node.core().contexts.borrow().get(&id) {
                return Some(v.clone());
            }
            cursor = node.core().owner.borrow().clone().and_then(|w| w.upgrade());
        }
        None
    }

    pub(crate) fn current_owner_node(&self) -> NodeRef {
        self.0.current_owner()
    }
}

/// Run `f` with all writes collected, committing them in one drain when it
/// returns.
pub fn batch<R>(sc: &mut Scope, f: impl FnOnce(&mut Scope) -> R) -> R {
    sc.rt().batch_run(|rt| f(Scope::new(rt)))
}
