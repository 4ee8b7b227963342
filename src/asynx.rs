use std::{
    any::Any,
    cell::{Cell, RefCell},
    cmp::Reverse,
    collections::BinaryHeap,
    marker::PhantomData,
    mem::take,
    rc::Rc,
    sync::{Arc, Mutex},
    task::{Context, Poll, Wake, Waker},
};

use futures::future::LocalBoxFuture;
use slabmap::SlabMap;

use crate::{
    HostError, Scope,
    core::{Equal, NodeRef, Runtime, WeakNode, route_error, run_refresh, state},
    source::{LockHandle, ReadSource, Source},
};


/// Where deferred work lands: the microtask queue, the next host frame, or
/// the delay timeline.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Sched {
    Asap,
    Frame,
    Delay(u64),
}

/// What starts a pipeline and with which input.
pub enum AsynxSource<T: 'static> {
    Asap(T),
    Frame(T),
    Delay(u64, T),
    Produce(Box<dyn FnOnce(&mut Scope) -> Produced<T>>),
}

/// A producer either has the input now or promises it.
pub enum Produced<T> {
    Ready(T),
    Later(LocalBoxFuture<'static, T>),
}

type PipeValue = Box<dyn Any>;
type Job = Box<dyn FnOnce(&mut Runtime)>;

struct PipeAction {
    locks: Vec<LockHandle>,
    #[allow(clippy::type_complexity)]
    f: Box<dyn FnMut(PipeValue, &mut Scope) -> Result<PipeValue, HostError>>,
}

/// Ordered sequence of typed actions threaded value-to-value. Each action
/// runs with its declared locks held and hands its result to the next one.
pub struct Pipeline<I: 'static, O: 'static> {
    actions: Vec<PipeAction>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I: 'static> Default for Pipeline<I, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: 'static> Pipeline<I, I> {
    pub fn new() -> Self {
        Pipeline {
            actions: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<I: 'static, O: 'static> Pipeline<I, O> {
    pub fn then<U: 'static>(
        self,
        mut f: impl FnMut(O, &mut Scope) -> U + 'static,
    ) -> Pipeline<I, U> {
        self.push(Vec::new(), move |v, sc| Ok(f(v, sc)))
    }

    pub fn then_try<U: 'static>(
        self,
        f: impl FnMut(O, &mut Scope) -> Result<U, HostError> + 'static,
    ) -> Pipeline<I, U> {
        self.push(Vec::new(), f)
    }

    /// Action that freezes `locks` while it runs; their staged writes commit
    /// together when the locks drop.
    pub fn then_locked<U: 'static>(
        self,
        locks: Vec<LockHandle>,
        mut f: impl FnMut(O, &mut Scope) -> U + 'static,
    ) -> Pipeline<I, U> {
        self.push(locks, move |v, sc| Ok(f(v, sc)))
    }

    fn push<U: 'static>(
        mut self,
        locks: Vec<LockHandle>,
        mut f: impl FnMut(O, &mut Scope) -> Result<U, HostError> + 'static,
    ) -> Pipeline<I, U> {
        self.actions.push(PipeAction {
            locks,
            f: Box::new(move |v, sc| {
                let v = v
                    .downcast::<O>()
                    .expect("pipeline value type mismatch");
                f(*v, sc).map(|u| Box::new(u) as PipeValue)
            }),
        });
        Pipeline {
            actions: self.actions,
            _marker: PhantomData,
        }
    }
}

struct PipeTask {
    actions: RefCell<Vec<Option<PipeAction>>>,
    cursor: Cell<usize>,
    done: Cell<bool>,
    owner: WeakNode,
    #[allow(clippy::type_complexity)]
    on_done: RefCell<Option<Box<dyn FnOnce(PipeValue, &mut Runtime)>>>,
    on_cancel: RefCell<Option<Box<dyn FnOnce(&mut Runtime)>>>,
    timeline_key: Cell<Option<usize>>,
}

/// Disposer for a running pipeline: cancels remaining actions and releases
/// its timeline slot.
pub struct AsynxHandle {
    task: Rc<PipeTask>,
}

impl AsynxHandle {
    pub fn dispose(&self, sc: &mut Scope) {
        if self.task.done.replace(true) {
            return;
        }
        self.task.actions.borrow_mut().clear();
        let rt = sc.rt();
        if let Some(key) = self.task.timeline_key.take() {
            timeline_cancel(rt, key);
        }
        if let Some(cancel) = self.task.on_cancel.borrow_mut().take() {
            cancel(rt);
        }
    }

    pub fn is_done(&self) -> bool {
        self.task.done.get()
    }
}

fn run_task_step(task: Rc<PipeTask>, input: PipeValue, rt: &mut Runtime) {
    if task.done.get() {
        return;
    }
    let idx = task.cursor.get();
    let action = task.actions.borrow_mut().get_mut(idx).and_then(Option::take);
    let Some(mut action) = action else {
        finish_task(&task, input, rt);
        return;
    };
    for lock in &action.locks {
        lock.acquire();
    }
    let out = (action.f)(input, Scope::new(rt));
    for lock in &action.locks {
        lock.release(rt);
    }
    match out {
        Ok(v) => {
            task.cursor.set(idx + 1);
            if task.cursor.get() >= task.actions.borrow().len() {
                finish_task(&task, v, rt);
            } else {
                let task = task.clone();
                push_asap(rt, Box::new(move |rt| run_task_step(task, v, rt)));
            }
        }
        Err(e) => {
            task.done.set(true);
            task.actions.borrow_mut().clear();
            let target = task
                .owner
                .upgrade()
                .unwrap_or_else(|| rt.unowned.clone());
            route_error(&target, rt, e);
        }
    }
}

fn finish_task(task: &Rc<PipeTask>, value: PipeValue, rt: &mut Runtime) {
    task.done.set(true);
    if let Some(done) = task.on_done.borrow_mut().take() {
        done(value, rt);
    }
}

/// Schedule `pipeline` on `source`. Every pipeline scheduled within the same
/// synchronous frame on the asap or frame sink runs in one scheduler batch.
pub fn asynx<I: 'static, O: 'static>(
    sc: &mut Scope,
    source: AsynxSource<I>,
    pipeline: Pipeline<I, O>,
) -> AsynxHandle {
    spawn_pipeline(sc, source, pipeline, None, None)
}

fn spawn_pipeline<I: 'static, O: 'static>(
    sc: &mut Scope,
    source: AsynxSource<I>,
    pipeline: Pipeline<I, O>,
    on_done: Option<Box<dyn FnOnce(PipeValue, &mut Runtime)>>,
    on_cancel: Option<Box<dyn FnOnce(&mut Runtime)>>,
) -> AsynxHandle {
    let rt = sc.rt();
    let task = Rc::new(PipeTask {
        actions: RefCell::new(pipeline.actions.into_iter().map(Some).collect()),
        cursor: Cell::new(0),
        done: Cell::new(false),
        owner: Rc::downgrade(&rt.current_owner()),
        on_done: RefCell::new(on_done),
        on_cancel: RefCell::new(on_cancel),
        timeline_key: Cell::new(None),
    });
    match source {
        AsynxSource::Asap(v) => {
            let t = task.clone();
            push_asap(rt, Box::new(move |rt| run_task_step(t, Box::new(v), rt)));
        }
        AsynxSource::Frame(v) => {
            let t = task.clone();
            push_frame(rt, Box::new(move |rt| run_task_step(t, Box::new(v), rt)));
        }
        AsynxSource::Delay(ms, v) => {
            let due = rt.clock.now() + ms;
            let t = task.clone();
            let key = timeline_insert(
                rt,
                due,
                Box::new(move |rt| {
                    t.timeline_key.set(None);
                    run_task_step(t.clone(), Box::new(v), rt);
                }),
            );
            task.timeline_key.set(Some(key));
        }
        AsynxSource::Produce(f) => match f(Scope::new(rt)) {
            Produced::Ready(v) => {
                let t = task.clone();
                push_asap(rt, Box::new(move |rt| run_task_step(t, Box::new(v), rt)));
            }
            Produced::Later(fut) => {
                let t = task.clone();
                spawn_future(rt, fut, move |v, rt| {
                    push_asap(rt, Box::new(move |rt| run_task_step(t, Box::new(v), rt)));
                });
            }
        },
    }
    AsynxHandle { task }
}

/// Run `pipeline` and observe it as a readable: `Poll::Pending` until the
/// last action finishes, then the final value.
pub fn await_asynx<I: 'static, O: 'static>(
    sc: &mut Scope,
    source: AsynxSource<I>,
    pipeline: Pipeline<I, O>,
) -> ReadSource<Poll<O>> {
    let out = Source::with_equal(Poll::<O>::Pending, Equal::never());
    let publish = {
        let out = out.clone();
        Box::new(move |v: PipeValue, rt: &mut Runtime| {
            let v = *v.downcast::<O>().expect("pipeline value type mismatch");
            out.set(Poll::Ready(v), Scope::new(rt));
        })
    };
    spawn_pipeline(sc, source, pipeline, Some(publish), None);
    out.split().0
}

/// [`await_asynx`] that also holds the enclosing suspense boundary open
/// until the pipeline completes or is disposed. Return [`crate::Step::Suspended`]
/// from the reading computation while this is still `Poll::Pending`.
pub fn suspending_asynx<I: 'static, O: 'static>(
    sc: &mut Scope,
    source: AsynxSource<I>,
    pipeline: Pipeline<I, O>,
) -> ReadSource<Poll<O>> {
    let boundary = crate::suspense::current_boundary(sc);
    if let Some(b) = &boundary {
        b.increment(sc.rt());
    }
    let out = Source::with_equal(Poll::<O>::Pending, Equal::never());
    let publish = {
        let out = out.clone();
        let boundary = boundary.clone();
        Box::new(move |v: PipeValue, rt: &mut Runtime| {
            let v = *v.downcast::<O>().expect("pipeline value type mismatch");
            out.set(Poll::Ready(v), Scope::new(rt));
            if let Some(b) = boundary {
                b.decrement(rt);
            }
        })
    };
    let cancel = boundary.map(|b| {
        Box::new(move |rt: &mut Runtime| b.decrement(rt)) as Box<dyn FnOnce(&mut Runtime)>
    });
    spawn_pipeline(sc, source, pipeline, Some(publish), cancel);
    out.split().0
}

#[derive(Default)]
pub(crate) struct AsynxState {
    asap: Vec<Job>,
    asap_scheduled: bool,
    frame: Vec<Job>,
    frame_scheduled: bool,
    timeline: Timeline,
    wakes: WakeSet,
}

pub(crate) fn push_asap(rt: &mut Runtime, job: Job) {
    rt.asynx.asap.push(job);
    if !rt.asynx.asap_scheduled {
        rt.asynx.asap_scheduled = true;
        rt.clock.microtask(Box::new(drain_asap));
    }
}

fn drain_asap(rt: &mut Runtime) {
    rt.asynx.asap_scheduled = false;
    let jobs = take(&mut rt.asynx.asap);
    rt.batch_run(|rt| {
        for job in jobs {
            job(rt);
        }
    });
}

pub(crate) fn push_frame(rt: &mut Runtime, job: Job) {
    rt.asynx.frame.push(job);
    if !rt.asynx.frame_scheduled {
        rt.asynx.frame_scheduled = true;
        rt.clock.frame(Box::new(drain_frame));
    }
}

fn drain_frame(rt: &mut Runtime) {
    rt.asynx.frame_scheduled = false;
    let jobs = take(&mut rt.asynx.frame);
    rt.batch_run(|rt| {
        for job in jobs {
            job(rt);
        }
    });
}

/// Hand a deferred observer's re-run to its AsynX sink.
pub(crate) fn defer_refresh(rt: &mut Runtime, node: NodeRef, sched: Sched) {
    let job: Job = Box::new(move |rt| {
        let core = node.core();
        core.defer_queued.set(false);
        if core.is_disposed() || core.state.get() & state::STALE == 0 {
            return;
        }
        run_refresh(node, rt);
    });
    match sched {
        Sched::Asap => push_asap(rt, job),
        Sched::Frame => push_frame(rt, job),
        Sched::Delay(ms) => {
            let due = rt.clock.now() + ms;
            timeline_insert(rt, due, job);
        }
    }
}

/// Min-heap of delayed jobs sharing one host timer that is rescheduled to
/// the earliest due time.
struct Timeline {
    entries: SlabMap<(u64, Job)>,
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    timer: Option<(u64, crate::clock::ClockHandle)>,
}

impl Default for Timeline {
    fn default() -> Self {
        Timeline {
            entries: SlabMap::new(),
            heap: BinaryHeap::new(),
            timer: None,
        }
    }
}

fn timeline_insert(rt: &mut Runtime, due: u64, job: Job) -> usize {
    let key = rt.asynx.timeline.entries.insert((due, job));
    rt.asynx.timeline.heap.push(Reverse((due, key)));
    timeline_reschedule(rt);
    key
}

fn timeline_cancel(rt: &mut Runtime, key: usize) {
    rt.asynx.timeline.entries.remove(key);
    timeline_reschedule(rt);
}

fn timeline_reschedule(rt: &mut Runtime) {
    let next_due = loop {
        match rt.asynx.timeline.heap.peek() {
            Some(Reverse((due, key))) => {
                if rt.asynx.timeline.entries.get(*key).is_some() {
                    break Some(*due);
                }
                rt.asynx.timeline.heap.pop();
            }
            None => break None,
        }
    };
    match next_due {
        None => {
            if let Some((_, handle)) = rt.asynx.timeline.timer.take() {
                rt.clock.cancel_timeout(handle);
            }
        }
        Some(due) => {
            if rt.asynx.timeline.timer.is_none_or(|(d, _)| due < d) {
                if let Some((_, handle)) = rt.asynx.timeline.timer.take() {
                    rt.clock.cancel_timeout(handle);
                }
                let delay = due.saturating_sub(rt.clock.now());
                let handle = rt.clock.timeout(delay, Box::new(timeline_fire));
                rt.asynx.timeline.timer = Some((due, handle));
            }
        }
    }
}

fn timeline_fire(rt: &mut Runtime) {
    rt.asynx.timeline.timer = None;
    let now = rt.clock.now();
    let mut due_jobs: Vec<Job> = Vec::new();
    loop {
        let top = match rt.asynx.timeline.heap.peek() {
            Some(Reverse((due, key))) => Some((*due, *key)),
            None => None,
        };
        let Some((due, key)) = top else {
            break;
        };
        if rt.asynx.timeline.entries.get(key).is_none() {
            rt.asynx.timeline.heap.pop();
            continue;
        }
        if due > now {
            break;
        }
        rt.asynx.timeline.heap.pop();
        if let Some((_, job)) = rt.asynx.timeline.entries.remove(key) {
            due_jobs.push(job);
        }
    }
    rt.batch_run(|rt| {
        for job in due_jobs {
            job(rt);
        }
    });
    timeline_reschedule(rt);
}

/// Spawned futures wake through a shared request list the runtime drains; a
/// foreign wake becomes a poll at the next flush or clock drive.
struct WakeSet {
    futures: SlabMap<LocalBoxFuture<'static, Job>>,
    requests: Arc<Mutex<Vec<usize>>>,
}

impl Default for WakeSet {
    fn default() -> Self {
        WakeSet {
            futures: SlabMap::new(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

struct ReqWake {
    requests: Arc<Mutex<Vec<usize>>>,
    key: usize,
}

impl Wake for ReqWake {
    fn wake(self: Arc<Self>) {
        self.requests.lock().unwrap().push(self.key);
    }
}

pub(crate) fn spawn_future<T: 'static>(
    rt: &mut Runtime,
    fut: impl Future<Output = T> + 'static,
    k: impl FnOnce(T, &mut Runtime) + 'static,
) {
    let fut: LocalBoxFuture<'static, Job> = Box::pin(async move {
        let v = fut.await;
        Box::new(move |rt: &mut Runtime| k(v, rt)) as Job
    });
    let key = rt.asynx.wakes.futures.insert(fut);
    poll_spawned(rt, key);
}

fn poll_spawned(rt: &mut Runtime, key: usize) {
    let waker = Waker::from(Arc::new(ReqWake {
        requests: rt.asynx.wakes.requests.clone(),
        key,
    }));
    let mut cx = Context::from_waker(&waker);
    let poll = match rt.asynx.wakes.futures.get_mut(key) {
        Some(fut) => fut.as_mut().poll(&mut cx),
        None => return,
    };
    if let Poll::Ready(job) = poll {
        rt.asynx.wakes.futures.remove(key);
        job(rt);
    }
}

pub(crate) fn apply_wakes(rt: &mut Runtime) {
    loop {
        let keys: Vec<usize> = take(&mut *rt.asynx.wakes.requests.lock().unwrap());
        if keys.is_empty() {
            break;
        }
        for key in keys {
            poll_spawned(rt, key);
        }
    }
}
