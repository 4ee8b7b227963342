use std::{
    cell::RefCell,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use assert_call::{CallRecorder, call};
use pretty_assertions::assert_eq;

use crate::{
    AsynxSource, Equal, HostError, ManualClock, Memo, Pipeline, Runtime, Source, Step,
    render_effect, root, suspending_asynx, suspense,
};

/// Future completed by hand from the test body.
#[derive(Clone, Default)]
struct Gate(Rc<RefCell<GateState>>);

#[derive(Default)]
struct GateState {
    done: bool,
    waker: Option<Waker>,
}

impl Gate {
    fn open(&self) {
        let waker = {
            let mut st = self.0.borrow_mut();
            st.done = true;
            st.waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}

impl Future for Gate {
    type Output = Result<(), HostError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut st = self.0.borrow_mut();
        if st.done {
            Poll::Ready(Ok(()))
        } else {
            st.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[test]
fn fallback_shows_until_the_future_resolves() {
    let mut rt = Runtime::new();
    let gate = Gate::default();

    let data = Source::new(Option::<i32>::None);
    let out = suspense(
        rt.scope(),
        {
            let data = data.clone();
            let gate = gate.clone();
            move |sc| match data.get(sc) {
                Some(v) => Step::Done(format!("content {v}")),
                None => sc.suspend(gate.clone()),
            }
        },
        |_| String::from("loading"),
    );
    assert_eq!(out.get(rt.scope()), "loading");

    // data lands while still pending: no mixed output
    data.set(Some(7), rt.scope());
    assert_eq!(out.get(rt.scope()), "loading");

    gate.open();
    rt.flush();
    assert_eq!(out.get(rt.scope()), "content 7");
}

#[test]
fn swap_renders_are_fallback_then_content() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let gate = Gate::default();

    let data = Source::new(Option::<i32>::None);
    let out = suspense(
        rt.scope(),
        {
            let data = data.clone();
            let gate = gate.clone();
            move |sc| match data.get(sc) {
                Some(v) => Step::Done(format!("content {v}")),
                None => sc.suspend(gate.clone()),
            }
        },
        |_| String::from("loading"),
    );
    render_effect(rt.scope(), {
        let out = out.clone();
        move |sc| call!("render:{}", out.get(sc))
    });
    cr.verify("render:loading");

    // the content value landing early re-renders the fallback, never a
    // half-resolved mix
    data.set(Some(1), rt.scope());
    cr.verify("render:loading");

    gate.open();
    rt.flush();
    cr.verify("render:content 1");
}

#[test]
fn suspending_pipeline_holds_the_boundary_open() {
    let clock = Rc::new(ManualClock::new());
    let mut rt = Runtime::with_clock(clock.clone());

    let out = suspense(
        rt.scope(),
        {
            let mut waiting: Option<crate::ReadSource<Poll<i32>>> = None;
            move |sc| {
                let src = waiting
                    .get_or_insert_with(|| {
                        suspending_asynx(sc, AsynxSource::Delay(10, 21), Pipeline::new())
                    })
                    .clone();
                match src.get(sc) {
                    Poll::Ready(v) => Step::Done(v * 2),
                    Poll::Pending => Step::Suspended,
                }
            }
        },
        |_| -1,
    );
    assert_eq!(out.get(rt.scope()), -1);

    clock.advance(9, &mut rt);
    assert_eq!(out.get(rt.scope()), -1);

    clock.advance(1, &mut rt);
    assert_eq!(out.get(rt.scope()), 42);
}

#[test]
fn suspend_outside_a_boundary_is_a_failure() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    root(rt.scope(), |sc, _| {
        sc.on_error(|_, e| call!("caught:{e}"));
        let _m = Memo::from_step(
            sc,
            |sc| sc.suspend::<i32>(std::future::ready(Ok(()))),
            None,
            Equal::never(),
        );
    });
    cr.verify("caught:suspension outside a suspense boundary");
}

#[test]
fn failed_future_publishes_the_boundary_error() {
    let mut rt = Runtime::new();

    let failed = Source::new(Option::<String>::None);
    let out = suspense(
        rt.scope(),
        {
            let failed = failed.clone();
            move |sc| {
                if let Some(e) = crate::suspense_error(sc) {
                    failed.set(Some(e.message().to_string()), sc);
                    return Step::Done(-1);
                }
                let fut = async { Err(HostError::msg("fetch failed")) };
                sc.suspend::<i32>(fut)
            }
        },
        |_| 0,
    );
    rt.flush();
    assert_eq!(
        failed.get(rt.scope()).as_deref(),
        // published by the resolution, observed on the rerun
        Some("fetch failed")
    );
    assert_eq!(out.get(rt.scope()), -1);
}
