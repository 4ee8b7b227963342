use assert_call::{CallRecorder, call};

use crate::{Runtime, Sched, Source, asynx_observe, observe, on_mount, restrict_to, selector};

#[test]
fn observer_runs_in_update_phase() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    let s = Source::new(1);
    observe(rt.scope(), {
        let s = s.clone();
        move |sc| call!("{}", s.get(sc))
    });
    cr.verify("1");

    s.set(2, rt.scope());
    cr.verify("2");
}

#[test]
fn on_mount_runs_once_in_the_effect_phase() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    let s = Source::new(0);
    on_mount(rt.scope(), {
        let s = s.clone();
        move |sc| call!("mounted:{}", s.get(sc))
    });
    // nothing until the next drain
    cr.verify(());

    rt.flush();
    cr.verify("mounted:0");

    // the mount body is untracked: later writes do not revive it
    s.set(1, rt.scope());
    cr.verify(());
}

#[test]
fn restrict_to_ignores_untracked_reads() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    let dep = Source::new(1);
    let free = Source::new(10);
    let mut body = restrict_to(
        {
            let dep = dep.clone();
            move |sc| dep.get(sc)
        },
        {
            let free = free.clone();
            move |sc, d| call!("{}:{}", d, free.get(sc))
        },
        false,
    );
    observe(rt.scope(), move |sc| {
        body(sc);
    });
    cr.verify("1:10");

    free.set(20, rt.scope());
    cr.verify(());

    dep.set(2, rt.scope());
    cr.verify("2:20");
}

#[test]
fn restrict_to_on_changes_skips_the_first_run() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    let dep = Source::new(1);
    let mut body = restrict_to(
        {
            let dep = dep.clone();
            move |sc| dep.get(sc)
        },
        move |_, d| call!("{d}"),
        true,
    );
    observe(rt.scope(), move |sc| {
        body(sc);
    });
    cr.verify(());

    dep.set(2, rt.scope());
    cr.verify("2");
}

#[test]
fn selector_notifies_only_flipped_keys() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    let picked = Source::new(0usize);
    let sel = selector(rt.scope(), {
        let picked = picked.clone();
        move |sc| picked.get(sc)
    });
    for key in 0..3usize {
        let sel = sel.clone();
        observe(rt.scope(), move |sc| {
            call!("{key}:{}", sel.selected(key, sc));
        });
    }
    cr.verify(["0:true", "1:false", "2:false"]);

    picked.set(1, rt.scope());
    // only the two flipped keys re-run
    cr.verify(["0:false", "1:true"]);

    picked.set(2, rt.scope());
    cr.verify(["1:false", "2:true"]);
}

#[test]
fn asynx_observer_coalesces_reruns() {
    let clock = std::rc::Rc::new(crate::ManualClock::new());
    let mut rt = Runtime::with_clock(clock.clone());
    let mut cr = CallRecorder::new();

    let a = Source::new(1);
    let b = Source::new(10);
    asynx_observe(rt.scope(), Sched::Asap, {
        let a = a.clone();
        let b = b.clone();
        move |sc| call!("{}", a.get(sc) + b.get(sc))
    });
    cr.verify("11");

    // two separate synchronous writes, one deferred re-run
    a.set(2, rt.scope());
    b.set(20, rt.scope());
    cr.verify(());

    clock.run_microtasks(&mut rt);
    cr.verify("22");
}
