//! End-to-end flows: list state driving a node sink through the keyed
//! projection and the reconciler, with updates arriving both synchronously
//! and through the async layer.

use std::{
    cell::RefCell,
    hash::{Hash, Hasher},
    rc::Rc,
    task::Poll,
};

use pretty_assertions::assert_eq;
use reknit::{
    AsynxSource, ManualClock, MapOptions, Pipeline, Runtime, Source, VecSink, await_asynx,
    map_keyed, reconcile, render_effect,
};

/// Node handle with reference identity, the way a render host compares
/// elements.
#[derive(Clone, Debug)]
struct Node(Rc<String>);

impl Node {
    fn new(label: impl Into<String>) -> Self {
        Node(Rc::new(label.into()))
    }
    fn label(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Node {}
impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

fn labels(sink: &VecSink<Node>) -> Vec<String> {
    sink.children()
        .iter()
        .map(|n| n.label().to_string())
        .collect()
}

#[test]
fn keyed_list_drives_the_sink_with_moves_not_rebuilds() {
    let mut rt = Runtime::new();

    let list = Source::new(vec![1, 2, 3]);
    let nodes = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        |id: &i32, _index, _sc: &mut reknit::Scope| Node::new(format!("item-{id}")),
        MapOptions::default(),
    );

    let sink = Rc::new(RefCell::new(VecSink::<Node>::new()));
    let mirror = Rc::new(RefCell::new(Vec::<Node>::new()));
    render_effect(rt.scope(), {
        let nodes = nodes.clone();
        let sink = sink.clone();
        let mirror = mirror.clone();
        move |sc| {
            let next = nodes.get(sc);
            reconcile(&mut *sink.borrow_mut(), &mut mirror.borrow_mut(), &next);
        }
    });
    assert_eq!(labels(&sink.borrow()), vec!["item-1", "item-2", "item-3"]);

    let first_nodes = sink.borrow().children().to_vec();
    sink.borrow_mut().reset_ops();

    // reorder: identity is preserved, so the sink sees moves, not rebuilds
    list.set(vec![3, 1, 2], rt.scope());
    assert_eq!(labels(&sink.borrow()), vec!["item-3", "item-1", "item-2"]);
    {
        let sink = sink.borrow();
        assert_eq!(sink.ops.replaces, 0);
        assert_eq!(sink.ops.removes, 0);
        assert_eq!(sink.ops.inserts, 1, "a single move suffices");
        assert!(sink.children().iter().all(|n| first_nodes.contains(n)));
    }

    sink.borrow_mut().reset_ops();
    // removal plus insertion in one update
    list.set(vec![4, 3, 2], rt.scope());
    assert_eq!(labels(&sink.borrow()), vec!["item-4", "item-3", "item-2"]);
}

#[test]
fn empty_list_renders_the_fallback() {
    let mut rt = Runtime::new();

    let list = Source::new(vec![1]);
    let nodes = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        |id: &i32, _index, _sc: &mut reknit::Scope| Node::new(format!("item-{id}")),
        MapOptions::with_fallback(|_| Node::new("empty")),
    );
    let sink = Rc::new(RefCell::new(VecSink::<Node>::new()));
    let mirror = Rc::new(RefCell::new(Vec::<Node>::new()));
    render_effect(rt.scope(), {
        let nodes = nodes.clone();
        let sink = sink.clone();
        let mirror = mirror.clone();
        move |sc| {
            let next = nodes.get(sc);
            reconcile(&mut *sink.borrow_mut(), &mut mirror.borrow_mut(), &next);
        }
    });
    assert_eq!(labels(&sink.borrow()), vec!["item-1"]);

    list.set(vec![], rt.scope());
    assert_eq!(labels(&sink.borrow()), vec!["empty"]);

    list.set(vec![2, 3], rt.scope());
    assert_eq!(labels(&sink.borrow()), vec!["item-2", "item-3"]);
}

#[test]
fn async_pipeline_updates_flow_into_the_sink() {
    let clock = Rc::new(ManualClock::new());
    let mut rt = Runtime::with_clock(clock.clone());

    let list = Source::new(vec![1, 2]);
    let nodes = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        |id: &i32, _index, _sc: &mut reknit::Scope| Node::new(format!("item-{id}")),
        MapOptions::default(),
    );
    let sink = Rc::new(RefCell::new(VecSink::<Node>::new()));
    let mirror = Rc::new(RefCell::new(Vec::<Node>::new()));
    render_effect(rt.scope(), {
        let nodes = nodes.clone();
        let sink = sink.clone();
        let mirror = mirror.clone();
        move |sc| {
            let next = nodes.get(sc);
            reconcile(&mut *sink.borrow_mut(), &mut mirror.borrow_mut(), &next);
        }
    });
    assert_eq!(labels(&sink.borrow()), vec!["item-1", "item-2"]);

    // a delayed fetch lands, reverses the list and appends
    let fetched = await_asynx(
        rt.scope(),
        AsynxSource::Delay(25, vec![2, 1, 9]),
        Pipeline::new().then({
            let list = list.clone();
            move |items: Vec<i32>, sc| {
                list.set(items.clone(), sc);
                items.len()
            }
        }),
    );
    assert_eq!(fetched.get(rt.scope()), Poll::Pending);
    assert_eq!(labels(&sink.borrow()), vec!["item-1", "item-2"]);

    clock.advance(25, &mut rt);
    assert_eq!(fetched.get(rt.scope()), Poll::Ready(3));
    assert_eq!(
        labels(&sink.borrow()),
        vec!["item-2", "item-1", "item-9"]
    );
}
