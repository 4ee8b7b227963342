use std::{cell::Cell, rc::Rc};

use assert_call::{CallRecorder, call};
use pretty_assertions::assert_eq;

use crate::{MapOptions, ReadSource, Runtime, Source, map_indexed, map_keyed};

#[derive(Clone)]
struct Entry {
    id: i32,
    index: ReadSource<usize>,
}

#[test]
fn keyed_maps_each_value_once() {
    let mut rt = Runtime::new();
    let built = Rc::new(Cell::new(0));

    let list = Source::new(vec![1, 2, 3]);
    let out = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        {
            let built = built.clone();
            move |id: &i32, index, _sc: &mut crate::Scope| {
                built.set(built.get() + 1);
                Entry { id: *id, index }
            }
        },
        MapOptions::default(),
    );

    let entries = out.get(rt.scope());
    assert_eq!(entries.len(), 3);
    assert_eq!(built.get(), 3);
    assert_eq!(
        entries.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    for (i, e) in entries.iter().enumerate() {
        assert_eq!(e.index.get(rt.scope()), i);
    }
}

#[test]
fn keyed_reorder_reuses_entries_and_updates_indices() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let built = Rc::new(Cell::new(0));

    let list = Source::new(vec![1, 2, 3]);
    let out = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        {
            let built = built.clone();
            move |id: &i32, index, sc: &mut crate::Scope| {
                built.set(built.get() + 1);
                let id = *id;
                sc.on_cleanup(move |_| call!("drop:{id}"));
                Entry { id, index }
            }
        },
        MapOptions::default(),
    );
    assert_eq!(built.get(), 3);

    list.set(vec![3, 1, 2], rt.scope());
    let entries = out.get(rt.scope());

    // nothing was rebuilt and nothing was torn down
    assert_eq!(built.get(), 3);
    cr.verify(());

    assert_eq!(
        entries.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![3, 1, 2]
    );
    // the surviving entries see their new positions
    let mut index_of = |id: i32| {
        entries
            .iter()
            .find(|e| e.id == id)
            .unwrap()
            .index
            .get(rt.scope())
    };
    assert_eq!(index_of(1), 1);
    assert_eq!(index_of(2), 2);
    assert_eq!(index_of(3), 0);
}

#[test]
fn keyed_removal_runs_cleanup() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    let list = Source::new(vec![1, 2, 3]);
    let _out = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        move |id: &i32, _index, sc: &mut crate::Scope| {
            let id = *id;
            sc.on_cleanup(move |last| call!("drop:{id}:{last}"));
            id
        },
        MapOptions::default(),
    );
    cr.verify(());

    list.set(vec![1, 3], rt.scope());
    cr.verify("drop:2:true");
}

#[test]
fn keyed_fallback_fills_the_empty_list() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    let list = Source::new(Vec::<i32>::new());
    let out = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        move |id: &i32, _index, _sc: &mut crate::Scope| *id,
        MapOptions::with_fallback(|sc: &mut crate::Scope| {
            sc.on_cleanup(|_| call!("fallback-drop"));
            -1
        }),
    );
    assert_eq!(out.get(rt.scope()), vec![-1]);

    list.set(vec![5], rt.scope());
    cr.verify("fallback-drop");
    assert_eq!(out.get(rt.scope()), vec![5]);

    list.set(vec![], rt.scope());
    assert_eq!(out.get(rt.scope()), vec![-1]);
}

#[test]
fn keyed_pool_recycles_entries() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let built = Rc::new(Cell::new(0));

    let list = Source::new(vec![1, 2]);
    let out = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        {
            let built = built.clone();
            move |id: &i32, _index, sc: &mut crate::Scope| {
                built.set(built.get() + 1);
                let id = *id;
                sc.on_cleanup(move |_| call!("drop:{id}"));
                id
            }
        },
        MapOptions::pooled(16),
    );
    assert_eq!(built.get(), 2);

    // removal stashes instead of disposing
    list.set(vec![1], rt.scope());
    cr.verify(());

    // the stashed entry comes back for the same value
    list.set(vec![1, 2], rt.scope());
    cr.verify(());
    assert_eq!(built.get(), 2);
    assert_eq!(out.get(rt.scope()), vec![1, 2]);
}

#[test]
fn keyed_handles_duplicate_values() {
    let mut rt = Runtime::new();
    let built = Rc::new(Cell::new(0));

    let list = Source::new(vec![7, 7, 8]);
    let out = map_keyed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        {
            let built = built.clone();
            move |id: &i32, _index, _sc: &mut crate::Scope| {
                built.set(built.get() + 1);
                *id
            }
        },
        MapOptions::default(),
    );
    assert_eq!(out.get(rt.scope()), vec![7, 7, 8]);
    assert_eq!(built.get(), 3);

    list.set(vec![8, 7, 7], rt.scope());
    assert_eq!(out.get(rt.scope()), vec![8, 7, 7]);
    assert_eq!(built.get(), 3);
}

#[test]
fn indexed_updates_values_in_place() {
    let mut rt = Runtime::new();
    let built = Rc::new(Cell::new(0));

    let list = Source::new(vec![10, 20, 30]);
    let out = map_indexed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        {
            let built = built.clone();
            move |value: ReadSource<i32>, i, _sc: &mut crate::Scope| {
                built.set(built.get() + 1);
                (i, value)
            }
        },
        MapOptions::default(),
    );
    assert_eq!(built.get(), 3);

    // positions keep their entries; only the cell contents move
    list.set(vec![11, 20, 31], rt.scope());
    assert_eq!(built.get(), 3);
    let entries = out.get(rt.scope());
    let values: Vec<i32> = entries.iter().map(|(_, v)| v.get(rt.scope())).collect();
    assert_eq!(values, vec![11, 20, 31]);
}

#[test]
fn indexed_grows_and_shrinks_at_the_tail() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let built = Rc::new(Cell::new(0));

    let list = Source::new(vec![1, 2]);
    let out = map_indexed(
        rt.scope(),
        {
            let list = list.clone();
            move |sc| list.get(sc)
        },
        {
            let built = built.clone();
            move |value: ReadSource<i32>, i, sc: &mut crate::Scope| {
                built.set(built.get() + 1);
                sc.on_cleanup(move |_| call!("drop:{i}"));
                (i, value)
            }
        },
        MapOptions::default(),
    );
    assert_eq!(built.get(), 2);

    list.set(vec![1, 2, 3, 4], rt.scope());
    assert_eq!(built.get(), 4);
    cr.verify(());

    list.set(vec![1], rt.scope());
    cr.verify(["drop:3", "drop:2"]);
    assert_eq!(out.get(rt.scope()).len(), 1);
}

#[test]
fn entries_die_with_the_owning_scope() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();

    let list = Source::new(vec![1, 2]);
    let disposer = crate::root(rt.scope(), |sc, disposer| {
        let _out = map_keyed(
            sc,
            {
                let list = list.clone();
                move |sc| list.get(sc)
            },
            move |id: &i32, _index, sc: &mut crate::Scope| {
                let id = *id;
                sc.on_cleanup(move |_| call!("drop:{id}"));
                id
            },
            MapOptions::default(),
        );
        disposer
    });
    cr.verify(());

    disposer.dispose(rt.scope());
    // disposal is depth-first from the youngest owned entry
    cr.verify(["drop:2", "drop:1"]);
}
