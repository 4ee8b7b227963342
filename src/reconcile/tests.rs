use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

use super::{NodeSink, SinkOps, VecSink, reconcile};

fn setup(current: &[&'static str]) -> (VecSink<&'static str>, Vec<&'static str>) {
    let mut sink = VecSink::new();
    for n in current {
        sink.insert_before(n, None);
    }
    sink.reset_ops();
    (sink, current.to_vec())
}

fn apply(current: &[&'static str], next: &[&'static str]) -> SinkOps {
    let (mut sink, mut cur) = setup(current);
    reconcile(&mut sink, &mut cur, next);
    assert_eq!(sink.children(), next, "live children mismatch");
    assert_eq!(cur, next, "mirror mismatch");
    sink.ops
}

#[test]
fn small_reorder_with_replace() {
    // one move of c, one replace d -> h, one move of f
    let ops = apply(&["a", "b", "c", "d", "e", "f"], &["a", "c", "b", "h", "f", "e"]);
    assert_eq!(ops.total(), 3);
    assert_eq!(ops.replaces, 1);
}

#[test]
fn suffix_insert_appends_only() {
    let ops = apply(&["a", "b", "c"], &["a", "b", "c", "d", "e"]);
    assert_eq!(
        ops,
        SinkOps {
            inserts: 2,
            removes: 0,
            replaces: 0
        }
    );
}

#[test]
fn full_reverse_stays_within_four_ops() {
    let ops = apply(&["a", "b", "c", "d"], &["d", "c", "b", "a"]);
    assert!(ops.total() <= 4, "reverse took {} ops", ops.total());
    assert_eq!(ops.removes, 0);
    assert_eq!(ops.replaces, 0);
}

#[rstest]
#[case(&[], &[], 0)]
#[case(&["a"], &["a"], 0)]
#[case(&["a", "b", "c"], &["a", "b", "c"], 0)]
#[case(&[], &["a", "b"], 2)]
#[case(&["a", "b"], &[], 2)]
#[case(&["b", "c"], &["a", "b", "c"], 1)]
#[case(&["a", "b", "c"], &["a", "c"], 1)]
#[case(&["a", "b", "c"], &["a", "x", "c"], 1)]
#[case(&["a", "b"], &["b", "a"], 1)]
#[case(&["a", "b", "c", "d"], &["d", "a", "b", "c"], 1)]
#[case(&["a", "b", "c", "d"], &["b", "c", "d", "a"], 1)]
#[case(&["a", "b", "c"], &["b"], 2)]
#[case(&["b"], &["a", "b", "c"], 2)]
#[case(&["x", "a", "b", "y"], &["a", "b"], 2)]
#[case(&["a", "b"], &["x", "a", "b", "y"], 2)]
#[case(&["a", "b"], &["x", "y"], 2)]
#[case(&["a", "b", "c", "d", "e"], &["c", "d", "a", "b", "e"], 2)]
fn scenario_costs(
    #[case] current: &[&'static str],
    #[case] next: &[&'static str],
    #[case] expected_ops: usize,
) {
    let ops = apply(current, next);
    assert_eq!(ops.total(), expected_ops);
}

#[test]
fn replace_batch_beats_remove_plus_insert() {
    // two strangers on each side: two replaces, nothing else
    let ops = apply(&["p", "a", "b", "q"], &["p", "x", "y", "q"]);
    assert_eq!(
        ops,
        SinkOps {
            inserts: 0,
            removes: 0,
            replaces: 2
        }
    );
}

#[test]
fn one_to_many_keeps_the_survivor() {
    let ops = apply(&["k"], &["a", "k", "b", "c"]);
    assert_eq!(
        ops,
        SinkOps {
            inserts: 3,
            removes: 0,
            replaces: 0
        }
    );
}

#[test]
fn many_to_one_folds_the_last_removal_into_a_replace() {
    let ops = apply(&["a", "b", "c"], &["z"]);
    assert_eq!(
        ops,
        SinkOps {
            inserts: 0,
            removes: 2,
            replaces: 1
        }
    );
}

#[test]
fn long_prefix_and_suffix_are_free() {
    let ops = apply(
        &["a", "b", "c", "m", "x", "y", "z"],
        &["a", "b", "c", "n", "x", "y", "z"],
    );
    assert_eq!(ops.total(), 1);
    assert_eq!(ops.replaces, 1);
}

#[test]
fn interleaved_reorder_converges() {
    let ops = apply(
        &["a", "x", "b", "y", "c", "z"],
        &["z", "b", "x", "c", "a", "y"],
    );
    assert!(ops.total() <= 12);
}

#[test]
fn mirror_tracks_every_intermediate_state() {
    // the sink resolves references against its own child list, so any
    // mirror drift would panic inside reconcile
    let mut sink = VecSink::new();
    let mut cur: Vec<&'static str> = Vec::new();
    let stages: &[&[&'static str]] = &[
        &["a", "b", "c"],
        &["c", "a", "b"],
        &["c", "d", "e", "a"],
        &["e", "d"],
        &[],
        &["x"],
    ];
    for next in stages {
        reconcile(&mut sink, &mut cur, next);
        assert_eq!(sink.children(), *next);
    }
}

fn unique_list() -> impl Strategy<Value = Vec<u32>> {
    proptest::sample::subsequence((0u32..16).collect::<Vec<_>>(), 0..=16).prop_shuffle()
}

proptest! {
    #[test]
    fn converges_for_any_pair(current in unique_list(), next in unique_list()) {
        let mut sink = VecSink::new();
        for n in &current {
            sink.insert_before(n, None);
        }
        sink.reset_ops();
        let mut cur = current.clone();
        reconcile(&mut sink, &mut cur, &next);
        prop_assert_eq!(sink.children(), &next[..]);
        prop_assert_eq!(&cur, &next);
        // amortized bound: no node is handled more than a constant number
        // of times
        prop_assert!(sink.ops.total() <= 3 * (current.len() + next.len()) + 2);
    }
}
