use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
};

#[cfg(test)]
mod tests;

/// The only assumptions the reconciler makes about a parent node. Node
/// handles compare by reference identity; `Eq`/`Hash` on the handle type
/// must reflect that.
pub trait NodeSink {
    type Node: Clone + Eq + Hash;
    /// Append when `reference` is `None`.
    fn insert_before(&mut self, child: &Self::Node, reference: Option<&Self::Node>);
    fn remove_child(&mut self, child: &Self::Node);
    fn replace_child(&mut self, new: &Self::Node, old: &Self::Node);
    fn next_sibling(&self, child: &Self::Node) -> Option<Self::Node>;
}

/// Mutation counters of a [`VecSink`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct SinkOps {
    pub inserts: usize,
    pub removes: usize,
    pub replaces: usize,
}

impl SinkOps {
    pub fn total(&self) -> usize {
        self.inserts + self.removes + self.replaces
    }
}

/// Reference sink: a plain child vector with operation counters, for
/// headless rendering and tests.
pub struct VecSink<N: Clone + Eq + Hash> {
    children: Vec<N>,
    pub ops: SinkOps,
}

impl<N: Clone + Eq + Hash> Default for VecSink<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Clone + Eq + Hash> VecSink<N> {
    pub fn new() -> Self {
        VecSink {
            children: Vec::new(),
            ops: SinkOps::default(),
        }
    }

    pub fn children(&self) -> &[N] {
        &self.children
    }

    pub fn reset_ops(&mut self) {
        self.ops = SinkOps::default();
    }

    fn index_of(&self, child: &N) -> usize {
        self.children
            .iter()
            .position(|c| c == child)
            .expect("node is not a child of this sink")
    }
}

impl<N: Clone + Eq + Hash> NodeSink for VecSink<N> {
    type Node = N;

    fn insert_before(&mut self, child: &N, reference: Option<&N>) {
        self.ops.inserts += 1;
        match reference {
            Some(r) => {
                let at = self.index_of(r);
                self.children.insert(at, child.clone());
            }
            None => self.children.push(child.clone()),
        }
    }

    fn remove_child(&mut self, child: &N) {
        self.ops.removes += 1;
        let at = self.index_of(child);
        self.children.remove(at);
    }

    fn replace_child(&mut self, new: &N, old: &N) {
        self.ops.replaces += 1;
        let at = self.index_of(old);
        self.children[at] = new.clone();
    }

    fn next_sibling(&self, child: &N) -> Option<N> {
        let at = self.index_of(child);
        self.children.get(at + 1).cloned()
    }
}

/// Mirror-updating primitives. Every sink mutation is reflected in `cur`
/// immediately, so the mirror always equals the parent's live children.
struct Splice<'a, S: NodeSink> {
    sink: &'a mut S,
    cur: &'a mut Vec<S::Node>,
    set: Option<HashSet<S::Node>>,
}

impl<S: NodeSink> Splice<'_, S> {
    fn insert_at(&mut self, node: &S::Node, at: usize) {
        let reference = self.cur.get(at).cloned();
        self.sink.insert_before(node, reference.as_ref());
        self.cur.insert(at, node.clone());
    }

    fn remove_at(&mut self, at: usize) {
        let node = self.cur.remove(at);
        self.sink.remove_child(&node);
        if let Some(set) = &mut self.set {
            set.remove(&node);
        }
    }

    fn replace_at(&mut self, new: &S::Node, at: usize) {
        let old = std::mem::replace(&mut self.cur[at], new.clone());
        self.sink.replace_child(new, &old);
        if let Some(set) = &mut self.set {
            set.remove(&old);
        }
    }

    /// Move the element at `from` so it ends up at index `to` of the mirror.
    fn move_to(&mut self, from: usize, to: usize) {
        let node = self.cur.remove(from);
        let reference = self.cur.get(to).cloned();
        self.sink.insert_before(&node, reference.as_ref());
        self.cur.insert(to, node);
    }

    /// Move the element at `from` directly after `after`, using the sink's
    /// sibling pointer for the reference.
    fn move_behind(&mut self, from: usize, after: usize) {
        let reference = self.sink.next_sibling(&self.cur[after]);
        let node = self.cur.remove(from);
        self.sink.insert_before(&node, reference.as_ref());
        let to = if from < after { after } else { after + 1 };
        self.cur.insert(to, node);
    }

    fn consume(&mut self, node: &S::Node) {
        if let Some(set) = &mut self.set {
            set.remove(node);
        }
    }

    fn in_current(&self, node: &S::Node) -> bool {
        self.set
            .as_ref()
            .expect("active set queried before advanced mode")
            .contains(node)
    }
}

/// Diff `current` against `next` and mutate the parent so its children equal
/// `next`, with the minimum viable insert/remove/replace sequence. `current`
/// must mirror the parent's child list; it equals `next` on return.
///
/// Lists must not contain the same node twice.
pub fn reconcile<S: NodeSink>(sink: &mut S, current: &mut Vec<S::Node>, next: &[S::Node]) {
    let mut start = 0usize;
    let mut cur_end = current.len();
    let mut next_end = next.len();
    let mut advanced = false;
    let mut map: HashMap<S::Node, usize> = HashMap::new();
    let mut d = Splice {
        sink,
        cur: current,
        set: None,
    };
    let mut fuel = 2 * (cur_end + next_end) + 8;

    while start < cur_end && start < next_end {
        fuel -= 1;
        assert!(fuel > 0, "reconcile failed to make progress");

        // matching prefix
        if d.cur[start] == next[start] {
            d.consume(&next[start]);
            start += 1;
            continue;
        }
        // matching suffix
        if d.cur[cur_end - 1] == next[next_end - 1] {
            d.consume(&next[next_end - 1]);
            cur_end -= 1;
            next_end -= 1;
            continue;
        }
        // cross swap: first and last exchanged places
        if d.cur[start] == next[next_end - 1] && d.cur[cur_end - 1] == next[start] {
            let first = d.cur[start].clone();
            let last = d.cur[cur_end - 1].clone();
            d.consume(&first);
            d.consume(&last);
            d.move_to(cur_end - 1, start);
            if cur_end - start > 2 {
                // the old first still has to travel to the window end
                d.move_to(start + 1, cur_end - 1);
            }
            start += 1;
            cur_end -= 1;
            next_end -= 1;
            continue;
        }

        if !advanced {
            // single move, right to left
            if next[start] == d.cur[cur_end - 1] {
                d.move_to(cur_end - 1, start);
                continue;
            }
            // single move, left to right
            if d.cur[start] == next[next_end - 1] {
                d.move_behind(start, cur_end - 1);
                continue;
            }
            if subrange_pass(&mut d, next, start, &mut cur_end, &mut next_end) {
                start = next_end;
                cur_end = start;
                break;
            }
            if cur_end - start == 1 {
                one_to_many(&mut d, next, start, next_end);
                start = next_end;
                cur_end = start;
                break;
            }
            if next_end - start == 1 {
                many_to_one(&mut d, next, start, cur_end);
                start = next_end;
                cur_end = start;
                break;
            }
            // no cheap structure left: build the helper structures once
            for (j, node) in next.iter().enumerate().take(next_end).skip(start) {
                let prev = map.insert(node.clone(), j);
                debug_assert!(prev.is_none(), "duplicate node in next");
            }
            let mut set = HashSet::new();
            for node in d.cur.iter().take(cur_end).skip(start) {
                set.insert(node.clone());
            }
            d.set = Some(set);
            advanced = true;
            continue;
        }

        // replace run at the tail: both tails are strangers to each other
        if !map.contains_key(&d.cur[cur_end - 1]) && !d.in_current(&next[next_end - 1]) {
            d.replace_at(&next[next_end - 1], cur_end - 1);
            cur_end -= 1;
            next_end -= 1;
            continue;
        }
        // insert run at the tail
        if !d.in_current(&next[next_end - 1]) {
            d.insert_at(&next[next_end - 1], cur_end);
            next_end -= 1;
            continue;
        }
        // remove run at the tail
        if !map.contains_key(&d.cur[cur_end - 1]) {
            d.remove_at(cur_end - 1);
            cur_end -= 1;
            continue;
        }

        rearrange(&mut d, next, &map, &mut start, &mut cur_end, next_end);
    }

    // tail pass
    if start == cur_end {
        for (off, node) in next[start..next_end].iter().enumerate() {
            d.insert_at(node, start + off);
        }
    } else if start == next_end {
        for _ in start..cur_end {
            d.remove_at(start);
        }
    }
    debug_assert!(
        current.as_slice() == next,
        "reconcile left the mirror out of sync"
    );
}

/// One window is a contiguous run of the other: only the differing prefix
/// and suffix need sink work.
fn subrange_pass<S: NodeSink>(
    d: &mut Splice<S>,
    next: &[S::Node],
    start: usize,
    cur_end: &mut usize,
    next_end: &mut usize,
) -> bool {
    let c_len = *cur_end - start;
    let n_len = *next_end - start;
    if n_len < c_len {
        // next window inside current: remove around the run
        let Some(pos) = d.cur[start..*cur_end]
            .iter()
            .position(|c| *c == next[start])
        else {
            return false;
        };
        let i = start + pos;
        if i + n_len > *cur_end || d.cur[i..i + n_len] != next[start..*next_end] {
            return false;
        }
        let before = i - start;
        let after = *cur_end - (i + n_len);
        for _ in 0..before {
            d.remove_at(start);
        }
        for _ in 0..after {
            d.remove_at(start + n_len);
        }
        true
    } else if c_len < n_len {
        // current window inside next: insert around the run
        let Some(pos) = next[start..*next_end]
            .iter()
            .position(|n| *n == d.cur[start])
        else {
            return false;
        };
        let j = start + pos;
        if j + c_len > *next_end || next[j..j + c_len] != d.cur[start..*cur_end] {
            return false;
        }
        for (off, node) in next[start..j].iter().enumerate() {
            d.insert_at(node, start + off);
        }
        let run_end = start + (j - start) + c_len;
        for (off, node) in next[j + c_len..*next_end].iter().enumerate() {
            d.insert_at(node, run_end + off);
        }
        true
    } else {
        false
    }
}

/// Exactly one current node remains: batch the many in around it, or replace
/// it with the last of them.
fn one_to_many<S: NodeSink>(d: &mut Splice<S>, next: &[S::Node], start: usize, next_end: usize) {
    let old = d.cur[start].clone();
    if let Some(pos) = next[start..next_end].iter().position(|n| *n == old) {
        let m = start + pos;
        for (off, node) in next[start..m].iter().enumerate() {
            d.insert_at(node, start + off);
        }
        for (off, node) in next[m + 1..next_end].iter().enumerate() {
            d.insert_at(node, m + 1 + off);
        }
    } else {
        for (off, node) in next[start..next_end - 1].iter().enumerate() {
            d.insert_at(node, start + off);
        }
        d.replace_at(&next[next_end - 1], next_end - 1);
    }
}

/// Exactly one next node remains: keep it if present, otherwise fold the
/// last removal into a replace.
fn many_to_one<S: NodeSink>(d: &mut Splice<S>, next: &[S::Node], start: usize, cur_end: usize) {
    let target = next[start].clone();
    if let Some(pos) = d.cur[start..cur_end].iter().position(|c| *c == target) {
        let m = start + pos;
        for _ in 0..(m - start) {
            d.remove_at(start);
        }
        for _ in 0..(cur_end - m - 1) {
            d.remove_at(start + 1);
        }
    } else {
        for _ in 0..(cur_end - start - 1) {
            d.remove_at(start + 1);
        }
        d.replace_at(&target, start);
    }
}

/// The three-step rearrange: analyze the runs on both sides, place the next
/// run at the window start (right to left), then place or drop the displaced
/// current run (left to right).
fn rearrange<S: NodeSink>(
    d: &mut Splice<S>,
    next: &[S::Node],
    map: &HashMap<S::Node, usize>,
    start_ref: &mut usize,
    cur_end_ref: &mut usize,
    next_end: usize,
) {
    let start = *start_ref;
    let cur_end = *cur_end_ref;
    let c_n = d.cur[start].clone();
    let n_n = next[start].clone();

    // analyze
    let n_in_current = d.in_current(&n_n);
    let mut i = 0usize;
    let mut seq = 1usize;
    if n_in_current {
        i = start
            + 1
            + d.cur[start + 1..cur_end]
                .iter()
                .position(|c| *c == n_n)
                .expect("active set out of sync");
        while i + seq < cur_end && start + seq < next_end && d.cur[i + seq] == next[start + seq] {
            seq += 1;
        }
    } else {
        while start + seq < next_end && !d.in_current(&next[start + seq]) {
            seq += 1;
        }
    }
    let skip_ltr = (start + seq < next_end && next[start + seq] == c_n)
        || (n_in_current && seq > i - start);
    let mut k: Option<usize> = None;
    let mut c_seq = 1usize;
    if !skip_ltr {
        k = map.get(&c_n).copied();
        match k {
            Some(kk) => {
                while kk + c_seq < next_end
                    && start + c_seq < cur_end
                    && next[kk + c_seq] == d.cur[start + c_seq]
                {
                    c_seq += 1;
                }
            }
            None => {
                while start + c_seq < cur_end && !map.contains_key(&d.cur[start + c_seq]) {
                    c_seq += 1;
                }
            }
        }
    }
    let mut do_ltr = !skip_ltr;

    // right-to-left: put the next run in place
    if n_in_current {
        if do_ltr && seq == 1 && c_seq == 1 && k == Some(i) {
            // pure swap of two nodes
            d.consume(&n_n);
            d.move_to(i, start);
            if i > start + 1 {
                d.move_to(start + 1, i);
            }
            *start_ref = start + 1;
            do_ltr = false;
        } else if seq > i - start {
            // cheaper to move the interveners behind the run
            for _ in 0..(i - start) {
                d.move_to(start, i + seq - 1);
            }
            for node in &next[start..start + seq] {
                d.consume(node);
            }
            *start_ref = start + seq;
            do_ltr = false;
        } else {
            for j in 0..seq {
                d.move_to(i + j, start + j);
            }
            for node in &next[start..start + seq] {
                d.consume(node);
            }
            *start_ref = start + seq;
        }
    } else if do_ltr && k.is_none() {
        // both runs are strangers: pairwise replaces, remainder spliced
        let m = seq.min(c_seq);
        for j in 0..m {
            d.replace_at(&next[start + j], start + j);
        }
        if seq > c_seq {
            for (off, node) in next[start + c_seq..start + seq].iter().enumerate() {
                d.insert_at(node, start + c_seq + off);
            }
        } else {
            for _ in 0..(c_seq - seq) {
                d.remove_at(start + seq);
            }
        }
        *cur_end_ref = (cur_end + seq) - c_seq;
        *start_ref = start + seq;
        do_ltr = false;
    } else {
        for (j, node) in next[start..start + seq].iter().enumerate() {
            d.insert_at(node, start + j);
        }
        *cur_end_ref = cur_end + seq;
        *start_ref = start + seq;
    }

    if !do_ltr {
        return;
    }

    // left-to-right: the displaced current run
    let run_start = *start_ref;
    let cur_end = *cur_end_ref;
    match k {
        None => {
            for _ in 0..c_seq {
                d.remove_at(run_start);
            }
            *cur_end_ref = cur_end - c_seq;
        }
        Some(kk) => {
            let dest_next = kk + c_seq;
            let ref_idx = if dest_next >= next_end {
                cur_end
            } else {
                d.cur[run_start..cur_end]
                    .iter()
                    .position(|c| *c == next[dest_next])
                    .map(|p| run_start + p)
                    .unwrap_or(cur_end)
            };
            if ref_idx <= run_start {
                for j in 0..c_seq {
                    d.move_to(run_start + j, ref_idx + j);
                }
            } else {
                let dist = ref_idx - (run_start + c_seq);
                if c_seq > dist {
                    let mut head = run_start;
                    for _ in 0..dist {
                        d.move_to(head + c_seq, head);
                        head += 1;
                    }
                } else {
                    for _ in 0..c_seq {
                        d.move_to(run_start, ref_idx - 1);
                    }
                }
            }
        }
    }
}
