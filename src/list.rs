use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    rc::Rc,
};

use crate::{
    Memo, Scope,
    core::{Equal, NodeRef, WeakNode, dispose_detached, owned_root},
    source::{ReadSource, Source},
};

#[cfg(test)]
mod tests;

/// Options shared by the keyed and indexed projections.
pub struct MapOptions<U> {
    /// Single entry produced while the input list is empty.
    pub fallback: Option<Box<dyn FnMut(&mut Scope) -> U>>,
    /// Stash removed entries for reuse instead of disposing them.
    pub pooled: bool,
    /// Oldest pooled entries are evicted beyond this count.
    pub pool_limit: usize,
}

impl<U> Default for MapOptions<U> {
    fn default() -> Self {
        MapOptions {
            fallback: None,
            pooled: false,
            pool_limit: 500,
        }
    }
}

impl<U> MapOptions<U> {
    pub fn with_fallback(f: impl FnMut(&mut Scope) -> U + 'static) -> Self {
        MapOptions {
            fallback: Some(Box::new(f)),
            ..Default::default()
        }
    }

    pub fn pooled(limit: usize) -> Self {
        MapOptions {
            pooled: true,
            pool_limit: limit,
            ..Default::default()
        }
    }
}

/// FIFO stash of retired entries keyed by value (keyed) or position
/// (indexed).
struct Pool<K, E> {
    slots: HashMap<K, Vec<E>>,
    order: VecDeque<K>,
    count: usize,
    limit: usize,
}

impl<K: Clone + Eq + Hash, E> Pool<K, E> {
    fn new(limit: usize) -> Self {
        Pool {
            slots: HashMap::new(),
            order: VecDeque::new(),
            count: 0,
            limit,
        }
    }

    fn stash(&mut self, key: K, entry: E, mut evict: impl FnMut(E)) {
        self.slots.entry(key.clone()).or_default().push(entry);
        self.order.push_back(key);
        self.count += 1;
        while self.count > self.limit {
            // order entries can be stale after takes; skip until one hits
            let Some(old) = self.order.pop_front() else {
                break;
            };
            if let Some(bucket) = self.slots.get_mut(&old) {
                if let Some(e) = bucket.pop() {
                    self.count -= 1;
                    evict(e);
                }
                if bucket.is_empty() {
                    self.slots.remove(&old);
                }
            }
        }
    }

    fn take(&mut self, key: &K) -> Option<E> {
        let bucket = self.slots.get_mut(key)?;
        let entry = bucket.pop()?;
        if bucket.is_empty() {
            self.slots.remove(key);
        }
        self.count -= 1;
        Some(entry)
    }
}

struct KeyedEntry<U> {
    output: U,
    index: Source<usize>,
    root: NodeRef,
}

struct FallbackEntry<U> {
    output: U,
    root: NodeRef,
}

fn make_fallback<U>(
    sc: &mut Scope,
    outer: &WeakNode,
    f: &mut Box<dyn FnMut(&mut Scope) -> U>,
) -> Option<FallbackEntry<U>> {
    let outer = outer.upgrade()?;
    let (output, root) = owned_root(sc.rt(), &outer, |sc| f(sc));
    Some(FallbackEntry { output, root })
}

/// Keyed projection: entry identity follows the value. Each mapped entry is
/// built once per value occurrence, keeps its cleanups across reorders, and
/// sees its position through the readable index.
pub fn map_keyed<T, U>(
    sc: &mut Scope,
    mut list: impl FnMut(&mut Scope) -> Vec<T> + 'static,
    map: impl FnMut(&T, ReadSource<usize>, &mut Scope) -> U + 'static,
    options: MapOptions<U>,
) -> Memo<Vec<U>>
where
    T: Clone + Eq + Hash + 'static,
    U: Clone + 'static,
{
    let outer: WeakNode = Rc::downgrade(&sc.rt().current_owner());
    let mut map = map;
    let MapOptions {
        mut fallback,
        pooled,
        pool_limit,
    } = options;
    let mut pool: Option<Pool<T, KeyedEntry<U>>> = pooled.then(|| Pool::new(pool_limit));
    let mut items: Vec<T> = Vec::new();
    let mut entries: Vec<KeyedEntry<U>> = Vec::new();
    let mut fallback_entry: Option<FallbackEntry<U>> = None;

    Memo::with_equal(
        sc,
        move |sc| {
            let new_items = list(sc);
            sc.untrack(|sc| {
                let n = new_items.len();
                let mut make = |pool: &mut Option<Pool<T, KeyedEntry<U>>>,
                                item: &T,
                                at: usize,
                                sc: &mut Scope|
                 -> KeyedEntry<U> {
                    if let Some(entry) = pool.as_mut().and_then(|p| p.take(item)) {
                        entry.index.set(at, sc);
                        return entry;
                    }
                    let index = Source::new(at);
                    let reader = index.split().0;
                    let Some(outer) = outer.upgrade() else {
                        unreachable!("projection ran after its owner was dropped");
                    };
                    let (output, root) = owned_root(sc.rt(), &outer, |sc| map(item, reader, sc));
                    KeyedEntry {
                        output,
                        index,
                        root,
                    }
                };

                if n == 0 {
                    for (item, entry) in items.drain(..).zip(entries.drain(..)) {
                        retire_keyed(&mut pool, item, entry, sc);
                    }
                    if fallback_entry.is_none() {
                        if let Some(f) = &mut fallback {
                            fallback_entry = make_fallback(sc, &outer, f);
                        }
                    }
                } else {
                    if let Some(fb) = fallback_entry.take() {
                        dispose_detached(&fb.root, sc.rt());
                    }
                    if items.is_empty() {
                        for (j, item) in new_items.iter().enumerate() {
                            let entry = make(&mut pool, item, j, sc);
                            entries.push(entry);
                        }
                        items = new_items.clone();
                    } else {
                        let old_len = items.len();
                        let mut old_entries: Vec<Option<KeyedEntry<U>>> =
                            entries.drain(..).map(Some).collect();
                        let mut temp: Vec<Option<KeyedEntry<U>>> =
                            (0..n).map(|_| None).collect();

                        let mut start = 0;
                        while start < old_len && start < n && items[start] == new_items[start] {
                            temp[start] = old_entries[start].take();
                            start += 1;
                        }
                        let mut old_end = old_len;
                        let mut new_end = n;
                        while old_end > start
                            && new_end > start
                            && items[old_end - 1] == new_items[new_end - 1]
                        {
                            temp[new_end - 1] = old_entries[old_end - 1].take();
                            old_end -= 1;
                            new_end -= 1;
                        }

                        // earliest position per value, with a chain through
                        // later duplicates
                        let mut index_of: HashMap<T, usize> = HashMap::new();
                        let mut chain: Vec<Option<usize>> = vec![None; n];
                        for j in (start..new_end).rev() {
                            chain[j] = index_of.insert(new_items[j].clone(), j);
                        }
                        for i in start..old_end {
                            let Some(entry) = old_entries[i].take() else {
                                continue;
                            };
                            match index_of.get(&items[i]).copied() {
                                Some(j) => {
                                    match chain[j] {
                                        Some(next) => {
                                            index_of.insert(items[i].clone(), next);
                                        }
                                        None => {
                                            index_of.remove(&items[i]);
                                        }
                                    }
                                    temp[j] = Some(entry);
                                }
                                None => retire_keyed(&mut pool, items[i].clone(), entry, sc),
                            }
                        }

                        for (j, slot) in temp.iter_mut().enumerate() {
                            let entry = match slot.take() {
                                Some(entry) => {
                                    entry.index.set(j, sc);
                                    entry
                                }
                                None => make(&mut pool, &new_items[j], j, sc),
                            };
                            entries.push(entry);
                        }
                        items = new_items.clone();
                    }
                }
                match (&fallback_entry, entries.is_empty()) {
                    (Some(fb), true) => vec![fb.output.clone()],
                    _ => entries.iter().map(|e| e.output.clone()).collect(),
                }
            })
        },
        Equal::never(),
    )
}

fn retire_keyed<T, U>(
    pool: &mut Option<Pool<T, KeyedEntry<U>>>,
    item: T,
    entry: KeyedEntry<U>,
    sc: &mut Scope,
) where
    T: Clone + Eq + Hash + 'static,
    U: 'static,
{
    match pool {
        Some(pool) => {
            let rt = sc.rt();
            pool.stash(item, entry, |e| dispose_detached(&e.root, rt));
        }
        None => dispose_detached(&entry.root, sc.rt()),
    }
}

struct IndexedEntry<T: 'static, U> {
    value: Source<T>,
    output: U,
    root: NodeRef,
}

/// Indexed projection: entry identity follows the position. Value changes at
/// a kept position flow through the readable value; only the tail is built
/// or torn down.
pub fn map_indexed<T, U>(
    sc: &mut Scope,
    mut list: impl FnMut(&mut Scope) -> Vec<T> + 'static,
    map: impl FnMut(ReadSource<T>, usize, &mut Scope) -> U + 'static,
    options: MapOptions<U>,
) -> Memo<Vec<U>>
where
    T: Clone + PartialEq + 'static,
    U: Clone + 'static,
{
    let outer: WeakNode = Rc::downgrade(&sc.rt().current_owner());
    let mut map = map;
    let MapOptions {
        mut fallback,
        pooled,
        pool_limit,
    } = options;
    let mut pool: Option<Pool<usize, IndexedEntry<T, U>>> = pooled.then(|| Pool::new(pool_limit));
    let mut entries: Vec<IndexedEntry<T, U>> = Vec::new();
    let mut fallback_entry: Option<FallbackEntry<U>> = None;

    Memo::with_equal(
        sc,
        move |sc| {
            let new_items = list(sc);
            sc.untrack(|sc| {
                let n = new_items.len();
                if n == 0 {
                    while let Some(entry) = entries.pop() {
                        let i = entries.len();
                        match &mut pool {
                            Some(pool) => {
                                let rt = sc.rt();
                                pool.stash(i, entry, |e| dispose_detached(&e.root, rt));
                            }
                            None => dispose_detached(&entry.root, sc.rt()),
                        }
                    }
                    if fallback_entry.is_none() {
                        if let Some(f) = &mut fallback {
                            fallback_entry = make_fallback(sc, &outer, f);
                        }
                    }
                    return match &fallback_entry {
                        Some(fb) => vec![fb.output.clone()],
                        None => Vec::new(),
                    };
                }
                if let Some(fb) = fallback_entry.take() {
                    dispose_detached(&fb.root, sc.rt());
                }
                for (i, item) in new_items.iter().enumerate().take(entries.len()) {
                    entries[i].value.set(item.clone(), sc);
                }
                while entries.len() > n {
                    let entry = entries.pop().unwrap();
                    let i = entries.len();
                    match &mut pool {
                        Some(pool) => {
                            let rt = sc.rt();
                            pool.stash(i, entry, |e| dispose_detached(&e.root, rt));
                        }
                        None => dispose_detached(&entry.root, sc.rt()),
                    }
                }
                while entries.len() < n {
                    let i = entries.len();
                    let item = &new_items[i];
                    if let Some(entry) = pool.as_mut().and_then(|p| p.take(&i)) {
                        entry.value.set(item.clone(), sc);
                        entries.push(entry);
                        continue;
                    }
                    let value = Source::new(item.clone());
                    let reader = value.split().0;
                    let Some(owner) = outer.upgrade() else {
                        unreachable!("projection ran after its owner was dropped");
                    };
                    let (output, root) = owned_root(sc.rt(), &owner, |sc| map(reader, i, sc));
                    entries.push(IndexedEntry {
                        value,
                        output,
                        root,
                    });
                }
                entries.iter().map(|e| e.output.clone()).collect()
            })
        },
        Equal::never(),
    )
}
