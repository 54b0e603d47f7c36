use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{NestError, Result};

/// Tower height cap; containers are expected to stay under ~2^11 entries.
pub const MAX_LEVEL: usize = 11;

/// Concurrent ordered map used for every container in the resource tree:
/// root -> databases, database -> documents, document -> collections,
/// collection -> documents, and the subscription registry.
///
/// Reads (`find`, `query`) never take a lock; they traverse `ArcSwap`
/// pointers and skip nodes that are marked for removal or not yet fully
/// linked. Writes lock the victim/predecessor nodes, revalidate, and then
/// publish the new links level by level.
pub struct SkipList<K, V> {
    head: Tower<K, V>,
    head_lock: Mutex<()>,
    /// Structural modification counter: bumped on insert and remove, never
    /// on in-place value updates. `query` uses it to detect a torn scan.
    ops: AtomicU64,
}

impl<K, V> std::fmt::Debug for SkipList<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipList").finish_non_exhaustive()
    }
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

struct Tower<K, V> {
    next: Vec<ArcSwapOption<Node<K, V>>>,
}

impl<K, V> Tower<K, V> {
    fn with_levels(levels: usize) -> Self {
        Self {
            next: (0..levels).map(|_| ArcSwapOption::empty()).collect(),
        }
    }
}

struct Node<K, V> {
    key: K,
    value: ArcSwap<V>,
    lock: Mutex<()>,
    /// Highest level this node is linked at (0-based, inclusive).
    top_level: usize,
    marked: AtomicBool,
    fully_linked: AtomicBool,
    tower: Tower<K, V>,
}

struct Search<K, V> {
    found_level: Option<usize>,
    /// Predecessor per level; `None` is the head tower.
    preds: Vec<Link<K, V>>,
    /// Successor per level; `None` is the tail.
    succs: Vec<Link<K, V>>,
}

fn same_link<K, V>(a: &Link<K, V>, b: &Link<K, V>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// Stable identity for a predecessor slot, used to avoid double-locking.
fn pred_identity<K, V>(pred: &Link<K, V>) -> *const () {
    match pred {
        None => std::ptr::null(),
        Some(node) => Arc::as_ptr(node) as *const (),
    }
}

/// Geometric level draw (p = 0.5), capped at `MAX_LEVEL` towers.
fn random_level() -> usize {
    let mut rng = rand::thread_rng();
    let mut level = 0;
    while level + 1 < MAX_LEVEL && rng.gen_bool(0.5) {
        level += 1;
    }
    level
}

impl<K, V> Default for SkipList<K, V>
where
    K: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SkipList<K, V>
where
    K: Ord,
{
    pub fn new() -> Self {
        Self {
            head: Tower::with_levels(MAX_LEVEL),
            head_lock: Mutex::new(()),
            ops: AtomicU64::new(0),
        }
    }

    /// Lock-free descent from the top level, recording the predecessor and
    /// successor at every level. `found_level` is the highest level at
    /// which the key was seen, marked nodes included; callers decide what
    /// a marked hit means.
    fn search(&self, key: &K) -> Search<K, V> {
        let mut preds: Vec<Link<K, V>> = vec![None; MAX_LEVEL];
        let mut succs: Vec<Link<K, V>> = vec![None; MAX_LEVEL];
        let mut found_level = None;
        let mut pred: Link<K, V> = None;

        for level in (0..MAX_LEVEL).rev() {
            let mut curr = self.load_link(&pred, level);
            while let Some(node) = curr.clone() {
                if node.key >= *key {
                    break;
                }
                curr = node.tower.next[level].load_full();
                pred = Some(node);
            }
            if found_level.is_none() {
                if let Some(node) = &curr {
                    if node.key == *key {
                        found_level = Some(level);
                    }
                }
            }
            preds[level] = pred.clone();
            succs[level] = curr;
        }

        Search {
            found_level,
            preds,
            succs,
        }
    }

    fn load_link(&self, pred: &Link<K, V>, level: usize) -> Link<K, V> {
        match pred {
            None => self.head.next[level].load_full(),
            Some(node) => node.tower.next[level].load_full(),
        }
    }

    fn store_link(&self, pred: &Link<K, V>, level: usize, succ: Link<K, V>) {
        match pred {
            None => self.head.next[level].store(succ),
            Some(node) => node.tower.next[level].store(succ),
        }
    }

    fn lock_pred<'a>(&'a self, pred: &'a Link<K, V>) -> MutexGuard<'a, ()> {
        match pred {
            None => self.head_lock.lock(),
            Some(node) => node.lock.lock(),
        }
    }
}

impl<K, V> SkipList<K, V>
where
    K: Ord,
    V: Clone,
{
    /// Point lookup. Sees every insert whose linking completed and no
    /// remove whose unlink started.
    pub fn find(&self, key: &K) -> Option<V> {
        let search = self.search(key);
        let level = search.found_level?;
        let node = search.succs[level].as_ref()?;
        if node.fully_linked.load(Ordering::Acquire) && !node.marked.load(Ordering::Acquire) {
            Some(node.value.load_full().as_ref().clone())
        } else {
            None
        }
    }

    /// Insert or update under `check`. The callback sees the current value
    /// (or `None` for a fresh key) and produces the value to store; a
    /// callback error leaves the index untouched and propagates verbatim.
    ///
    /// Returns `true` only when the structure changed, i.e. a new node was
    /// linked. An in-place value replacement returns `false`.
    pub fn upsert<F>(&self, key: K, mut check: F) -> Result<bool>
    where
        F: FnMut(&K, Option<&V>) -> Result<V>,
    {
        loop {
            let search = self.search(&key);

            if let Some(level) = search.found_level {
                let node = search.succs[level]
                    .clone()
                    .expect("found level implies a successor node");
                let _guard = node.lock.lock();
                if node.marked.load(Ordering::Acquire)
                    || !node.fully_linked.load(Ordering::Acquire)
                {
                    // Mid-removal or mid-insert; retry against fresh state.
                    continue;
                }
                let current = node.value.load_full();
                let next = check(&node.key, Some(current.as_ref()))?;
                node.value.store(Arc::new(next));
                return Ok(false);
            }

            let top_level = random_level();

            // Lock each distinct predecessor bottom-up, then make sure the
            // window we searched is still intact.
            let mut guards: Vec<MutexGuard<'_, ()>> = Vec::new();
            let mut locked: Vec<*const ()> = Vec::new();
            let mut valid = true;
            for level in 0..=top_level {
                let pred = &search.preds[level];
                let succ = &search.succs[level];
                let identity = pred_identity(pred);
                if !locked.contains(&identity) {
                    guards.push(self.lock_pred(pred));
                    locked.push(identity);
                }
                let pred_marked = pred
                    .as_ref()
                    .map(|n| n.marked.load(Ordering::Acquire))
                    .unwrap_or(false);
                let succ_marked = succ
                    .as_ref()
                    .map(|n| n.marked.load(Ordering::Acquire))
                    .unwrap_or(false);
                if pred_marked || succ_marked || !same_link(&self.load_link(pred, level), succ) {
                    valid = false;
                    break;
                }
            }
            if !valid {
                continue;
            }

            let value = check(&key, None)?;

            let node = Arc::new(Node {
                key,
                value: ArcSwap::from_pointee(value),
                lock: Mutex::new(()),
                top_level,
                marked: AtomicBool::new(false),
                fully_linked: AtomicBool::new(false),
                tower: Tower::with_levels(top_level + 1),
            });

            // Publish the successor pointer before the predecessor pointer
            // so a concurrent reader never sees a half-wired level.
            for level in 0..=top_level {
                node.tower.next[level].store(search.succs[level].clone());
                self.store_link(&search.preds[level], level, Some(node.clone()));
            }
            node.fully_linked.store(true, Ordering::Release);

            self.ops.fetch_add(1, Ordering::SeqCst);
            return Ok(true);
        }
    }

    /// Two-phase removal: mark the victim under its lock, then lock the
    /// predecessors and unlink top-down. Readers treat the node as absent
    /// from the moment it is marked.
    pub fn remove(&self, key: &K) -> Option<V> {
        let victim = {
            let search = self.search(key);
            let level = search.found_level?;
            let node = search.succs[level].clone()?;
            if !node.fully_linked.load(Ordering::Acquire)
                || node.marked.load(Ordering::Acquire)
                || node.top_level != level
            {
                return None;
            }
            node
        };

        let victim_guard = victim.lock.lock();
        if victim.marked.load(Ordering::Acquire) {
            // Another remover won the race while we waited for the lock.
            return None;
        }
        victim.marked.store(true, Ordering::Release);
        let top_level = victim.top_level;

        loop {
            let search = self.search(key);

            let mut guards: Vec<MutexGuard<'_, ()>> = Vec::new();
            let mut locked: Vec<*const ()> = Vec::new();
            let mut valid = true;
            for level in 0..=top_level {
                let pred = &search.preds[level];
                let identity = pred_identity(pred);
                if !locked.contains(&identity) {
                    guards.push(self.lock_pred(pred));
                    locked.push(identity);
                }
                let pred_marked = pred
                    .as_ref()
                    .map(|n| n.marked.load(Ordering::Acquire))
                    .unwrap_or(false);
                let still_linked =
                    same_link(&self.load_link(pred, level), &Some(victim.clone()));
                if pred_marked || !still_linked {
                    valid = false;
                    break;
                }
            }
            if !valid {
                continue;
            }

            for level in (0..=top_level).rev() {
                let succ = victim.tower.next[level].load_full();
                self.store_link(&search.preds[level], level, succ);
            }
            drop(guards);
            drop(victim_guard);

            self.ops.fetch_add(1, Ordering::SeqCst);
            return Some(victim.value.load_full().as_ref().clone());
        }
    }

    /// Range scan over `start ..= end` in ascending key order; `None`
    /// bounds are open-ended. The scan restarts whenever the structural
    /// counter moved underneath it, so the returned snapshot is
    /// consistent. Cancellation is checked on every step.
    pub fn query(
        &self,
        cancel: &CancellationToken,
        start: Option<&K>,
        end: Option<&K>,
    ) -> Result<Vec<V>> {
        loop {
            let pre = self.ops.load(Ordering::SeqCst);
            let mut results = Vec::new();

            let mut curr = match start {
                None => self.head.next[0].load_full(),
                Some(key) => self.search(key).succs[0].clone(),
            };
            while let Some(node) = curr {
                if cancel.is_cancelled() {
                    return Err(NestError::Cancelled);
                }
                if let Some(end) = end {
                    if node.key > *end {
                        break;
                    }
                }
                if node.fully_linked.load(Ordering::Acquire)
                    && !node.marked.load(Ordering::Acquire)
                {
                    results.push(node.value.load_full().as_ref().clone());
                }
                curr = node.tower.next[0].load_full();
            }

            if self.ops.load(Ordering::SeqCst) == pre {
                return Ok(results);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(list: &SkipList<String, u64>, key: &str, value: u64) -> bool {
        list.upsert(key.to_string(), |_, _| Ok(value)).unwrap()
    }

    fn keys_of(list: &SkipList<String, u64>) -> Vec<u64> {
        list.query(&CancellationToken::new(), None, None).unwrap()
    }

    #[test]
    fn upsert_then_find_round_trips() {
        let list = SkipList::new();
        assert!(insert(&list, "beta", 2));
        assert!(insert(&list, "alpha", 1));
        assert_eq!(list.find(&"alpha".to_string()), Some(1));
        assert_eq!(list.find(&"beta".to_string()), Some(2));
        assert_eq!(list.find(&"gamma".to_string()), None);
    }

    #[test]
    fn upsert_reports_structural_change_only() {
        let list = SkipList::new();
        assert!(insert(&list, "k", 1));
        // Overwriting in place is not a structural change.
        assert!(!insert(&list, "k", 2));
        assert_eq!(list.find(&"k".to_string()), Some(2));
    }

    #[test]
    fn failed_check_leaves_index_unchanged() {
        let list = SkipList::new();
        assert!(insert(&list, "k", 1));

        let err = list
            .upsert("k".to_string(), |_, _| {
                Err(NestError::Conflict("k".into()))
            })
            .unwrap_err();
        assert!(matches!(err, NestError::Conflict(_)));
        assert_eq!(list.find(&"k".to_string()), Some(1));

        let err = list
            .upsert("fresh".to_string(), |_, _| {
                Err(NestError::BadRequest("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, NestError::BadRequest(_)));
        assert_eq!(list.find(&"fresh".to_string()), None);
    }

    #[test]
    fn remove_round_trips() {
        let list = SkipList::new();
        insert(&list, "a", 1);
        insert(&list, "b", 2);

        assert_eq!(list.remove(&"a".to_string()), Some(1));
        assert_eq!(list.find(&"a".to_string()), None);
        assert_eq!(list.remove(&"a".to_string()), None);
        assert_eq!(keys_of(&list), vec![2]);
    }

    #[test]
    fn query_returns_ascending_order() {
        let list = SkipList::new();
        for (key, value) in [("delta", 4), ("alpha", 1), ("charlie", 3), ("bravo", 2)] {
            insert(&list, key, value);
        }
        assert_eq!(keys_of(&list), vec![1, 2, 3, 4]);
    }

    #[test]
    fn query_honors_inclusive_bounds() {
        let list = SkipList::new();
        for (key, value) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            insert(&list, key, value);
        }
        let cancel = CancellationToken::new();
        let mid = list
            .query(&cancel, Some(&"b".to_string()), Some(&"c".to_string()))
            .unwrap();
        assert_eq!(mid, vec![2, 3]);

        let tail = list.query(&cancel, Some(&"c".to_string()), None).unwrap();
        assert_eq!(tail, vec![3, 4]);
    }

    #[test]
    fn query_with_inverted_range_is_empty() {
        let list = SkipList::new();
        insert(&list, "m", 1);
        let results = list
            .query(
                &CancellationToken::new(),
                Some(&"z".to_string()),
                Some(&"a".to_string()),
            )
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn query_aborts_when_cancelled() {
        let list = SkipList::new();
        insert(&list, "a", 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = list.query(&cancel, None, None).unwrap_err();
        assert!(matches!(err, NestError::Cancelled));
    }

    #[test]
    fn concurrent_writers_converge() {
        let list = Arc::new(SkipList::new());
        let mut handles = Vec::new();
        for shard in 0..4u64 {
            let list = Arc::clone(&list);
            handles.push(std::thread::spawn(move || {
                for i in 0..200u64 {
                    let key = format!("{shard:02}-{i:04}");
                    list.upsert(key, |_, _| Ok(shard * 1000 + i)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let all = list.query(&CancellationToken::new(), None, None).unwrap();
        assert_eq!(all.len(), 800);
        for shard in 0..4u64 {
            for i in 0..200u64 {
                let key = format!("{shard:02}-{i:04}");
                assert_eq!(list.find(&key), Some(shard * 1000 + i));
            }
        }
    }

    #[test]
    fn concurrent_removal_never_exposes_half_state() {
        let list = Arc::new(SkipList::new());
        for i in 0..400u64 {
            list.upsert(format!("{i:04}"), |_, _| Ok(i)).unwrap();
        }

        let remover = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for i in (0..400u64).step_by(2) {
                    assert_eq!(list.remove(&format!("{i:04}")), Some(i));
                }
            })
        };
        let reader = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    for i in 0..400u64 {
                        // Either the original value or absent; never junk.
                        if let Some(value) = list.find(&format!("{i:04}")) {
                            assert_eq!(value, i);
                        }
                    }
                }
            })
        };
        remover.join().unwrap();
        reader.join().unwrap();

        let survivors = list.query(&CancellationToken::new(), None, None).unwrap();
        assert_eq!(survivors, (0..400u64).filter(|i| i % 2 == 1).collect::<Vec<_>>());
    }
}
