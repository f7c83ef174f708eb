use super::{shard_index, Quarantinable};
use crate::sync::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Shard<T> {
    queue: VecDeque<T>,
    size: usize,
}

/// FIFO quarantine split into independently locked shards.
///
/// Objects are assigned to a shard by identity hash and each shard enforces
/// `ceil(max_quarantine_size / shards)` on its own, so total capacity is the
/// shard count times that cap. Eviction is oldest-first within a shard only;
/// globally the order is approximately FIFO. The shard count is fixed for the
/// life of the quarantine.
pub struct ShardedQuarantine<T: Quarantinable> {
    shards: Box<[Mutex<Shard<T>>]>,
    max_quarantine_size: AtomicUsize,
    max_object_size: AtomicUsize,
    size: AtomicUsize,
    count: AtomicUsize,
}

impl<T: Quarantinable> ShardedQuarantine<T> {
    pub fn new(shards: usize, max_quarantine_size: usize, max_object_size: usize) -> Self {
        let shards = shards.max(1);
        ShardedQuarantine {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(Shard {
                        queue: VecDeque::new(),
                        size: 0,
                    })
                })
                .collect(),
            max_quarantine_size: AtomicUsize::new(max_quarantine_size),
            max_object_size: AtomicUsize::new(max_object_size),
            size: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    pub fn shard_of(&self, object: &T) -> usize {
        shard_index(object.shard_hash(), self.shards.len())
    }

    /// Budget each shard enforces.
    #[inline]
    pub fn shard_cap(&self) -> usize {
        self.max_quarantine_size().div_ceil(self.shards.len())
    }

    pub fn max_quarantine_size(&self) -> usize {
        self.max_quarantine_size.load(Ordering::Relaxed)
    }

    pub fn set_max_quarantine_size(&self, size: usize) {
        self.max_quarantine_size.store(size, Ordering::Relaxed);
    }

    pub fn max_object_size(&self) -> usize {
        self.max_object_size.load(Ordering::Relaxed)
    }

    pub fn set_max_object_size(&self, size: usize) {
        self.max_object_size.store(size, Ordering::Relaxed);
    }

    /// Bytes currently held, summed over shards.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Objects currently held.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `object`. Returns the shard it went to, or `None` if it is too
    /// large to be quarantined and should be released right away.
    pub fn push(&self, object: T) -> Option<usize> {
        let footprint = object.footprint();
        if footprint > self.max_object_size() || footprint > self.shard_cap() {
            return None;
        }
        let shard = self.shard_of(&object);
        {
            let mut s = self.shards[shard].lock();
            s.queue.push_back(object);
            s.size += footprint;
        }
        self.size.fetch_add(footprint, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        Some(shard)
    }

    /// Dequeue the oldest object of `shard` if that shard is over budget.
    pub fn pop_over_budget(&self, shard: usize) -> Option<T> {
        let cap = self.shard_cap();
        let object = {
            let mut s = self.shards[shard].lock();
            if s.size <= cap {
                return None;
            }
            let object = s.queue.pop_front()?;
            s.size -= object.footprint();
            object
        };
        self.size.fetch_sub(object.footprint(), Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::Relaxed);
        Some(object)
    }

    /// Drain `shard` down to its budget, handing each evicted object to
    /// `release` oldest first. Returns how many were evicted.
    pub fn trim(&self, shard: usize, mut release: impl FnMut(T)) -> usize {
        let mut evicted = 0;
        while let Some(object) = self.pop_over_budget(shard) {
            log::trace!("evicting quarantined object from shard {}", shard);
            release(object);
            evicted += 1;
        }
        evicted
    }

    /// Dequeue from any over-budget shard, starting the search at a random
    /// shard so that no shard is systematically drained first.
    pub fn pop(&self) -> Option<T> {
        let n = self.shards.len();
        let start = rand::random::<usize>() % n;
        (0..n).find_map(|k| self.pop_over_budget((start + k) % n))
    }

    /// Take a specific object out, wherever it is in its shard.
    pub fn remove(&self, object: &T) -> bool {
        let shard = self.shard_of(object);
        let removed = {
            let mut s = self.shards[shard].lock();
            match s.queue.iter().position(|o| o == object) {
                Some(pos) => {
                    s.queue.remove(pos);
                    s.size -= object.footprint();
                    true
                }
                None => false,
            }
        };
        if removed {
            self.size.fetch_sub(object.footprint(), Ordering::Relaxed);
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn contains(&self, object: &T) -> bool {
        self.shards[self.shard_of(object)]
            .lock()
            .queue
            .contains(object)
    }

    /// Drain every shard, oldest first within each shard.
    pub fn empty(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let (drained, bytes) = {
                let mut s = shard.lock();
                let bytes = s.size;
                s.size = 0;
                (s.queue.drain(..).collect::<Vec<_>>(), bytes)
            };
            self.size.fetch_sub(bytes, Ordering::Relaxed);
            self.count.fetch_sub(drained.len(), Ordering::Relaxed);
            out.extend(drained);
        }
        out
    }

    /// Bytes held by one shard.
    pub fn shard_size(&self, shard: usize) -> usize {
        self.shards[shard].lock().size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Dummy {
        id: usize,
        size: usize,
    }

    impl Quarantinable for Dummy {
        fn footprint(&self) -> usize {
            self.size
        }
        fn shard_hash(&self) -> u64 {
            self.id as u64
        }
    }

    fn d(id: usize, size: usize) -> Dummy {
        Dummy { id, size }
    }

    #[test]
    fn rejects_oversized_objects() {
        let q = ShardedQuarantine::new(1, 100, 40);
        assert_eq!(q.push(d(1, 41)), None);
        assert_eq!(q.push(d(2, 40)), Some(0));
        q.set_max_object_size(1000);
        assert_eq!(q.push(d(3, 101)), None);
        assert_eq!(q.len(), 1);
        assert_eq!(q.size(), 40);
    }

    #[test]
    fn single_shard_is_fifo() {
        let q = ShardedQuarantine::new(1, 30, 30);
        for i in 0..3 {
            q.push(d(i, 10));
        }
        assert_eq!(q.pop_over_budget(0), None);
        q.push(d(3, 10));
        assert_eq!(q.pop_over_budget(0), Some(d(0, 10)));
        assert_eq!(q.pop_over_budget(0), None);

        q.set_max_quarantine_size(10);
        assert_eq!(q.pop(), Some(d(1, 10)));
        assert_eq!(q.pop(), Some(d(2, 10)));
        assert_eq!(q.pop(), None);
        assert_eq!(q.size(), 10);

        q.push(d(4, 10));
        let mut evicted = Vec::new();
        assert_eq!(q.trim(0, |o| evicted.push(o.id)), 1);
        assert_eq!(evicted, vec![3]);
    }

    #[test]
    fn zero_budget_flushes_everything() {
        let q = ShardedQuarantine::new(4, 4000, 4000);
        for i in 0..32 {
            q.push(d(i, 8));
        }
        q.set_max_quarantine_size(0);
        let mut popped = 0;
        while q.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 32);
        assert!(q.is_empty());
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn per_shard_accounting() {
        let q = ShardedQuarantine::new(8, 800, 100);
        assert_eq!(q.shard_cap(), 100);
        for i in 0..64 {
            q.push(d(i, 10));
        }
        let total: usize = (0..q.shard_count()).map(|s| q.shard_size(s)).sum();
        assert_eq!(total, q.size());
        while q.pop().is_some() {}
        for s in 0..q.shard_count() {
            assert!(q.shard_size(s) <= q.shard_cap());
        }
    }

    #[test]
    fn remove_and_empty_leave_no_residue() {
        let q = ShardedQuarantine::new(4, 1000, 1000);
        for i in 0..20 {
            q.push(d(i, 5));
        }
        assert!(q.remove(&d(7, 5)));
        assert!(!q.contains(&d(7, 5)));
        assert!(!q.remove(&d(7, 5)));
        assert_eq!(q.len(), 19);

        let drained = q.empty();
        assert_eq!(drained.len(), 19);
        assert!(!drained.contains(&d(7, 5)));
        assert!(q.is_empty());
        assert_eq!(q.size(), 0);
        for s in 0..q.shard_count() {
            assert_eq!(q.shard_size(s), 0);
        }
    }
}
