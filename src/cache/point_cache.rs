use std::collections::HashMap;

use super::clock_replacer::{ClockReplacer, FrameId};
use crate::common::RecordOffset;
use crate::tuple::point::Point;

/// (column position, record offset)
type CacheKey = (usize, RecordOffset);

/// A bounded cache of decoded POINT values, so distance computations over
/// index results don't have to go back to the record file for every offset.
/// A capacity of 0 disables caching.
pub struct PointCache {
    frames: Vec<Option<(CacheKey, Point)>>,
    lookup: HashMap<CacheKey, FrameId>,
    replacer: ClockReplacer,
    hits: u64,
    misses: u64,
}

impl PointCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: vec![None; capacity],
            lookup: HashMap::with_capacity(capacity),
            replacer: ClockReplacer::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn get(&mut self, column: usize, offset: RecordOffset) -> Option<Point> {
        match self.lookup.get(&(column, offset)) {
            Some(frame) => {
                self.hits += 1;
                self.replacer.touch(*frame);
                self.frames[*frame].map(|(_, point)| point)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, column: usize, offset: RecordOffset, point: Point) {
        let key = (column, offset);
        if let Some(frame) = self.lookup.get(&key) {
            self.frames[*frame] = Some((key, point));
            self.replacer.touch(*frame);
            return;
        }
        let Some(frame) = self.replacer.claim() else {
            return;
        };
        if let Some((evicted, _)) = self.frames[frame].take() {
            self.lookup.remove(&evicted);
        }
        self.frames[frame] = Some((key, point));
        self.lookup.insert(key, frame);
    }

    /// Drops the cached value of one record column, if there is one.
    pub fn invalidate(&mut self, column: usize, offset: RecordOffset) {
        if let Some(frame) = self.lookup.remove(&(column, offset)) {
            self.frames[frame] = None;
            self.replacer.release(frame);
        }
    }

    pub fn clear(&mut self) {
        for (_, frame) in self.lookup.drain() {
            self.frames[frame] = None;
            self.replacer.release(frame);
        }
    }

    /// (hits, misses) since the cache was created
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::PointCache;
    use crate::tuple::point::Point;

    #[test]
    fn evicts_when_full() {
        let mut cache = PointCache::new(2);
        cache.insert(0, 10, Point::new(1.0, 1.0));
        cache.insert(0, 20, Point::new(2.0, 2.0));
        cache.insert(0, 30, Point::new(3.0, 3.0));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(0, 30), Some(Point::new(3.0, 3.0)));

        let cached = [10, 20]
            .iter()
            .filter(|offset| cache.get(0, **offset).is_some())
            .count();
        assert_eq!(cached, 1);
    }

    #[test]
    fn columns_are_cached_separately() {
        let mut cache = PointCache::new(8);
        cache.insert(0, 10, Point::new(1.0, 1.0));
        cache.insert(1, 10, Point::new(5.0, 5.0));
        cache.invalidate(0, 10);
        assert_eq!(cache.get(0, 10), None);
        assert_eq!(cache.get(1, 10), Some(Point::new(5.0, 5.0)));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn replacing_a_point_keeps_one_entry() {
        let mut cache = PointCache::new(4);
        cache.insert(2, 7, Point::new(1.0, 1.0));
        cache.insert(2, 7, Point::new(9.0, 9.0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(2, 7), Some(Point::new(9.0, 9.0)));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = PointCache::new(0);
        cache.insert(0, 1, Point::origin());
        assert_eq!(cache.get(0, 1), None);
    }
}
