//! Distinct-value collectors with a byte budget

use crate::request::TagValue;
use rustc_hash::FxHashSet;
use spanstore_core::TagScope;
use std::hash::Hash;

/// Size charged against a collector's budget.
pub trait ByteSize {
    /// Bytes this value costs.
    fn byte_size(&self) -> usize;
}

impl ByteSize for String {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl ByteSize for TagValue {
    fn byte_size(&self) -> usize {
        self.value_type.len() + self.value.len()
    }
}

impl ByteSize for (TagScope, String) {
    fn byte_size(&self) -> usize {
        self.1.len()
    }
}

/// Collects distinct values until the byte budget is spent.
///
/// Once a value would push the total over the budget the collector is
/// marked exceeded and accepts nothing more, so the result never holds
/// more than fits.
#[derive(Debug)]
pub struct DistinctCollector<T> {
    max_bytes: usize,
    curr_bytes: usize,
    values: FxHashSet<T>,
    exceeded: bool,
}

/// Distinct tag names or plain values.
pub type DistinctStringCollector = DistinctCollector<String>;

/// Distinct typed values.
pub type DistinctValueCollector = DistinctCollector<TagValue>;

/// Distinct tag names keyed by scope.
pub type ScopedNameCollector = DistinctCollector<(TagScope, String)>;

impl<T: Hash + Eq + Ord + ByteSize> DistinctCollector<T> {
    /// Collector with a budget of `max_bytes` (0 = unlimited).
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            curr_bytes: 0,
            values: FxHashSet::default(),
            exceeded: false,
        }
    }

    /// Offer a value. Returns false once the budget is exceeded.
    pub fn collect(&mut self, value: T) -> bool {
        if self.exceeded {
            return false;
        }
        if self.values.contains(&value) {
            return true;
        }
        let len = value.byte_size();
        if self.max_bytes > 0 && self.curr_bytes + len > self.max_bytes {
            self.exceeded = true;
            return false;
        }
        self.curr_bytes += len;
        self.values.insert(value);
        true
    }

    /// Whether a value was refused for the budget.
    pub fn exceeded(&self) -> bool {
        self.exceeded
    }

    /// Distinct values held.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bytes charged so far.
    pub fn bytes(&self) -> usize {
        self.curr_bytes
    }

    /// Collected values, sorted.
    pub fn into_sorted(self) -> Vec<T> {
        let mut values: Vec<T> = self.values.into_iter().collect();
        values.sort();
        values
    }
}
