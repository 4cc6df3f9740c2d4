//! Query-side types: predicates and the best-first result iterator.

mod predicate;
mod result_iter;

pub use predicate::{ComparisonOperator, NumericPredicate, TextPredicate};
pub use result_iter::{QuerySpec, ResultIterator, ScoredRecord};
pub(crate) use result_iter::QueryMember;

/// A closed interval of super-node ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnInterval {
    pub start: u32,
    pub end: u32,
}

impl SnInterval {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, sn: u32) -> bool {
        sn >= self.start && sn <= self.end
    }
}
