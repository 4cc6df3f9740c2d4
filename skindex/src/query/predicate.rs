//! Query predicates over keyword fields and numeric fields.

use crate::rtree::{NumericRange, EPSILON};

/// Comparison operator of a query predicate. For text predicates only
/// `Equal` (AND over keywords), `Or` and `NotEqual` are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Or,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
}

/// A keyword predicate: one or more keywords combined under `op`, optionally
/// restricted to a single text field (`None` matches any field).
#[derive(Debug, Clone)]
pub struct TextPredicate {
    keywords: Vec<String>,
    pub op: ComparisonOperator,
    field: Option<u16>,
}

impl TextPredicate {
    pub fn new(keywords: Vec<String>, op: ComparisonOperator, field: Option<u16>) -> Self {
        Self {
            keywords,
            op,
            field,
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn field(&self) -> Option<u16> {
        self.field
    }

    pub fn add_keyword(&mut self, keyword: impl Into<String>) {
        self.keywords.push(keyword.into());
    }
}

/// A predicate on one numeric field, read constant-first: the predicate
/// holds when `value op record_value`. A query "population at least 5000"
/// is therefore expressed as `LessThanEqual` with value 5000.
#[derive(Debug, Clone)]
pub struct NumericPredicate {
    /// Index into the record's numeric field array.
    pub field_index: usize,
    pub value: f64,
    pub op: ComparisonOperator,
}

impl NumericPredicate {
    pub fn new(field_index: usize, value: f64, op: ComparisonOperator) -> Self {
        Self {
            field_index,
            value,
            op,
        }
    }

    /// Exact check against one record's field value.
    pub fn is_satisfied_by(&self, d: f64) -> bool {
        match self.op {
            ComparisonOperator::Equal => (self.value - d).abs() <= EPSILON as f64,
            ComparisonOperator::NotEqual => self.value != d,
            ComparisonOperator::GreaterThanEqual => self.value >= d,
            ComparisonOperator::LessThanEqual => self.value <= d,
            ComparisonOperator::GreaterThan => self.value > d,
            ComparisonOperator::LessThan => self.value < d,
            ComparisonOperator::Or => false,
        }
    }

    /// Necessary-condition check against a subtree's aggregated range.
    /// A `true` here only means the subtree may contain a match; `NotEqual`
    /// can never be ruled out by a range.
    pub fn is_satisfied_by_range(&self, range: &NumericRange) -> bool {
        let lower = range.lower_bound_at(self.field_index) as f64;
        let upper = range.upper_bound_at(self.field_index) as f64;

        match self.op {
            ComparisonOperator::Equal => self.value >= lower && self.value <= upper,
            ComparisonOperator::NotEqual => true,
            ComparisonOperator::GreaterThanEqual => lower <= self.value,
            ComparisonOperator::LessThanEqual => upper >= self.value,
            ComparisonOperator::GreaterThan => lower < self.value,
            ComparisonOperator::LessThan => upper > self.value,
            ComparisonOperator::Or => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_numeric_checks() {
        let at_least_10 = NumericPredicate::new(0, 10.0, ComparisonOperator::LessThanEqual);
        assert!(at_least_10.is_satisfied_by(10.0));
        assert!(at_least_10.is_satisfied_by(11.5));
        assert!(!at_least_10.is_satisfied_by(9.9));

        let at_most_10 = NumericPredicate::new(0, 10.0, ComparisonOperator::GreaterThanEqual);
        assert!(at_most_10.is_satisfied_by(10.0));
        assert!(at_most_10.is_satisfied_by(3.0));
        assert!(!at_most_10.is_satisfied_by(10.1));

        let eq = NumericPredicate::new(0, 1.0, ComparisonOperator::Equal);
        assert!(eq.is_satisfied_by(1.0));
        assert!(eq.is_satisfied_by(1.0 + EPSILON as f64 / 2.0));
        assert!(!eq.is_satisfied_by(1.1));

        let ne = NumericPredicate::new(0, 5.0, ComparisonOperator::NotEqual);
        assert!(!ne.is_satisfied_by(5.0));
        assert!(ne.is_satisfied_by(4.0));
    }

    #[test]
    fn test_range_check_is_necessary_not_sufficient() {
        let range = NumericRange::from_values(vec![5.0, 0.0]);

        let eq_in = NumericPredicate::new(0, 5.0, ComparisonOperator::Equal);
        let eq_out = NumericPredicate::new(0, 6.0, ComparisonOperator::Equal);
        assert!(eq_in.is_satisfied_by_range(&range));
        assert!(!eq_out.is_satisfied_by_range(&range));

        // NOT_EQUAL can never prune a subtree.
        let ne = NumericPredicate::new(0, 5.0, ComparisonOperator::NotEqual);
        assert!(ne.is_satisfied_by_range(&range));
    }

    #[test]
    fn test_range_check_with_aggregated_bounds() {
        use crate::rtree::{Node, Point, Rectangle};

        let mut node = Node::new(0, 0);
        node.push(
            1,
            Rectangle::point(Point::new(0.0, 0.0)),
            Some(NumericRange::from_values(vec![2.0])),
        );
        node.push(
            2,
            Rectangle::point(Point::new(1.0, 1.0)),
            Some(NumericRange::from_values(vec![8.0])),
        );
        let range = node.aggregate_numeric_range(1).unwrap();

        // "at least 5": some value in [2, 8] may be >= 5.
        let pred = NumericPredicate::new(0, 5.0, ComparisonOperator::LessThanEqual);
        assert!(pred.is_satisfied_by_range(&range));

        // "at least 9": nothing in [2, 8] qualifies.
        let pred = NumericPredicate::new(0, 9.0, ComparisonOperator::LessThanEqual);
        assert!(!pred.is_satisfied_by_range(&range));
    }

    #[test]
    fn test_text_predicate_accessors() {
        let mut pred = TextPredicate::new(vec!["lake".into()], ComparisonOperator::Equal, Some(1));
        pred.add_keyword("park");
        assert_eq!(pred.keywords(), ["lake", "park"]);
        assert_eq!(pred.field(), Some(1));
        assert_eq!(pred.op, ComparisonOperator::Equal);
    }
}
