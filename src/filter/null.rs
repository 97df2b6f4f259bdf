use crate::filter::{Filter, FilterAction};
use crate::record::Record;

/// A filter without an opinion: it accepts nothing and denies nothing.
///
/// Useful as a placeholder where a filter is required but no filtering is
/// wanted.
pub struct NullFilter;

impl Filter for NullFilter {
    fn filter(&self, _rec: &Record) -> FilterAction {
        FilterAction::Neutral
    }
}
