//! Query directives passed to remote sources as data.
//!
//! Adapters translate a `RemoteQuery` into their own query language (SQL,
//! JQL, an in-memory filter). The engine never builds provider-specific
//! expressions itself.

use std::fmt;

/// Comparison operators a predicate may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Comparison {
  /// Field value strictly greater than the operand
  GreaterThan,
}

impl Comparison {
  pub fn evaluate<V: Ord>(self, lhs: &V, rhs: &V) -> bool {
    match self {
      Comparison::GreaterThan => lhs > rhs,
    }
  }

  pub fn sql_operator(self) -> &'static str {
    match self {
      Comparison::GreaterThan => ">",
    }
  }
}

impl fmt::Display for Comparison {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.sql_operator())
  }
}

/// `field <op> value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate<Ts> {
  pub field: String,
  pub op: Comparison,
  pub value: Ts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
  Ascending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDirective {
  pub field: String,
  pub order: SortOrder,
}

/// Filter and ordering requested from a remote source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQuery<Ts> {
  pub filter: Option<Predicate<Ts>>,
  pub sort: Option<SortDirective>,
}

impl<Ts> RemoteQuery<Ts> {
  /// Unfiltered, unordered query
  pub fn all() -> Self {
    Self {
      filter: None,
      sort: None,
    }
  }

  /// Keep only items whose `field` is strictly greater than `value`
  pub fn modified_after(mut self, field: impl Into<String>, value: Ts) -> Self {
    self.filter = Some(Predicate {
      field: field.into(),
      op: Comparison::GreaterThan,
      value,
    });
    self
  }

  pub fn sort_ascending(mut self, field: impl Into<String>) -> Self {
    self.sort = Some(SortDirective {
      field: field.into(),
      order: SortOrder::Ascending,
    });
    self
  }

  pub fn is_sorted(&self) -> bool {
    self.sort.is_some()
  }
}

/// What a remote source can push down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
  /// Deterministic server-side sort on the last-modified field
  pub sort: bool,
}

impl Capabilities {
  pub fn sortable() -> Self {
    Self { sort: true }
  }

  pub fn filter_only() -> Self {
    Self { sort: false }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_builder() {
    let query = RemoteQuery::all()
      .modified_after("updated", 10i64)
      .sort_ascending("updated");

    let filter = query.filter.as_ref().unwrap();
    assert_eq!(filter.field, "updated");
    assert_eq!(filter.op, Comparison::GreaterThan);
    assert_eq!(filter.value, 10);
    assert!(query.is_sorted());
  }

  #[test]
  fn test_greater_than_is_strict() {
    assert!(Comparison::GreaterThan.evaluate(&2, &1));
    assert!(!Comparison::GreaterThan.evaluate(&1, &1));
    assert_eq!(Comparison::GreaterThan.to_string(), ">");
  }
}
