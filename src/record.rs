//! Generic mirrored row: key, last-modified value and a JSON payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{Cacheable, Timestamp};

/// One row mirrored from a table-shaped remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<Ts> {
  pub key: String,
  pub updated: Ts,
  #[serde(default)]
  pub data: Value,
}

impl<Ts> Record<Ts> {
  pub fn new(key: impl Into<String>, updated: Ts, data: Value) -> Self {
    Self {
      key: key.into(),
      updated,
      data,
    }
  }
}

impl<Ts: Timestamp> Cacheable for Record<Ts> {
  type Timestamp = Ts;

  fn cache_key(&self) -> String {
    self.key.clone()
  }

  fn last_modified(&self) -> Ts {
    self.updated.clone()
  }

  fn timestamp_field() -> &'static str {
    "updated"
  }
}
