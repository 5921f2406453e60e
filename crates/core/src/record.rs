//! Record keys and selection units.

use serde::{Deserialize, Serialize};

/// Key of one business record.
///
/// Most selections yield integer ids; file-driven batches key their work by
/// path, so plain string keys are accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Id(i64),
    Name(String),
}

impl RecordKey {
    pub fn as_id(&self) -> Option<i64> {
        match self {
            RecordKey::Id(id) => Some(*id),
            RecordKey::Name(_) => None,
        }
    }
}

impl core::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RecordKey::Id(id) => write!(f, "{id}"),
            RecordKey::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        RecordKey::Id(value)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey::Name(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey::Name(value)
    }
}

/// One unit of a record selection.
///
/// A `Group` holds keys that must travel together in one job (for instance
/// every payment of one mandate); it is only split when it alone exceeds the
/// job size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordUnit {
    Single(RecordKey),
    Group(Vec<RecordKey>),
}

impl RecordUnit {
    pub fn len(&self) -> usize {
        match self {
            RecordUnit::Single(_) => 1,
            RecordUnit::Group(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Normalize the unit to a list of keys.
    pub fn into_keys(self) -> Vec<RecordKey> {
        match self {
            RecordUnit::Single(key) => vec![key],
            RecordUnit::Group(keys) => keys,
        }
    }
}

impl From<i64> for RecordUnit {
    fn from(value: i64) -> Self {
        RecordUnit::Single(RecordKey::Id(value))
    }
}

impl From<RecordKey> for RecordUnit {
    fn from(value: RecordKey) -> Self {
        RecordUnit::Single(value)
    }
}

impl From<Vec<RecordKey>> for RecordUnit {
    fn from(value: Vec<RecordKey>) -> Self {
        RecordUnit::Group(value)
    }
}

impl From<Vec<i64>> for RecordUnit {
    fn from(value: Vec<i64>) -> Self {
        RecordUnit::Group(value.into_iter().map(RecordKey::Id).collect())
    }
}

/// Origin reference of a record of `model` (`"<model>,<key>"`).
pub fn origin(model: &str, key: &RecordKey) -> String {
    format!("{model},{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_serialize_untagged() {
        let keys = vec![RecordKey::Id(3), RecordKey::from("/in/flux.zip")];
        let json = serde_json::to_string(&keys).unwrap();
        assert_eq!(json, r#"[3,"/in/flux.zip"]"#);
        let back: Vec<RecordKey> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, keys);
    }

    #[test]
    fn units_deserialize_scalars_and_groups() {
        let units: Vec<RecordUnit> = serde_json::from_str("[1,[2,3],\"a\"]").unwrap();
        assert_eq!(units[0], RecordUnit::from(1));
        assert_eq!(units[1], RecordUnit::from(vec![2_i64, 3]));
        assert_eq!(units[2].len(), 1);
    }

    #[test]
    fn origin_joins_model_and_key() {
        assert_eq!(origin("contract", &RecordKey::Id(7)), "contract,7");
    }
}
