//! Shared data route
//!
//! A process-wide JSON key/value store any authenticated peer can use to
//! share small pieces of state with the rest of the cluster.

use crate::error::BeaconError;
use crate::rpc::routes::{arg, DATA};
use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct SharedData {
    entries: DashMap<String, Value>,
}

impl SharedData {
    /// Apply `[op, ...]`:
    /// `get key [default]`, `set key value`, `pop key [default]`,
    /// `contains key`, `keys`, `len`, `clear`
    pub fn apply(&self, args: &[Value]) -> Result<Value, BeaconError> {
        let op: String = arg(DATA, args, 0)?;

        match op.as_str() {
            "get" => {
                let key: String = arg(DATA, args, 1)?;
                Ok(self
                    .entries
                    .get(&key)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_else(|| default_at(args, 2)))
            }
            "set" => {
                let key: String = arg(DATA, args, 1)?;
                let value: Value = arg(DATA, args, 2)?;
                self.entries.insert(key, value);
                Ok(Value::Null)
            }
            "pop" => {
                let key: String = arg(DATA, args, 1)?;
                Ok(self
                    .entries
                    .remove(&key)
                    .map(|(_, value)| value)
                    .unwrap_or_else(|| default_at(args, 2)))
            }
            "contains" => {
                let key: String = arg(DATA, args, 1)?;
                Ok(Value::Bool(self.entries.contains_key(&key)))
            }
            "keys" => {
                let mut keys: Vec<String> =
                    self.entries.iter().map(|entry| entry.key().clone()).collect();
                keys.sort();
                Ok(Value::from(keys))
            }
            "len" => Ok(Value::from(self.entries.len())),
            "clear" => {
                self.entries.clear();
                Ok(Value::Null)
            }
            other => Err(BeaconError::bad_arguments(
                DATA,
                format!("unknown data operation '{other}'"),
            )),
        }
    }
}

fn default_at(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_pop() {
        let data = SharedData::default();
        assert_eq!(data.apply(&[json!("get"), json!("k")]).unwrap(), Value::Null);
        assert_eq!(
            data.apply(&[json!("get"), json!("k"), json!(7)]).unwrap(),
            json!(7)
        );

        data.apply(&[json!("set"), json!("k"), json!({"a": 1})]).unwrap();
        assert_eq!(data.apply(&[json!("get"), json!("k")]).unwrap(), json!({"a": 1}));
        assert_eq!(data.apply(&[json!("contains"), json!("k")]).unwrap(), json!(true));

        assert_eq!(data.apply(&[json!("pop"), json!("k")]).unwrap(), json!({"a": 1}));
        assert_eq!(data.apply(&[json!("contains"), json!("k")]).unwrap(), json!(false));
    }

    #[test]
    fn test_keys_len_clear() {
        let data = SharedData::default();
        data.apply(&[json!("set"), json!("b"), json!(2)]).unwrap();
        data.apply(&[json!("set"), json!("a"), json!(1)]).unwrap();

        assert_eq!(data.apply(&[json!("keys")]).unwrap(), json!(["a", "b"]));
        assert_eq!(data.apply(&[json!("len")]).unwrap(), json!(2));

        data.apply(&[json!("clear")]).unwrap();
        assert_eq!(data.apply(&[json!("len")]).unwrap(), json!(0));
    }

    #[test]
    fn test_unknown_op_and_missing_args() {
        let data = SharedData::default();
        let err = data.apply(&[json!("explode")]).unwrap_err();
        assert_eq!(err.error_type_label(), "bad_arguments");

        let err = data.apply(&[json!("set"), json!("k")]).unwrap_err();
        assert_eq!(err.error_type_label(), "bad_arguments");

        let err = data.apply(&[]).unwrap_err();
        assert_eq!(err.error_type_label(), "bad_arguments");
    }
}
