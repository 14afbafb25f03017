//! Typed configuration tree and recursive merge.
//!
//! Any serializable config converts into a [`ConfigValue`]. Two trees merge key
//! by key; where both sides hold a non-object value the [`Resolve`] strategy
//! picks the winner. The strategy is a type parameter, so each call site states
//! at compile time whether the overlay overrides or fills in.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Number, Value};

use crate::SchemaError;

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Scalar(Scalar),
    List(Vec<ConfigValue>),
    Object(BTreeMap<String, ConfigValue>),
}

/// Chooses between two conflicting non-object values.
pub trait Resolve {
    fn resolve(base: ConfigValue, overlay: ConfigValue) -> ConfigValue;
}

/// The overlay wins conflicts.
#[derive(Debug, Clone, Copy)]
pub struct Override;

/// The base wins conflicts; the overlay only fills gaps.
#[derive(Debug, Clone, Copy)]
pub struct Preserve;

impl Resolve for Override {
    fn resolve(_base: ConfigValue, overlay: ConfigValue) -> ConfigValue { overlay }
}

impl Resolve for Preserve {
    fn resolve(base: ConfigValue, _overlay: ConfigValue) -> ConfigValue { base }
}

impl ConfigValue {
    pub fn null() -> Self { ConfigValue::Scalar(Scalar::Null) }

    pub fn is_null(&self) -> bool { matches!(self, ConfigValue::Scalar(Scalar::Null)) }

    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, SchemaError> {
        serde_json::to_value(value).map(Self::from).map_err(|e| SchemaError::Encode(e.to_string()))
    }

    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, SchemaError> {
        serde_json::from_value(Value::from(self)).map_err(|e| SchemaError::Invalid(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Merge `overlay` into `self`. Objects merge per key; a null on either side
    /// yields the other side; lists and scalars are resolved by `R` as a whole.
    pub fn merge<R: Resolve>(self, overlay: ConfigValue) -> ConfigValue { Merger::<R>::merge(self, overlay) }
}

struct Merger<R>(PhantomData<R>);

impl<R: Resolve> Merger<R> {
    fn merge(base: ConfigValue, overlay: ConfigValue) -> ConfigValue {
        match (base, overlay) {
            (b, o) if o.is_null() => b,
            (b, o) if b.is_null() => o,
            (ConfigValue::Object(mut b), ConfigValue::Object(o)) => {
                for (k, ov) in o {
                    let merged = match b.remove(&k) {
                        Some(bv) => Self::merge(bv, ov),
                        None => ov,
                    };
                    b.insert(k, merged);
                }
                ConfigValue::Object(b)
            }
            (b, o) => R::resolve(b, o),
        }
    }
}

impl From<Value> for ConfigValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => ConfigValue::Scalar(Scalar::Null),
            Value::Bool(b) => ConfigValue::Scalar(Scalar::Bool(b)),
            Value::Number(n) => ConfigValue::Scalar(Scalar::Number(n)),
            Value::String(s) => ConfigValue::Scalar(Scalar::String(s)),
            Value::Array(items) => ConfigValue::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => ConfigValue::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<ConfigValue> for Value {
    fn from(v: ConfigValue) -> Self {
        match v {
            ConfigValue::Scalar(Scalar::Null) => Value::Null,
            ConfigValue::Scalar(Scalar::Bool(b)) => Value::Bool(b),
            ConfigValue::Scalar(Scalar::Number(n)) => Value::Number(n),
            ConfigValue::Scalar(Scalar::String(s)) => Value::String(s),
            ConfigValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            ConfigValue::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}
