use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("property {name} = {value:?} is not a valid {kind}")]
pub struct PropertyError {
    pub name: String,
    pub value: String,
    pub kind: &'static str,
}

/// A scalar as written in the configuration file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PropertyValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl From<PropertyValue> for String {
    fn from(value: PropertyValue) -> String {
        match value {
            PropertyValue::Text(s) => s,
            PropertyValue::Integer(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Bool(b) => b.to_string(),
        }
    }
}

/// Name/value configuration handed to a servlet's `init()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, PropertyValue>")]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl From<BTreeMap<String, PropertyValue>> for Properties {
    fn from(map: BTreeMap<String, PropertyValue>) -> Properties {
        Properties {
            values: map.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Properties
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Properties {
        Properties {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Properties {
    pub fn new() -> Properties {
        Properties::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Parse a property; absent properties are `Ok(None)`.
    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Result<Option<T>, PropertyError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| PropertyError {
                name: name.to_string(),
                value: value.to_string(),
                kind: std::any::type_name::<T>(),
            }),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<Option<i64>, PropertyError> {
        self.get_parsed(name)
    }

    /// Property names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
