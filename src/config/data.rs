//! A read-only, path-tracking view over a parsed TOML document.
//!
//! Every accessor below either returns a value of the requested type or fails
//! with an error naming the fully dotted key path, the document source, and
//! the expected vs actual type. Nested views extend the path so any error
//! raised deep in resolution can be traced to an exact location in the
//! source document.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use toml::value::{Table, Value};

/// One table of the configuration document, with provenance.
#[derive(Debug, Clone)]
pub struct Data {
    source: String,
    path: String,
    table: Table,
}

impl Data {
    /// A view over the document's root table.
    pub fn new(source: impl Into<String>, table: Table) -> Data {
        Data {
            source: source.into(),
            path: String::new(),
            table,
        }
    }

    fn child(&self, path: String, table: Table) -> Data {
        Data {
            source: self.source.clone(),
            path,
            table,
        }
    }

    fn child_path(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.path)
        }
    }

    /// The dotted location of `key` for use in error messages.
    pub fn describe(&self, key: &str) -> String {
        if self.path.is_empty() {
            format!("`[{key}]`")
        } else {
            format!("`[{}] {key}`", self.path)
        }
    }

    /// The document this view was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The keys of this table, in document order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    fn missing(&self, key: &str, expected: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "Expected {} of type {expected} to be defined in {}.",
            self.describe(key),
            self.source
        )
    }

    fn mismatch(&self, key: &str, expected: &str, actual: &Value) -> anyhow::Error {
        anyhow::anyhow!(
            "Expected a {expected} for {} but found {actual} of type {} in {}.",
            self.describe(key),
            actual.type_str(),
            self.source
        )
    }

    fn str_value(&self, key: &str, value: &Value) -> Result<String> {
        match value.as_str() {
            Some(s) => Ok(s.to_string()),
            None => Err(self.mismatch(key, "string", value)),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<String> {
        match self.table.get(key) {
            None => Err(self.missing(key, "string")),
            Some(value) => self.str_value(key, value),
        }
    }

    pub fn get_str_or(&self, key: &str, default: &str) -> Result<String> {
        match self.table.get(key) {
            None => Ok(default.to_string()),
            Some(value) => self.str_value(key, value),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        match self.table.get(key) {
            None => Err(self.missing(key, "integer")),
            Some(value) => value
                .as_integer()
                .ok_or_else(|| self.mismatch(key, "integer", value)),
        }
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.table.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_integer()
                .ok_or_else(|| self.mismatch(key, "integer", value)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.table.get(key) {
            None => Err(self.missing(key, "boolean")),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| self.mismatch(key, "boolean", value)),
        }
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.table.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| self.mismatch(key, "boolean", value)),
        }
    }

    /// A required list of strings; every element is validated and all
    /// offending elements are reported, not just the first.
    pub fn get_str_list(&self, key: &str) -> Result<Vec<String>> {
        match self.table.get(key) {
            None => Err(self.missing(key, "array of strings")),
            Some(value) => self.str_list_value(key, value),
        }
    }

    pub fn get_str_list_or(&self, key: &str, default: &[&str]) -> Result<Vec<String>> {
        match self.table.get(key) {
            None => Ok(default.iter().map(|s| s.to_string()).collect()),
            Some(value) => self.str_list_value(key, value),
        }
    }

    fn str_list_value(&self, key: &str, value: &Value) -> Result<Vec<String>> {
        let Some(items) = value.as_array() else {
            return Err(self.mismatch(key, "array", value));
        };
        let mut out = Vec::with_capacity(items.len());
        let mut invalid = Vec::new();
        for (index, item) in items.iter().enumerate() {
            match item.as_str() {
                Some(s) => out.push(s.to_string()),
                None => invalid.push(format!(
                    "item {}: {item} of type {}",
                    index + 1,
                    item.type_str()
                )),
            }
        }
        if !invalid.is_empty() {
            bail!(
                "Expected {} defined in {} to be a list with items of type string but got {} \
                 out of {} entries of the wrong type:\n{}",
                self.describe(key),
                self.source,
                invalid.len(),
                items.len(),
                invalid.join("\n")
            );
        }
        Ok(out)
    }

    /// A required nested table as a child view.
    pub fn get_data(&self, key: &str) -> Result<Data> {
        match self.get_data_opt(key)? {
            Some(data) => Ok(data),
            None => Err(self.missing(key, "table")),
        }
    }

    /// An optional nested table as a child view.
    pub fn get_data_opt(&self, key: &str) -> Result<Option<Data>> {
        match self.table.get(key) {
            None => Ok(None),
            Some(value) => match value.as_table() {
                Some(table) => Ok(Some(self.child(self.child_path(key), table.clone()))),
                None => Err(self.mismatch(key, "table", value)),
            },
        }
    }

    /// A required list of tables; child paths carry a 1-based index.
    pub fn get_data_list(&self, key: &str) -> Result<Vec<Data>> {
        match self.table.get(key) {
            None => Err(self.missing(key, "array of tables")),
            Some(value) => self.data_list_value(key, value),
        }
    }

    /// Like [`Data::get_data_list`] but an absent key yields an empty list.
    pub fn get_data_list_or_empty(&self, key: &str) -> Result<Vec<Data>> {
        match self.table.get(key) {
            None => Ok(Vec::new()),
            Some(value) => self.data_list_value(key, value),
        }
    }

    fn data_list_value(&self, key: &str, value: &Value) -> Result<Vec<Data>> {
        let Some(items) = value.as_array() else {
            return Err(self.mismatch(key, "array", value));
        };
        let mut invalid = Vec::new();
        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match item.as_table() {
                Some(table) => out.push(self.child(
                    format!("{}[{}]", self.child_path(key), index + 1),
                    table.clone(),
                )),
                None => invalid.push(format!(
                    "item {}: {item} of type {}",
                    index + 1,
                    item.type_str()
                )),
            }
        }
        if !invalid.is_empty() {
            bail!(
                "Expected {} defined in {} to be a list with items of type table but got {} \
                 out of {} entries of the wrong type:\n{}",
                self.describe(key),
                self.source,
                invalid.len(),
                items.len(),
                invalid.join("\n")
            );
        }
        Ok(out)
    }

    /// Every entry of this table as a string-to-string map, reporting all
    /// non-string values.
    pub fn string_map(&self) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let mut invalid = Vec::new();
        for (key, value) in &self.table {
            match value.as_str() {
                Some(s) => {
                    out.insert(key.clone(), s.to_string());
                }
                None => invalid.push(format!("{key}: {value} of type {}", value.type_str())),
            }
        }
        if !invalid.is_empty() {
            bail!(
                "Expected `[{}]` defined in {} to map names to string values but got {} \
                 entries of the wrong type:\n{}",
                self.path,
                self.source,
                invalid.len(),
                invalid.join("\n")
            );
        }
        Ok(out)
    }

    /// The same table with the named keys removed; used to forward
    /// provider-specific configuration verbatim.
    pub fn remaining(&self, excluded_keys: &[&str]) -> Data {
        let mut table = self.table.clone();
        for key in excluded_keys {
            table.remove(*key);
        }
        self.child(self.path.clone(), table)
    }
}
