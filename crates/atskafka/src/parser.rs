// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of tab-delimited `key:value` log lines into JSON documents.
//!
//! A line such as `hostname:cp3050.esams.wmnet\ttime_firstbyte:9` becomes
//! `{"hostname":"cp3050.esams.wmnet","time_firstbyte":9}`. Keys listed in the
//! [`NumericFieldSet`] are emitted as JSON numbers, everything else as strings.
//! A single malformed token rejects the whole line.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::errors::ParseError;

const FIELD_SEPARATOR: char = '\t';
const KEY_VALUE_SEPARATOR: char = ':';
const QUERY_SEPARATOR: char = '?';

pub const DEFAULT_URI_PATH_FIELD: &str = "uri_path";
pub const DEFAULT_URI_QUERY_FIELD: &str = "uri_query";

/// Field names whose values are parsed as base-10 integers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NumericFieldSet {
    fields: HashSet<String>,
}

impl NumericFieldSet {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds the set from a comma-separated list, ignoring blanks.
    ///
    /// ```
    /// use atskafka::parser::NumericFieldSet;
    ///
    /// let fields = NumericFieldSet::from_list("response_size, time_firstbyte,,");
    /// assert!(fields.contains("response_size"));
    /// assert!(fields.contains("time_firstbyte"));
    /// assert_eq!(fields.len(), 2);
    /// ```
    pub fn from_list(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|field| !field.is_empty()),
        )
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A single field value of a parsed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
}

/// Field name to value mapping. Keys serialize in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ParsedRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl ParsedRecord {
    /// Inserts a field, replacing any previous value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Serializes the record as a compact JSON object.
    pub fn to_json(&self) -> Result<Vec<u8>, ParseError> {
        serde_json::to_vec(self).map_err(|e| ParseError::Serialize(e.to_string()))
    }
}

/// Splits a URL field on its first `?` into a path field and a query field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriSplit {
    pub path_field: String,
    pub query_field: String,
}

impl Default for UriSplit {
    fn default() -> Self {
        Self {
            path_field: DEFAULT_URI_PATH_FIELD.to_string(),
            query_field: DEFAULT_URI_QUERY_FIELD.to_string(),
        }
    }
}

impl UriSplit {
    // The query field is always present once the path field is, empty when there is no `?`.
    fn apply(&self, record: &mut ParsedRecord) {
        let Some(FieldValue::Text(url)) = record.get(&self.path_field) else {
            return;
        };
        let (path, query) = match url.split_once(QUERY_SEPARATOR) {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (url.clone(), String::new()),
        };
        record.insert(self.path_field.clone(), FieldValue::Text(path));
        record.insert(self.query_field.clone(), FieldValue::Text(query));
    }
}

/// Stateless line parser shared read-only by all workers.
#[derive(Debug, Clone, Default)]
pub struct LineParser {
    numeric_fields: NumericFieldSet,
    uri_split: Option<UriSplit>,
}

impl LineParser {
    pub fn new(numeric_fields: NumericFieldSet, uri_split: Option<UriSplit>) -> Self {
        Self {
            numeric_fields,
            uri_split,
        }
    }

    /// Parses a raw line into a record. Fails atomically on the first bad token.
    pub fn parse(&self, line: &str) -> Result<ParsedRecord, ParseError> {
        let mut record = ParsedRecord::default();

        for token in line.split(FIELD_SEPARATOR) {
            let (key, value) = token
                .split_once(KEY_VALUE_SEPARATOR)
                .ok_or_else(|| ParseError::MissingSeparator(token.to_string()))?;

            let value = if self.numeric_fields.contains(key) {
                let number = value
                    .parse::<i64>()
                    .map_err(|_| ParseError::InvalidNumber {
                        field: key.to_string(),
                        value: value.to_string(),
                    })?;
                FieldValue::Integer(number)
            } else {
                FieldValue::Text(value.to_string())
            };

            record.insert(key, value);
        }

        if let Some(uri_split) = &self.uri_split {
            uri_split.apply(&mut record);
        }

        Ok(record)
    }

    /// Parses a raw line straight into its JSON document.
    pub fn to_json(&self, line: &str) -> Result<Vec<u8>, ParseError> {
        self.parse(line)?.to_json()
    }
}
