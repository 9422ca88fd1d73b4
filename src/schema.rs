//! Named record schema and payload construction
//!
//! An input line is split on the schema delimiter and checked against the
//! declared field names when it is read, so a short or long line is reported
//! as malformed instead of being silently mapped onto the wrong keys.

use crate::error::{Error, Result};
use crate::types::{InputRecord, RecordBody, RecordIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Layout of one delimited input line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Field delimiter (default: tab)
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Field names, in line order
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            fields: Vec::new(),
        }
    }
}

impl RecordSchema {
    /// Create a schema from a delimiter and ordered field names
    pub fn new<I, S>(delimiter: char, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            delimiter,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Check that the schema declares at least one uniquely named field
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::config(
                "schema must declare at least one field",
                "schema.fields",
            ));
        }
        let mut seen = HashSet::with_capacity(self.fields.len());
        for name in &self.fields {
            if name.trim().is_empty() {
                return Err(Error::config(
                    "schema field names must not be empty",
                    "schema.fields",
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::config(
                    format!("duplicate schema field '{}'", name),
                    "schema.fields",
                ));
            }
        }
        if self.delimiter == '\n' || self.delimiter == '\r' {
            return Err(Error::config(
                "delimiter must not be a line terminator",
                "schema.delimiter",
            ));
        }
        Ok(())
    }

    /// Parse one line (already stripped of its terminator) into a record
    ///
    /// Whitespace-only lines become [`RecordBody::Blank`]; lines whose field
    /// count differs from the schema become [`RecordBody::Malformed`].
    pub fn parse_line(&self, index: RecordIndex, line: String) -> InputRecord {
        let body = if line.trim().is_empty() {
            RecordBody::Blank
        } else {
            let fields: Vec<String> = line.split(self.delimiter).map(str::to_string).collect();
            if fields.len() == self.fields.len() {
                RecordBody::Fields(fields)
            } else {
                RecordBody::Malformed(format!(
                    "expected {} fields, found {}",
                    self.fields.len(),
                    fields.len()
                ))
            }
        };
        InputRecord {
            index,
            raw: line,
            body,
        }
    }
}

fn default_delimiter() -> char {
    '\t'
}

/// Turns a validated record into the request body sent to the remote service
pub trait PayloadBuilder: Send + Sync {
    /// Build the request body for a record
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the record cannot be represented.
    fn build(&self, record: &InputRecord) -> Result<serde_json::Value>;
}

/// Builds a flat JSON object whose keys follow the schema order
#[derive(Clone, Debug)]
pub struct JsonPayloadBuilder {
    schema: RecordSchema,
}

impl JsonPayloadBuilder {
    /// Create a builder for the given schema
    pub fn new(schema: RecordSchema) -> Self {
        Self { schema }
    }
}

impl PayloadBuilder for JsonPayloadBuilder {
    fn build(&self, record: &InputRecord) -> Result<serde_json::Value> {
        let fields = record.fields().ok_or_else(|| Error::InvalidRecord {
            line: record.index.line_number(),
            reason: "record has no fields".to_string(),
        })?;
        if fields.len() != self.schema.fields.len() {
            return Err(Error::InvalidRecord {
                line: record.index.line_number(),
                reason: format!(
                    "expected {} fields, found {}",
                    self.schema.fields.len(),
                    fields.len()
                ),
            });
        }

        let object: serde_json::Map<String, serde_json::Value> = self
            .schema
            .fields
            .iter()
            .zip(fields)
            .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
            .collect();
        Ok(serde_json::Value::Object(object))
    }
}
