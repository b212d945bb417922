//! Error types for row decoding and validation.

use thiserror::Error;

/// Errors produced while turning a store row into a typed record.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    /// The row could not be decoded into the table's record type.
    #[error("invalid {table} row: {message}")]
    InvalidRow { table: &'static str, message: String },

    /// A keyed row has no name.
    #[error("{table} row has an empty name")]
    EmptyName { table: &'static str },

    /// A required field is missing or empty.
    #[error("{table} row is missing required field `{field}`")]
    MissingField {
        table: &'static str,
        field: &'static str,
    },

    /// An enumerated field holds a value outside its domain.
    #[error("invalid value {value:?} for `{field}`")]
    InvalidValue { field: &'static str, value: String },
}
