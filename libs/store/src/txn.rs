//! Write transactions.

use serde_json::{Map, Value};

use crate::RowId;

/// A single write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOp {
    /// Create a new row with the given columns.
    Insert {
        table: String,
        fields: Map<String, Value>,
    },
    /// Set columns on an existing row; other columns are left untouched.
    Update {
        table: String,
        id: RowId,
        fields: Map<String, Value>,
    },
}

impl TxnOp {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } => table,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        match self {
            Self::Insert { fields, .. } | Self::Update { fields, .. } => fields,
        }
    }
}

/// An ordered batch of writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<TxnOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row.
    pub fn insert(&mut self, table: impl Into<String>, fields: Map<String, Value>) -> &mut Self {
        self.ops.push(TxnOp::Insert {
            table: table.into(),
            fields,
        });
        self
    }

    /// Set fields on an existing row.
    pub fn update(
        &mut self,
        table: impl Into<String>,
        id: RowId,
        fields: Map<String, Value>,
    ) -> &mut Self {
        self.ops.push(TxnOp::Update {
            table: table.into(),
            id,
            fields,
        });
        self
    }

    /// Update `existing` if given, otherwise insert a new row.
    pub fn upsert(
        &mut self,
        table: impl Into<String>,
        existing: Option<RowId>,
        fields: Map<String, Value>,
    ) -> &mut Self {
        match existing {
            Some(id) => self.update(table, id, fields),
            None => self.insert(table, fields),
        }
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    /// True when the transaction writes nothing.
    pub fn is_empty(&self) -> bool {
        self.ops.iter().all(|op| match op {
            TxnOp::Insert { .. } => false,
            TxnOp::Update { fields, .. } => fields.is_empty(),
        })
    }
}

/// Outcome of committing a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    /// The writes were applied.
    Success,
    /// Nothing needed to be written.
    Unchanged,
    /// The store's view moved underneath us (e.g. the row disappeared).
    TryAgain,
    /// The store rejected the transaction.
    Error(String),
}

impl CommitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Unchanged)
    }
}

impl std::fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::TryAgain => f.write_str("try again"),
            Self::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}
