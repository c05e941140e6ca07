//! Document lifecycle vocabulary.
//!
//! A document moves `draft → authorized | rejected`, and `authorized →
//! cancelled`. `rejected` is not terminal: the payload may be edited,
//! which returns the document to `draft` for resubmission.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// Kind of fiscal transport document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Cte,
    Mdfe,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Cte => "cte",
            DocKind::Mdfe => "mdfe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cte" => Some(DocKind::Cte),
            "mdfe" => Some(DocKind::Mdfe),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for DocKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for DocKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown document kind '{}'", s).into()))
    }
}

/// Lifecycle status of a document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Authorized,
    Rejected,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Authorized => "authorized",
            DocumentStatus::Rejected => "rejected",
            DocumentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(DocumentStatus::Draft),
            "authorized" => Some(DocumentStatus::Authorized),
            "rejected" => Some(DocumentStatus::Rejected),
            "cancelled" => Some(DocumentStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether an emission may be requested from this status.
    pub fn can_submit(&self) -> bool {
        matches!(self, DocumentStatus::Draft | DocumentStatus::Rejected)
    }

    /// Whether a cancellation may be requested from this status.
    pub fn can_cancel(&self) -> bool {
        matches!(self, DocumentStatus::Authorized)
    }

    /// Whether the business payload may still be edited.
    pub fn is_editable(&self) -> bool {
        matches!(self, DocumentStatus::Draft | DocumentStatus::Rejected)
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for DocumentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for DocumentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown document status '{}'", s).into()))
    }
}
