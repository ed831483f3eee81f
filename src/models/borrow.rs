//! Borrow record (loan history) model and its state machine
//!
//! A record is created in the `Borrowed` state together with a stock
//! decrement and moves to `Returned` exactly once, together with a stock
//! increment. A returned record is immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

/// Persisted status discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BorrowStatus {
    Borrowed,
    Returned,
}

impl BorrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BorrowStatus::Borrowed => "borrowed",
            BorrowStatus::Returned => "returned",
        }
    }
}

impl FromStr for BorrowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "borrowed" => Ok(BorrowStatus::Borrowed),
            "returned" => Ok(BorrowStatus::Returned),
            _ => Err(format!("Invalid borrow status: {}", s)),
        }
    }
}

/// Where a loan sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanState {
    Borrowed,
    Returned { at: DateTime<Utc> },
}

/// One loan episode, from borrow to return
#[derive(Debug, Clone, PartialEq)]
pub struct BorrowRecord {
    pub id: i64,
    pub book_id: i64,
    pub user_id: i64,
    pub borrowed_at: DateTime<Utc>,
    pub state: LoanState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BorrowRecord {
    pub fn status(&self) -> BorrowStatus {
        match self.state {
            LoanState::Borrowed => BorrowStatus::Borrowed,
            LoanState::Returned { .. } => BorrowStatus::Returned,
        }
    }

    pub fn returned_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            LoanState::Borrowed => None,
            LoanState::Returned { at } => Some(at),
        }
    }

    /// Check that a return of `book_id` may be applied to this record.
    ///
    /// Fails with `Conflict` when the record is already returned or belongs
    /// to another book.
    pub fn check_return(&self, book_id: i64) -> AppResult<()> {
        if let LoanState::Returned { at } = self.state {
            return Err(AppError::Conflict(format!(
                "Borrow record {} was already returned at {}",
                self.id, at
            )));
        }
        if self.book_id != book_id {
            return Err(AppError::Conflict(format!(
                "Borrow record {} is for book {}, not book {}",
                self.id, self.book_id, book_id
            )));
        }
        Ok(())
    }

    /// The only legal transition: `Borrowed -> Returned`
    pub fn into_returned(self, at: DateTime<Utc>) -> AppResult<Self> {
        match self.state {
            LoanState::Borrowed => Ok(Self {
                state: LoanState::Returned { at },
                updated_at: at,
                ..self
            }),
            LoanState::Returned { .. } => Err(AppError::Conflict(format!(
                "Borrow record {} was already returned",
                self.id
            ))),
        }
    }
}

/// Row as stored in `borrow_histories`
#[derive(Debug, Clone, FromRow)]
pub struct BorrowRow {
    pub id: i64,
    pub book_id: i64,
    pub user_id: i64,
    pub borrowed_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BorrowRow> for BorrowRecord {
    type Error = AppError;

    fn try_from(row: BorrowRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<BorrowStatus>().map_err(AppError::Internal)?;
        let state = match (status, row.returned_at) {
            (BorrowStatus::Borrowed, None) => LoanState::Borrowed,
            (BorrowStatus::Returned, Some(at)) => LoanState::Returned { at },
            _ => {
                return Err(AppError::Internal(format!(
                    "Borrow record {} has status {} inconsistent with its return date",
                    row.id, row.status
                )))
            }
        };

        Ok(Self {
            id: row.id,
            book_id: row.book_id,
            user_id: row.user_id,
            borrowed_at: row.borrowed_at,
            state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Insert payload for a new loan
#[derive(Debug, Clone)]
pub struct NewBorrow {
    pub book_id: i64,
    pub user_id: i64,
    pub borrowed_at: DateTime<Utc>,
}

/// Borrow record as exposed by the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BorrowRecordResponse {
    pub id: i64,
    pub book_id: i64,
    pub user_id: i64,
    pub status: BorrowStatus,
    pub borrowed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
}

impl From<BorrowRecord> for BorrowRecordResponse {
    fn from(record: BorrowRecord) -> Self {
        Self {
            id: record.id,
            book_id: record.book_id,
            user_id: record.user_id,
            status: record.status(),
            borrowed_at: record.borrowed_at,
            returned_at: record.returned_at(),
        }
    }
}

/// Return request body
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ReturnBookRequest {
    /// Borrow record being closed
    pub history_id: i64,
}
