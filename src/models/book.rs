//! Book model and related types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use validator::{Validate, ValidationError};

use crate::error::{AppError, AppResult};

/// Soft-delete state of a persisted row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Deleted { at: DateTime<Utc> },
}

impl Lifecycle {
    pub fn from_deleted_at(deleted_at: Option<DateTime<Utc>>) -> Self {
        match deleted_at {
            Some(at) => Lifecycle::Deleted { at },
            None => Lifecycle::Active,
        }
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifecycle::Active => None,
            Lifecycle::Deleted { at } => Some(*at),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }
}

/// Catalogued book
#[derive(Debug, Clone, PartialEq)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub price: Decimal,
    /// Lendable copies; never negative
    pub stock: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lifecycle: Lifecycle,
}

impl Book {
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    pub fn has_available_copy(&self) -> bool {
        self.stock >= 1
    }
}

/// Book row as stored in the `books` table
#[derive(Debug, Clone, FromRow)]
pub struct BookRow {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub price: Decimal,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<BookRow> for Book {
    fn from(row: BookRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            author: row.author,
            price: row.price,
            stock: row.stock,
            created_at: row.created_at,
            updated_at: row.updated_at,
            lifecycle: Lifecycle::from_deleted_at(row.deleted_at),
        }
    }
}

/// Book as exposed by the API and held in the latest-books cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BookResponse {
    pub id: i64,
    pub title: String,
    pub author: String,
    #[schema(value_type = String)]
    pub price: Decimal,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Book> for BookResponse {
    fn from(book: Book) -> Self {
        Self {
            id: book.id,
            title: book.title,
            author: book.author,
            price: book.price,
            stock: book.stock,
            created_at: book.created_at,
            updated_at: book.updated_at,
        }
    }
}

fn non_negative_price(price: &Decimal) -> Result<(), ValidationError> {
    if *price < Decimal::ZERO {
        return Err(ValidationError::new("negative_price"));
    }
    Ok(())
}

/// Create book request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateBook {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Author is required"))]
    pub author: String,
    #[validate(custom(function = "non_negative_price"))]
    #[schema(value_type = String)]
    pub price: Decimal,
    /// Must be at least 1
    #[validate(range(max = MAX_STOCK, message = "Stock is above the allowed maximum"))]
    pub stock: i32,
}

/// Full replacement of a book's mutable fields
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateBook {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Author is required"))]
    pub author: String,
    #[validate(custom(function = "non_negative_price"))]
    #[schema(value_type = String)]
    pub price: Decimal,
    /// Must be at least 1
    #[validate(range(max = MAX_STOCK, message = "Stock is above the allowed maximum"))]
    pub stock: i32,
}

/// Book listing query
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BookQuery {
    /// Page number, starting at 1
    pub page: Option<i64>,
    /// Page size (1..=100)
    pub size: Option<i64>,
    /// Case-insensitive title search
    pub search: Option<String>,
}

pub const DEFAULT_PAGE_SIZE: i64 = 20;
/// Upper bound for stock set through the catalog; leaves headroom for returns
pub const MAX_STOCK: i32 = 1_000_000;
pub const MAX_PAGE_SIZE: i64 = 100;

impl BookQuery {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1)
    }

    pub fn size(&self) -> i64 {
        self.size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        self.page().saturating_sub(1).saturating_mul(self.size())
    }

    /// Trimmed search term, `None` when blank
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn check(&self) -> AppResult<()> {
        if self.page() < 1 {
            return Err(AppError::Validation("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.size()) {
            return Err(AppError::Validation(format!(
                "size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if (self.page() - 1).checked_mul(self.size()).is_none() {
            return Err(AppError::Validation("page is out of range".to_string()));
        }
        Ok(())
    }
}
