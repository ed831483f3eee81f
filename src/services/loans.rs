//! Loan management service
//!
//! Borrow and return run as single transactions against the store. The
//! book row lock serializes every stock change for that book, so concurrent
//! borrowers always see the stock left by the previous commit and stock
//! never drops below zero. The history write and the stock write commit
//! together or not at all.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::{
    error::{AppError, AppResult},
    models::{
        book::Book,
        borrow::{BorrowRecord, NewBorrow},
    },
    repository::{finish, Store, StoreTx},
    services::cache::{invalidate, Cache, LATEST_BOOKS_KEY},
};

#[derive(Clone)]
pub struct LoansService {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
}

impl LoansService {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Self {
        Self { store, cache }
    }

    /// Borrow one copy of a book
    pub async fn borrow(&self, book_id: i64, user_id: i64) -> AppResult<BorrowRecord> {
        let mut tx = self.store.begin().await?;
        let outcome = borrow_locked(tx.as_mut(), book_id, user_id, Utc::now()).await;
        let record = finish(tx, outcome)
            .await
            .inspect_err(|e| log_rejection("borrow", book_id, e))?;

        tracing::info!(
            history_id = record.id,
            book_id,
            user_id,
            "Book borrowed"
        );
        invalidate(self.cache.as_ref(), LATEST_BOOKS_KEY, "borrow").await;
        Ok(record)
    }

    /// Return a borrowed copy now
    pub async fn return_book(&self, history_id: i64, book_id: i64) -> AppResult<BorrowRecord> {
        self.return_at(history_id, book_id, Utc::now()).await
    }

    /// Close a loan with an explicit return time
    pub async fn return_at(
        &self,
        history_id: i64,
        book_id: i64,
        returned_at: DateTime<Utc>,
    ) -> AppResult<BorrowRecord> {
        let mut tx = self.store.begin().await?;
        let outcome = return_locked(tx.as_mut(), history_id, book_id, returned_at).await;
        let record = finish(tx, outcome)
            .await
            .inspect_err(|e| log_rejection("return", book_id, e))?;

        tracing::info!(
            history_id,
            book_id,
            user_id = record.user_id,
            "Book returned"
        );
        invalidate(self.cache.as_ref(), LATEST_BOOKS_KEY, "return").await;
        Ok(record)
    }

    /// Get a single borrow record
    pub async fn get_record(&self, history_id: i64) -> AppResult<BorrowRecord> {
        self.store.find_borrow(history_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("Borrow record with id {} not found", history_id))
        })
    }

    /// Loan history of a book, newest first. Deleted books keep their history.
    pub async fn history_for_book(&self, book_id: i64) -> AppResult<Vec<BorrowRecord>> {
        if self.store.find_book(book_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Book with id {} not found", book_id)));
        }
        self.store.borrows_for_book(book_id).await
    }
}

fn log_rejection(operation: &'static str, book_id: i64, error: &AppError) {
    if error.is_business_rule() {
        tracing::warn!(operation, book_id, error = %error, "Loan operation rejected");
    } else {
        tracing::error!(operation, book_id, error = %error, "Loan operation failed");
    }
}

async fn borrow_locked(
    tx: &mut dyn StoreTx,
    book_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> AppResult<BorrowRecord> {
    if !tx.active_user_exists(user_id).await? {
        return Err(AppError::NotFound(format!("User with id {} not found", user_id)));
    }

    // Stock is re-read under the lock; any earlier read is stale
    let book = tx
        .lock_book(book_id)
        .await?
        .filter(Book::is_active)
        .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", book_id)))?;

    if !book.has_available_copy() {
        return Err(AppError::InvalidStock(format!(
            "Book {} has no copies left",
            book_id
        )));
    }

    tx.adjust_stock(book_id, -1).await?;
    tx.insert_borrow(&NewBorrow {
        book_id,
        user_id,
        borrowed_at: now,
    })
    .await
}

async fn return_locked(
    tx: &mut dyn StoreTx,
    history_id: i64,
    book_id: i64,
    returned_at: DateTime<Utc>,
) -> AppResult<BorrowRecord> {
    let record = tx.get_borrow(history_id).await?.ok_or_else(|| {
        AppError::NotFound(format!("Borrow record with id {} not found", history_id))
    })?;
    record.check_return(book_id)?;

    // A concurrent return of the same record wins the row and leaves us nothing
    let returned = tx
        .mark_returned(history_id, returned_at)
        .await?
        .ok_or_else(|| {
            AppError::Conflict(format!(
                "Borrow record {} was already returned",
                history_id
            ))
        })?;

    // Soft-deleted books still take their copies back
    tx.lock_book(book_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", book_id)))?;
    tx.adjust_stock(book_id, 1).await?;

    Ok(returned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            book::CreateBook,
            borrow::BorrowStatus,
            user::{NewUser, Role},
        },
        repository::memory::MemoryStore,
        services::cache::MemoryCache,
    };
    use rust_decimal::Decimal;

    struct Fixture {
        store: MemoryStore,
        service: LoansService,
        user_id: i64,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let user = store
            .insert_user(&NewUser {
                name: "Reader".into(),
                username: "reader".into(),
                password_hash: "not-a-real-hash".into(),
                role: Role::User,
            })
            .await
            .unwrap();
        let service = LoansService::new(Arc::new(store.clone()), Arc::new(MemoryCache::new()));
        Fixture {
            store,
            service,
            user_id: user.id,
        }
    }

    async fn add_book(store: &MemoryStore, stock: i32) -> i64 {
        store
            .insert_book(&CreateBook {
                title: "Neuromancer".into(),
                author: "William Gibson".into(),
                price: Decimal::new(999, 2),
                stock,
            })
            .await
            .unwrap()
            .id
    }

    async fn stock_of(store: &MemoryStore, id: i64) -> i32 {
        store.find_book(id).await.unwrap().unwrap().stock
    }

    #[tokio::test]
    async fn test_borrow_decrements_stock_and_records_history() {
        let f = fixture().await;
        let book_id = add_book(&f.store, 2).await;

        let record = f.service.borrow(book_id, f.user_id).await.unwrap();
        assert_eq!(record.book_id, book_id);
        assert_eq!(record.user_id, f.user_id);
        assert_eq!(record.status(), BorrowStatus::Borrowed);
        assert_eq!(stock_of(&f.store, book_id).await, 1);
    }

    #[tokio::test]
    async fn test_borrow_without_stock_is_rejected() {
        let f = fixture().await;
        let book_id = add_book(&f.store, 1).await;

        f.service.borrow(book_id, f.user_id).await.unwrap();
        let second = f.service.borrow(book_id, f.user_id).await;

        assert!(matches!(second, Err(AppError::InvalidStock(_))));
        assert_eq!(stock_of(&f.store, book_id).await, 0);
        assert_eq!(f.service.history_for_book(book_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_borrow_missing_book_is_not_found() {
        let f = fixture().await;
        let result = f.service.borrow(404, f.user_id).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_borrow_by_unknown_user_is_not_found() {
        let f = fixture().await;
        let book_id = add_book(&f.store, 1).await;

        let result = f.service.borrow(book_id, f.user_id + 100).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(stock_of(&f.store, book_id).await, 1);
    }

    #[tokio::test]
    async fn test_return_restores_stock() {
        let f = fixture().await;
        let book_id = add_book(&f.store, 1).await;
        let record = f.service.borrow(book_id, f.user_id).await.unwrap();

        let returned = f.service.return_book(record.id, book_id).await.unwrap();
        assert_eq!(returned.status(), BorrowStatus::Returned);
        assert!(returned.returned_at().is_some());
        assert_eq!(stock_of(&f.store, book_id).await, 1);
    }

    #[tokio::test]
    async fn test_second_return_conflicts() {
        let f = fixture().await;
        let book_id = add_book(&f.store, 1).await;
        let record = f.service.borrow(book_id, f.user_id).await.unwrap();

        f.service.return_book(record.id, book_id).await.unwrap();
        let again = f.service.return_book(record.id, book_id).await;

        assert!(matches!(again, Err(AppError::Conflict(_))));
        assert_eq!(stock_of(&f.store, book_id).await, 1);
    }

    #[tokio::test]
    async fn test_return_with_wrong_book_conflicts() {
        let f = fixture().await;
        let borrowed = add_book(&f.store, 1).await;
        let other = add_book(&f.store, 3).await;
        let record = f.service.borrow(borrowed, f.user_id).await.unwrap();

        let result = f.service.return_book(record.id, other).await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(stock_of(&f.store, borrowed).await, 0);
        assert_eq!(stock_of(&f.store, other).await, 3);
        assert_eq!(
            f.service.get_record(record.id).await.unwrap().status(),
            BorrowStatus::Borrowed
        );
    }

    #[tokio::test]
    async fn test_return_unknown_record_is_not_found() {
        let f = fixture().await;
        let book_id = add_book(&f.store, 1).await;
        let result = f.service.return_book(77, book_id).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_history_of_missing_book_is_not_found() {
        let f = fixture().await;
        assert!(matches!(
            f.service.history_for_book(12).await,
            Err(AppError::NotFound(_))
        ));
    }
}
