//! Catalog management service
//!
//! Book creation, updates and deletion, plus the read-through cache in front
//! of the latest-books listing. Every mutation invalidates that cache entry
//! on a best-effort basis.

use chrono::Utc;
use std::sync::Arc;
use validator::Validate;

use crate::{
    config::CacheConfig,
    error::{AppError, AppResult},
    models::book::{Book, BookQuery, BookResponse, CreateBook, UpdateBook},
    repository::{finish, Store, StoreTx},
    services::cache::{invalidate, Cache, LATEST_BOOKS_KEY},
};

/// Newly catalogued or updated books must be lendable
fn ensure_lendable_stock(stock: i32) -> AppResult<()> {
    if stock < 1 {
        return Err(AppError::InvalidStock(format!(
            "Stock must be at least 1, got {}",
            stock
        )));
    }
    Ok(())
}

fn book_not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Book with id {} not found", id))
}

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    config: CacheConfig,
}

impl CatalogService {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>, config: CacheConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Create a new book
    pub async fn create_book(&self, book: CreateBook) -> AppResult<Book> {
        ensure_lendable_stock(book.stock)?;
        book.validate()?;

        let created = self.store.insert_book(&book).await?;
        tracing::info!(book_id = created.id, stock = created.stock, "Book created");

        invalidate(self.cache.as_ref(), LATEST_BOOKS_KEY, "create_book").await;
        Ok(created)
    }

    /// Get a non-deleted book, always from the store
    pub async fn get_book(&self, id: i64) -> AppResult<Book> {
        self.store
            .find_book(id)
            .await?
            .filter(Book::is_active)
            .ok_or_else(|| book_not_found(id))
    }

    /// Replace a book's title, author, price and stock
    pub async fn update_book(&self, id: i64, changes: UpdateBook) -> AppResult<Book> {
        // Cheap lock-free check first; the locked re-check below is authoritative
        self.get_book(id).await?;
        ensure_lendable_stock(changes.stock)?;
        changes.validate()?;

        let mut tx = self.store.begin().await?;
        let outcome = update_locked(tx.as_mut(), id, &changes).await;
        let updated = finish(tx, outcome).await?;
        tracing::info!(book_id = id, stock = updated.stock, "Book updated");

        invalidate(self.cache.as_ref(), LATEST_BOOKS_KEY, "update_book").await;
        Ok(updated)
    }

    /// Soft delete a book
    pub async fn delete_book(&self, id: i64) -> AppResult<()> {
        let mut tx = self.store.begin().await?;
        let outcome = delete_locked(tx.as_mut(), id).await;
        finish(tx, outcome).await?;
        tracing::info!(book_id = id, "Book deleted");

        invalidate(self.cache.as_ref(), LATEST_BOOKS_KEY, "delete_book").await;
        Ok(())
    }

    /// Page through the catalog
    pub async fn list_books(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        query.check()?;
        self.store.list_books(query).await
    }

    /// Latest books, served from cache when possible.
    ///
    /// May be stale by up to the configured TTL; never use it to decide
    /// whether a book can be borrowed.
    pub async fn list_latest_books(&self) -> AppResult<Vec<BookResponse>> {
        match self.cache.get(LATEST_BOOKS_KEY).await {
            Ok(Some(payload)) => match serde_json::from_str::<Vec<BookResponse>>(&payload) {
                Ok(books) => return Ok(books),
                Err(e) => tracing::warn!(error = %e, "Discarding unparsable latest books cache entry"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Unable to read latest books cache"),
        }

        let books: Vec<BookResponse> = self
            .store
            .latest_books(self.config.latest_books_limit)
            .await?
            .into_iter()
            .map(BookResponse::from)
            .collect();

        match serde_json::to_string(&books) {
            Ok(payload) => {
                if let Err(e) = self
                    .cache
                    .set_ex(LATEST_BOOKS_KEY, &payload, self.config.latest_books_ttl_seconds)
                    .await
                {
                    tracing::warn!(error = %e, "Unable to cache latest books");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Unable to serialize latest books"),
        }

        Ok(books)
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.store.ping().await
    }
}

async fn update_locked(tx: &mut dyn StoreTx, id: i64, changes: &UpdateBook) -> AppResult<Book> {
    // A concurrent delete between the check and the lock surfaces here
    tx.lock_book(id)
        .await?
        .filter(Book::is_active)
        .ok_or_else(|| book_not_found(id))?;
    tx.update_book(id, changes).await
}

async fn delete_locked(tx: &mut dyn StoreTx, id: i64) -> AppResult<()> {
    tx.lock_book(id)
        .await?
        .filter(Book::is_active)
        .ok_or_else(|| book_not_found(id))?;
    tx.soft_delete_book(id, Utc::now()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{repository::memory::MemoryStore, services::cache::MockCache};
    use rust_decimal::Decimal;

    fn create_request(title: &str, stock: i32) -> CreateBook {
        CreateBook {
            title: title.into(),
            author: "Ursula K. Le Guin".into(),
            price: Decimal::new(1250, 2),
            stock,
        }
    }

    fn update_request(stock: i32) -> UpdateBook {
        UpdateBook {
            title: "The Dispossessed".into(),
            author: "Ursula K. Le Guin".into(),
            price: Decimal::new(1400, 2),
            stock,
        }
    }

    fn service_with(cache: MockCache) -> CatalogService {
        CatalogService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(cache),
            CacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_create_rejects_zero_stock_without_touching_cache() {
        let mut cache = MockCache::new();
        cache.expect_delete().never();
        let service = service_with(cache);

        let result = service.create_book(create_request("Lathe of Heaven", 0)).await;
        assert!(matches!(result, Err(AppError::InvalidStock(_))));
    }

    #[tokio::test]
    async fn test_create_succeeds_when_invalidation_fails() {
        let mut cache = MockCache::new();
        cache
            .expect_delete()
            .times(1)
            .returning(|_| Err(AppError::Internal("connection refused".into())));
        let service = service_with(cache);

        let book = service
            .create_book(create_request("The Left Hand of Darkness", 2))
            .await
            .unwrap();
        assert_eq!(book.stock, 2);
    }

    #[tokio::test]
    async fn test_update_invalidates_cache() {
        let mut cache = MockCache::new();
        cache
            .expect_delete()
            .withf(|key| key.to_string() == LATEST_BOOKS_KEY)
            .times(2)
            .returning(|_| Ok(()));
        let service = service_with(cache);

        let book = service
            .create_book(create_request("The Dispossessed", 1))
            .await
            .unwrap();
        let updated = service.update_book(book.id, update_request(4)).await.unwrap();
        assert_eq!(updated.stock, 4);
        assert_eq!(updated.price, Decimal::new(1400, 2));
    }

    #[tokio::test]
    async fn test_update_missing_book_is_not_found() {
        let mut cache = MockCache::new();
        cache.expect_delete().never();
        let service = service_with(cache);

        let result = service.update_book(99, update_request(1)).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_rejects_zero_stock() {
        let mut cache = MockCache::new();
        cache.expect_delete().times(1).returning(|_| Ok(()));
        let service = service_with(cache);

        let book = service.create_book(create_request("Tehanu", 1)).await.unwrap();
        let result = service.update_book(book.id, update_request(0)).await;
        assert!(matches!(result, Err(AppError::InvalidStock(_))));
        assert_eq!(service.get_book(book.id).await.unwrap().stock, 1);
    }

    #[tokio::test]
    async fn test_deleted_book_is_hidden() {
        let mut cache = MockCache::new();
        cache.expect_delete().times(2).returning(|_| Ok(()));
        let service = service_with(cache);

        let book = service.create_book(create_request("Tales", 1)).await.unwrap();
        service.delete_book(book.id).await.unwrap();

        assert!(matches!(
            service.get_book(book.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.delete_book(book.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.update_book(book.id, update_request(1)).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_latest_books_served_from_cache_hit() {
        let cached = vec![BookResponse {
            id: 7,
            title: "Cached".into(),
            author: "Someone".into(),
            price: Decimal::ONE,
            stock: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }];
        let payload = serde_json::to_string(&cached).unwrap();

        let mut cache = MockCache::new();
        cache
            .expect_get()
            .times(1)
            .returning(move |_| Ok(Some(payload.clone())));
        cache.expect_set_ex().never();
        let service = service_with(cache);

        let books = service.list_latest_books().await.unwrap();
        assert_eq!(books, cached);
    }

    #[tokio::test]
    async fn test_latest_books_falls_back_on_unparsable_entry() {
        let mut cache = MockCache::new();
        cache
            .expect_get()
            .returning(|_| Ok(Some("not json".into())));
        cache
            .expect_set_ex()
            .withf(|key, _, ttl| key.to_string() == LATEST_BOOKS_KEY && *ttl == 3600)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let service = service_with(cache);

        assert!(service.list_latest_books().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_books_survive_cache_outage() {
        let mut cache = MockCache::new();
        cache
            .expect_get()
            .returning(|_| Err(AppError::Internal("timeout".into())));
        cache
            .expect_set_ex()
            .returning(|_, _, _| Err(AppError::Internal("timeout".into())));
        cache.expect_delete().returning(|_| Err(AppError::Internal("timeout".into())));
        let service = service_with(cache);

        service.create_book(create_request("First", 1)).await.unwrap();
        service.create_book(create_request("Second", 1)).await.unwrap();

        let books = service.list_latest_books().await.unwrap();
        assert_eq!(books.len(), 2);
        assert_eq!(books[0].title, "Second");
    }
}
