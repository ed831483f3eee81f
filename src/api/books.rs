//! Catalog endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::{
    error::AppResult,
    models::book::{BookQuery, BookResponse, CreateBook, UpdateBook},
    AppState,
};

use super::AuthenticatedUser;

/// List books with pagination and title search
#[utoipa::path(
    get,
    path = "/books",
    tag = "books",
    security(("bearer_auth" = [])),
    params(BookQuery),
    responses(
        (status = 200, description = "Page of books", body = Vec<BookResponse>),
        (status = 400, description = "Invalid paging parameters", body = crate::error::ErrorResponse),
        (status = 401, description = "Not authenticated", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_books(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Query(query): Query<BookQuery>,
) -> AppResult<Json<Vec<BookResponse>>> {
    let books = state.services.catalog.list_books(&query).await?;
    Ok(Json(books.into_iter().map(BookResponse::from).collect()))
}

/// Most recently catalogued books (cached, may be slightly stale)
#[utoipa::path(
    get,
    path = "/books/latest",
    tag = "books",
    responses(
        (status = 200, description = "Latest books, newest first", body = Vec<BookResponse>)
    )
)]
pub async fn list_latest_books(State(state): State<AppState>) -> AppResult<Json<Vec<BookResponse>>> {
    let books = state.services.catalog.list_latest_books().await?;
    Ok(Json(books))
}

/// Get book details
#[utoipa::path(
    get,
    path = "/books/{id}",
    tag = "books",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Book ID")
    ),
    responses(
        (status = 200, description = "Book details", body = BookResponse),
        (status = 404, description = "Book not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_book(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<BookResponse>> {
    let book = state.services.catalog.get_book(id).await?;
    Ok(Json(book.into()))
}

/// Catalogue a new book
#[utoipa::path(
    post,
    path = "/management/books",
    tag = "management",
    security(("bearer_auth" = [])),
    request_body = CreateBook,
    responses(
        (status = 201, description = "Book created", body = BookResponse),
        (status = 400, description = "Invalid input", body = crate::error::ErrorResponse),
        (status = 403, description = "Staff role required", body = crate::error::ErrorResponse),
        (status = 409, description = "Stock must be at least 1", body = crate::error::ErrorResponse)
    )
)]
pub async fn create_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(book): Json<CreateBook>,
) -> AppResult<(StatusCode, Json<BookResponse>)> {
    claims.require_staff()?;

    let created = state.services.catalog.create_book(book).await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// Replace a book's details
#[utoipa::path(
    put,
    path = "/management/books/{id}",
    tag = "management",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Book ID")
    ),
    request_body = UpdateBook,
    responses(
        (status = 200, description = "Book updated", body = BookResponse),
        (status = 403, description = "Staff role required", body = crate::error::ErrorResponse),
        (status = 404, description = "Book not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Stock must be at least 1", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    Json(changes): Json<UpdateBook>,
) -> AppResult<Json<BookResponse>> {
    claims.require_staff()?;

    let updated = state.services.catalog.update_book(id, changes).await?;
    Ok(Json(updated.into()))
}

/// Remove a book from the catalog; its loan history is kept
#[utoipa::path(
    delete,
    path = "/management/books/{id}",
    tag = "management",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Book ID")
    ),
    responses(
        (status = 204, description = "Book deleted"),
        (status = 403, description = "Staff role required", body = crate::error::ErrorResponse),
        (status = 404, description = "Book not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    claims.require_staff()?;

    state.services.catalog.delete_book(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
