//! Borrow and return endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::{
    error::AppResult,
    models::borrow::{BorrowRecordResponse, ReturnBookRequest},
    AppState,
};

use super::AuthenticatedUser;

/// Borrow one copy of a book for the calling user
#[utoipa::path(
    post,
    path = "/books/{id}/borrow",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Book ID")
    ),
    responses(
        (status = 201, description = "Book borrowed", body = BorrowRecordResponse),
        (status = 401, description = "Not authenticated", body = crate::error::ErrorResponse),
        (status = 404, description = "Book or user not found", body = crate::error::ErrorResponse),
        (status = 409, description = "No copies left", body = crate::error::ErrorResponse)
    )
)]
pub async fn borrow_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(book_id): Path<i64>,
) -> AppResult<(StatusCode, Json<BorrowRecordResponse>)> {
    let record = state.services.loans.borrow(book_id, claims.user_id).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// Return a borrowed copy
#[utoipa::path(
    post,
    path = "/books/{id}/return",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Book ID")
    ),
    request_body = ReturnBookRequest,
    responses(
        (status = 200, description = "Book returned", body = BorrowRecordResponse),
        (status = 404, description = "Borrow record or book not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Already returned or record belongs to another book", body = crate::error::ErrorResponse)
    )
)]
pub async fn return_book(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Path(book_id): Path<i64>,
    Json(request): Json<ReturnBookRequest>,
) -> AppResult<Json<BorrowRecordResponse>> {
    let record = state
        .services
        .loans
        .return_book(request.history_id, book_id)
        .await?;
    Ok(Json(record.into()))
}

/// Loan history of a book, newest first
#[utoipa::path(
    get,
    path = "/management/books/{id}/history",
    tag = "management",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Book ID")
    ),
    responses(
        (status = 200, description = "Borrow records", body = Vec<BorrowRecordResponse>),
        (status = 403, description = "Staff role required", body = crate::error::ErrorResponse),
        (status = 404, description = "Book not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn book_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(book_id): Path<i64>,
) -> AppResult<Json<Vec<BorrowRecordResponse>>> {
    claims.require_staff()?;

    let records = state.services.loans.history_for_book(book_id).await?;
    Ok(Json(records.into_iter().map(BorrowRecordResponse::from).collect()))
}
