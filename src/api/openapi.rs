//! OpenAPI documentation

use axum::Router;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{auth, books, health, loans, users};

/// Registers the JWT bearer scheme referenced by protected paths
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi
            .components
            .get_or_insert_with(utoipa::openapi::Components::default);

        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "Lending API",
        version = "1.0.0",
        description = "Book catalog and lending REST API"
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        health::readiness_check,
        // Auth
        auth::login,
        auth::register,
        // Books
        books::list_books,
        books::list_latest_books,
        books::get_book,
        books::create_book,
        books::update_book,
        books::delete_book,
        // Loans
        loans::borrow_book,
        loans::return_book,
        loans::book_history,
        // Users
        users::get_me,
        users::update_me,
        users::delete_user,
    ),
    components(
        schemas(
            crate::models::user::LoginRequest,
            crate::models::user::LoginResponse,
            crate::models::user::CreateUser,
            crate::models::user::UpdateUser,
            crate::models::user::UserResponse,
            crate::models::user::Role,
            crate::models::book::BookResponse,
            crate::models::book::CreateBook,
            crate::models::book::UpdateBook,
            crate::models::borrow::BorrowRecordResponse,
            crate::models::borrow::BorrowStatus,
            crate::models::borrow::ReturnBookRequest,
            health::HealthResponse,
            crate::error::ErrorResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "auth", description = "Authentication endpoints"),
        (name = "books", description = "Catalog browsing"),
        (name = "loans", description = "Borrowing and returning"),
        (name = "users", description = "User profile"),
        (name = "management", description = "Staff-only catalog and account management")
    )
)]
pub struct ApiDoc;

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
