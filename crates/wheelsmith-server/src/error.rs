//! Error-to-response mapping: infrastructure faults are 5xx, malformed
//! bodies and unsatisfiable compiles are 4xx carrying the log as body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use wheelsmith_catalog::CatalogError;
use wheelsmith_dispatch::DispatchError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{what} not found")]
    NotFound { what: &'static str },

    /// 400 whose body is shown to the client verbatim (e.g. a compile
    /// log).
    #[error("bad request")]
    BadRequest { body: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound { what } => {
                (StatusCode::NOT_FOUND, format!("{what} not found\n")).into_response()
            }
            Self::BadRequest { body } => (StatusCode::BAD_REQUEST, body).into_response(),
            Self::Catalog(err) => {
                error!("catalog failure: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Self::Dispatch(err) => {
                error!("dispatch failure: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
