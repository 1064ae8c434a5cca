mod middleware;
mod public;

pub use middleware::RequestContext;
pub use public::{ARTIFACT_EXPIRES_HEADER, HttpState, build_router};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{application::error::ErrorReport, store::StoreError};

fn store_health_response(result: Result<(), StoreError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::store_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
