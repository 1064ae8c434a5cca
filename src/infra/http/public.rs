use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{Path, State},
    http::{
        HeaderName, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use time::format_description::well_known::Rfc3339;

use crate::{
    application::{
        error::{AppError, HttpError},
        gateway::{CacheGateway, Fetch},
    },
    domain::types::{Artifact, ArtifactKey},
    store::ArtifactStore,
};

use super::{
    middleware::{log_responses, set_request_context},
    store_health_response,
};

/// RFC 3339 timestamp at which a served artifact expires, when the store knows it.
pub const ARTIFACT_EXPIRES_HEADER: HeaderName = HeaderName::from_static("x-artifact-expires-at");

#[derive(Clone)]
pub struct HttpState {
    pub gateway: Arc<CacheGateway>,
    pub store: Arc<dyn ArtifactStore>,
    /// Advertised in `Retry-After` when the queue cannot take a request.
    pub retry_after: Duration,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/artifact/{key}", get(artifact))
        .route("/cert/{key}", get(artifact))
        .route("/_health/store", get(store_health))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
        .with_state(state)
}

async fn artifact(State(state): State<HttpState>, Path(raw): Path<String>) -> Response {
    let key = match ArtifactKey::parse(raw) {
        Ok(key) => key,
        Err(err) => return AppError::from(err).into_response(),
    };

    match state.gateway.fetch(key).await {
        Ok(Fetch::Ready(artifact)) => artifact_response(artifact),
        Ok(Fetch::Accepted(_)) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            HttpError::from_queue_error("infra::http::artifact", err, state.retry_after)
                .into_response()
        }
    }
}

fn artifact_response(artifact: Artifact) -> Response {
    let expires_at = artifact
        .expires_at
        .and_then(|at| at.format(&Rfc3339).ok())
        .and_then(|at| HeaderValue::from_str(&at).ok());

    let mut response = (
        StatusCode::OK,
        [
            (
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            (CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        artifact.value,
    )
        .into_response();
    if let Some(expires_at) = expires_at {
        response
            .headers_mut()
            .insert(ARTIFACT_EXPIRES_HEADER, expires_at);
    }
    response
}

async fn store_health(State(state): State<HttpState>) -> Response {
    store_health_response(state.store.ping().await)
}
