//! Defines routes for the namespace API.
//!
//! ## Structure
//! - **Bucket endpoints**
//!   - `GET    /buckets` - list buckets (optional `owner`)
//!   - `PUT    /buckets/{bucket}` - create bucket
//!   - `POST   /buckets/{bucket}` - update bucket settings
//!   - `GET    /buckets/{bucket}` - bucket record with aggregates
//!   - `DELETE /buckets/{bucket}` - delete an empty bucket
//!   - `GET|PUT|DELETE /buckets/{bucket}/external/{kind}` - policy, acl, tags, logging
//!
//! - **Namespace endpoints**
//!   - `GET /buckets/{bucket}/list` - one directory level (`prefix`, `offset`, `limit`, `deleted`)
//!   - `GET /buckets/{bucket}/versions` - version listing
//!   - `GET /buckets/{bucket}/count` - live entries below `prefix`
//!   - `PUT|GET|DELETE /buckets/{bucket}/objects/{*path}` - entry metadata
//!
//! The wildcard `*path` allows nested paths like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        bucket_handlers::{
            create_bucket, delete_bucket, delete_external, get_bucket, get_external,
            list_buckets, put_external, update_bucket,
        },
        health_handlers::{healthz, readyz},
        object_handlers::{
            count_objects, delete_object, get_object, list_objects, list_versions, put_object,
        },
    },
    services::namespace_service::NamespaceService,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build and return the router for the namespace API.
///
/// The router carries shared state (`NamespaceService`) to all handlers.
pub fn routes() -> Router<NamespaceService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Bucket-level routes
        .route("/buckets", get(list_buckets))
        .route(
            "/buckets/{bucket}",
            put(create_bucket)
                .post(update_bucket)
                .get(get_bucket)
                .delete(delete_bucket),
        )
        .route(
            "/buckets/{bucket}/external/{kind}",
            get(get_external).put(put_external).delete(delete_external),
        )
        // Namespace routes
        .route("/buckets/{bucket}/list", get(list_objects))
        .route("/buckets/{bucket}/versions", get(list_versions))
        .route("/buckets/{bucket}/count", get(count_objects))
        .route(
            "/buckets/{bucket}/objects/{*path}",
            put(put_object).get(get_object).delete(delete_object),
        )
}
