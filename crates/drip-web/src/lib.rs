//! HTTP API for the Drip send scheduler.
//!
//! A thin axum layer over the campaign scheduler service: routes deserialize
//! the CRM's camelCase payloads, hand them to the service together with the
//! current time, and map scheduler errors onto HTTP statuses.

mod error;
mod routes;

pub use error::ApiError;
pub use routes::{AppState, create_router};
