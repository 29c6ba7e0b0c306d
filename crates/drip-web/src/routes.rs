//! API routes for campaign scheduling.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use drip_engine::{ScheduleConfig, ScheduleOverride};
use drip_scheduler::CampaignScheduler;

use crate::error::ApiError;

/// Shared state for the API server.
pub struct AppState {
    pub scheduler: CampaignScheduler,
}

/// Request body for scheduling a campaign.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    organization_id: String,
    /// Partial schedule override, merged over the organization config.
    #[serde(default, rename = "override")]
    override_config: Option<ScheduleOverride>,
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/campaigns/{campaign_id}/schedule", post(schedule_campaign))
        .route("/campaigns/{campaign_id}/pause", post(pause_campaign))
        .route("/campaigns/{campaign_id}/resume", post(resume_campaign))
        .route("/campaigns/{campaign_id}/retry", post(retry_failed))
        .route("/campaigns/{campaign_id}/cancel", post(cancel_remaining))
        .route("/campaigns/{campaign_id}/status", get(campaign_status))
        .route("/emails/{email_id}/cancel", post(cancel_email))
        .route(
            "/organizations/{organization_id}/schedule-config",
            get(organization_config).put(update_organization_config),
        )
        .route("/health", get(health))
        .with_state(state)
}

async fn schedule_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
    Json(request): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state
        .scheduler
        .schedule_campaign(
            &campaign_id,
            &request.organization_id,
            request.override_config,
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "jobsCreated": created }))))
}

async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let paused = state
        .scheduler
        .pause_campaign(&campaign_id, Utc::now())
        .await?;
    Ok(Json(json!({ "paused": paused })))
}

async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let resumed = state
        .scheduler
        .resume_campaign(&campaign_id, Utc::now())
        .await?;
    Ok(Json(json!({ "resumed": resumed })))
}

async fn retry_failed(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let retried = state
        .scheduler
        .retry_failed(&campaign_id, Utc::now())
        .await?;
    Ok(Json(json!({ "retried": retried })))
}

async fn cancel_remaining(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state
        .scheduler
        .cancel_remaining(&campaign_id, Utc::now())
        .await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn campaign_status(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.scheduler.campaign_status(&campaign_id).await?;
    Ok(Json(status))
}

/// The email-deletion cascade hook: the CRM calls this when an email is
/// removed so its queued send dies with it.
async fn cancel_email(
    State(state): State<Arc<AppState>>,
    Path(email_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.scheduler.cancel_email(&email_id, Utc::now()).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn organization_config(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .scheduler
        .organization_config(&organization_id)
        .await?;
    Ok(Json(config))
}

async fn update_organization_config(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<String>,
    Json(config): Json<ScheduleConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let saved = state
        .scheduler
        .update_organization_config(&organization_id, config, Utc::now())
        .await?;
    Ok(Json(saved))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    use drip_scheduler::{EmailSource, PendingEmail, SourceError, StaticOrgSettings};
    use drip_store::JobStore;

    struct FixedEmails(Vec<PendingEmail>);

    #[async_trait]
    impl EmailSource for FixedEmails {
        async fn pending_emails(
            &self,
            _campaign_id: &str,
        ) -> Result<Vec<PendingEmail>, SourceError> {
            Ok(self.0.clone())
        }
    }

    fn pending(id: &str) -> PendingEmail {
        PendingEmail {
            email_id: id.to_string(),
            donor_id: format!("donor-{id}"),
        }
    }

    async fn api_with(emails: Vec<PendingEmail>) -> (Router, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = JobStore::open(file.path()).await.unwrap();
        let scheduler = CampaignScheduler::new(
            store,
            Arc::new(FixedEmails(emails)),
            Arc::new(StaticOrgSettings::new("UTC")),
            "UTC",
        );
        let router = create_router(Arc::new(AppState { scheduler }));
        (router, file)
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&value).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap();
        (status, value)
    }

    async fn schedule(router: &Router, campaign: &str) -> (StatusCode, Value) {
        call(
            router,
            "POST",
            &format!("/campaigns/{campaign}/schedule"),
            Some(json!({ "organizationId": "org-1" })),
        )
        .await
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (router, _file) = api_with(vec![]).await;

        let (status, body) = call(&router, "GET", "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn scheduling_returns_created_count() {
        let (router, _file) = api_with(vec![pending("email-a"), pending("email-b")]).await;

        let (status, body) = schedule(&router, "campaign-1").await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["jobsCreated"], 2);
    }

    #[tokio::test]
    async fn rescheduling_creates_nothing_new() {
        let (router, _file) = api_with(vec![pending("email-a")]).await;
        schedule(&router, "campaign-1").await;

        let (status, body) = schedule(&router, "campaign-1").await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["jobsCreated"], 0);
    }

    #[tokio::test]
    async fn invalid_override_is_unprocessable() {
        let (router, _file) = api_with(vec![pending("email-a")]).await;

        let (status, body) = call(
            &router,
            "POST",
            "/campaigns/campaign-1/schedule",
            Some(json!({
                "organizationId": "org-1",
                "override": { "dailyLimit": 501 }
            })),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(
            body["error"].as_str().unwrap().contains("daily limit 501"),
            "unexpected error body: {body}"
        );
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let (router, _file) = api_with(vec![]).await;

        let (status, body) = call(&router, "POST", "/campaigns/ghost/pause", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("campaign not found"));

        let (status, _body) = call(&router, "GET", "/campaigns/ghost/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pause_and_resume_report_counts() {
        let (router, _file) = api_with(vec![pending("email-a"), pending("email-b")]).await;
        schedule(&router, "campaign-1").await;

        let (status, body) = call(&router, "POST", "/campaigns/campaign-1/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], 2);

        let (status, body) = call(&router, "POST", "/campaigns/campaign-1/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resumed"], 2);

        let (_, body) = call(&router, "GET", "/campaigns/campaign-1/status", None).await;
        assert_eq!(body["scheduled"], 2);
        assert_eq!(body["paused"], 0);
    }

    #[tokio::test]
    async fn cancel_remaining_reports_count() {
        let (router, _file) = api_with(vec![pending("email-a"), pending("email-b")]).await;
        schedule(&router, "campaign-1").await;

        let (status, body) = call(&router, "POST", "/campaigns/campaign-1/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], 2);

        let (_, body) = call(&router, "GET", "/campaigns/campaign-1/status", None).await;
        assert_eq!(body["scheduled"], 0);
        assert_eq!(body["cancelled"], 2);
    }

    #[tokio::test]
    async fn cancelling_one_email_keeps_the_rest() {
        let (router, _file) = api_with(vec![pending("email-a"), pending("email-b")]).await;
        schedule(&router, "campaign-1").await;

        let (status, body) = call(&router, "POST", "/emails/email-a/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], 1);

        let (_, body) = call(&router, "GET", "/campaigns/campaign-1/status", None).await;
        assert_eq!(body["scheduled"], 1);
        assert_eq!(body["cancelled"], 1);
    }

    #[tokio::test]
    async fn status_reports_queue_counts() {
        let (router, _file) = api_with(vec![pending("email-a"), pending("email-b")]).await;
        schedule(&router, "campaign-1").await;

        let (status, body) = call(&router, "GET", "/campaigns/campaign-1/status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheduled"], 2);
        assert_eq!(body["completed"], 0);
        assert_eq!(body["needsAttention"], false);
        assert!(body["nextSendTime"].is_string());
    }

    #[tokio::test]
    async fn retry_without_failures_is_zero() {
        let (router, _file) = api_with(vec![pending("email-a")]).await;
        schedule(&router, "campaign-1").await;

        let (status, body) = call(&router, "POST", "/campaigns/campaign-1/retry", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retried"], 0);
    }

    #[tokio::test]
    async fn config_roundtrip() {
        let (router, _file) = api_with(vec![]).await;

        // Nothing stored yet, so the defaults come back.
        let (status, body) =
            call(&router, "GET", "/organizations/org-1/schedule-config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dailyLimit"], 150);
        assert_eq!(body["timezone"], "UTC");

        let (status, body) = call(
            &router,
            "PUT",
            "/organizations/org-1/schedule-config",
            Some(json!({ "timezone": "America/Chicago", "dailyLimit": 25 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dailyLimit"], 25);

        let (_, body) = call(&router, "GET", "/organizations/org-1/schedule-config", None).await;
        assert_eq!(body["dailyLimit"], 25);
        assert_eq!(body["timezone"], "America/Chicago");
        assert_eq!(body["maxDailyLimit"], 500);
    }

    #[tokio::test]
    async fn config_update_rejects_unknown_timezone() {
        let (router, _file) = api_with(vec![]).await;

        let (status, body) = call(
            &router,
            "PUT",
            "/organizations/org-1/schedule-config",
            Some(json!({ "timezone": "Mars/Olympus" })),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("unknown timezone"));
    }
}
