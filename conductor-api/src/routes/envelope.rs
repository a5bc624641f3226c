//! Envelope ingress.
//!
//! Lets an external collaborator hand a fully formed envelope to the
//! orchestrator. An unknown destination with `requiresResponse` comes back
//! as the immediate error result.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use conductor_agents::{DropReason, Orchestrator, RouteOutcome};
use conductor_core::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    Delivered,
    Parked,
    Dropped,
    Bounced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RouteEnvelopeResponse {
    pub outcome: RouteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DropReason>,
    /// Error result answering a bounced envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub reply: Option<JsonValue>,
}

impl RouteEnvelopeResponse {
    fn from_outcome(outcome: RouteOutcome) -> ApiResult<(StatusCode, Self)> {
        let response = match outcome {
            RouteOutcome::Delivered => (
                StatusCode::ACCEPTED,
                Self {
                    outcome: RouteStatus::Delivered,
                    reason: None,
                    reply: None,
                },
            ),
            RouteOutcome::Parked => (
                StatusCode::ACCEPTED,
                Self {
                    outcome: RouteStatus::Parked,
                    reason: None,
                    reply: None,
                },
            ),
            RouteOutcome::Dropped(reason) => (
                StatusCode::ACCEPTED,
                Self {
                    outcome: RouteStatus::Dropped,
                    reason: Some(reason),
                    reply: None,
                },
            ),
            RouteOutcome::Bounced(reply) => (
                StatusCode::OK,
                Self {
                    outcome: RouteStatus::Bounced,
                    reason: Some(DropReason::UnknownDestination),
                    reply: Some(serde_json::to_value(&*reply)?),
                },
            ),
        };
        Ok(response)
    }
}

/// POST /envelopes - Route one envelope
#[utoipa::path(
    post,
    path = "/envelopes",
    tag = "Envelopes",
    responses(
        (status = 202, description = "Delivered, parked or dropped", body = RouteEnvelopeResponse),
        (status = 200, description = "Unknown destination answered with an error result", body = RouteEnvelopeResponse),
        (status = 400, description = "Malformed envelope", body = ApiError),
    ),
)]
pub async fn route_envelope(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<JsonValue>,
) -> ApiResult<(StatusCode, Json<RouteEnvelopeResponse>)> {
    let envelope: Envelope = serde_json::from_value(body)?;
    if envelope.to.trim().is_empty() {
        return Err(ApiError::missing_field("to"));
    }

    let envelope_id = envelope.id;
    let outcome = orchestrator.route(envelope).await?;
    tracing::debug!(envelope_id = %envelope_id, outcome = ?outcome, "Envelope routed via API");

    let (status, response) = RouteEnvelopeResponse::from_outcome(outcome)?;
    Ok((status, Json(response)))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", post(route_envelope))
}
