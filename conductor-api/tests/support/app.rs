#![allow(dead_code)]

//! In-process router harness shared by the API integration tests.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use conductor_api::{create_api_router, ApiConfig, AppState};
use conductor_core::ConductorConfig;
use conductor_test_utils::{fixtures, EchoAgent, SlowAgent};
use serde_json::Value as JsonValue;
use tower::ServiceExt;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Opportunities reported by the last pipeline stage per run.
pub const OPPORTUNITIES_PER_RUN: usize = 2;

pub struct TestApp {
    pub state: AppState,
    router: Router,
}

impl TestApp {
    /// App with no worker agents registered.
    pub fn bare() -> TestResult<Self> {
        let state = AppState::new(ConductorConfig::development())?;
        let router = create_api_router(state.clone(), &ApiConfig::default());
        Ok(Self { state, router })
    }

    /// App with echo agents behind every pipeline stage. `discovery` reports
    /// 1000 input and 500 output tokens per envelope.
    pub async fn pipeline() -> TestResult<Self> {
        let app = Self::bare()?;
        for id in fixtures::PIPELINE_AGENTS {
            let agent = match id {
                "discovery" => EchoAgent::new(id).with_usage(fixtures::sample_usage()),
                "action-generation" => EchoAgent::new(id).with_opportunities(OPPORTUNITIES_PER_RUN),
                _ => EchoAgent::new(id),
            };
            app.state.register_agent(Arc::new(agent)).await?;
        }
        Ok(app)
    }

    /// Pipeline whose first stage takes `delay` per entity, one at a time.
    pub async fn slow_pipeline(delay: Duration) -> TestResult<Self> {
        let app = Self::bare()?;
        for id in fixtures::PIPELINE_AGENTS {
            if id == "discovery" {
                app.state
                    .register_agent(Arc::new(SlowAgent::new(id, delay, 1)))
                    .await?;
            } else {
                app.state.register_agent(Arc::new(EchoAgent::new(id))).await?;
            }
        }
        Ok(app)
    }

    pub async fn get(&self, uri: &str) -> TestResult<(StatusCode, JsonValue)> {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Option<JsonValue>) -> TestResult<(StatusCode, JsonValue)> {
        self.request(Method::POST, uri, body).await
    }

    /// Send one request through the router. Non-JSON bodies come back as a
    /// JSON string; empty bodies as `null`.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<JsonValue>,
    ) -> TestResult<(StatusCode, JsonValue)> {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let json = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok((status, json))
    }

    /// Poll `GET uri` until `done` accepts the body.
    pub async fn wait_for(
        &self,
        uri: &str,
        done: impl Fn(&JsonValue) -> bool,
    ) -> TestResult<JsonValue> {
        for _ in 0..400 {
            let (status, body) = self.get(uri).await?;
            if status == StatusCode::OK && done(&body) {
                return Ok(body);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(format!("timed out waiting on {}", uri).into())
    }
}

/// String field of a JSON body.
pub fn str_field<'a>(body: &'a JsonValue, field: &str) -> TestResult<&'a str> {
    body[field]
        .as_str()
        .ok_or_else(|| format!("missing string field {} in {}", field, body).into())
}
