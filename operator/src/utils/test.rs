//! Common implementation of a stub API server for controller tests.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hyper::{body::to_bytes, Body};
use k8s_openapi::chrono::{DateTime, TimeZone, Utc};
use kube::{error::ErrorResponse, Client};
use serde::Serialize;

use crate::{
    config::OperatorConfig,
    pipeline::health::HealthChecker,
    utils::{Clock, Context},
};

/// Clock that always reports a fixed time.
pub struct StaticClock(pub DateTime<Utc>);
impl Clock for StaticClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Health checker that reports a canned result.
pub struct StubHealthChecker {
    /// When set, every check fails with this message.
    pub error: Option<String>,
}

#[async_trait]
impl HealthChecker for StubHealthChecker {
    async fn check(&self, url: &str) -> Result<()> {
        match &self.error {
            None => Ok(()),
            Some(msg) => Err(anyhow!("{msg}: {url}")),
        }
    }
}

/// The fixed time test contexts report.
pub fn test_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

// Add test specific implementation to the Context
impl Context<StubHealthChecker, StaticClock> {
    /// Create a test context with a mocked kube client and a fixed clock.
    pub fn test() -> (Arc<Self>, ApiServerVerifier) {
        Self::test_at(test_time(), None)
    }

    /// Create a test context at a specific time, optionally failing health
    /// checks.
    pub fn test_at(
        now: DateTime<Utc>,
        health_error: Option<String>,
    ) -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) =
            tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
        let ctx = Self {
            k_client: Client::new(mock_service, "default"),
            health_client: StubHealthChecker { error: health_error },
            clock: StaticClock(now),
            config: OperatorConfig::default(),
        };
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}

/// Wait for the stub API server task to handle every expected request.
pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("stub succeeded")
}

type ApiServerHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;
type SendHandle = tower_test::mock::SendResponse<http::Response<Body>>;

/// Verifies the requests the controller makes against a stub API server.
///
/// NB: If the controller makes more calls than the test handles, the
/// reconcile typically fails with `KubeError(Service(Closed(())))`. Await the
/// `JoinHandle` of the task driving the verifier (with a timeout) to ensure
/// all expected calls actually happened.
pub struct ApiServerVerifier(ApiServerHandle);

/// An observed request: method, uri, and decoded JSON body (Null when empty).
#[derive(Debug)]
pub struct Request {
    /// HTTP method.
    pub method: String,
    /// Full request uri including the query string.
    pub uri: String,
    /// JSON body.
    pub body: serde_json::Value,
}

impl Request {
    async fn from_request(request: http::Request<Body>) -> Result<Self> {
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let body_bytes = to_bytes(request.into_body()).await?;
        let body = if body_bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body_bytes)?
        };
        Ok(Self { method, uri, body })
    }
}

/// Types that can have an expected status attached, used to echo status
/// patches back as the full object the client expects.
pub trait WithStatus {
    /// The status subresource type.
    type Status: serde::de::DeserializeOwned;
    /// Attach a status to the object.
    fn with_status(self, status: Self::Status) -> Self;
}

impl ApiServerVerifier {
    async fn expect(&mut self, method: &str, uri: &str) -> (Request, SendHandle) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        let request = Request::from_request(request)
            .await
            .expect("request should parse");
        // An empty query string still leaves a trailing "?" on the uri.
        assert_eq!(
            (request.method.as_str(), request.uri.trim_end_matches('?')),
            (method, uri.trim_end_matches('?')),
            "unexpected api request"
        );
        (request, send)
    }

    fn respond(send: SendHandle, status: u16, body: Vec<u8>) {
        send.send_response(
            http::Response::builder()
                .status(status)
                .body(Body::from(body))
                .unwrap(),
        );
    }

    /// Expect a request and answer it with the given object.
    pub async fn handle<T: Serialize>(&mut self, method: &str, uri: &str, response: &T) -> Request {
        let (request, send) = self.expect(method, uri).await;
        Self::respond(send, 200, serde_json::to_vec(response).unwrap());
        request
    }

    /// Expect a request and echo its body back, as create and replace do.
    pub async fn handle_echo(&mut self, method: &str, uri: &str) -> Request {
        let (request, send) = self.expect(method, uri).await;
        Self::respond(send, 200, serde_json::to_vec(&request.body).unwrap());
        request
    }

    /// Expect a request and answer 404 NotFound.
    pub async fn handle_not_found(&mut self, method: &str, uri: &str) -> Request {
        let (request, send) = self.expect(method, uri).await;
        let error = ErrorResponse {
            status: "Failure".to_owned(),
            code: 404,
            message: "not found".to_owned(),
            reason: "NotFound".to_owned(),
        };
        Self::respond(send, 404, serde_json::to_vec(&error).unwrap());
        request
    }

    /// Expect a create and answer 409 AlreadyExists, as a resumed pass sees.
    pub async fn handle_already_exists(&mut self, method: &str, uri: &str) -> Request {
        let (request, send) = self.expect(method, uri).await;
        let error = ErrorResponse {
            status: "Failure".to_owned(),
            code: 409,
            message: "already exists".to_owned(),
            reason: "AlreadyExists".to_owned(),
        };
        Self::respond(send, 409, serde_json::to_vec(&error).unwrap());
        request
    }

    /// Expect a delete and answer with a success Status.
    pub async fn handle_delete(&mut self, uri: &str) -> Request {
        let (request, send) = self.expect("DELETE", uri).await;
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success",
        });
        Self::respond(send, 200, serde_json::to_vec(&status).unwrap());
        request
    }

    /// Expect a status patch and answer with the object carrying the patched
    /// status, as the real API server does.
    pub async fn handle_patch_status<T>(&mut self, uri: &str, object: T) -> Request
    where
        T: WithStatus + Serialize,
    {
        let (request, send) = self.expect("PATCH", uri).await;
        let status_json = request
            .body
            .get("status")
            .expect("patch should carry a status object")
            .clone();
        let status: T::Status =
            serde_json::from_value(status_json).expect("JSON should be a valid status");
        let object = object.with_status(status);
        Self::respond(send, 200, serde_json::to_vec(&object).unwrap());
        request
    }
}
