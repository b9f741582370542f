use std::future::Future;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use stacked_errors::{Result, StackableErr};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::error;

use crate::{orchestrator::Orchestrator, runner::Payload, Config};

/// Wire error code for request bodies that fail to decode.
pub const ERR_FAILED_CONVERSION_CODE: u32 = 1000;
/// Wire error code for failures while processing a deployment.
pub const ERR_PROCESSING_REQUEST_CODE: u32 = 1001;

/// The `{code, message}` error body of the deployer HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: u32,
    pub message: String,
}

/// Builds the deployer router: `POST /deployer/run`.
pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/deployer/run", post(create_deployment))
        .with_state(orchestrator)
}

/// Decodes the payload, deploys it, and returns the result. Decode failures
/// are 400s with code 1000 and never reach the engine; orchestration
/// failures are 500s with code 1001. A payload whose commands merely failed
/// still yields 200, the failure is data in the result.
async fn create_deployment(State(orchestrator): State<Orchestrator>, body: Bytes) -> Response {
    let payload: Payload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            let error = ApiError {
                code: ERR_FAILED_CONVERSION_CODE,
                message: format!("failed to parse request body; {err}"),
            };
            return (StatusCode::BAD_REQUEST, Json(error)).into_response();
        }
    };
    match orchestrator.create_deployment(&payload).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => {
            error!("failed to deploy container: {err:?}");
            let error = ApiError {
                code: ERR_PROCESSING_REQUEST_CODE,
                message: format!("failed to deploy container; {err}"),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
    }
}

/// Serves the deployer API until `shutdown` resolves. The configured HTTP
/// read/write timeouts are applied as a request timeout layer.
pub async fn serve(
    config: &Config,
    orchestrator: Orchestrator,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let timeout = config.read_timeout().max(config.write_timeout());
    let app = router(orchestrator)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout));
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .stack_err_with(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .stack()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use chrono::Utc;
    use stacked_errors::bail;
    use tower::util::ServiceExt;

    use super::*;
    use crate::{
        engine::{ContainerDuplex, ContainerEngine, WaitCondition},
        runner::RunResult,
        ImageFilter, ImageSummary,
    };

    /// Engine whose listing either fails or yields one image, and whose
    /// container emits `output`. Counts every call it receives.
    #[derive(Default)]
    struct ScriptedEngine {
        fail_listing: bool,
        output: Vec<u8>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContainerEngine for ScriptedEngine {
        async fn deploy(&self, _image: &str) -> stacked_errors::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("container-0".to_owned())
        }

        async fn attach(&self, _container_id: &str) -> stacked_errors::Result<ContainerDuplex> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("attach is not scripted")
        }

        async fn write(&self, _container_id: &str, _data: &[u8]) -> stacked_errors::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_and_read(
            &self,
            _container_id: &str,
            _condition: WaitCondition,
        ) -> stacked_errors::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }

        async fn stop(
            &self,
            _container_id: &str,
            _grace: Duration,
        ) -> stacked_errors::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn find_images(
            &self,
            _filter: &ImageFilter,
        ) -> stacked_errors::Result<Vec<ImageSummary>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_listing {
                bail!("engine unreachable")
            }
            Ok(vec![ImageSummary {
                id: "deadbeef".to_owned(),
                repository: "matryoshka/c".to_owned(),
                tag: "debian-amd64".to_owned(),
                created_at: Utc::now(),
                size: 1,
            }])
        }
    }

    fn request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/deployer/run")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn malformed_body_is_a_400_and_never_reaches_the_engine() {
        let engine = Arc::new(ScriptedEngine::default());
        let app = router(Orchestrator::new(
            Arc::clone(&engine) as Arc<dyn ContainerEngine>
        ));
        let response = app.oneshot(request("this is not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ApiError = body_json(response).await;
        assert_eq!(error.code, ERR_FAILED_CONVERSION_CODE);
        assert!(error.message.starts_with("failed to parse request body;"));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn orchestration_failure_is_a_500() {
        let engine = Arc::new(ScriptedEngine {
            fail_listing: true,
            ..Default::default()
        });
        let app = router(Orchestrator::new(engine as Arc<dyn ContainerEngine>));
        let body = r#"{"language":"c","files":[{"name":"main.c","content":""}]}"#;
        let response = app.oneshot(request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error: ApiError = body_json(response).await;
        assert_eq!(error.code, ERR_PROCESSING_REQUEST_CODE);
        assert!(error.message.starts_with("failed to deploy container;"));
    }

    #[tokio::test]
    async fn pipeline_failure_still_returns_200() {
        let result = RunResult::from_error("Error while building: exit status 2");
        let mut output = serde_json::to_vec(&result).unwrap();
        output.push(b'\n');
        let engine = Arc::new(ScriptedEngine {
            output,
            ..Default::default()
        });
        let app = router(Orchestrator::new(engine as Arc<dyn ContainerEngine>));
        let body = r#"{"language":"c","files":[{"name":"main.c","content":"int main;"}]}"#;
        let response = app.oneshot(request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let returned: RunResult = body_json(response).await;
        assert_eq!(returned, result);
    }
}
