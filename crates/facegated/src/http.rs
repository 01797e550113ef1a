//! JSON control endpoints and MJPEG streams.

use crate::service::{Service, ServiceError};
use crate::stream::{multipart_part, FrameProcessor, FrameStream};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Encoded frames buffered between the capture thread and the response body.
const STREAM_BUFFER: usize = 2;

type AppState = Arc<Service>;

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/enrollment/start", post(start_enrollment))
        .route("/enrollment/stop", post(stop_enrollment))
        .route("/enrollment/status", get(enrollment_status))
        .route("/enrollment/stream", get(enrollment_stream))
        .route("/identification/start", post(start_identification))
        .route("/identification/stop", post(stop_identification))
        .route("/identification/stream", get(identification_stream))
        .with_state(service)
}

#[derive(Debug, Deserialize)]
struct StartEnrollment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::ModeBusy(_) | ServiceError::NotStarted(_) => StatusCode::CONFLICT,
            ServiceError::NoEnrolledIdentities => StatusCode::CONFLICT,
            ServiceError::Enrollment(_) => StatusCode::BAD_REQUEST,
            ServiceError::Camera(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Gallery(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "success": false,
            "code": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Run a blocking service call off the async executor.
async fn blocking<T, F>(service: AppState, call: F) -> Result<T, ServiceError>
where
    F: FnOnce(&Service) -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(move || call(&service)).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(error = %err, "service call panicked");
            Err(ServiceError::Internal(err.to_string()))
        }
    }
}

async fn status(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.status())
}

async fn start_enrollment(
    State(service): State<AppState>,
    Json(req): Json<StartEnrollment>,
) -> Result<impl IntoResponse, ServiceError> {
    let uid = blocking(service, move |s| {
        s.start_enrollment(req.name.as_deref().unwrap_or(""), req.email.as_deref())
    })
    .await?;
    Ok(Json(json!({ "success": true, "uid": uid })))
}

async fn stop_enrollment(State(service): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    blocking(service, |s| {
        s.stop_enrollment();
        Ok(())
    })
    .await?;
    Ok(Json(json!({ "success": true })))
}

async fn enrollment_status(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.enrollment_status())
}

async fn enrollment_stream(State(service): State<AppState>) -> Result<Response, ServiceError> {
    let stream = blocking(service, |s| s.enrollment_stream()).await?;
    Ok(mjpeg_response(stream))
}

async fn start_identification(
    State(service): State<AppState>,
) -> Result<impl IntoResponse, ServiceError> {
    let enrolled = blocking(service, |s| s.start_identification()).await?;
    Ok(Json(json!({ "success": true, "enrolled": enrolled })))
}

async fn stop_identification(
    State(service): State<AppState>,
) -> Result<impl IntoResponse, ServiceError> {
    blocking(service, |s| {
        s.stop_identification();
        Ok(())
    })
    .await?;
    Ok(Json(json!({ "success": true })))
}

async fn identification_stream(State(service): State<AppState>) -> Result<Response, ServiceError> {
    let stream = blocking(service, |s| s.identification_stream()).await?;
    Ok(mjpeg_response(stream))
}

/// Drive `stream` on its own thread and forward each frame as a multipart part.
///
/// The thread ends when the stream ends or the client disconnects.
fn mjpeg_response<P: FrameProcessor + 'static>(stream: FrameStream<P>) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Vec<u8>, Infallible>>(STREAM_BUFFER);

    std::thread::spawn(move || {
        for item in stream {
            match item {
                Ok(jpeg) => {
                    if tx.blocking_send(Ok(multipart_part(&jpeg))).is_err() {
                        tracing::debug!("stream client disconnected");
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(code = err.code(), error = %err, "stream ended");
                    break;
                }
            }
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to build stream response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}
