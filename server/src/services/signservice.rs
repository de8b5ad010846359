use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;
use signlib::types::{JobId, JobInputs};
use signlib::{JobCoordinator, JobError, JobOutcome, JobStatus};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// How many upload chunks may sit between the HTTP layer and the staging
/// pipeline per role. Small on purpose: the request body is the buffer.
const CHUNK_BACKLOG: usize = 8;

#[derive(Clone)]
pub struct SignService {
    coordinator: JobCoordinator,
    /// How long a download request waits for the job to finish.
    await_timeout: Duration,
}

pub fn router(coordinator: JobCoordinator, await_timeout: Duration) -> Router {
    let service = SignService {
        coordinator,
        await_timeout,
    };
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(job_status).delete(cancel_job))
        .route("/jobs/{id}/package", get(fetch_package))
        // per-role limits in the artifact store are the enforcement point
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Accept a multipart upload and admit it as a signing job. Fields are
/// streamed into the staging pipeline as they arrive; the job id comes
/// back as soon as the last byte is in.
async fn submit_job(
    State(service): State<SignService>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let (package_tx, package_rx) = mpsc::channel::<io::Result<Bytes>>(CHUNK_BACKLOG);
    let (certificate_tx, certificate_rx) = mpsc::channel(CHUNK_BACKLOG);
    let (profile_tx, profile_rx) = mpsc::channel(CHUNK_BACKLOG);
    let (entitlements_tx, entitlements_rx) = mpsc::channel(CHUNK_BACKLOG);

    let inputs = JobInputs {
        package: Box::pin(ReceiverStream::new(package_rx)),
        certificate: Box::pin(ReceiverStream::new(certificate_rx)),
        profile: Box::pin(ReceiverStream::new(profile_rx)),
        // an empty stream stages to "not supplied"
        entitlements: Some(Box::pin(ReceiverStream::new(entitlements_rx))),
    };
    let job_id = service.coordinator.submit(inputs).await?;

    // the worker drains all roles concurrently, so field order does not
    // matter and the bounded channels give upload backpressure
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("malformed multipart body: {}", err)))?
    {
        let tx = match field.name() {
            Some("package") | Some("file") => &package_tx,
            Some("certificate") | Some("p12") => &certificate_tx,
            Some("profile") | Some("mobileprovision") => &profile_tx,
            Some("entitlements") => &entitlements_tx,
            _ => continue,
        };
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    // a closed receiver means staging already failed; the
                    // job will report why
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx
                        .send(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            err.to_string(),
                        )))
                        .await;
                    return Err(ApiError::BadRequest(format!(
                        "upload interrupted: {}",
                        err
                    )));
                }
            }
        }
    }
    drop((package_tx, certificate_tx, profile_tx, entitlements_tx));

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id.to_string(), "status": "queued" })),
    ))
}

async fn job_status(
    State(service): State<SignService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let status = service.coordinator.status(job_id).await?;
    Ok(Json(status_body(&status)))
}

async fn cancel_job(
    State(service): State<SignService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    service.coordinator.cancel(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Wait for the job to finish and stream the signed package back. The
/// stream owns the job's workspace, so teardown happens when the response
/// body is done — fully read or not.
async fn fetch_package(
    State(service): State<SignService>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&id)?;
    let outcome = service
        .coordinator
        .await_outcome(job_id, service.await_timeout)
        .await?;
    match outcome {
        JobOutcome::Success(package) => {
            let len = package.len();
            let stream = package.into_stream().await?;
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, len)
                .header(
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"signed.ipa\"",
                )
                .body(Body::from_stream(stream))
                .map_err(|err| ApiError::Job(JobError::ResourceExhausted(err.to_string())))
        }
        JobOutcome::Failure(err) => Err(ApiError::Job(err)),
    }
}

fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest("malformed job id".into()))
}

fn status_body(status: &JobStatus) -> serde_json::Value {
    match status {
        JobStatus::Queued => json!({ "status": "queued" }),
        JobStatus::Staging => json!({ "status": "running", "stage": "staging" }),
        JobStatus::Invoking => json!({ "status": "running", "stage": "invoking" }),
        JobStatus::Delivering => json!({ "status": "running", "stage": "delivering" }),
        JobStatus::Succeeded => json!({ "status": "succeeded" }),
        JobStatus::Failed { kind, detail } => {
            json!({ "status": wire_status(kind), "detail": detail })
        }
    }
}

fn wire_status(kind: &str) -> String {
    match kind {
        "timed_out" => "timed_out".to_string(),
        "overloaded" => "overloaded".to_string(),
        kind => format!("failed:{}", kind),
    }
}

pub enum ApiError {
    Job(JobError),
    BadRequest(String),
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        ApiError::Job(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, wire, detail) = match self {
            ApiError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "failed:bad_request".to_string(), detail)
            }
            ApiError::Job(err) => {
                let status = match &err {
                    JobError::InvalidArtifact { .. } => StatusCode::BAD_REQUEST,
                    JobError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    JobError::ResourceExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    JobError::ToolFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    JobError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
                    JobError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
                    JobError::Aborted => StatusCode::CONFLICT,
                    JobError::DoesNotExist => StatusCode::NOT_FOUND,
                };
                (status, wire_status(err.kind()), err.to_string())
            }
        };
        (status, Json(json!({ "status": wire, "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use signlib::Config;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    const BOUNDARY: &str = "XsignserviceboundaryX";
    const SAMPLE_PACKAGE: &[u8] = b"PK\x03\x04fake ipa payload bytes";

    fn fake_signer(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-signer.sh");
        let script = format!(
            "#!/bin/sh\n\
             pkg=\"\"\nout=\"\"\nent=\"\"\n\
             while [ \"$#\" -gt 0 ]; do\n\
             \tcase \"$1\" in\n\
             \t\t-k|-m) shift 2 ;;\n\
             \t\t-e) ent=\"$2\"; shift 2 ;;\n\
             \t\t-o) out=\"$2\"; shift 2 ;;\n\
             \t\t*) pkg=\"$1\"; shift ;;\n\
             \tesac\n\
             done\n\
             {}",
            body
        );
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn test_router(root: &Path, signer_body: &str) -> Router {
        let config = Config {
            workspace_root: root.join("workspaces"),
            signer_program: fake_signer(root, signer_body),
            ..Config::default()
        };
        router(JobCoordinator::spawn(config), Duration::from_secs(15))
    }

    fn multipart_body(parts: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    name, filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/jobs")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let root = tempfile::tempdir().unwrap();
        let app = test_router(root.path(), "cp \"$pkg\" \"$out\"\n");
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn multipart_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let app = test_router(root.path(), "cp \"$pkg\" \"$out\"\n");

        let body = multipart_body(&[
            ("package", "app.ipa", SAMPLE_PACKAGE),
            ("certificate", "cert.p12", b"fake cert"),
            ("profile", "dist.mobileprovision", b"fake profile"),
        ]);
        let response = app.clone().oneshot(multipart_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let submitted = json_body(response).await;
        let job_id = submitted["job_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/jobs/{}/package", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "application/octet-stream"
        );
        let signed = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&signed[..], SAMPLE_PACKAGE);

        // the outcome was handed out exactly once
        let response = app
            .oneshot(
                Request::get(format!("/jobs/{}", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn entitlements_part_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let app = test_router(
            root.path(),
            "if [ ! -s \"$ent\" ]; then exit 9; fi\ncp \"$pkg\" \"$out\"\n",
        );

        // entitlements first: field order on the wire must not matter
        let body = multipart_body(&[
            ("entitlements", "app.plist", b"<plist/>"),
            ("package", "app.ipa", SAMPLE_PACKAGE),
            ("certificate", "cert.p12", b"fake cert"),
            ("profile", "dist.mobileprovision", b"fake profile"),
        ]);
        let response = app.clone().oneshot(multipart_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job_id = json_body(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                Request::get(format!("/jobs/{}/package", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let signed = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&signed[..], SAMPLE_PACKAGE);
    }

    #[tokio::test]
    async fn tool_failure_is_surfaced_with_diagnostics() {
        let root = tempfile::tempdir().unwrap();
        let app = test_router(root.path(), "echo 'invalid certificate' >&2\nexit 1\n");

        let body = multipart_body(&[
            ("package", "app.ipa", SAMPLE_PACKAGE),
            ("certificate", "cert.p12", b"fake cert"),
            ("profile", "dist.mobileprovision", b"fake profile"),
        ]);
        let response = app.clone().oneshot(multipart_request(body)).await.unwrap();
        let job_id = json_body(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                Request::get(format!("/jobs/{}/package", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let error = json_body(response).await;
        assert_eq!(error["status"], "failed:tool_failure");
        assert!(error["detail"].as_str().unwrap().contains("invalid certificate"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_the_job() {
        let root = tempfile::tempdir().unwrap();
        let app = test_router(root.path(), "cp \"$pkg\" \"$out\"\n");

        let body = multipart_body(&[("package", "app.ipa", SAMPLE_PACKAGE)]);
        let response = app.clone().oneshot(multipart_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job_id = json_body(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                Request::get(format!("/jobs/{}/package", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = json_body(response).await;
        assert_eq!(error["status"], "failed:invalid_artifact");
    }

    #[tokio::test]
    async fn unknown_and_malformed_job_ids() {
        let root = tempfile::tempdir().unwrap();
        let app = test_router(root.path(), "cp \"$pkg\" \"$out\"\n");

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/jobs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::get("/jobs/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
