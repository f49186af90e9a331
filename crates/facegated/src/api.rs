use crate::engine::{EngineError, EngineHandle};
use crate::store::{Coordinates, LogStatus, NewLogEntry, NewUser, Store, StoreError};
use actix_multipart::form::text::Text;
use actix_multipart::form::{MultipartCollect, MultipartForm, MultipartFormConfig};
use actix_web::http::StatusCode;
use actix_web::{web, Either, HttpResponse};
use facegate_core::capture::{self, DecodeError};
use facegate_core::{
    EnrollError, FaceMatch, Liveness, Task, TaskValidity, VerificationOutcome, VerifyError,
};
use image::RgbImage;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::path::PathBuf;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub store: Store,
    pub capture_dir: Option<PathBuf>,
}

/// Routes plus the body limits of every extractor they use.
pub fn configure(cfg: &mut web::ServiceConfig, max_body_bytes: usize) {
    cfg.app_data(web::PayloadConfig::new(max_body_bytes))
        .app_data(web::FormConfig::default().limit(max_body_bytes))
        .app_data(web::JsonConfig::default().limit(max_body_bytes))
        .app_data(
            MultipartFormConfig::default()
                .total_limit(max_body_bytes)
                .memory_limit(max_body_bytes),
        )
        .service(web::resource("/register").route(web::post().to(register)))
        .service(web::resource("/verify").route(web::post().to(verify)))
        .service(web::resource("/log-verification").route(web::post().to(log_verification)))
        .service(web::resource("/get-logs").route(web::get().to(get_logs)));
}

#[derive(Debug, Deserialize)]
pub struct RegisterForm {
    #[serde(rename = "frontImage")]
    front_image: Option<String>,
    #[serde(rename = "leftImage")]
    left_image: Option<String>,
    #[serde(rename = "rightImage")]
    right_image: Option<String>,
    name: Option<String>,
    email: Option<String>,
    /// Required at the boundary; credential handling belongs to another service.
    password: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
}

/// `/register` fields sent as `multipart/form-data`.
#[derive(MultipartForm)]
pub struct RegisterUpload {
    #[multipart(rename = "frontImage")]
    front_image: Option<Text<String>>,
    #[multipart(rename = "leftImage")]
    left_image: Option<Text<String>>,
    #[multipart(rename = "rightImage")]
    right_image: Option<Text<String>>,
    name: Option<Text<String>>,
    email: Option<Text<String>>,
    password: Option<Text<String>>,
    latitude: Option<Text<String>>,
    longitude: Option<Text<String>>,
}

impl From<RegisterUpload> for RegisterForm {
    fn from(upload: RegisterUpload) -> Self {
        Self {
            front_image: upload.front_image.map(Text::into_inner),
            left_image: upload.left_image.map(Text::into_inner),
            right_image: upload.right_image.map(Text::into_inner),
            name: upload.name.map(Text::into_inner),
            email: upload.email.map(Text::into_inner),
            password: upload.password.map(Text::into_inner),
            latitude: upload.latitude.map(Text::into_inner),
            longitude: upload.longitude.map(Text::into_inner),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyForm {
    email: Option<String>,
    task: Option<String>,
    image: Option<String>,
}

#[derive(MultipartForm)]
pub struct VerifyUpload {
    email: Option<Text<String>>,
    task: Option<Text<String>>,
    image: Option<Text<String>>,
}

impl From<VerifyUpload> for VerifyForm {
    fn from(upload: VerifyUpload) -> Self {
        Self {
            email: upload.email.map(Text::into_inner),
            task: upload.task.map(Text::into_inner),
            image: upload.image.map(Text::into_inner),
        }
    }
}

/// Form fields in either encoding a browser sends.
type FormBody<F, U> = Either<web::Form<F>, MultipartForm<U>>;

/// Extraction failures are handed to the handler so they can be answered in
/// the endpoint's error shape.
type Extracted<T> = Result<T, actix_web::Error>;

fn form_fields<F, U: Into<F> + MultipartCollect>(body: FormBody<F, U>) -> F {
    match body {
        Either::Left(form) => form.into_inner(),
        Either::Right(upload) => upload.into_inner().into(),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogVerificationRequest {
    email: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    time_taken: Option<f64>,
}

/// A JSON number or numeric string; anything else reads as absent.
fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub face_match: FaceMatch,
    pub similarity: f64,
    pub liveness_status: Liveness,
    pub task_validity: TaskValidity,
}

impl From<&VerificationOutcome> for VerifyResponse {
    fn from(outcome: &VerificationOutcome) -> Self {
        Self {
            face_match: outcome.face_match,
            similarity: outcome.similarity_rounded(),
            liveness_status: outcome.liveness,
            task_validity: outcome.task_validity,
        }
    }
}

fn status_error(code: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(code).json(json!({ "status": "error", "message": message.into() }))
}

fn plain_error(code: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(code).json(json!({ "error": message.into() }))
}

/// Trimmed, non-empty form value.
fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Status of a body that could not be extracted.
fn rejected(error: &actix_web::Error) -> StatusCode {
    let code = error.as_response_error().status_code();
    tracing::info!(status = %code, error = %error, "request body rejected");
    code
}

fn parse_coordinate(field: &Option<String>) -> Option<f64> {
    present(field).and_then(|v| v.parse().ok())
}

struct DecodedCapture {
    bytes: Vec<u8>,
    image: RgbImage,
}

fn decode(payload: &str) -> Result<DecodedCapture, DecodeError> {
    let bytes = capture::decode_payload(payload)?;
    let image = capture::decode_image(&bytes)?;
    Ok(DecodedCapture { bytes, image })
}

/// Keep the raw side captures as `{timestamp}_{i}.jpeg`. Failures only warn.
async fn save_side_captures(dir: PathBuf, captures: [Vec<u8>; 2]) {
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "capture directory unavailable");
        return;
    }
    for (i, bytes) in captures.iter().enumerate() {
        let path = dir.join(format!("{timestamp}_{}.jpeg", i + 1));
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to save registration capture");
        }
    }
}

pub async fn register(
    state: web::Data<AppState>,
    body: Extracted<FormBody<RegisterForm, RegisterUpload>>,
) -> HttpResponse {
    let form = match body {
        Ok(body) => form_fields(body),
        Err(e) => return status_error(rejected(&e), e.to_string()),
    };
    let (Some(front), Some(left), Some(right), Some(name), Some(email), Some(_password)) = (
        present(&form.front_image),
        present(&form.left_image),
        present(&form.right_image),
        present(&form.name),
        present(&form.email),
        present(&form.password),
    ) else {
        return status_error(StatusCode::BAD_REQUEST, "Missing required fields");
    };

    match state.store.user_exists(email).await {
        Ok(false) => {}
        Ok(true) => return status_error(StatusCode::BAD_REQUEST, "User already exists"),
        Err(e) => {
            tracing::error!(error = %e, "user lookup failed");
            return status_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    let payloads = [front.to_string(), left.to_string(), right.to_string()];
    let decoded = web::block(move || payloads.map(|p| decode(&p)))
        .await
        .map_err(|e| e.to_string());
    let [front, left, right] = match decoded {
        Ok([Ok(front), Ok(left), Ok(right)]) => [front, left, right],
        Ok(results) => {
            for (i, result) in results.iter().enumerate() {
                if let Err(e) = result {
                    tracing::info!(image = i + 1, error = %e, "registration capture rejected");
                }
            }
            return status_error(StatusCode::BAD_REQUEST, "Invalid image format");
        }
        Err(e) => return status_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    if let Some(dir) = state.capture_dir.clone() {
        save_side_captures(dir, [left.bytes.clone(), right.bytes.clone()]).await;
    }

    let reference = match state.engine.enroll(front.image, left.image, right.image).await {
        Ok(reference) => reference,
        Err(EngineError::Enroll(e @ EnrollError::NoFaceDetected { .. })) => {
            return status_error(StatusCode::BAD_REQUEST, e.to_string());
        }
        Err(e) => return status_error(engine_status(&e), e.to_string()),
    };

    let location = Coordinates {
        latitude: parse_coordinate(&form.latitude),
        longitude: parse_coordinate(&form.longitude),
    };
    let user = NewUser {
        email,
        name,
        profile_image: &front.bytes,
        reference: &reference,
        location,
    };
    match state.store.insert_user(user).await {
        Ok(()) => {}
        Err(StoreError::DuplicateIdentity) => {
            return status_error(StatusCode::BAD_REQUEST, "User already exists");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to persist enrollment");
            return status_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    let entry = NewLogEntry {
        email,
        name: Some(name),
        status: LogStatus::InProcess,
        verified: false,
        detail: "Registered",
        location,
        time_taken: None,
    };
    if let Err(e) = state.store.record_attempt(entry).await {
        tracing::error!(error = %e, "failed to log registration");
    }

    tracing::info!(email, dim = reference.dim(), "user registered");
    HttpResponse::Ok().json(json!({ "status": "success" }))
}

pub async fn verify(state: web::Data<AppState>, body: Extracted<FormBody<VerifyForm, VerifyUpload>>) -> HttpResponse {
    let form = match body {
        Ok(body) => form_fields(body),
        Err(e) => return plain_error(rejected(&e), e.to_string()),
    };
    let (Some(email), Some(image)) = (present(&form.email), present(&form.image)) else {
        return plain_error(StatusCode::BAD_REQUEST, "Missing email or image");
    };
    let Some(task) = present(&form.task) else {
        return plain_error(StatusCode::BAD_REQUEST, "Missing task");
    };
    let task: Task = match task.parse() {
        Ok(task) => task,
        Err(e) => return plain_error(StatusCode::BAD_REQUEST, format!("Invalid task: {e}")),
    };

    let outcome = match state.engine.verify(email, image.to_string(), task).await {
        Ok(outcome) => outcome,
        Err(EngineError::Verify(e)) => {
            let code = match &e {
                VerifyError::InvalidImageFormat(_) | VerifyError::NoFaceDetected => StatusCode::BAD_REQUEST,
                VerifyError::ReferenceNotFound => StatusCode::NOT_FOUND,
                _ => {
                    tracing::error!(email, error = %e, "verification failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            return plain_error(code, e.to_string());
        }
        Err(e) => return plain_error(engine_status(&e), e.to_string()),
    };

    let response = VerifyResponse::from(&outcome);
    actix_web::rt::spawn(record_verification(state.store.clone(), email.to_string(), outcome));

    HttpResponse::Ok().json(response)
}

/// Fire-and-forget log entry for a completed verification.
async fn record_verification(store: Store, email: String, outcome: VerificationOutcome) {
    let name = store.user_name(&email).await.ok().flatten();
    let (status, detail) = if outcome.is_verified() {
        (LogStatus::Verified, "Face verification passed".to_string())
    } else {
        (
            LogStatus::Rejected,
            format!(
                "Face verification failed: {}, {}, task {}",
                outcome.face_match, outcome.liveness, outcome.task_validity
            ),
        )
    };
    let entry = NewLogEntry {
        email: &email,
        name: name.as_deref(),
        status,
        verified: outcome.is_verified(),
        detail: &detail,
        location: Coordinates::default(),
        time_taken: None,
    };
    if let Err(e) = store.record_attempt(entry).await {
        tracing::error!(email, error = %e, "failed to log verification");
    }
}

pub async fn log_verification(state: web::Data<AppState>, body: Extracted<web::Json<LogVerificationRequest>>) -> HttpResponse {
    let body = match body {
        Ok(body) => body.into_inner(),
        Err(e) => return status_error(rejected(&e), e.to_string()),
    };
    let Some(email) = present(&body.email) else {
        return status_error(StatusCode::BAD_REQUEST, "Missing email");
    };

    let location = Coordinates { latitude: body.latitude, longitude: body.longitude };
    match state.store.mark_latest_verified(email, location, body.time_taken).await {
        Ok(true) => {
            tracing::info!(email, "login verified");
            HttpResponse::Ok().json(json!({ "status": "success", "message": "Verified successfully in db." }))
        }
        // Not found is reported in-band with 200.
        Ok(false) => status_error(StatusCode::OK, "Log entry not found."),
        Err(e) => {
            tracing::error!(email, error = %e, "failed to update log entry");
            status_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn get_logs(state: web::Data<AppState>) -> HttpResponse {
    match state.store.logs().await {
        Ok(logs) => HttpResponse::Ok().json(logs),
        Err(e) => {
            tracing::error!(error = %e, "failed to read logs");
            plain_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Timeout → 503, anything else → 500.
fn engine_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Timeout(_) => {
            tracing::warn!(error = %error, "inference timed out");
            StatusCode::SERVICE_UNAVAILABLE
        }
        other => {
            tracing::error!(error = %other, "engine failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
