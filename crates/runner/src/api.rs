use axum::body::Body;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use herd::{EntityKind, EntitySummary, LaunchSpec, StartOutcome, StopOutcome, Supervisor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::extract;
use crate::payload::{Params, Payload};
use crate::storage;

const DEFAULT_TAIL: usize = 2000;
const MULTIPART_SLACK: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
	pub supervisor: Arc<Supervisor>,
	pub config: Arc<Config>,
}

impl AppState {
	pub fn new(config: Config) -> Self {
		let supervisor = Supervisor::new(config.supervisor_config());
		Self {
			supervisor,
			config: Arc::new(config),
		}
	}

	fn log_dir(&self, kind: EntityKind) -> PathBuf {
		match kind {
			EntityKind::Script => self.config.script_log_dir(),
			EntityKind::Project => self.config.project_log_dir(),
		}
	}
}

pub fn router(state: AppState) -> Router {
	let script_limit = DefaultBodyLimit::max(state.config.storage.max_file_size + MULTIPART_SLACK);
	let archive_limit = DefaultBodyLimit::max(state.config.storage.max_archive_size + MULTIPART_SLACK);

	let protected = Router::new()
		.route("/status", get(status))
		.route("/api/upload", post(upload_script).layer(script_limit))
		.route("/api/list", get(list_scripts))
		.route("/api/download", get(download_script))
		.route("/api/save", post(save_script).layer(script_limit))
		.route("/api/start", post(start_script))
		.route("/api/stop", post(stop_script))
		.route("/api/logs", get(script_logs))
		.route("/api/running", get(list_running))
		.route("/api/is-running", get(is_running))
		.route("/api/projects", get(list_projects))
		.route("/api/projects/extract", post(extract_project).layer(archive_limit))
		.route("/api/projects/start", post(start_project))
		.route("/api/projects/stop", post(stop_project))
		.route("/api/projects/logs", get(project_logs))
		.route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

	Router::new()
		.route("/api/status", get(status))
		.merge(protected)
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}

// ── responses ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusResponse {
	success: bool,
	msg: &'static str,
}

#[derive(Serialize)]
struct MessageResponse {
	success: bool,
	message: String,
}

impl MessageResponse {
	fn ok(message: impl Into<String>) -> Json<Self> {
		Json(Self { success: true, message: message.into() })
	}
}

#[derive(Serialize)]
struct UploadResponse {
	success: bool,
	message: &'static str,
	name: String,
}

#[derive(Serialize)]
struct EntryInfo {
	name: String,
	running: bool,
}

#[derive(Serialize)]
struct ScriptListResponse {
	success: bool,
	scripts: Vec<EntryInfo>,
}

#[derive(Serialize)]
struct ProjectListResponse {
	success: bool,
	projects: Vec<EntryInfo>,
}

#[derive(Serialize)]
struct StartResponse {
	success: bool,
	pid: u32,
	key: String,
	message: &'static str,
}

impl From<StartOutcome> for StartResponse {
	fn from(outcome: StartOutcome) -> Self {
		let message = if outcome.is_fresh() { "Started" } else { "Already running" };
		let summary = outcome.summary();
		Self {
			success: true,
			pid: summary.pid,
			key: summary.key.clone(),
			message,
		}
	}
}

#[derive(Serialize)]
struct LogsResponse {
	success: bool,
	logs: String,
	running: bool,
}

#[derive(Serialize)]
struct RunningResponse {
	success: bool,
	running: Vec<EntitySummary>,
}

#[derive(Serialize)]
struct IsRunningResponse {
	success: bool,
	running: bool,
}

#[derive(Serialize)]
struct ExtractResponse {
	success: bool,
	project: String,
	path: String,
	files: usize,
}

// ── requests ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NameRequest {
	name: Option<String>,
}

#[derive(Deserialize)]
struct SaveRequest {
	name: Option<String>,
	#[serde(default)]
	content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartScriptRequest {
	name: Option<String>,
	#[serde(default)]
	auto_restart: bool,
	#[serde(default)]
	env: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartProjectRequest {
	name: Option<String>,
	command: Option<String>,
	#[serde(default)]
	auto_restart: bool,
	#[serde(default)]
	env: HashMap<String, String>,
}

#[derive(Deserialize)]
struct LogsQuery {
	name: Option<String>,
	tail: Option<usize>,
}

#[derive(Deserialize)]
struct IsRunningQuery {
	name: Option<String>,
	kind: Option<EntityKind>,
}

fn required(value: Option<String>, field: &str) -> AppResult<String> {
	match value.as_deref().map(str::trim) {
		Some(v) if !v.is_empty() => Ok(v.to_string()),
		_ => Err(AppError::BadRequest(format!("{} required", field))),
	}
}

/// The one name an entity is known by: its file or directory name, registry
/// key and log file all derive from it.
fn entity_name(value: Option<String>) -> AppResult<String> {
	storage::safe_name(&required(value, "name")?)
}

// ── health ───────────────────────────────────────────────────────────────────

async fn status() -> Json<StatusResponse> {
	Json(StatusResponse { success: true, msg: "runner ok" })
}

// ── scripts ──────────────────────────────────────────────────────────────────

async fn upload_script(
	State(state): State<AppState>,
	multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<UploadResponse>> {
	let storage = &state.config.storage;
	let mut multipart = multipart?;
	let mut provided_name: Option<String> = None;
	let mut upload = None;

	while let Some(field) = multipart.next_field().await? {
		match field.name() {
			Some("name") => {
				let text = field.text().await?;
				if !text.trim().is_empty() {
					provided_name = Some(text);
				}
			}
			Some("script") => {
				let filename = field.file_name().unwrap_or_default().to_string();
				if !filename.ends_with(storage::SCRIPT_EXTENSION) {
					return Err(AppError::BadRequest("Only .js allowed".into()));
				}
				let data = field.bytes().await?;
				if data.len() > storage.max_file_size {
					return Err(AppError::BadRequest(format!(
						"File too large (max {} bytes)",
						storage.max_file_size
					)));
				}
				upload = Some((filename, data));
			}
			_ => {}
		}
	}

	let (filename, data) = upload.ok_or_else(|| AppError::BadRequest("No file uploaded".into()))?;
	let name = storage::safe_name(provided_name.as_deref().unwrap_or(&filename))?;
	storage::write_atomic(storage.scripts_dir.join(&name), data).await?;

	tracing::info!("uploaded script {}", name);
	Ok(Json(UploadResponse { success: true, message: "Uploaded", name }))
}

async fn list_scripts(State(state): State<AppState>) -> AppResult<Json<ScriptListResponse>> {
	let names = storage::list_scripts(&state.config.storage.scripts_dir).await?;
	let scripts = names
		.into_iter()
		.map(|name| EntryInfo {
			running: state.supervisor.is_running(EntityKind::Script, &name),
			name,
		})
		.collect();
	Ok(Json(ScriptListResponse { success: true, scripts }))
}

async fn download_script(
	State(state): State<AppState>,
	Params(query): Params<NameRequest>,
) -> AppResult<Response> {
	let name = entity_name(query.name)?;
	let path = state.config.storage.scripts_dir.join(&name);
	let data = match tokio::fs::read(&path).await {
		Ok(d) => d,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			return Err(AppError::NotFound("Not found".into()))
		}
		Err(e) => return Err(AppError::internal(e)),
	};

	Ok((
		StatusCode::OK,
		[
			(header::CONTENT_TYPE, "application/octet-stream".to_string()),
			(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", name)),
		],
		Body::from(data),
	)
		.into_response())
}

async fn save_script(
	State(state): State<AppState>,
	Payload(req): Payload<SaveRequest>,
) -> AppResult<Json<MessageResponse>> {
	let name = entity_name(req.name)?;
	let path = state.config.storage.scripts_dir.join(&name);
	if !path.is_file() {
		return Err(AppError::NotFound("not found".into()));
	}
	storage::write_atomic(path, req.content.into()).await?;
	Ok(MessageResponse::ok("Saved"))
}

async fn start_script(
	State(state): State<AppState>,
	Payload(req): Payload<StartScriptRequest>,
) -> AppResult<Json<StartResponse>> {
	let name = entity_name(req.name)?;
	let path = state.config.storage.scripts_dir.join(&name);
	if !path.is_file() {
		return Err(AppError::NotFound("not found".into()));
	}

	let spec = LaunchSpec::script(name, path, state.log_dir(EntityKind::Script))
		.auto_restart(req.auto_restart)
		.env(req.env);
	let outcome = state.supervisor.start(spec)?;
	Ok(Json(outcome.into()))
}

async fn stop_script(
	State(state): State<AppState>,
	Payload(req): Payload<NameRequest>,
) -> AppResult<Json<MessageResponse>> {
	stop(&state, EntityKind::Script, req.name)
}

async fn script_logs(
	State(state): State<AppState>,
	Params(query): Params<LogsQuery>,
) -> AppResult<Json<LogsResponse>> {
	logs(&state, EntityKind::Script, query).await
}

// ── projects ─────────────────────────────────────────────────────────────────

async fn list_projects(State(state): State<AppState>) -> AppResult<Json<ProjectListResponse>> {
	let names = storage::list_projects(&state.config.storage.projects_dir).await?;
	let projects = names
		.into_iter()
		.map(|name| EntryInfo {
			running: state.supervisor.is_running(EntityKind::Project, &name),
			name,
		})
		.collect();
	Ok(Json(ProjectListResponse { success: true, projects }))
}

async fn extract_project(
	State(state): State<AppState>,
	multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<ExtractResponse>> {
	let storage = &state.config.storage;
	let mut multipart = multipart?;
	let mut provided_name: Option<String> = None;
	let mut upload = None;

	while let Some(field) = multipart.next_field().await? {
		match field.name() {
			Some("projectName") => {
				let text = field.text().await?;
				if !text.trim().is_empty() {
					provided_name = Some(text);
				}
			}
			Some("archive") => {
				let filename = field.file_name().unwrap_or("project.zip").to_string();
				let data = field.bytes().await?;
				if data.len() > storage.max_archive_size {
					return Err(AppError::BadRequest(format!(
						"Archive too large (max {} bytes)",
						storage.max_archive_size
					)));
				}
				let staged = storage::stage_upload(storage.uploads_dir.clone(), data).await?;
				upload = Some((filename, staged));
			}
			_ => {}
		}
	}

	let (filename, staged) =
		upload.ok_or_else(|| AppError::BadRequest("No file (field: archive)".into()))?;
	let raw_name = provided_name.unwrap_or_else(|| strip_zip_suffix(&filename).to_string());
	let (project, dest, files) = unpack(staged.path(), &storage.projects_dir, &raw_name).await?;

	tracing::info!("extracted {} files into project {}", files, project);
	Ok(Json(ExtractResponse {
		success: true,
		project,
		path: dest.to_string_lossy().to_string(),
		files,
	}))
}

async fn unpack(archive: &Path, projects_dir: &Path, raw_name: &str) -> AppResult<(String, PathBuf, usize)> {
	let project = storage::safe_name(raw_name)?;
	let dest = projects_dir.join(&project);
	let archive = archive.to_path_buf();
	let target = dest.clone();
	let files = tokio::task::spawn_blocking(move || extract::extract_zip(&archive, &target))
		.await
		.map_err(AppError::internal)?
		.map_err(|e| match e {
			extract::ExtractError::Zip(z) => AppError::BadRequest(format!("invalid archive: {}", z)),
			other => AppError::internal(other),
		})?;
	Ok((project, dest, files))
}

fn strip_zip_suffix(filename: &str) -> &str {
	let len = filename.len();
	if len >= 4 && filename.is_char_boundary(len - 4) && filename[len - 4..].eq_ignore_ascii_case(".zip") {
		&filename[..len - 4]
	} else {
		filename
	}
}

async fn start_project(
	State(state): State<AppState>,
	Payload(req): Payload<StartProjectRequest>,
) -> AppResult<Json<StartResponse>> {
	let name = entity_name(req.name)?;
	let command = required(req.command, "command")?;
	let dir = state.config.storage.projects_dir.join(&name);
	if !dir.is_dir() {
		return Err(AppError::NotFound("not found".into()));
	}

	let spec = LaunchSpec::project(name, command, dir, state.log_dir(EntityKind::Project))
		.auto_restart(req.auto_restart)
		.env(req.env);
	let outcome = state.supervisor.start(spec)?;
	Ok(Json(outcome.into()))
}

async fn stop_project(
	State(state): State<AppState>,
	Payload(req): Payload<NameRequest>,
) -> AppResult<Json<MessageResponse>> {
	stop(&state, EntityKind::Project, req.name)
}

async fn project_logs(
	State(state): State<AppState>,
	Params(query): Params<LogsQuery>,
) -> AppResult<Json<LogsResponse>> {
	logs(&state, EntityKind::Project, query).await
}

// ── shared ───────────────────────────────────────────────────────────────────

fn stop(state: &AppState, kind: EntityKind, name: Option<String>) -> AppResult<Json<MessageResponse>> {
	let name = entity_name(name)?;
	let message = match state.supervisor.stop(kind, &name)? {
		StopOutcome::Signalled { .. } => "Stopped",
		StopOutcome::RestartCancelled => "Restart cancelled",
	};
	Ok(MessageResponse::ok(message))
}

async fn logs(state: &AppState, kind: EntityKind, query: LogsQuery) -> AppResult<Json<LogsResponse>> {
	let name = entity_name(query.name)?;
	let tail = query.tail.unwrap_or(DEFAULT_TAIL);
	let result = state
		.supervisor
		.tail_log(kind, &name, &state.log_dir(kind), tail)
		.await?;
	Ok(Json(LogsResponse {
		success: true,
		logs: result.logs,
		running: result.running,
	}))
}

async fn list_running(State(state): State<AppState>) -> Json<RunningResponse> {
	Json(RunningResponse {
		success: true,
		running: state.supervisor.list_running(),
	})
}

async fn is_running(
	State(state): State<AppState>,
	Params(query): Params<IsRunningQuery>,
) -> AppResult<Json<IsRunningResponse>> {
	let name = entity_name(query.name)?;
	let kind = query.kind.unwrap_or(EntityKind::Script);
	Ok(Json(IsRunningResponse {
		success: true,
		running: state.supervisor.is_running(kind, &name),
	}))
}
