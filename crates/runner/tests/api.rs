use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use runner::{router, AppState, Config};
use serde_json::{json, Value};
use std::io::Write;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const KEY: &str = "test-key";
const BOUNDARY: &str = "runner-test-boundary";

struct Harness {
	_tmp: TempDir,
	state: AppState,
	app: Router,
}

impl Harness {
	fn new() -> Self {
		let tmp = tempfile::tempdir().unwrap();
		let mut config = Config::default();
		config.server.api_key = KEY.into();
		config.storage.scripts_dir = tmp.path().join("scripts");
		config.storage.projects_dir = tmp.path().join("projects");
		config.storage.uploads_dir = tmp.path().join("uploads");
		config.storage.log_dir = tmp.path().join("logs");
		config.storage.max_file_size = 1024;
		config.supervisor.script_launcher = "sh".into();
		config.supervisor.restart_delay_ms = 100;
		config.ensure_dirs().unwrap();

		let state = AppState::new(config);
		let app = router(state.clone());
		Self { _tmp: tmp, state, app }
	}

	fn write_script(&self, name: &str, body: &str) {
		std::fs::write(self.state.config.storage.scripts_dir.join(name), body).unwrap();
	}

	async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
		let res = self.app.clone().oneshot(req).await.unwrap();
		let status = res.status();
		let bytes = res.into_body().collect().await.unwrap().to_bytes();
		let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
		(status, value)
	}

	async fn get(&self, uri: &str) -> (StatusCode, Value) {
		let req = Request::get(uri).header("x-api-key", KEY).body(Body::empty()).unwrap();
		self.send(req).await
	}

	async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
		let req = Request::post(uri)
			.header("x-api-key", KEY)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.unwrap();
		self.send(req).await
	}

	async fn post_raw(&self, uri: &str, content_type: &str, body: impl Into<Body>) -> (StatusCode, Value) {
		let req = Request::post(uri)
			.header("x-api-key", KEY)
			.header(header::CONTENT_TYPE, content_type)
			.body(body.into())
			.unwrap();
		self.send(req).await
	}

	async fn post_multipart(&self, uri: &str, parts: &[Part<'_>]) -> (StatusCode, Value) {
		let req = Request::post(uri)
			.header("x-api-key", KEY)
			.header(
				header::CONTENT_TYPE,
				format!("multipart/form-data; boundary={}", BOUNDARY),
			)
			.body(Body::from(multipart_body(parts)))
			.unwrap();
		self.send(req).await
	}

	async fn wait_for_log(&self, uri: &str, needle: &str) -> String {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		loop {
			let (_, body) = self.get(uri).await;
			let logs = body["logs"].as_str().unwrap_or_default().to_string();
			if logs.contains(needle) {
				return logs;
			}
			if tokio::time::Instant::now() > deadline {
				panic!("{} never appeared in {}: {:?}", needle, uri, logs);
			}
			tokio::time::sleep(Duration::from_millis(25)).await;
		}
	}

	async fn wait_until_stopped(&self, uri: &str) {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		while self.get(uri).await.1["running"] == true {
			if tokio::time::Instant::now() > deadline {
				panic!("{} still running", uri);
			}
			tokio::time::sleep(Duration::from_millis(25)).await;
		}
	}
}

impl Drop for Harness {
	fn drop(&mut self) {
		self.state.supervisor.shutdown();
	}
}

enum Part<'a> {
	Text(&'a str, &'a str),
	File(&'a str, &'a str, &'a [u8]),
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
	let mut out = Vec::new();
	for part in parts {
		write!(out, "--{}\r\n", BOUNDARY).unwrap();
		match part {
			Part::Text(name, value) => {
				write!(out, "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n", name, value)
					.unwrap();
			}
			Part::File(name, filename, data) => {
				write!(
					out,
					"Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
					 Content-Type: application/octet-stream\r\n\r\n",
					name, filename
				)
				.unwrap();
				out.extend_from_slice(data);
				out.extend_from_slice(b"\r\n");
			}
		}
	}
	write!(out, "--{}--\r\n", BOUNDARY).unwrap();
	out
}

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
	let mut w = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
	for (name, body) in entries {
		w.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
		w.write_all(body.as_bytes()).unwrap();
	}
	w.finish().unwrap().into_inner()
}

#[tokio::test]
async fn health_is_public() {
	let h = Harness::new();
	let (status, body) = h.send(Request::get("/api/status").body(Body::empty()).unwrap()).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["success"], true);
}

#[tokio::test]
async fn missing_or_wrong_key_is_forbidden() {
	let h = Harness::new();

	let (status, body) = h.send(Request::get("/api/list").body(Body::empty()).unwrap()).await;
	assert_eq!(status, StatusCode::FORBIDDEN);
	assert_eq!(body, json!({ "success": false, "error": "Invalid API key" }));

	let req = Request::get("/api/list").header("x-api-key", "nope").body(Body::empty()).unwrap();
	assert_eq!(h.send(req).await.0, StatusCode::FORBIDDEN);

	let req = Request::get(format!("/api/list?key={}", KEY)).body(Body::empty()).unwrap();
	assert_eq!(h.send(req).await.0, StatusCode::OK);
}

#[tokio::test]
async fn upload_then_list_and_download() {
	let h = Harness::new();
	let (status, body) = h
		.post_multipart(
			"/api/upload",
			&[Part::Text("name", "bot.js"), Part::File("script", "local.js", b"echo hi\n")],
		)
		.await;
	assert_eq!(status, StatusCode::OK, "{}", body);
	assert_eq!(body["name"], "bot.js");

	let (_, list) = h.get("/api/list").await;
	assert_eq!(list["scripts"], json!([{ "name": "bot.js", "running": false }]));

	let req = Request::get("/api/download?name=bot.js")
		.header("x-api-key", KEY)
		.body(Body::empty())
		.unwrap();
	let res = h.app.clone().oneshot(req).await.unwrap();
	assert_eq!(res.status(), StatusCode::OK);
	let disposition = res.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
	assert!(disposition.contains("bot.js"));
	let bytes = res.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&bytes[..], b"echo hi\n");

	// no temp files left behind
	let leftovers = std::fs::read_dir(&h.state.config.storage.uploads_dir).unwrap().count();
	assert_eq!(leftovers, 0);
	let scripts = std::fs::read_dir(&h.state.config.storage.scripts_dir).unwrap().count();
	assert_eq!(scripts, 1);
}

#[tokio::test]
async fn upload_over_route_limit_is_payload_too_large() {
	let h = Harness::new();
	let huge = vec![b'a'; 256 * 1024];
	let (status, body) = h
		.post_multipart("/api/upload", &[Part::File("script", "huge.js", &huge)])
		.await;
	assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
	assert_eq!(body["success"], false);
	assert!(h.get("/api/list").await.1["scripts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn upload_rejects_non_js_and_oversized() {
	let h = Harness::new();
	let (status, _) = h
		.post_multipart("/api/upload", &[Part::File("script", "notes.txt", b"x")])
		.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);

	let big = vec![b'a'; 2048];
	let (status, _) = h
		.post_multipart("/api/upload", &[Part::File("script", "big.js", &big)])
		.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);

	let (status, _) = h.post_multipart("/api/upload", &[Part::Text("name", "x.js")]).await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn save_overwrites_existing_only() {
	let h = Harness::new();
	h.write_script("job.js", "old");

	let (status, _) = h.post_json("/api/save", json!({ "name": "job.js", "content": "new" })).await;
	assert_eq!(status, StatusCode::OK);
	let saved = std::fs::read_to_string(h.state.config.storage.scripts_dir.join("job.js")).unwrap();
	assert_eq!(saved, "new");

	let (status, _) = h.post_json("/api/save", json!({ "name": "ghost.js", "content": "x" })).await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn start_logs_stop_script() {
	let h = Harness::new();
	h.write_script("loop.js", "echo hello-from-loop\nexec sleep 30\n");

	let (status, body) = h.post_json("/api/start", json!({ "name": "loop.js" })).await;
	assert_eq!(status, StatusCode::OK, "{}", body);
	assert_eq!(body["key"], "script:loop.js");
	let pid = body["pid"].as_u64().unwrap();
	assert!(pid > 0);

	let (_, again) = h.post_json("/api/start", json!({ "name": "loop.js" })).await;
	assert_eq!(again["pid"].as_u64(), Some(pid));
	assert_eq!(again["message"], "Already running");

	h.wait_for_log("/api/logs?name=loop.js", "[OUT ").await;
	let (_, running) = h.get("/api/is-running?name=loop.js&kind=script").await;
	assert_eq!(running["running"], true);
	let (_, all) = h.get("/api/running").await;
	assert_eq!(all["running"][0]["key"], "script:loop.js");

	let (status, _) = h.post_json("/api/stop", json!({ "name": "loop.js" })).await;
	assert_eq!(status, StatusCode::OK);
	let logs = h.wait_for_log("/api/logs?name=loop.js", "[EXIT ").await;
	assert!(logs.contains("signal=SIGTERM"), "{}", logs);
	h.wait_until_stopped("/api/is-running?name=loop.js").await;

	let (status, _) = h.post_json("/api/stop", json!({ "name": "loop.js" })).await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn padded_name_resolves_to_one_entity() {
	let h = Harness::new();
	h.write_script("loop.js", "exec sleep 30\n");

	let (status, body) = h.post_json("/api/start", json!({ "name": " loop.js " })).await;
	assert_eq!(status, StatusCode::OK, "{}", body);
	assert_eq!(body["key"], "script:loop.js");

	let (_, list) = h.get("/api/list").await;
	assert_eq!(list["scripts"], json!([{ "name": "loop.js", "running": true }]));

	let (status, _) = h.post_json("/api/stop", json!({ "name": "loop.js" })).await;
	assert_eq!(status, StatusCode::OK);
	h.wait_until_stopped("/api/is-running?name=loop.js").await;
}

#[tokio::test]
async fn form_encoded_bodies_are_accepted() {
	let h = Harness::new();
	h.write_script("form.js", "exec sleep 30\n");

	let form = "application/x-www-form-urlencoded";
	let (status, body) = h.post_raw("/api/start", form, "name=form.js&autoRestart=false").await;
	assert_eq!(status, StatusCode::OK, "{}", body);
	assert_eq!(body["key"], "script:form.js");

	let (status, body) = h.post_raw("/api/stop", form, "name=form.js").await;
	assert_eq!(status, StatusCode::OK, "{}", body);
	h.wait_until_stopped("/api/is-running?name=form.js").await;

	let (status, _) = h.post_raw("/api/save", form, "name=form.js&content=echo+saved").await;
	assert_eq!(status, StatusCode::OK);
	let saved = std::fs::read_to_string(h.state.config.storage.scripts_dir.join("form.js")).unwrap();
	assert_eq!(saved, "echo saved");
}

#[tokio::test]
async fn unreadable_bodies_get_json_errors() {
	let h = Harness::new();

	let (status, body) = h.post_raw("/api/start", "text/plain", "name=x").await;
	assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
	assert_eq!(body["success"], false);
	assert!(body["error"].is_string());

	let (status, body) = h.post_raw("/api/start", "application/json", "{not json").await;
	assert!(status.is_client_error());
	assert_eq!(body["success"], false);

	let (status, body) = h.get("/api/logs?name=x&tail=lots").await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["success"], false);

	let (status, body) = h.post_json("/api/upload", json!({})).await;
	assert!(status.is_client_error());
	assert_eq!(body["success"], false);
}

#[tokio::test]
async fn start_missing_script_is_404() {
	let h = Harness::new();
	let (status, body) = h.post_json("/api/start", json!({ "name": "nope.js" })).await;
	assert_eq!(status, StatusCode::NOT_FOUND);
	assert_eq!(body["success"], false);

	let (status, _) = h.post_json("/api/start", json!({})).await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn logs_for_unknown_entity_are_empty() {
	let h = Harness::new();
	let (status, body) = h.get("/api/logs?name=never.js").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["logs"], "");
	assert_eq!(body["running"], false);
}

#[tokio::test]
async fn extract_and_run_project() {
	let h = Harness::new();
	let archive = zip_bytes(&[("run.sh", "echo project-up\nexec sleep 30\n"), ("lib/a.txt", "a")]);

	let (status, body) = h
		.post_multipart(
			"/api/projects/extract",
			&[Part::Text("projectName", "site"), Part::File("archive", "bundle.zip", &archive)],
		)
		.await;
	assert_eq!(status, StatusCode::OK, "{}", body);
	assert_eq!(body["project"], "site");
	assert_eq!(body["files"], 2);

	let (_, list) = h.get("/api/projects").await;
	assert_eq!(list["projects"], json!([{ "name": "site", "running": false }]));

	let (status, body) = h
		.post_json("/api/projects/start", json!({ "name": "site", "command": "sh run.sh" }))
		.await;
	assert_eq!(status, StatusCode::OK, "{}", body);
	assert_eq!(body["key"], "project:site");

	h.wait_for_log("/api/projects/logs?name=site", "project-up").await;

	let (status, _) = h.post_json("/api/projects/stop", json!({ "name": "site" })).await;
	assert_eq!(status, StatusCode::OK);
	h.wait_for_log("/api/projects/logs?name=site", "[EXIT ").await;
}

#[tokio::test]
async fn extract_without_name_uses_archive_stem() {
	let h = Harness::new();
	let archive = zip_bytes(&[("index.js", "1")]);
	let (status, body) = h
		.post_multipart("/api/projects/extract", &[Part::File("archive", "demo.zip", &archive)])
		.await;
	assert_eq!(status, StatusCode::OK, "{}", body);
	assert_eq!(body["project"], "demo");
	assert!(h.state.config.storage.projects_dir.join("demo/index.js").exists());
}

#[tokio::test]
async fn extract_rejects_garbage() {
	let h = Harness::new();
	let (status, _) = h
		.post_multipart(
			"/api/projects/extract",
			&[Part::File("archive", "bad.zip", b"definitely not a zip")],
		)
		.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn project_start_requires_existing_dir_and_command() {
	let h = Harness::new();
	let (status, _) = h
		.post_json("/api/projects/start", json!({ "name": "ghost", "command": "true" }))
		.await;
	assert_eq!(status, StatusCode::NOT_FOUND);

	std::fs::create_dir_all(h.state.config.storage.projects_dir.join("real")).unwrap();
	let (status, _) = h.post_json("/api/projects/start", json!({ "name": "real" })).await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
}
