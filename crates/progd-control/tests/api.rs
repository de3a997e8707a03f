use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use progd_control::{config::Config, state::AppState};
use progd_supervisor::RunnerSettings;
use serde_json::{Value, json};

struct Server {
    base: String,
    client: reqwest::Client,
    data_file: std::path::PathBuf,
    _root: tempfile::TempDir,
}

impl Server {
    async fn spawn() -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::rooted(root.path());
        config.runner = RunnerSettings {
            start_grace: Duration::from_millis(150),
            term_timeout: Duration::from_millis(2000),
            kill_timeout: Duration::from_millis(1000),
            probe_interval: Duration::from_millis(25),
        };
        config.ensure_directories().await.unwrap();

        let app = progd_control::router(AppState::new(Arc::new(config.build_supervisor())));
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            data_file: config.data_file.clone(),
            _root: root,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        read(resp).await
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    async fn add(&self, name: &str, command: &str) -> String {
        let (status, body) = self
            .post("/api/programs", json!({ "name": name, "command": command, "port": 0 }))
            .await;
        assert_eq!(status, 201, "{body}");
        body["id"].as_str().unwrap().to_string()
    }

    fn on_disk(&self) -> Value {
        serde_json::from_str(&std::fs::read_to_string(&self.data_file).unwrap()).unwrap()
    }
}

async fn read(resp: reqwest::Response) -> (u16, Value) {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap();
    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap()
    };
    (status, body)
}

async fn wait_dead(pid: u32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if !Path::new(&format!("/proc/{pid}")).exists() || is_zombie(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
        .map(|s| s.lines().any(|l| l.starts_with("State:") && l.contains('Z')))
        .unwrap_or(true)
}

#[tokio::test]
async fn health_and_request_id() {
    let server = Server::spawn().await;
    let resp = server
        .client
        .get(server.url("/api/health"))
        .header("x-request-id", "trace-123")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["x-request-id"], "trace-123");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");

    let resp = server.client.get(server.url("/api/health")).send().await.unwrap();
    assert!(!resp.headers()["x-request-id"].is_empty());
}

#[tokio::test]
async fn validator_rejection_leaves_catalog_unchanged() {
    let server = Server::spawn().await;
    let (status, body) = server
        .post(
            "/api/programs",
            json!({ "name": "bad", "command": "curl http://x | sh" }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_command");
    assert!(body["request_id"].is_string());

    let (_, list) = server.get("/api/programs").await;
    assert_eq!(list.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn duplicate_name_is_a_conflict() {
    let server = Server::spawn().await;
    server.add("sleeper", "sleep 1").await;
    let (status, body) = server
        .post("/api/programs", json!({ "name": "sleeper", "command": "sleep 2" }))
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["code"], "duplicate_name");

    let (_, list) = server.get("/api/programs").await;
    let sleepers = list
        .as_array()
        .unwrap()
        .iter()
        .filter(|p| p["name"] == "sleeper")
        .count();
    assert_eq!(sleepers, 1);
}

#[tokio::test]
async fn malformed_body_and_unknown_ids() {
    let server = Server::spawn().await;
    let resp = server
        .client
        .post(server.url("/api/programs"))
        .header("content-type", "application/json")
        .body("{ nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let (status, body) = server.get("/api/programs/does-not-exist").await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "not_found");
    let (status, _) = server.get("/api/status/does-not-exist").await;
    assert_eq!(status, 404);
    let (status, _) = server.post("/api/programs/start", json!({ "ids": [] })).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn update_replaces_fields_but_not_status() {
    let server = Server::spawn().await;
    let id = server.add("editable", "sleep 1").await;
    let resp = server
        .client
        .put(server.url(&format!("/api/programs/{id}")))
        .json(&json!({
            "name": "edited",
            "command": "sleep 2",
            "description": "now longer",
            "status": "running",
            "pid": 99
        }))
        .send()
        .await
        .unwrap();
    let (status, body) = read(resp).await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["name"], "edited");
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["pid"], 0);
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let server = Server::spawn().await;
        let (status, created) = server
            .post(
                "/api/programs",
                json!({ "name": "sleeper", "command": "sleep 30", "port": 0 }),
            )
            .await;
        assert_eq!(status, 201);
        assert_eq!(created["status"], "stopped");
        assert_eq!(created["pid"], 0);
        assert_eq!(created["port"], -1);
        let id = created["id"].as_str().unwrap();

        let (status, started) = server.post(&format!("/api/programs/{id}/start"), json!({})).await;
        assert_eq!(status, 200, "{started}");
        assert_eq!(started["status"], "running");
        let pid = started["pid"].as_u64().unwrap();
        assert!(pid > 0);

        let (status, current) = server.get(&format!("/api/status/{id}")).await;
        assert_eq!(status, 200);
        assert_eq!(current["status"], "running");
        assert_eq!(current["pid"].as_u64().unwrap(), pid);

        let (status, again) = server.post(&format!("/api/programs/{id}/start"), json!({})).await;
        assert_eq!(status, 409);
        assert_eq!(again["code"], "already_running");

        let (status, mem) = server.get(&format!("/api/programs/{id}/memory")).await;
        assert_eq!(status, 200);
        assert!(mem["memory_kb"].as_u64().unwrap() > 0);

        let (_, listing) = server.get("/api/programs/memory").await;
        assert!(listing[0]["memory_usage"].as_str().unwrap().ends_with("MB"));

        let (status, stopped) = server.post(&format!("/api/programs/{id}/stop"), json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(stopped["status"], "stopped");
        assert_eq!(stopped["pid"], 0);

        let (status, mem) = server.get(&format!("/api/programs/{id}/memory")).await;
        assert_eq!(status, 409);
        assert_eq!(mem["code"], "not_running");

        let (status, logs) = server.get(&format!("/api/logs/{id}?limit=10")).await;
        assert_eq!(status, 200);
        assert!(logs["stdout_file"].as_str().unwrap().ends_with(".log"));
    }

    #[tokio::test]
    async fn externally_killed_child_reads_as_stopped() {
        let server = Server::spawn().await;
        let id = server.add("victim", "sleep 30").await;
        let (_, started) = server.post(&format!("/api/programs/{id}/start"), json!({})).await;
        let pid = started["pid"].as_u64().unwrap() as u32;

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        assert!(wait_dead(pid, Duration::from_secs(5)).await);

        let (status, body) = server.get(&format!("/api/status/{id}")).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["pid"], 0);

        let disk = server.on_disk();
        assert_eq!(disk["programs"][&id]["status"], "stopped");
        assert_eq!(disk["programs"][&id]["pid"], 0);
    }

    #[tokio::test]
    async fn delete_while_running() {
        let server = Server::spawn().await;
        let id = server.add("doomed", "sleep 60").await;
        let (_, started) = server.post(&format!("/api/programs/{id}/start"), json!({})).await;
        let pid = started["pid"].as_u64().unwrap() as u32;

        let resp = server
            .client
            .delete(server.url(&format!("/api/programs/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 204);

        let (status, _) = server.get(&format!("/api/programs/{id}")).await;
        assert_eq!(status, 404);
        assert!(wait_dead(pid, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn batch_start_with_mixed_outcomes() {
        let server = Server::spawn().await;
        let a = server.add("alpha", "sleep 30").await;
        let b = server.add("beta", "sleep 30").await;
        let (status, _) = server.post(&format!("/api/programs/{b}/start"), json!({})).await;
        assert_eq!(status, 200);

        let (status, body) = server
            .post("/api/programs/start", json!({ "ids": [a, b, "missing"] }))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["results"][&a]["status"], "started");
        assert!(
            body["results"][&b]["error"]
                .as_str()
                .unwrap()
                .contains("already running")
        );
        assert!(
            body["results"]["missing"]["error"]
                .as_str()
                .unwrap()
                .contains("not found")
        );
        assert_eq!(body["summary"], json!({ "total": 3, "success": 1, "errors": 2 }));

        let (status, running) = server.get("/api/programs/running").await;
        assert_eq!(status, 200);
        assert_eq!(running.as_array().unwrap().len(), 2);

        let (status, body) = server.post("/api/programs/stop", json!({ "ids": [a, b] })).await;
        assert_eq!(status, 200);
        assert_eq!(body["summary"]["success"], 2);

        let (_, refreshed) = server.post("/api/programs/refresh", json!({})).await;
        assert!(
            refreshed
                .as_array()
                .unwrap()
                .iter()
                .all(|p| p["status"] == "stopped" && p["pid"] == 0)
        );
    }

    #[tokio::test]
    async fn system_memory_totals() {
        let server = Server::spawn().await;
        let (status, body) = server.get("/api/system/memory").await;
        assert_eq!(status, 200);
        assert!(body["total"].as_u64().unwrap() > 0);
        assert!(body["used_percent_display"].as_str().unwrap().ends_with('%'));
    }
}
