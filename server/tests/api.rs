//! HTTP surface tests against a live server over a mocked item API.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use pubdatahub_core::DownloadConfig;
use pubdatahub_core::JobManager;
use pubdatahub_core::JobManagerConfig;
use pubdatahub_core::SourceRegistry;
use pubdatahub_core::hn::HackerNewsSource;
use pubdatahub_server::AppContext;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Request;
use wiremock::Respond;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path_regex;

struct ItemApi {
    max_id: i64,
    missing: HashSet<i64>,
    delay: Duration,
}

impl Respond for ItemApi {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path();
        if path.ends_with("/maxitem.json") {
            return ResponseTemplate::new(200).set_body_string(self.max_id.to_string());
        }
        let id: i64 = path
            .trim_end_matches(".json")
            .rsplit('/')
            .next()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let template = ResponseTemplate::new(200).set_delay(self.delay);
        if id < 1 || id > self.max_id || self.missing.contains(&id) {
            return template.set_body_string("null");
        }
        template.set_body_json(serde_json::json!({
            "id": id,
            "type": "story",
            "by": format!("user{id}"),
            "time": 1_700_000_000 + id,
        }))
    }
}

struct TestHarness {
    base: String,
    _storage: tempfile::TempDir,
    _remote: MockServer,
}

async fn start_server(max_id: i64, item_delay: Duration) -> TestHarness {
    let remote = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v0/.*\.json$"))
        .respond_with(ItemApi {
            max_id,
            missing: HashSet::new(),
            delay: item_delay,
        })
        .mount(&remote)
        .await;

    let config = DownloadConfig {
        batch_size: 25,
        rate_limit: 10_000,
        rate_interval_secs: 1,
        http_timeout_secs: 5,
        density_skip_threshold: 0.9,
    };
    let source =
        HackerNewsSource::with_base_url(&config, &format!("{}/v0", remote.uri())).expect("source");
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(source));

    let storage = tempfile::tempdir().expect("tempdir");
    let context = Arc::new(AppContext {
        registry,
        manager: JobManager::start(JobManagerConfig::default(), None),
        storage_root: storage.path().to_path_buf(),
    });

    let (addr_tx, addr_rx) = tokio::sync::oneshot::channel::<SocketAddr>();
    tokio::spawn(async move {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let _ = pubdatahub_server::serve(addr, context, |bound| {
            let _ = addr_tx.send(bound);
        })
        .await;
    });
    let bound = addr_rx.await.expect("server bound");
    TestHarness {
        base: format!("http://{bound}"),
        _storage: storage,
        _remote: remote,
    }
}

async fn wait_for_job_status(base: &str, id: &str, wanted: &str) -> serde_json::Value {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let jobs: serde_json::Value = client
            .get(format!("{base}/api/jobs"))
            .send()
            .await
            .expect("list jobs")
            .json()
            .await
            .expect("decode jobs");
        let found = jobs
            .as_array()
            .and_then(|jobs| jobs.iter().find(|job| job["id"] == id).cloned());
        if let Some(job) = found
            && job["status"] == wanted
        {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {id} to reach {wanted}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let harness = start_server(5, Duration::ZERO).await;
    let body: serde_json::Value = reqwest::get(format!("{}/health", harness.base))
        .await
        .expect("health")
        .json()
        .await
        .expect("decode");
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn sources_are_listed_with_descriptions() {
    let harness = start_server(5, Duration::ZERO).await;
    let body: serde_json::Value = reqwest::get(format!("{}/api/sources", harness.base))
        .await
        .expect("sources")
        .json()
        .await
        .expect("decode");
    let sources = body.as_array().expect("array");
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["name"], "hackernews");
    assert!(
        sources[0]["description"]
            .as_str()
            .is_some_and(|text| !text.is_empty())
    );
}

#[tokio::test]
async fn download_job_flow_end_to_end() {
    let harness = start_server(10, Duration::ZERO).await;
    let client = reqwest::Client::new();

    // Missing source is a 400.
    let response = client
        .post(format!("{}/api/jobs/download", harness.base))
        .json(&serde_json::json!({}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Real source: 201 plus the job snapshot.
    let response = client
        .post(format!("{}/api/jobs/download", harness.base))
        .json(&serde_json::json!({"source": "hackernews"}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let job: serde_json::Value = response.json().await.expect("decode job");
    let id = job["id"].as_str().expect("job id").to_string();
    assert_eq!(job["kind"], "download");

    wait_for_job_status(&harness.base, &id, "completed").await;

    // The ingested corpus is readable through the paginated data endpoint.
    let page: serde_json::Value = client
        .get(format!(
            "{}/api/sources/hackernews/data?page=2&limit=4",
            harness.base
        ))
        .send()
        .await
        .expect("data")
        .json()
        .await
        .expect("decode page");
    assert_eq!(page["page"], 2);
    assert_eq!(page["count"], 4);
    let id_column = page["columns"]
        .as_array()
        .expect("columns")
        .iter()
        .position(|column| column == "id")
        .expect("id column");
    let first_row_id = &page["rows"][0][id_column];
    assert_eq!(first_row_id, 5, "page 2 with limit 4 starts at id 5");
}

#[tokio::test]
async fn data_endpoint_validates_input() {
    let harness = start_server(5, Duration::ZERO).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/sources/nope/data", harness.base))
        .send()
        .await
        .expect("get");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = client
        .get(format!(
            "{}/api/sources/hackernews/data?page=0",
            harness.base
        ))
        .send()
        .await
        .expect("get");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pause_and_resume_over_http() {
    // 15 ms per item keeps the run alive long enough to pause it.
    let harness = start_server(100, Duration::from_millis(15)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/jobs/download", harness.base))
        .json(&serde_json::json!({"source": "hackernews"}))
        .send()
        .await
        .expect("post");
    let job: serde_json::Value = response.json().await.expect("decode");
    let id = job["id"].as_str().expect("id").to_string();
    wait_for_job_status(&harness.base, &id, "running").await;

    let response = client
        .post(format!("{}/api/jobs/{id}/pause", harness.base))
        .send()
        .await
        .expect("pause");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("decode");
    assert_eq!(body["job_id"], id.as_str());
    wait_for_job_status(&harness.base, &id, "paused").await;

    let response = client
        .post(format!("{}/api/jobs/{id}/resume", harness.base))
        .send()
        .await
        .expect("resume");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    wait_for_job_status(&harness.base, &id, "completed").await;

    // Pausing a finished job is a conflict.
    let response = client
        .post(format!("{}/api/jobs/{id}/pause", harness.base))
        .send()
        .await
        .expect("pause again");
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    // Garbage ids are rejected up front.
    let response = client
        .post(format!("{}/api/jobs/not-a-uuid/pause", harness.base))
        .send()
        .await
        .expect("bad id");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}
