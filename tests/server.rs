//! HTTP API tests. The router is served in-process on an ephemeral port
//! over an in-memory store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;
use web_monitoring::payload::PayloadStore;
use web_monitoring::server::router;
use web_monitoring_core::models::{sha256_hex, NewDiff, NewPage, NewVersion};
use web_monitoring_core::store::{InMemoryStore, Store};

struct TestServer {
    base: String,
    client: reqwest::Client,
    page: Uuid,
    versions: Vec<Uuid>,
    /// Diffs ordered by priority, highest first.
    ranked: Vec<Uuid>,
    _tmp: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

/// One Page, four Versions, three Diffs with priorities 0.2, 0.9, 0.5.
async fn start() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let payloads = PayloadStore::new(tmp.path().join("diffs"));
    let store = Arc::new(InMemoryStore::new());

    let page = store
        .insert_page(&NewPage {
            url: "https://www.epa.gov/climatechange".into(),
            title: "Climate Change".into(),
            agency: "EPA".into(),
            site: "epa.gov".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut versions = Vec::new();
    for day in 17..21 {
        versions.push(
            store
                .insert_version(&NewVersion {
                    uuid: None,
                    page_uuid: page,
                    capture_time: Utc.with_ymd_and_hms(2017, 1, day, 12, 0, 0).unwrap(),
                    uri: format!("/captures/{}.html", day),
                    version_hash: sha256_hex(day.to_string().as_bytes()),
                    source_type: "versionista".into(),
                    source_metadata: json!({}),
                })
                .await
                .unwrap(),
        );
    }

    let mut scored = Vec::new();
    for (pair, priority) in versions.windows(2).zip([0.2, 0.9, 0.5]) {
        let body = serde_json::to_vec(&json!({
            "output": { "diffs": [[0, "a"], [1, priority.to_string()]] }
        }))
        .unwrap();
        let hash = sha256_hex(&body);
        let uri = payloads.write(&hash, &body).await.unwrap();
        let id = store
            .insert_diff(&NewDiff {
                uuid: None,
                version_from: pair[0],
                version_to: pair[1],
                diffhash: hash,
                uri,
                source_type: "pagefreezer".into(),
                source_metadata: json!({}),
            })
            .await
            .unwrap()
            .uuid();
        store.set_priority(id, priority).await.unwrap();
        scored.push((priority, id));
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let app = router(store, payloads);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        page,
        versions,
        ranked: scored.into_iter().map(|(_, id)| id).collect(),
        _tmp: tmp,
    }
}

#[tokio::test]
async fn health_and_stats() {
    let server = start().await;

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, body) = server.get("/stats").await;
    assert_eq!(status, 200);
    assert_eq!(body["pages"], 1);
    assert_eq!(body["versions"], 4);
    assert_eq!(body["diffs"], 3);
    assert_eq!(body["unprocessed_diffs"], 0);
}

#[tokio::test]
async fn pages_and_versions() {
    let server = start().await;

    let (status, body) = server
        .get("/pages?url=https://www.epa.gov/climatechange")
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["uuid"], server.page.to_string());

    let (status, body) = server.get(&format!("/pages/{}", server.page)).await;
    assert_eq!(status, 200);
    assert_eq!(body["agency"], "EPA");
    assert_eq!(body["version_count"], 4);
    assert_eq!(body["oldest"]["uuid"], server.versions[0].to_string());

    let (status, body) = server
        .get(&format!("/pages/{}/versions", server.page))
        .await;
    assert_eq!(status, 200);
    let listed: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["uuid"].as_str().unwrap())
        .collect();
    assert_eq!(listed.len(), 4);
    assert_eq!(listed[0], server.versions[3].to_string());

    let (status, body) = server
        .get(&format!("/versions/{}", server.versions[1]))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["page_uuid"], server.page.to_string());
}

#[tokio::test]
async fn error_contract() {
    let server = start().await;

    let (status, body) = server.get(&format!("/diffs/{}", Uuid::new_v4())).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("diff not found"));

    let (status, body) = server.get("/versions/not-a-uuid").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = server.get("/pages?url=https://example.gov/").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn diff_with_content_and_queue() {
    let server = start().await;

    let (status, body) = server.get("/queue?limit=2").await;
    assert_eq!(status, 200);
    let queued: Vec<String> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["uuid"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        queued,
        vec![server.ranked[0].to_string(), server.ranked[1].to_string()]
    );

    let id = server.ranked[0];
    let (_, plain) = server.get(&format!("/diffs/{}", id)).await;
    assert!(plain.get("content").is_none());
    assert_eq!(plain["priority"], 0.9);

    let (status, full) = server.get(&format!("/diffs/{}?content=true", id)).await;
    assert_eq!(status, 200);
    assert_eq!(full["content"]["output"]["diffs"][1][1], "0.9");
}

#[tokio::test]
async fn annotations_round_trip() {
    let server = start().await;
    let id = server.ranked[1];
    let path = format!("/diffs/{}/annotations", id);

    let (status, created) = server
        .post(
            &path,
            json!({ "author": "ana", "content": { "significant": true } }),
        )
        .await;
    assert_eq!(status, 201);
    assert_eq!(created["diff_uuid"], id.to_string());
    assert_eq!(created["content"]["significant"], true);

    server
        .post(&path, json!({ "author": "ben", "content": "agree" }))
        .await;

    let (status, listed) = server.get(&path).await;
    assert_eq!(status, 200);
    let authors: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["author"].as_str().unwrap())
        .collect();
    assert_eq!(authors, ["ana", "ben"]);

    let (status, body) = server
        .post(&path, json!({ "author": "  ", "content": "x" }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = server
        .post(
            &format!("/diffs/{}/annotations", Uuid::new_v4()),
            json!({ "author": "ana", "content": "x" }),
        )
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn review_checkout_hands_out_distinct_diffs() {
    let server = start().await;

    let mut held = Vec::new();
    for user in ["ana", "ben", "cy"] {
        let (status, diff) = server
            .post("/review/checkout", json!({ "user": user }))
            .await;
        assert_eq!(status, 200);
        held.push(diff["uuid"].as_str().unwrap().to_string());
    }
    let expected: Vec<String> = server.ranked.iter().map(Uuid::to_string).collect();
    assert_eq!(held, expected);

    let (status, body) = server
        .post("/review/checkout", json!({ "user": "dee" }))
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "queue_empty");

    let (status, body) = server
        .post("/review/checkin", json!({ "user": "ben" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["released"], expected[1]);

    let (_, diff) = server
        .post("/review/checkout", json!({ "user": "dee" }))
        .await;
    assert_eq!(diff["uuid"], expected[1]);

    let (status, _) = server
        .post("/review/checkin", json!({ "user": "nobody" }))
        .await;
    assert_eq!(status, 404);
}
