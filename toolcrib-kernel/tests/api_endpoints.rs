use serde_json::{json, Value};
use std::sync::Arc;
use toolcrib_core::{JsonFileBackend, Snapshot, Store, StoreOptions};
use toolcrib_devkit::{seeded_store, standard_tool_type_count, SnapshotBuilder, TestHarness};
use toolcrib_kernel::events::{spawn_change_forwarder, STORE_CHANGED_TOPIC};
use toolcrib_kernel::{build_router, AppState, HealthTracker};

struct Server {
    harness: TestHarness,
    base: String,
    store: Arc<Store>,
    client: reqwest::Client,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

async fn start_with_store(store: Store, api_key: Option<&str>) -> Server {
    let harness = TestHarness::new().expect("harness");
    let store = Arc::new(store);
    let state = AppState::new(store.clone(), HealthTracker::new(), api_key.map(str::to_string));
    let addr = harness.spawn_router(build_router(state)).await.expect("spawn");
    Server {
        harness,
        base: TestHarness::base_url(addr),
        store,
        client: reqwest::Client::new(),
    }
}

async fn start(snapshot: Snapshot) -> Server {
    start_with_store(seeded_store(&snapshot).expect("store"), None).await
}

fn shop() -> Snapshot {
    SnapshotBuilder::new()
        .machine("M1", 2)
        .machine("M2", 4)
        .tool_type("Tap", &["M6", "M8"])
        .build()
}

#[tokio::test]
async fn api_key_guards_everything_but_health() {
    let server = start_with_store(seeded_store(&shop()).unwrap(), Some("secret")).await;

    let health = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(health.status().as_u16(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let system = server.client.get(server.url("/system/health")).send().await.unwrap();
    assert_eq!(system.status().as_u16(), 200);
    let system: Value = system.json().await.unwrap();
    assert_eq!(system["machines"], 2);
    assert_eq!(system["mqtt_status"], "disabled");

    let denied = server.client.get(server.url("/api/tools")).send().await.unwrap();
    assert_eq!(denied.status().as_u16(), 401);

    let allowed = server
        .client
        .get(server.url("/api/tools"))
        .header("x-api-key", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status().as_u16(), 200);
}

#[tokio::test]
async fn cors_preflight_and_headers() {
    let server = start(shop()).await;
    let preflight = server
        .client
        .request(reqwest::Method::OPTIONS, server.url("/api/sync"))
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status().as_u16(), 204);
    assert_eq!(preflight.headers()["access-control-allow-origin"], "*");

    let res = server.client.get(server.url("/api/machines")).send().await.unwrap();
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn placement_lifecycle_and_occupied_cell() {
    let server = start(shop()).await;

    let add = server
        .client
        .post(server.url("/api/tools"))
        .json(&json!({"machine": "M1", "toolType": "Thread mill", "toolSize": "8", "cellNumber": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(add.status().as_u16(), 201);
    let added: Value = add.json().await.unwrap();
    assert_eq!(added["tool"]["toolSize"], "M8");
    assert_eq!(added["tool"]["cellNumber"], "1");
    assert!(added["note"].is_string());

    let again = server
        .client
        .post(server.url("/api/tools"))
        .json(&json!({"machine": "M1", "toolType": "Reamer", "cellNumber": "1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status().as_u16(), 409);
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["code"], "cell_occupied");
    assert!(body["error"].as_str().unwrap().starts_with("Cell already occupied"));

    let cells: Vec<Value> = server
        .client
        .get(server.url("/api/cells?machine=M1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cells.len(), 2);
    assert_eq!(cells[0]["occupied"], true);
    assert_eq!(cells[1]["occupied"], false);

    let unknown: Vec<Value> = server
        .client
        .get(server.url("/api/cells?machine=Nope"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(unknown.is_empty());

    let del = server.client.delete(server.url("/api/tools/M1/1")).send().await.unwrap();
    assert_eq!(del.status().as_u16(), 200);
    assert!(server.store.tools().is_empty());

    let missing = server.client.delete(server.url("/api/tools/M1/1")).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn validation_errors_are_400() {
    let server = start(shop()).await;
    for (body, code) in [
        (json!({"machine": "M1", "toolType": "End mill", "toolSize": "abc", "cellNumber": "1"}), "not_numeric"),
        (json!({"machine": "M1", "toolType": "End mill", "toolSize": "1;2", "cellNumber": "1"}), "invalid_characters"),
        (json!({"machine": "M1", "toolType": "Tap", "toolSize": "M10", "cellNumber": "1"}), "size_not_allowed"),
        (json!({"machine": "M1", "toolType": "End mill", "cellNumber": "9"}), "invalid_cell"),
        (json!({"toolType": "End mill", "cellNumber": "1"}), "missing_field"),
    ] {
        let res = server.client.post(server.url("/api/tools")).json(&body).send().await.unwrap();
        assert_eq!(res.status().as_u16(), 400, "body {body}");
        let err: Value = res.json().await.unwrap();
        assert_eq!(err["code"], code);
    }
}

#[tokio::test]
async fn legacy_delete_by_query() {
    let snapshot = SnapshotBuilder::new().machine("M1", 3).tool("M1", "Hob", "", "3").build();
    let server = start(snapshot).await;

    let res = server
        .client
        .get(server.url("/api/delete?cell=3&machine=M1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({"status": "ok"}));
    assert!(server.store.tools().is_empty());

    // déjà vide : toujours ok, rien ne bouge
    let revision = server.store.revision();
    let res = server
        .client
        .get(server.url("/api/delete?cell=3&machine=M1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.json::<Value>().await.unwrap()["status"], "ok");
    assert_eq!(server.store.revision(), revision);

    let res = server.client.get(server.url("/api/delete?cell=3")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 400);
}

#[tokio::test]
async fn full_data_etag_and_not_modified() {
    let server = start(shop().into_revision(4)).await;

    let res = server.client.get(server.url("/api/full-data")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.headers()["etag"], "\"4\"");
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["revision"], 4);
    assert!(body["timestamp"].is_string());
    assert_eq!(body["machines"].as_array().unwrap().len(), 2);

    let res = server
        .client
        .get(server.url("/api/full-data"))
        .header("if-none-match", "\"4\"")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 304);
}

#[tokio::test]
async fn sync_with_stale_base_is_rejected() {
    let server = start(shop()).await;
    let mut pushed = server.store.get_all();
    pushed.machines[0].cells = 12;

    // quelqu'un d'autre écrit entre-temps
    server.store.add_activity("other client").unwrap();

    let stale = server
        .client
        .post(server.url("/api/sync"))
        .header("if-match", "\"0\"")
        .json(&pushed)
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status().as_u16(), 409);
    let err: Value = stale.json().await.unwrap();
    assert_eq!(err["code"], "conflict");
    assert_eq!(server.store.machines()[0].cells, 2);

    let fresh = server
        .client
        .post(server.url("/api/sync"))
        .header("if-match", "\"1\"")
        .json(&pushed)
        .send()
        .await
        .unwrap();
    assert_eq!(fresh.status().as_u16(), 200);
    assert_eq!(fresh.headers()["etag"], "\"2\"");
    let ok: Value = fresh.json().await.unwrap();
    assert_eq!(ok["revision"], 2);
    assert_eq!(server.store.machines()[0].cells, 12);

    let changes: Value = server
        .client
        .get(server.url("/api/changes?since=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(changes["has_changes"], true);
    assert_eq!(changes["current_revision"], 2);
    assert_eq!(changes["changes"][0]["kind"], "snapshot_replaced");
    assert_eq!(changes["changes"][0]["source"], "client");

    let none: Value = server
        .client
        .get(server.url("/api/changes?since=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(none["has_changes"], false);
}

#[tokio::test]
async fn sync_cannot_put_two_tools_in_one_cell() {
    let server = start(shop()).await;
    let base = server.store.revision();
    let mut pushed: Value = serde_json::to_value(server.store.get_all()).unwrap();
    pushed["tools"] = json!([
        {"machine": "M1", "toolType": "Hob", "cellNumber": "1"},
        {"machine": "M1", "toolType": "Reamer", "cellNumber": 1}
    ]);

    let res = server
        .client
        .post(server.url("/api/sync"))
        .header("if-match", format!("\"{base}\""))
        .json(&pushed)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 409);
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["code"], "cell_occupied");
    assert!(server.store.tools().is_empty());
    assert_eq!(server.store.revision(), base);

    pushed["tools"] = json!([{"machine": "Ghost", "toolType": "Hob", "cellNumber": "1"}]);
    let res = server
        .client
        .post(server.url("/api/sync"))
        .header("if-match", format!("\"{base}\""))
        .json(&pushed)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);

    pushed["tools"] = json!([{"machine": "M2", "toolType": "Hob", "cellNumber": "04"}]);
    let res = server
        .client
        .post(server.url("/api/sync"))
        .header("if-match", format!("\"{base}\""))
        .json(&pushed)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(server.store.tools()[0].cell_number, "4");

    let cells: Vec<Value> = server
        .client
        .get(server.url("/api/cells?machine=M2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cells[3]["occupied"], true);
}

#[tokio::test]
async fn admin_clear_resets_the_store() {
    let snapshot = SnapshotBuilder::new().machine("M1", 3).tool("M1", "Hob", "", "3").build();
    let server = start(snapshot).await;
    let before = server.store.revision();

    let res = server.client.post(server.url("/api/admin/clear")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["revision"], before + 1);

    let full: Value = server
        .client
        .get(server.url("/api/full-data"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(full["machines"].as_array().unwrap().is_empty());
    assert!(full["tools"].as_array().unwrap().is_empty());
    assert_eq!(full["activityLog"][0]["action"], "Cleared all data");
    assert_eq!(full["toolTypes"].as_object().unwrap().len(), standard_tool_type_count());

    let changes: Value = server
        .client
        .get(server.url(&format!("/api/changes?since={before}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(changes["changes"][0]["kind"], "cleared");
}

#[tokio::test]
async fn admin_machine_and_tool_type_crud() {
    let server = start(shop()).await;

    let created: Value = server
        .client
        .post(server.url("/api/machines"))
        .json(&json!({"name": "Lathe", "cells": 6, "status": "maintenance"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["id"], 3);
    assert_eq!(created["status"], "maintenance");

    let dup = server
        .client
        .post(server.url("/api/machines"))
        .json(&json!({"name": "Lathe", "cells": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status().as_u16(), 409);

    server
        .client
        .post(server.url("/api/tools"))
        .json(&json!({"machine": "Lathe", "toolType": "End mill", "toolSize": "6", "cellNumber": "2"}))
        .send()
        .await
        .unwrap();

    let renamed: Value = server
        .client
        .post(server.url("/api/tool-types/End%20mill/rename"))
        .json(&json!({"to": "Square end mill"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(renamed["placements"], 1);
    assert_eq!(server.store.tools()[0].tool_type, "Square end mill");

    let saved: Value = server
        .client
        .put(server.url("/api/tool-types/Insert"))
        .json(&json!({"sizes": "CNMG 12, DNMG 15, "}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(saved["created"], true);
    assert_eq!(server.store.tool_types()["Insert"], vec!["CNMG 12", "DNMG 15"]);

    let restricted = server.client.delete(server.url("/api/machines/3")).send().await.unwrap();
    assert_eq!(restricted.status().as_u16(), 409);
    let err: Value = restricted.json().await.unwrap();
    assert_eq!(err["code"], "in_use");

    let cascaded: Value = server
        .client
        .delete(server.url("/api/machines/3?cascade=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cascaded["removed_placements"], 1);
    assert!(server.store.tools().is_empty());

    let activity: Vec<Value> = server
        .client
        .get(server.url("/api/activity?limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(activity.len(), 2);
    assert_eq!(activity[0]["action"], "Deleted machine: Lathe");
}

#[tokio::test]
async fn table_dashboard_and_usage_report() {
    let snapshot = SnapshotBuilder::new()
        .machine("M1", 4)
        .machine("M2", 4)
        .tool("M2", "Hob", "", "1")
        .tool("M1", "Reamer", "8", "2")
        .tool("M2", "Reamer", "10", "3")
        .build();
    let server = start(snapshot).await;

    let table: Vec<Value> = server
        .client
        .get(server.url("/api/table?toolType=Reamer"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table[0]["machine"], "M1");
    assert_eq!(table[0]["rows"][0]["age"], "Today");

    let dashboard: Value = server
        .client
        .get(server.url("/api/dashboard"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dashboard["stats"]["totalTools"], 3);
    assert_eq!(dashboard["stats"]["freeCells"], 5);

    let report: Value = server
        .client
        .get(server.url("/api/reports/usage"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["toolsByMachine"]["M2"], 2);
    assert_eq!(report["toolsByType"]["Reamer"], 2);
}

#[tokio::test]
async fn settings_roundtrip() {
    let server = start(shop()).await;
    let res = server
        .client
        .put(server.url("/api/settings"))
        .json(&json!({"autoBackup": false, "syncInterval": 5000}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let settings: Value = res.json().await.unwrap();
    assert_eq!(settings["syncInterval"], 5000);
    assert_eq!(settings["activityLogCap"], 100);

    let bad = server
        .client
        .put(server.url("/api/settings"))
        .json(&json!({"syncInterval": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 400);

    let too_small = server
        .client
        .put(server.url("/api/settings"))
        .json(&json!({"activityLogCap": 5}))
        .send()
        .await
        .unwrap();
    assert_eq!(too_small.status().as_u16(), 400);
    assert_eq!(server.store.settings().activity_log_cap, 100);
}

#[tokio::test]
async fn store_events_reach_the_mqtt_sink() {
    let server = start(shop()).await;
    spawn_change_forwarder(server.store.subscribe(), server.harness.mqtt_client.clone());

    server
        .client
        .post(server.url("/api/tools"))
        .json(&json!({"machine": "M2", "toolType": "Hob", "cellNumber": "4"}))
        .send()
        .await
        .unwrap();
    server.client.delete(server.url("/api/tools/M2/4")).send().await.unwrap();

    let messages = server.harness.mqtt_client.wait_for_messages(STORE_CHANGED_TOPIC, 2, 2000).await;
    assert_eq!(messages.len(), 2);
    let first: Value = serde_json::from_slice(&messages[0].payload).unwrap();
    assert_eq!(first["kind"], "placement_added");
    assert_eq!(first["machine"], "M2");
    assert_eq!(first["cell"], "4");

    server.harness.mqtt_client.clear();
    server.client.post(server.url("/api/admin/clear")).send().await.unwrap();
    let messages = server.harness.mqtt_client.wait_for_messages(STORE_CHANGED_TOPIC, 1, 2000).await;
    assert_eq!(messages.len(), 1);
    let cleared: Value = serde_json::from_slice(&messages[0].payload).unwrap();
    assert_eq!(cleared["kind"], "cleared");
}

#[tokio::test]
async fn file_backed_store_survives_restart() {
    let harness = TestHarness::new().unwrap();
    let path = harness.path("data/toolcrib.json");
    {
        let store = Store::open(Box::new(JsonFileBackend::new(&path)), StoreOptions::default()).unwrap();
        let server = start_with_store(store, None).await;
        let res = server
            .client
            .post(server.url("/api/machines"))
            .json(&json!({"name": "Mill 5", "cells": 30}))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 201);
    }

    let reopened = Store::open(Box::new(JsonFileBackend::new(&path)), StoreOptions::default()).unwrap();
    assert_eq!(reopened.revision(), 1);
    assert_eq!(reopened.machines()[0].name, "Mill 5");
}

trait SnapshotExt {
    fn into_revision(self, revision: u64) -> Snapshot;
}

impl SnapshotExt for Snapshot {
    fn into_revision(mut self, revision: u64) -> Snapshot {
        self.revision = revision;
        self
    }
}
