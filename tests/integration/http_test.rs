//! REST backend tests against a local mock server

use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use offline_sync::remote::{HttpBackend, RemoteBackend};
use offline_sync::shared::timestamp::normalize_timestamp;
use offline_sync::shared::SyncError;

use crate::common::*;

async fn backend_for(server: &MockServer) -> HttpBackend {
    HttpBackend::new(server.uri(), Some("anon-key".into()), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_fetch_changes_sends_incremental_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/contacts"))
        .and(query_param("tenant_id", "eq.tenant-1"))
        .and(query_param("order", "updated_at.asc,id.asc"))
        .and(query_param("updated_at", format!("gte.{}", T0)))
        .and(header("apikey", "anon-key"))
        .and(header("Authorization", "Bearer anon-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            contact("c1", "+1555", &at(1)),
            contact("c2", "+1556", &at(2)),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    let rows = backend
        .fetch_changes("contacts", TENANT, normalize_timestamp(T0))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], "c1");
}

#[tokio::test]
async fn test_fetch_recent_orders_newest_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/groups"))
        .and(query_param("order", "updated_at.desc"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    let rows = backend.fetch_recent("groups", TENANT, 5).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_upsert_merges_duplicates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/groups"))
        .and(header("Prefer", "resolution=merge-duplicates,return=minimal"))
        .and(body_json(json!([{"id": "g1", "name": "Team", "tenant_id": TENANT}])))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    backend
        .upsert("groups", TENANT, &json!({"id": "g1", "name": "Team"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_and_delete_are_tenant_scoped() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/assets"))
        .and(query_param("id", "eq.a1"))
        .and(query_param("tenant_id", "eq.tenant-1"))
        .and(body_json(json!({"deleted": true})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/rest/v1/groups"))
        .and(query_param("id", "eq.g1"))
        .and(query_param("tenant_id", "eq.tenant-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    backend
        .update("assets", TENANT, "a1", &json!({"deleted": true}))
        .await
        .unwrap();
    backend.delete("groups", TENANT, "g1").await.unwrap();
}

#[tokio::test]
async fn test_status_codes_map_onto_error_classes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/contacts"))
        .respond_with(ResponseTemplate::new(401).set_body_string("JWT expired"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/groups"))
        .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/templates"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad filter"))
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    crate::assert_err!(
        backend.fetch_changes("contacts", TENANT, None).await,
        SyncError::Unauthorized { .. }
    );
    crate::assert_err!(
        backend.fetch_changes("groups", TENANT, None).await,
        SyncError::Network { .. }
    );
    crate::assert_err!(
        backend.fetch_changes("templates", TENANT, None).await,
        SyncError::Backend { status: 400, .. }
    );
}

#[tokio::test]
async fn test_rejected_rpc_is_a_business_rule_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/commit_quota_reservation"))
        .respond_with(ResponseTemplate::new(400).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    let error = backend
        .call_rpc("commit_quota_reservation", &json!({"tenant_id": TENANT}))
        .await
        .unwrap_err();
    assert_eq!(
        error,
        SyncError::business_rule("commit_quota_reservation: quota exceeded")
    );
}

#[tokio::test]
async fn test_rpc_returns_rows_or_null() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/pull_all_contacts"))
        .and(body_json(json!({"tenant_id": TENANT, "since": null})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([contact("c1", "+1", T0)])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/touch"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    let rows = backend
        .call_rpc("pull_all_contacts", &json!({"tenant_id": TENANT, "since": null}))
        .await
        .unwrap();
    assert_eq!(rows.as_array().map(Vec::len), Some(1));

    let empty = backend.call_rpc("touch", &json!({})).await.unwrap();
    assert!(empty.is_null());
}

#[tokio::test]
async fn test_count_reads_content_range() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/rest/v1/contacts"))
        .and(header("Prefer", "count=exact"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Range", "0-0/42"))
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    assert_eq!(backend.count("contacts", TENANT).await.unwrap(), 42);
}

#[tokio::test]
async fn test_ping_reaches_rest_root() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server).await;
    assert!(backend.ping().await.is_ok());
}
