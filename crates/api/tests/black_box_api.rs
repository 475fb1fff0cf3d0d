use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{Value, json};

use stockledger_api::app::{router, services::build_in_memory_services};
use stockledger_core::TenantId;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over in-memory services, on an ephemeral port.
        let app = router(Arc::new(build_in_memory_services(3)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn post_movement(
    client: &reqwest::Client,
    server: &TestServer,
    tenant: TenantId,
    body: Value,
) -> (StatusCode, Value) {
    let res = client
        .post(server.url("/ledger/movements"))
        .header("X-Tenant-Id", tenant.to_string())
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn stock(client: &reqwest::Client, server: &TestServer, tenant: TenantId, query: &str) -> Value {
    let res = client
        .get(server.url(&format!("/ledger/stock{query}")))
        .header("X-Tenant-Id", tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

fn decimal(v: &Value) -> rust_decimal::Decimal {
    match v {
        Value::String(s) => s.parse().unwrap(),
        other => other.to_string().parse().unwrap(),
    }
}

#[tokio::test]
async fn health_needs_no_tenant() {
    let server = TestServer::spawn().await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn ledger_routes_require_tenant_header() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/ledger/stock")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(server.url("/ledger/stock"))
        .header("X-Tenant-Id", "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn receive_issue_reject_and_deplete_over_http() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new();

    let (status, receipt) = post_movement(
        &client,
        &server,
        tenant,
        json!({
            "location_id": "CR-1",
            "batch_id": "B1",
            "direction": "In",
            "quantity": 100,
            "product_type": "whole milk",
            "product_category": "dairy"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["direction"], "In");

    let (status, _) = post_movement(
        &client,
        &server,
        tenant,
        json!({ "location_id": "CR-1", "batch_id": "B1", "direction": "out", "quantity": "40" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, err) = post_movement(
        &client,
        &server,
        tenant,
        json!({ "location_id": "CR-1", "batch_id": "B1", "direction": "Out", "quantity": 70 }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["error"], "insufficient_stock");
    assert_eq!(decimal(&err["available"]), rust_decimal::Decimal::from(60));

    let body = stock(&client, &server, tenant, "").await;
    assert_eq!(decimal(&body["rows"][0]["current"]), rust_decimal::Decimal::from(60));

    let (status, _) = post_movement(
        &client,
        &server,
        tenant,
        json!({ "location_id": "CR-1", "batch_id": "B1", "direction": "Out", "quantity": 60 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let body = stock(&client, &server, tenant, "").await;
    assert_eq!(body["rows"].as_array().unwrap().len(), 0);

    let body = stock(&client, &server, tenant, "?include_depleted=true").await;
    assert_eq!(body["rows"].as_array().unwrap().len(), 1);
    assert_eq!(body["totals"]["batches_depleted"], 1);
}

#[tokio::test]
async fn invalid_input_maps_to_client_errors() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new();

    let cases = [
        (json!({ "location_id": "CR-1", "batch_id": "", "direction": "In", "quantity": 1 }), StatusCode::BAD_REQUEST, "validation_error"),
        (json!({ "location_id": "CR-1", "batch_id": "B1", "direction": "In", "quantity": "lots" }), StatusCode::BAD_REQUEST, "invalid_quantity"),
        (json!({ "location_id": "CR-1", "batch_id": "B1", "direction": "In", "quantity": -5 }), StatusCode::BAD_REQUEST, "invalid_quantity"),
        (json!({ "location_id": "CR-1", "batch_id": "B1", "direction": "Up", "quantity": 5 }), StatusCode::BAD_REQUEST, "unknown_direction"),
        (json!({ "location_id": "CR-1", "batch_id": "B9", "direction": "Out", "quantity": 5 }), StatusCode::NOT_FOUND, "batch_not_found"),
    ];

    for (body, expected_status, expected_code) in cases {
        let (status, err) = post_movement(&client, &server, tenant, body).await;
        assert_eq!(status, expected_status);
        assert_eq!(err["error"], expected_code);
    }

    let res = client
        .get(server.url("/ledger/movements"))
        .header("X-Tenant-Id", tenant.to_string())
        .send()
        .await
        .unwrap();
    let movements: Value = res.json().await.unwrap();
    assert_eq!(movements.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn reversal_and_csv_export() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new();

    let (_, receipt) = post_movement(
        &client,
        &server,
        tenant,
        json!({ "location_id": "CR-2", "batch_id": "C7", "direction": "In", "quantity": 25 }),
    )
    .await;
    let id = receipt["id"].as_str().unwrap().to_string();

    let res = client
        .post(server.url(&format!("/ledger/movements/{id}/reverse")))
        .header("X-Tenant-Id", tenant.to_string())
        .json(&json!({ "location_id": "CR-2", "batch_id": "C7", "reason": "typo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let reversal: Value = res.json().await.unwrap();
    assert_eq!(reversal["reverses"], id.as_str());
    assert_eq!(reversal["direction"], "Out");

    let res = client
        .get(server.url("/ledger/stock/export.csv?include_depleted=true"))
        .header("X-Tenant-Id", tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(
        res.headers()[reqwest::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/csv")
    );
    let body = res.text().await.unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("location_id,batch_id"));
    assert!(lines[1].starts_with("CR-2,C7,"));

    let res = client
        .get(server.url("/ledger/movements/export.csv?batch_id=C7"))
        .header("X-Tenant-Id", tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap().lines().count(), 3);
}

#[tokio::test]
async fn tenants_are_isolated_over_http() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let a = TenantId::new();
    let b = TenantId::new();

    let (status, _) = post_movement(
        &client,
        &server,
        a,
        json!({ "location_id": "CR-1", "batch_id": "B1", "direction": "In", "quantity": 5 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let body = stock(&client, &server, b, "?include_depleted=true").await;
    assert_eq!(body["rows"].as_array().unwrap().len(), 0);
}
