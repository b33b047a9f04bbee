use std::sync::Arc;

use armonia_api::{
    auth::revocation::RevocationList,
    config::{Config, PaymentConfig},
    router,
    services::payments::sign_callback,
    store::{
        memory::{fixtures, MemoryBackend},
        SchemaBackend,
    },
    tenant::SchemaName,
    AppState,
};
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::NaiveDate;
use dto::{GatewayOutcome, Role, SessionClaims};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use models::FeeStatus;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "integration-secret";

fn schema(name: &str) -> SchemaName {
    SchemaName::parse(name).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, d).unwrap()
}

struct TestApp {
    router: Router,
    state: AppState,
    backend: Arc<MemoryBackend>,
}

impl TestApp {
    async fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        backend.provision("Torres del Parque", &schema("t1")).await.unwrap();
        backend.provision("Mirador del Río", &schema("t2")).await.unwrap();
        backend
            .seed(&schema("t1"))
            .unwrap()
            .resident(fixtures::resident(1, "Ana Gómez", "ana@example.co", "T2-301"))
            .fee(fixtures::fee(10, 1, 350_000_00, day(5), FeeStatus::Pending))
            .panic_alert(fixtures::active_alert(42, 1));

        let state = AppState::new(
            &Config::for_secret(SECRET),
            backend.clone(),
            RevocationList::in_memory(),
        );
        Self {
            router: router(state.clone(), None),
            state,
            backend,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

fn token(role: Role, tenant: Option<&str>, global: bool) -> String {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = SessionClaims {
        id: 7,
        email: "ana@example.co".into(),
        role,
        complex_id: Some(1),
        schema_name: tenant.map(str::to_string),
        is_global_admin: global,
        exp: now + 3600,
        iat: now,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(res: Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new().await;
    let res = app.send(request("GET", "/health", None, None)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({"status":"ok"}));
}

#[tokio::test]
async fn requests_without_a_session_are_rejected() {
    let app = TestApp::new().await;
    let res = app.send(request("GET", "/panic/alerts/active", None, None)).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(res).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");

    let res = app
        .send(request("GET", "/panic/alerts/active", Some("not-a-jwt"), None))
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sessions_without_a_complex_cannot_reach_tenant_data() {
    let app = TestApp::new().await;
    let admin = token(Role::Admin, None, false);
    let res = app
        .send(request("GET", "/panic/alerts/active", Some(&admin), None))
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(res).await["error"]["code"], "UNRESOLVED_TENANT");
}

#[tokio::test]
async fn unknown_complex_is_not_found_and_not_cached() {
    let app = TestApp::new().await;
    let admin = token(Role::Admin, Some("t9"), false);
    let res = app
        .send(request("GET", "/panic/alerts/active", Some(&admin), None))
        .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(res).await["error"]["code"], "TENANT_NOT_FOUND");
    assert!(app.state.registry().is_empty());
    assert_eq!(app.backend.open_count(), 0);
}

#[tokio::test]
async fn alerts_of_one_complex_are_invisible_to_another() {
    let app = TestApp::new().await;
    let other = token(Role::Admin, Some("t2"), false);
    let res = app
        .send(request(
            "PATCH",
            "/panic/alerts/42/status",
            Some(&other),
            Some(json!({"status":"RESOLVED"})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let owner = token(Role::Reception, Some("t1"), false);
    let res = app
        .send(request("GET", "/panic/alerts/active", Some(&owner), None))
        .await;
    let body = json_body(res).await;
    assert_eq!(body["data"][0]["id"], 42);
    assert_eq!(body["data"][0]["status"], "ACTIVE");
}

#[tokio::test]
async fn resolving_twice_reports_no_change_the_second_time() {
    let app = TestApp::new().await;
    let staff = token(Role::Staff, Some("t1"), false);
    let resolve = || {
        request(
            "PATCH",
            "/panic/alerts/42/status",
            Some(&staff),
            Some(json!({"status":"RESOLVED"})),
        )
    };

    let first = json_body(app.send(resolve()).await).await;
    assert_eq!(first["data"]["changed"], true);
    assert_eq!(first["data"]["alert"]["status"], "RESOLVED");
    assert_eq!(first["data"]["alert"]["resolvedBy"], 7);

    let second = json_body(app.send(resolve()).await).await;
    assert_eq!(second["data"]["changed"], false);

    let active = json_body(
        app.send(request("GET", "/panic/alerts/active", Some(&staff), None))
            .await,
    )
    .await;
    assert_eq!(active["data"], json!([]));

    let res = app
        .send(request(
            "PATCH",
            "/panic/alerts/42/status",
            Some(&staff),
            Some(json!({"status":"IN_PROGRESS"})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(res).await["error"]["code"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn residents_raise_alerts_but_cannot_manage_them() {
    let app = TestApp::new().await;
    let resident = token(Role::Resident, Some("t1"), false);
    let res = app
        .send(request(
            "POST",
            "/panic/alerts",
            Some(&resident),
            Some(json!({"type":"FIRE","location":"Torre 2, piso 3"})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created = json_body(res).await;
    assert_eq!(created["data"]["type"], "FIRE");
    assert_eq!(created["data"]["status"], "ACTIVE");

    let res = app
        .send(request("GET", "/panic/alerts/active", Some(&resident), None))
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn global_admins_pick_the_complex_by_header() {
    let app = TestApp::new().await;
    let root = token(Role::SuperAdmin, None, true);
    let mut req = request("GET", "/panic/alerts/42", Some(&root), None);
    req.headers_mut()
        .insert("x-tenant-schema", "t1".parse().unwrap());
    let res = app.send(req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["data"]["id"], 42);

    // ignored for everyone else
    let admin = token(Role::Admin, Some("t2"), false);
    let mut req = request("GET", "/panic/alerts/42", Some(&admin), None);
    req.headers_mut()
        .insert("x-tenant-schema", "t1".parse().unwrap());
    assert_eq!(app.send(req).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_bodies_use_the_error_envelope() {
    let app = TestApp::new().await;
    let staff = token(Role::Staff, Some("t1"), false);
    let req = Request::builder()
        .method("POST")
        .uri("/panic/alerts")
        .header(header::AUTHORIZATION, format!("Bearer {staff}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"type\":"))
        .unwrap();
    let res = app.send(req).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(res).await["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn logout_clears_the_cookie_and_revokes_the_token() {
    let app = TestApp::new().await;
    let staff = token(Role::Staff, Some("t1"), false);
    let req = Request::builder()
        .method("POST")
        .uri("/auth/logout")
        .header(header::COOKIE, format!("token={staff}"))
        .body(Body::empty())
        .unwrap();
    let res = app.send(req).await;
    assert_eq!(res.status(), StatusCode::OK);
    let cookie = res
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("token="));
    assert!(cookie.contains("Max-Age=0"));
    assert!(json_body(res).await["message"].is_string());

    let res = app
        .send(request("GET", "/panic/alerts/active", Some(&staff), None))
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // without any session logout still succeeds
    let res = app.send(request("POST", "/auth/logout", None, None)).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn paying_the_last_fee_unlocks_the_certificate() {
    let app = TestApp::new().await;
    let resident = token(Role::Resident, Some("t1"), false);

    let res = app
        .send(request("GET", "/reports/peace-and-safe/pdf/1", Some(&resident), None))
        .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(res).await["error"]["code"], "OUTSTANDING_BALANCE");

    let res = app
        .send(request(
            "POST",
            "/finances/payments/initiate",
            Some(&resident),
            Some(json!({"feeId":10})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let started = json_body(res).await;
    let tx: Uuid = started["data"]["transactionId"].as_str().unwrap().parse().unwrap();
    assert!(started["data"]["redirectUrl"]
        .as_str()
        .unwrap()
        .ends_with(&tx.to_string()));

    let secret = PaymentConfig::default().gateway_secret;
    let res = app
        .send(request(
            "POST",
            &format!("/finances/payments/verify/{tx}"),
            Some(&resident),
            Some(json!({
                "status": "APPROVED",
                "gatewayReference": "GW-123",
                "signature": "00ff",
            })),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(res).await["error"]["code"], "INVALID_SIGNATURE");

    let signature = sign_callback(&secret, tx, GatewayOutcome::Approved, "GW-123").unwrap();
    let res = app
        .send(request(
            "POST",
            &format!("/finances/payments/verify/{tx}"),
            Some(&resident),
            Some(json!({
                "status": "APPROVED",
                "gatewayReference": "GW-123",
                "signature": signature,
            })),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["data"]["status"], "COMPLETED");

    let res = app
        .send(request("GET", "/reports/peace-and-safe/pdf/1", Some(&resident), None))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "application/pdf");
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.starts_with(b"%PDF-"));
}

#[tokio::test]
async fn statement_lines_are_matched_against_completed_payments() {
    let app = TestApp::new().await;
    app.backend
        .seed(&schema("t1"))
        .unwrap()
        .payment(fixtures::completed_payment(5, 250_000_00, day(10)));
    let admin = token(Role::Admin, Some("t1"), false);

    let res = app
        .send(request(
            "POST",
            "/bank-reconciliation/upload",
            Some(&admin),
            Some(json!({"transactions": [
                {"postedOn": "2024-04-10", "amountCents": 250_000_00, "description": "Consignación"},
                {"postedOn": "2024-04-11", "amountCents": 9_999_00},
            ]})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = app
        .send(request(
            "POST",
            "/bank-reconciliation/reconcile",
            Some(&admin),
            Some(json!({})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let results = json_body(res).await;
    let results = results["data"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["status"], "MATCHED");
    assert_eq!(results[0]["paymentId"], 5);
    assert_eq!(results[1]["status"], "UNMATCHED");

    let stats = json_body(
        app.send(request("GET", "/bank-reconciliation/stats", Some(&admin), None))
            .await,
    )
    .await;
    assert_eq!(stats["data"]["matchedTransactions"], 1);
    assert_eq!(stats["data"]["unmatchedTransactions"], 1);

    let resident = token(Role::Resident, Some("t1"), false);
    let res = app
        .send(request("GET", "/bank-reconciliation/config", Some(&resident), None))
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn manual_matches_in_bulk_then_listed_by_status() {
    let app = TestApp::new().await;
    let seed = app.backend.seed(&schema("t1")).unwrap();
    seed.payment(fixtures::completed_payment(5, 250_000_00, day(10)))
        .payment(fixtures::completed_payment(6, 80_000_00, day(12)));
    let admin = token(Role::Admin, Some("t1"), false);

    let res = app
        .send(request(
            "POST",
            "/bank-reconciliation/upload",
            Some(&admin),
            Some(json!({"transactions": [
                {"postedOn": "2024-04-25", "amountCents": 250_000_00},
                {"postedOn": "2024-04-26", "amountCents": 80_000_00},
            ]})),
        ))
        .await;
    let uploaded = json_body(res).await;
    let first = uploaded["data"][0]["id"].as_i64().unwrap();
    let second = uploaded["data"][1]["id"].as_i64().unwrap();

    let res = app
        .send(request(
            "POST",
            "/bank-reconciliation/bulk-reconciliation",
            Some(&admin),
            Some(json!({"reconciliations": [
                {"bankTransactionId": first, "paymentId": 5},
                {"bankTransactionId": first, "paymentId": 6},
                {"bankTransactionId": second, "paymentId": 6},
            ]})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["data"], json!({"success": 2, "failed": 1}));

    let res = app
        .send(request(
            "GET",
            "/bank-reconciliation/results?status=MATCHED&page=2&limit=1",
            Some(&admin),
            None,
        ))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let page = json_body(res).await;
    assert_eq!(page["pagination"], json!({"page": 2, "limit": 1, "total": 2}));
    assert_eq!(page["data"][0]["id"], second);

    let res = app
        .send(request(
            "POST",
            "/bank-reconciliation/upload",
            Some(&admin),
            Some(json!({"transactions": [
                {"postedOn": "2024-04-25", "amountCents": i64::MIN},
            ]})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let resident = token(Role::Resident, Some("t1"), false);
    let res = app
        .send(request("GET", "/bank-reconciliation/results", Some(&resident), None))
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn only_global_admins_manage_complexes() {
    let app = TestApp::new().await;
    let admin = token(Role::Admin, Some("t1"), false);
    let res = app
        .send(request(
            "POST",
            "/complexes",
            Some(&admin),
            Some(json!({"name":"Nuevo","schemaName":"t3"})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let root = token(Role::SuperAdmin, None, true);
    let res = app
        .send(request(
            "POST",
            "/complexes",
            Some(&root),
            Some(json!({"name":"Nuevo","schemaName":"t3"})),
        ))
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(json_body(res).await["data"]["schemaName"], "t3");

    let res = app
        .send(request("DELETE", "/complexes/t1", Some(&root), None))
        .await;
    assert_eq!(res.status(), StatusCode::OK);

    let staff = token(Role::Staff, Some("t1"), false);
    let res = app
        .send(request("GET", "/panic/alerts/active", Some(&staff), None))
        .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(res).await["error"]["code"], "TENANT_NOT_FOUND");
}
