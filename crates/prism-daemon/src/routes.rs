//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use prism_engine::Governance;

use crate::handlers::{accounts, admin, approvals, health, heartbeats, policies, resources};
use crate::state::DaemonState;

/// Create the daemon router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
/// - `POST /v1/heartbeats` - Agent heartbeat ingestion
///
/// ## Resources (caller identified by `x-prism-user`)
/// - `POST /v1/resources` - Launch
/// - `GET /v1/resources` - List (`?state=&account_id=`)
/// - `GET /v1/resources/:resource_id` - Get
/// - `POST /v1/resources/:resource_id/actions` - Lifecycle action
/// - `GET /v1/resources/:resource_id/idle` - Idle report
///
/// ## Policies
/// - `GET /v1/policies` - Catalogue
/// - `PUT /v1/policies/:name` - Create or replace
/// - `PUT /v1/projects/:project_id/policy` - Project default
///
/// ## Budgets
/// - `POST /v1/accounts` - Create account
/// - `GET /v1/accounts` - All balances
/// - `GET /v1/accounts/:account_id` - Balance
/// - `GET /v1/accounts/:account_id/events` - Cost events (`?period=YYYY-MM`)
/// - `GET /v1/accounts/:account_id/savings` - Savings report (`?period=YYYY-MM`)
///
/// ## Approvals
/// - `GET /v1/approvals` - List (`?status=`)
/// - `GET /v1/approvals/:approval_id` - Get
/// - `POST /v1/approvals/:approval_id/decision` - Approve or deny
///
/// ## Administration (operator named by `x-prism-operator`)
/// - `POST /v1/admin/resources/:resource_id/force` - Forced transition
/// - `POST /v1/admin/resources/:resource_id/recover` - Recover a failed resource
/// - `POST /v1/admin/resources/:resource_id/reconcile` - Reconcile now
/// - `POST /v1/admin/accounts/:account_id/repair` - Repair a frozen account
/// - `GET /v1/admin/flags` - Operator flags
/// - `GET /v1/journal` - Event stream (`?since=&limit=`)
pub fn create_router<G>(state: DaemonState<G>) -> Router
where
    G: Governance + 'static,
{
    // Extract config values before moving state
    let cors = build_cors_layer(&state.config.cors_origins);
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();

    let state = Arc::new(state);

    Router::new()
        .route("/health", get(health::health))
        .route("/v1/heartbeats", post(heartbeats::ingest::<G>))
        // Resources
        .route(
            "/v1/resources",
            get(resources::list::<G>).post(resources::launch::<G>),
        )
        .route("/v1/resources/:resource_id", get(resources::get::<G>))
        .route(
            "/v1/resources/:resource_id/actions",
            post(resources::action::<G>),
        )
        .route(
            "/v1/resources/:resource_id/idle",
            get(resources::idle_report::<G>),
        )
        // Policies
        .route("/v1/policies", get(policies::list::<G>))
        .route("/v1/policies/:name", put(policies::put::<G>))
        .route(
            "/v1/projects/:project_id/policy",
            put(policies::set_project_policy::<G>),
        )
        // Budgets
        .route(
            "/v1/accounts",
            get(accounts::list::<G>).post(accounts::create::<G>),
        )
        .route("/v1/accounts/:account_id", get(accounts::status::<G>))
        .route("/v1/accounts/:account_id/events", get(accounts::events::<G>))
        .route(
            "/v1/accounts/:account_id/savings",
            get(accounts::savings::<G>),
        )
        // Approvals
        .route("/v1/approvals", get(approvals::list::<G>))
        .route("/v1/approvals/:approval_id", get(approvals::get::<G>))
        .route(
            "/v1/approvals/:approval_id/decision",
            post(approvals::decide::<G>),
        )
        // Administration
        .route(
            "/v1/admin/resources/:resource_id/force",
            post(admin::force::<G>),
        )
        .route(
            "/v1/admin/resources/:resource_id/recover",
            post(admin::recover::<G>),
        )
        .route(
            "/v1/admin/resources/:resource_id/reconcile",
            post(admin::reconcile::<G>),
        )
        .route(
            "/v1/admin/accounts/:account_id/repair",
            post(admin::repair::<G>),
        )
        .route("/v1/admin/flags", get(admin::flags::<G>))
        .route("/v1/journal", get(admin::journal::<G>))
        // Middleware, outermost first
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(RequestBodyLimitLayer::new(max_body_bytes))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::{OPERATOR_HEADER, USER_HEADER};
    use crate::config::DaemonConfig;
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum_test::TestServer;
    use chrono::Utc;
    use prism_core::{AccountId, ActivityMetrics, CostRate, IdleSignal, Money, ProjectId, UserId};
    use prism_engine::{EngineConfig, GovernanceEngine};
    use prism_provider::{MockProvider, RetryPolicy};
    use prism_store::{LaunchSpec, ResourceKind, ResourceSpec, RocksStore};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    struct Fixture {
        server: TestServer,
        user: UserId,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let config = EngineConfig {
            retry: RetryPolicy::immediate(3),
            ..EngineConfig::default()
        };
        let engine = GovernanceEngine::new(store, Arc::new(MockProvider::new()), config);
        engine.seed_policies().unwrap();

        let app = create_router(DaemonState::new(Arc::new(engine), DaemonConfig::default()));
        Fixture {
            server: TestServer::new(app).unwrap(),
            user: UserId::generate(),
            _dir: dir,
        }
    }

    fn user_header(user: UserId) -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static(USER_HEADER),
            HeaderValue::from_str(&user.to_string()).unwrap(),
        )
    }

    fn operator_header() -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static(OPERATOR_HEADER),
            HeaderValue::from_static("ops-oncall"),
        )
    }

    async fn create_account(server: &TestServer, limit: f64, hard_cap: bool) -> AccountId {
        let response = server
            .post("/v1/accounts")
            .json(&json!({
                "name": "lab",
                "monthly_limit": Money::from_dollars(limit),
                "hard_cap": hard_cap,
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
        let body: Value = response.json();
        body["account_id"].as_str().unwrap().parse().unwrap()
    }

    fn spec(owner: UserId, account_id: AccountId, name: &str) -> LaunchSpec {
        LaunchSpec {
            provider_id: format!("i-{name}"),
            name: name.to_string(),
            owner,
            project_id: ProjectId::generate(),
            account_id,
            spec: ResourceSpec {
                kind: ResourceKind::Compute,
                instance_class: "t3.medium".into(),
                cost_rate: CostRate::per_day(Money::from_dollars(2.40)),
            },
            policy_ref: None,
            policy_override: None,
        }
    }

    async fn launch(fx: &Fixture, account_id: AccountId, name: &str) -> String {
        let (name_h, value_h) = user_header(fx.user);
        let response = fx
            .server
            .post("/v1/resources")
            .add_header(name_h, value_h)
            .json(&spec(fx.user, account_id, name))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["outcome"], "launched");
        body["resource"]["resource_id"].as_str().unwrap().to_string()
    }

    #[test]
    fn cors_any_origin() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn cors_specific_origins() {
        let origins = vec![
            "http://localhost:3000".to_string(),
            "https://console.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }

    #[tokio::test]
    async fn health_is_public() {
        let fx = fixture();
        let response = fx.server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn launch_then_stop_then_reject_second_stop() {
        let fx = fixture();
        let account_id = create_account(&fx.server, 100.0, false).await;
        let resource_id = launch(&fx, account_id, "ws1").await;

        let (name_h, value_h) = user_header(fx.user);
        let stopped = fx
            .server
            .post(&format!("/v1/resources/{resource_id}/actions"))
            .add_header(name_h.clone(), value_h.clone())
            .json(&json!({ "action": "stop" }))
            .await;
        assert_eq!(stopped.status_code(), StatusCode::OK);
        assert_eq!(stopped.json::<Value>()["state"], "stopped");

        let again = fx
            .server
            .post(&format!("/v1/resources/{resource_id}/actions"))
            .add_header(name_h, value_h)
            .json(&json!({ "action": "stop" }))
            .await;
        assert_eq!(again.status_code(), StatusCode::CONFLICT);
        let body: Value = again.json();
        assert_eq!(body["error"]["code"], "INVALID_TRANSITION");
        assert_eq!(body["error"]["details"]["from"], "stopped");
    }

    #[tokio::test]
    async fn launch_requires_a_caller() {
        let fx = fixture();
        let account_id = create_account(&fx.server, 100.0, false).await;
        let response = fx
            .server
            .post("/v1/resources")
            .json(&spec(fx.user, account_id, "anon"))
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<Value>()["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn hard_cap_denial_explains_the_limit() {
        let fx = fixture();
        let account_id = create_account(&fx.server, 0.05, true).await;

        let (name_h, value_h) = user_header(fx.user);
        let response = fx
            .server
            .post("/v1/resources")
            .add_header(name_h, value_h)
            .json(&spec(fx.user, account_id, "big"))
            .await;
        assert_eq!(response.status_code(), StatusCode::PAYMENT_REQUIRED);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "BUDGET_EXCEEDED");
        assert_eq!(body["error"]["details"]["hard_cap"], true);
        assert_eq!(body["error"]["details"]["limit"]["limit"], "monthly_budget");
        assert!(body["error"]["details"]["remediation"].is_string());

        let listed: Value = fx.server.get("/v1/resources").await.json();
        assert_eq!(listed["resources"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn soft_limit_routes_to_approval_and_approval_launches() {
        let fx = fixture();
        let account_id = create_account(&fx.server, 0.05, false).await;

        let (name_h, value_h) = user_header(fx.user);
        let pending = fx
            .server
            .post("/v1/resources")
            .add_header(name_h, value_h)
            .json(&spec(fx.user, account_id, "over"))
            .await;
        assert_eq!(pending.status_code(), StatusCode::ACCEPTED);
        let body: Value = pending.json();
        assert_eq!(body["outcome"], "pending_approval");
        let approval_id = body["approval"]["approval_id"].as_str().unwrap().to_string();

        let listed: Value = fx.server.get("/v1/approvals?status=pending").await.json();
        assert_eq!(listed["approvals"].as_array().unwrap().len(), 1);

        let (name_h, value_h) = user_header(UserId::generate());
        let decided = fx
            .server
            .post(&format!("/v1/approvals/{approval_id}/decision"))
            .add_header(name_h, value_h)
            .json(&json!({ "verdict": "approve", "note": "conference deadline" }))
            .await;
        assert_eq!(decided.status_code(), StatusCode::OK);
        assert_eq!(decided.json::<Value>()["status"], "approved");

        let resources: Value = fx
            .server
            .get(&format!("/v1/resources?account_id={account_id}"))
            .await
            .json();
        assert_eq!(resources["resources"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let fx = fixture();
        let account_id = create_account(&fx.server, 100.0, false).await;
        let resource_id = launch(&fx, account_id, "ws2").await;

        let signal = IdleSignal {
            resource_id: resource_id.parse().unwrap(),
            seq: 0,
            boot_id: 1,
            sent_at: Utc::now(),
            metrics: ActivityMetrics::quiet(),
            idle_score: 0.0,
            idle_for_secs: 0,
        };
        let response = fx.server.post("/v1/heartbeats").json(&signal).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let ack: Value = response.json();
        assert_eq!(ack["accepted"], true);
        assert_eq!(ack["state"], "running");

        let duplicate: Value = fx.server.post("/v1/heartbeats").json(&signal).await.json();
        assert_eq!(duplicate["accepted"], false);
    }

    #[tokio::test]
    async fn bad_and_unknown_ids() {
        let fx = fixture();
        let malformed = fx.server.get("/v1/resources/not-hex").await;
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);

        let unknown = fx
            .server
            .get(&format!("/v1/accounts/{}", AccountId::generate()))
            .await;
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(unknown.json::<Value>()["error"]["code"], "ACCOUNT_NOT_FOUND");
    }

    #[tokio::test]
    async fn policy_catalogue_and_name_mismatch() {
        let fx = fixture();
        let listed: Value = fx.server.get("/v1/policies").await.json();
        let names: Vec<&str> = listed["policies"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p["name"].as_str())
            .collect();
        assert!(names.contains(&"standard"));
        assert!(names.contains(&"gpu"));

        let response = fx
            .server
            .put("/v1/policies/night-shift")
            .json(&json!({
                "name": "other",
                "idle_threshold_minutes": 20,
                "grace_period_minutes": 5,
                "action": "hibernate",
                "idle_score_threshold": 0.1,
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_routes_need_an_operator() {
        let fx = fixture();
        let account_id = create_account(&fx.server, 100.0, false).await;
        let resource_id = launch(&fx, account_id, "ws3").await;

        let anonymous = fx.server.get("/v1/admin/flags").await;
        assert_eq!(anonymous.status_code(), StatusCode::UNAUTHORIZED);

        let (name_h, value_h) = operator_header();
        let forced = fx
            .server
            .post(&format!("/v1/admin/resources/{resource_id}/force"))
            .add_header(name_h.clone(), value_h.clone())
            .json(&json!({ "target": "stopped", "skip_provider": true, "reason": "stuck console" }))
            .await;
        assert_eq!(forced.status_code(), StatusCode::OK);
        assert_eq!(forced.json::<Value>()["state"], "stopped");

        let flags = fx
            .server
            .get("/v1/admin/flags")
            .add_header(name_h, value_h)
            .await;
        assert_eq!(flags.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn journal_pages_from_since() {
        let fx = fixture();
        let account_id = create_account(&fx.server, 100.0, false).await;
        launch(&fx, account_id, "ws4").await;

        let first: Value = fx.server.get("/v1/journal?limit=1").await.json();
        assert_eq!(first["entries"].as_array().unwrap().len(), 1);
        let next = first["next_since"].as_u64().unwrap();
        assert_eq!(first["entries"][0]["seq"].as_u64().unwrap(), next);

        let rest: Value = fx
            .server
            .get(&format!("/v1/journal?since={next}"))
            .await
            .json();
        let entries = rest["entries"].as_array().unwrap();
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|e| e["seq"].as_u64().unwrap() > next));
    }

    #[tokio::test]
    async fn account_events_reject_bad_period() {
        let fx = fixture();
        let account_id = create_account(&fx.server, 100.0, false).await;
        launch(&fx, account_id, "ws5").await;

        let events: Value = fx
            .server
            .get(&format!("/v1/accounts/{account_id}/events"))
            .await
            .json();
        assert!(!events["events"].as_array().unwrap().is_empty());

        let bad = fx
            .server
            .get(&format!("/v1/accounts/{account_id}/events?period=march"))
            .await;
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
    }
}
