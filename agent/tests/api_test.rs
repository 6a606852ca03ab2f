//! Control API round trips through the router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use stockroom_agent::auth::{SessionAuth, User};
use stockroom_agent::config::Config;
use stockroom_agent::context::SyncContext;
use stockroom_agent::remote::{CallKind, MemoryRemoteStore};
use stockroom_agent::storage::MemoryStorage;
use stockroom_agent::{app, AppState};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    ctx: Arc<SyncContext>,
    remote: Arc<MemoryRemoteStore>,
}

fn test_app(secret: Option<&str>) -> TestApp {
    let secret = secret.map(str::to_string);
    let config = Config::from_lookup(|key| match key {
        "STORAGE_URL" => Some("memory".to_string()),
        "AUTH_SECRET" => secret.clone(),
        _ => None,
    })
    .unwrap();

    let remote = Arc::new(MemoryRemoteStore::new());
    let ctx = Arc::new(SyncContext::new(
        Arc::new(MemoryStorage::new()),
        Some(remote.clone()),
        Arc::new(SessionAuth::signed_in(User::new("u1"))),
        config.sync.clone(),
    ));
    let router = app(AppState {
        ctx: ctx.clone(),
        config: Arc::new(config),
    });
    TestApp {
        router,
        ctx,
        remote,
    }
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

#[cfg(test)]
mod health_tests {
    use super::*;

    #[tokio::test]
    async fn test_health() {
        let app = test_app(None);
        let (status, body) = send(&app, request(Method::GET, "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["pending"], 0);
        assert_eq!(body["remoteEnabled"], true);
    }

    #[tokio::test]
    async fn test_health_counts_queued_work() {
        let app = test_app(None);
        app.ctx.remote.set_offline(true);
        app.ctx
            .writer
            .create("products", json!({"name": "W"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let (_, body) = send(&app, request(Method::GET, "/health", None)).await;
        assert_eq!(body["pending"], 1);
    }
}

#[cfg(test)]
mod collection_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_read_update_delete() {
        let app = test_app(None);

        let (status, created) = send(
            &app,
            request(
                Method::POST,
                "/collections/products",
                Some(json!({"sku": "A1", "name": "Widget", "price": 9.5})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["owner_id"], "u1");
        assert_eq!(created["sync_status"], "synced");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, listed) = send(&app, request(Method::GET, "/collections/products", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, updated) = send(
            &app,
            request(
                Method::PATCH,
                &format!("/collections/products/{id}"),
                Some(json!({"name": "Gadget"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "Gadget");
        assert_eq!(updated["sku"], "A1");

        let (status, fetched) =
            send(&app, request(Method::GET, &format!("/collections/products/{id}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["name"], "Gadget");

        let (status, _) =
            send(&app, request(Method::DELETE, &format!("/collections/products/{id}"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(app.remote.calls_of(CallKind::Delete).len(), 1);

        let (status, _) =
            send(&app, request(Method::DELETE, &format!("/collections/products/{id}"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_collection_is_not_found() {
        let app = test_app(None);
        let (status, body) = send(&app, request(Method::GET, "/collections/unicorns", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("unicorns"));
    }

    #[tokio::test]
    async fn test_non_object_body_is_rejected() {
        let app = test_app(None);
        let (status, _) = send(
            &app,
            request(Method::POST, "/collections/products", Some(json!([1, 2, 3]))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_other_owners_records_stay_hidden() {
        let app = test_app(None);
        let foreign = app
            .ctx
            .local
            .insert(
                "products",
                json!({"name": "Theirs", "owner_id": "u2"}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();

        let (_, listed) = send(&app, request(Method::GET, "/collections/products", None)).await;
        assert!(listed.as_array().unwrap().is_empty());

        let (status, _) = send(
            &app,
            request(Method::GET, &format!("/collections/products/{foreign}"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_other_owners_records_cannot_be_changed() {
        let app = test_app(None);
        let foreign = app
            .ctx
            .local
            .insert(
                "products",
                json!({"name": "Theirs", "price": 1, "owner_id": "u2"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
        let uri = format!("/collections/products/{foreign}");

        let (status, body) = send(
            &app,
            request(Method::PATCH, &uri, Some(json!({"price": 42}))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.get("owner_id").is_none());

        let (status, _) = send(&app, request(Method::DELETE, &uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let kept = app.ctx.local.get_by_id("products", &foreign).await.unwrap().unwrap();
        assert_eq!(kept.get("price"), Some(&json!(1)));
        assert!(app.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_endpoint() {
        let app = test_app(None);
        for name in ["Widget", "widget"] {
            app.ctx
                .local
                .insert(
                    "products",
                    json!({"name": name, "owner_id": "u1"}).as_object().cloned().unwrap(),
                )
                .await
                .unwrap();
        }

        let (status, summary) = send(
            &app,
            request(Method::POST, "/collections/products/reconcile", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["collection"], "products");
        assert_eq!(summary["duplicatesRemoved"], 1);
    }
}

#[cfg(test)]
mod sync_route_tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_and_status() {
        let app = test_app(None);
        let (status, outcome) = send(&app, request(Method::POST, "/sync", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "completed");
        assert!(outcome["errors"].as_array().unwrap().is_empty());

        let (status, state) = send(&app, request(Method::GET, "/sync/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["phase"], "idle");
        assert_eq!(state["pending"], 0);
        assert!(state["lastFinishedAt"].is_string());
    }

    #[tokio::test]
    async fn test_offline_switch_skips_sync() {
        let app = test_app(None);
        let (status, body) = send(
            &app,
            request(Method::POST, "/sync/offline", Some(json!({"offline": true}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["offline"], true);

        let (_, outcome) = send(&app, request(Method::POST, "/sync", None)).await;
        assert_eq!(outcome["outcome"], "skipped");
        assert_eq!(outcome["reason"], "offline");

        let (_, body) = send(
            &app,
            request(Method::POST, "/sync/offline", Some(json!({"offline": false}))),
        )
        .await;
        assert_eq!(body["syncRequested"], true);
    }

    #[tokio::test]
    async fn test_foreground_and_cache_invalidation() {
        let app = test_app(None);
        let (status, body) = send(&app, request(Method::POST, "/app/foreground", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);

        let (status, _) = send(
            &app,
            request(
                Method::POST,
                "/cache/invalidate",
                Some(json!({"collection": "products"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_clear_errors_on_empty_queue() {
        let app = test_app(None);
        let (status, body) = send(&app, request(Method::POST, "/sync/errors/clear", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], 0);

        let (status, outcome) = send(&app, request(Method::POST, "/sync/force", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "completed");
    }
}

#[cfg(test)]
mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn test_secret_requires_matching_bearer() {
        let app = test_app(Some("s3cret"));

        let (status, _) = send(&app, request(Method::GET, "/collections/products", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .uri("/collections/products")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let right = Request::builder()
            .uri("/collections/products")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, right).await;
        assert_eq!(status, StatusCode::OK);

        // Health stays open.
        let (status, _) = send(&app, request(Method::GET, "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
    }
}
