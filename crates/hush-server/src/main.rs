mod config;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use hush_api::auth::{self, AppState, AppStateInner};
use hush_api::middleware::require_auth;
use hush_api::{conversations, unmasking, whispers};
use hush_gateway::connection;
use hush_gateway::dispatcher::Dispatcher;

use crate::config::Config;

#[derive(Clone)]
struct GatewayState {
    dispatcher: Dispatcher,
    jwt_secret: Arc<str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hush=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let db = hush_db::Database::open(&config.db_path, config.protocol.clone())?;

    let dispatcher = Dispatcher::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: config.jwt_secret.clone(),
        token_ttl_days: config.token_ttl_days,
        max_content_len: config.max_content_len,
        dispatcher: dispatcher.clone(),
    });

    let gateway_state = GatewayState {
        dispatcher,
        jwt_secret: Arc::from(config.jwt_secret.as_str()),
    };

    let app = router(app_state, gateway_state);

    let addr = config.addr()?;
    info!("Hush server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(app_state: AppState, gateway_state: GatewayState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/whispers", post(whispers::send_whisper))
        .route("/whispers/inbox", get(whispers::inbox))
        .route("/whispers/sent", get(whispers::sent))
        .route("/whispers/{whisper_id}/read", post(whispers::mark_read))
        .route("/whispers/{whisper_id}/echo", post(whispers::echo))
        .route("/whispers/{whisper_id}/echo-request", post(whispers::echo_request))
        .route("/conversations", get(conversations::list))
        .route("/conversations/{conversation_id}/accept", post(conversations::accept))
        .route("/conversations/{conversation_id}/reject", post(conversations::reject))
        .route("/conversations/{conversation_id}/close", post(conversations::close))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages).post(conversations::send_message),
        )
        .route("/conversations/{conversation_id}/read", post(conversations::mark_read))
        .route(
            "/conversations/{conversation_id}/unmasking",
            get(unmasking::status).post(unmasking::request),
        )
        .route("/conversations/{conversation_id}/unmasking/complete", post(unmasking::complete))
        .route("/unmasking/{request_id}/respond", post(unmasking::respond))
        .route("/unmasking/{request_id}", delete(unmasking::cancel))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.dispatcher, state.jwt_secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(dir: &std::path::Path) -> Router {
        let db = hush_db::Database::open(&dir.join("hush.db"), hush_db::ProtocolConfig::default()).unwrap();
        let dispatcher = Dispatcher::new();
        let app_state = Arc::new(AppStateInner {
            db,
            jwt_secret: "test-secret".into(),
            token_ttl_days: 1,
            max_content_len: 2000,
            dispatcher: dispatcher.clone(),
        });
        router(
            app_state,
            GatewayState {
                dispatcher,
                jwt_secret: Arc::from("test-secret"),
            },
        )
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {}", token));
        }
        let body = if body.is_null() { Body::empty() } else { Body::from(body.to_string()) };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn register(app: &Router, username: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/auth/register",
            None,
            serde_json::json!({ "username": username, "password": "correct horse" }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, _) = call(&app, "GET", "/health", None, serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/whispers/inbox", None, serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn duplicate_username_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        register(&app, "alice").await;

        let (status, body) = call(
            &app,
            "POST",
            "/auth/register",
            None,
            serde_json::json!({ "username": "alice", "password": "another password" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_exists");
    }

    #[tokio::test]
    async fn whisper_to_unmasked_conversation_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let alice = register(&app, "alice").await;
        let bob = register(&app, "bob").await;

        let (status, _) = call(
            &app,
            "POST",
            "/whispers",
            Some(&alice),
            serde_json::json!({ "recipient_username": "bob", "content": "hello" }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, inbox) = call(&app, "GET", "/whispers/inbox", Some(&bob), serde_json::Value::Null).await;
        assert!(inbox[0].get("sender_id").is_none());
        let whisper_id = inbox[0]["id"].as_str().unwrap().to_string();

        let echo_uri = format!("/whispers/{}/echo", whisper_id);
        let (status, echo) = call(&app, "POST", &echo_uri, Some(&bob), serde_json::json!({ "content": "hi" })).await;
        assert_eq!(status, StatusCode::CREATED);
        let conversation = echo["conversation_id"].as_str().unwrap().to_string();

        let (status, again) = call(&app, "POST", &echo_uri, Some(&bob), serde_json::json!({ "content": "hi" })).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(again["error"], "already_exists");

        let unmask_uri = format!("/conversations/{}/unmasking", conversation);
        let (status, first) = call(&app, "POST", &unmask_uri, Some(&alice), serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["status"], "pending");
        let (_, second) = call(&app, "POST", &unmask_uri, Some(&bob), serde_json::Value::Null).await;
        assert_eq!(second["status"], "mutual_pending");

        let (status, done) = call(
            &app,
            "POST",
            &format!("{}/complete", unmask_uri),
            Some(&alice),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["status"], "completed");

        let (_, view) = call(&app, "GET", &unmask_uri, Some(&alice), serde_json::Value::Null).await;
        assert_eq!(view["state"], "completed");
        assert_eq!(view["revealed"]["username"], "bob");

        let (_, messages) = call(
            &app,
            "GET",
            &format!("/conversations/{}/messages", conversation),
            Some(&alice),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(messages[0]["content"], "hello");
        assert_eq!(messages[0]["from_me"], true);
        assert_eq!(messages[1]["content"], "hi");
    }
}
