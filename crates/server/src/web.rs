//! The control protocol dispatcher: one entry point per request, at three
//! path depths under the configurable base path.
//!
//! `/`            is session-level, pre-creation (`create`, `info`)
//! `/<sid>`       is session-scoped (`attach`, `destroy`, long-poll GET)
//! `/<sid>/<hid>` is handle-scoped (`message`, `detach`)
//!
//! Every protocol-level outcome, including errors, is HTTP 200 with the JSON
//! envelope; 404 is reserved for malformed paths, 501 for methods other than
//! GET/POST/OPTIONS, and 302 for a GET on a handle path.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use gatehouse_core::Gateway;
use gatehouse_protocol::{ApiError, ErrorCode, Reply, Request};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;

/// Shared application state.
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub base_path: String,
}

/// Build the dispatcher router mounted under the configured base path.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/", any(dispatch_root))
        .route("/{session_id}", any(dispatch_session))
        .route("/{session_id}/{handle_id}", any(dispatch_handle))
        .with_state(Arc::clone(&state));

    let app = if state.base_path == "/" {
        api
    } else {
        Router::new().nest(&state.base_path, api)
    };

    app.fallback(malformed_path)
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .layer(axum::middleware::from_fn(allow_any_origin))
}

/// Middleware adding the CORS origin header to every dispatcher response.
async fn allow_any_origin(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    response
}

/// Anything that is not a well-formed dispatcher path.
async fn malformed_path() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn dispatch_root(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match method {
        Method::OPTIONS => preflight(&headers),
        Method::GET => protocol_error(&ApiError::new(ErrorCode::UsePost), None),
        Method::POST => root_post(&state, &body).await,
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

async fn dispatch_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(session_id) = session_id.parse::<u64>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match method {
        Method::OPTIONS => preflight(&headers),
        Method::GET => long_poll(&state, session_id).await,
        Method::POST => session_post(&state, session_id, &body).await,
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

async fn dispatch_handle(
    State(state): State<Arc<AppState>>,
    Path((session_id, handle_id)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (Ok(session_id), Ok(handle_id)) =
        (session_id.parse::<u64>(), handle_id.parse::<u64>())
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match method {
        Method::OPTIONS => preflight(&headers),
        // Events are delivered per session; polling a handle redirects there.
        Method::GET => {
            let location = format!("{}/{session_id}", state.base_path.trim_end_matches('/'));
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Method::POST => handle_post(&state, session_id, handle_id, &body).await,
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

/// CORS preflight: allow any origin, echo the requested methods/headers.
fn preflight(headers: &HeaderMap) -> Response {
    let mut response = StatusCode::OK.into_response();
    let out = response.headers_mut();
    if let Some(method) = headers.get("access-control-request-method") {
        out.insert("access-control-allow-methods", method.clone());
    }
    if let Some(requested) = headers.get("access-control-request-headers") {
        out.insert("access-control-allow-headers", requested.clone());
    }
    response
}

async fn root_post(state: &AppState, body: &[u8]) -> Response {
    let request = match Request::parse(body) {
        Ok(request) => request,
        Err(e) => return protocol_error(&e, None),
    };
    match request.verb.as_str() {
        "create" => {
            let session_id = state.gateway.create_session().await;
            json_reply(&Reply::success(request.transaction, json!({ "id": session_id })))
        }
        "info" => json_reply(&state.gateway.server_info(request.transaction)),
        verb => wrong_scope_or_unknown(verb, request.transaction),
    }
}

async fn session_post(state: &AppState, session_id: u64, body: &[u8]) -> Response {
    let request = match Request::parse(body) {
        Ok(request) => request,
        Err(e) => return protocol_error(&e, None),
    };
    let transaction = request.transaction.clone();
    match request.verb.as_str() {
        "attach" => {
            let Some(package) = request.plugin.as_deref() else {
                return protocol_error(
                    &ApiError::with_reason(
                        ErrorCode::MissingMandatoryElement,
                        "Missing mandatory element (plugin)",
                    ),
                    Some(transaction),
                );
            };
            match state.gateway.attach(session_id, package).await {
                Ok(handle_id) => {
                    json_reply(&Reply::success(transaction, json!({ "id": handle_id })))
                }
                Err(e) => protocol_error(&e, Some(transaction)),
            }
        }
        "destroy" => match state.gateway.destroy_session(session_id).await {
            Ok(()) => json_reply(&Reply::Success {
                transaction,
                data: None,
            }),
            Err(e) => protocol_error(&e, Some(transaction)),
        },
        verb => wrong_scope_or_unknown(verb, transaction),
    }
}

async fn handle_post(
    state: &AppState,
    session_id: u64,
    handle_id: u64,
    body: &[u8],
) -> Response {
    let request = match Request::parse(body) {
        Ok(request) => request,
        Err(e) => return protocol_error(&e, None),
    };
    let transaction = request.transaction.clone();
    match request.verb.as_str() {
        "detach" => match state.gateway.detach(session_id, handle_id).await {
            Ok(()) => json_reply(&Reply::Success {
                transaction,
                data: None,
            }),
            Err(e) => protocol_error(&e, Some(transaction)),
        },
        "message" => {
            let Some(body) = request.body else {
                return protocol_error(
                    &ApiError::with_reason(
                        ErrorCode::MissingMandatoryElement,
                        "Missing mandatory element (body)",
                    ),
                    Some(transaction),
                );
            };
            // The ack is synchronous; the plugin's real answer arrives on the
            // session's event queue.
            match state
                .gateway
                .message(
                    session_id,
                    handle_id,
                    Some(transaction.clone()),
                    body,
                    request.jsep,
                )
                .await
            {
                Ok(()) => json_reply(&Reply::ack(transaction)),
                Err(e) => protocol_error(&e, Some(transaction)),
            }
        }
        verb => wrong_scope_or_unknown(verb, transaction),
    }
}

/// Long-poll drain of the session's event queue; an empty 30 s window is a
/// keepalive, not an error.
async fn long_poll(state: &AppState, session_id: u64) -> Response {
    match state.gateway.poll(session_id).await {
        Ok(Some(event)) => Json(event).into_response(),
        Ok(None) => json_reply(&Reply::Keepalive),
        Err(e) => protocol_error(&e, None),
    }
}

/// Known verb at the wrong depth vs. a verb nobody knows.
fn wrong_scope_or_unknown(verb: &str, transaction: String) -> Response {
    const KNOWN_VERBS: &[&str] = &["create", "info", "attach", "destroy", "detach", "message"];
    let error = if KNOWN_VERBS.contains(&verb) {
        ApiError::with_reason(
            ErrorCode::InvalidRequestPath,
            format!("'{verb}' is not valid at this path"),
        )
    } else {
        ApiError::with_reason(ErrorCode::UnknownRequest, format!("Unknown request '{verb}'"))
    };
    protocol_error(&error, Some(transaction))
}

fn json_reply(reply: &Reply) -> Response {
    Json(reply).into_response()
}

/// Protocol errors ride an HTTP 200; the code lives in the envelope.
fn protocol_error(error: &ApiError, transaction: Option<String>) -> Response {
    Json(Reply::error(error, transaction)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use gatehouse_core::transport::memory::MemoryTransportFactory;
    use gatehouse_core::{Plugin as _, PluginHost};
    use gatehouse_videocall::{VIDEOCALL_PACKAGE, VideoCallPlugin};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    const OFFER: &str = "v=0\r\n\
        s=-\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=ice-ufrag:alicefrag\r\n\
        a=candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=candidate:2 1 udp 2130706431 192.0.2.1 5002 typ host\r\n";

    const ANSWER: &str = "v=0\r\n\
        s=-\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=ice-ufrag:bobfrag\r\n\
        a=candidate:3 1 udp 2130706431 192.0.2.2 6000 typ host\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=candidate:4 1 udp 2130706431 192.0.2.2 6002 typ host\r\n";

    struct TestApp {
        app: Router,
        gateway: Arc<Gateway>,
        plugin: Arc<VideoCallPlugin>,
        transports: Arc<MemoryTransportFactory>,
        _stop_tx: watch::Sender<bool>,
    }

    async fn test_app() -> TestApp {
        let plugin = VideoCallPlugin::new();
        let mut host = PluginHost::new();
        host.register(plugin.clone()).unwrap();
        let transports = Arc::new(MemoryTransportFactory::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let gateway = Gateway::new(host, transports.clone(), stop_rx);
        gateway.start(&std::env::temp_dir()).await.unwrap();

        let state = Arc::new(AppState {
            gateway: Arc::clone(&gateway),
            base_path: "/janus".to_string(),
        });
        TestApp {
            app: build_router(state),
            gateway,
            plugin,
            transports,
            _stop_tx: stop_tx,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    /// GET with a hard timeout so a missing event fails the test instead of
    /// parking it behind the 30 s long-poll window.
    async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            app.clone().oneshot(request),
        )
        .await
        .expect("long-poll did not resolve in time")
        .unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    async fn create_session(app: &Router, transaction: &str) -> u64 {
        let (status, reply) = post(
            app,
            "/janus",
            json!({"janus": "create", "transaction": transaction}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["janus"], "success");
        assert_eq!(reply["transaction"], transaction);
        reply["data"]["id"].as_u64().expect("session id")
    }

    async fn attach_videocall(app: &Router, session_id: u64) -> u64 {
        let (status, reply) = post(
            app,
            &format!("/janus/{session_id}"),
            json!({"janus": "attach", "transaction": "ta", "plugin": VIDEOCALL_PACKAGE}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["janus"], "success");
        reply["data"]["id"].as_u64().expect("handle id")
    }

    /// Register a username; consumes the `registered` event.
    async fn register(app: &Router, session_id: u64, handle_id: u64, username: &str) {
        let (_, ack) = post(
            app,
            &format!("/janus/{session_id}/{handle_id}"),
            json!({
                "janus": "message",
                "transaction": "tr",
                "body": {"request": "register", "username": username},
            }),
        )
        .await;
        assert_eq!(ack["janus"], "ack");
        let (_, event) = get(app, &format!("/janus/{session_id}")).await;
        assert_eq!(event["plugindata"]["data"]["event"], "registered");
    }

    // --- Scenario: create then destroy -----------------------------------

    #[tokio::test]
    async fn create_destroy_roundtrip() {
        let t = test_app().await;

        let session_id = create_session(&t.app, "t1").await;

        let (status, reply) = post(
            &t.app,
            &format!("/janus/{session_id}"),
            json!({"janus": "destroy", "transaction": "t2"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["janus"], "success");

        // The session is gone; a poll reports it at the protocol level.
        let (status, reply) = get(&t.app, &format!("/janus/{session_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["janus"], "error");
        assert_eq!(
            reply["error"]["code"],
            ErrorCode::SessionNotFound.code()
        );
    }

    // --- Scenario: attach to an unknown plugin ---------------------------

    #[tokio::test]
    async fn attach_unknown_plugin_reports_plugin_not_found() {
        let t = test_app().await;
        let session_id = create_session(&t.app, "t").await;

        let (status, reply) = post(
            &t.app,
            &format!("/janus/{session_id}"),
            json!({"janus": "attach", "transaction": "t", "plugin": "nope"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["janus"], "error");
        assert_eq!(reply["error"]["code"], ErrorCode::PluginNotFound.code());
    }

    // --- Scenario: register collision ------------------------------------

    #[tokio::test]
    async fn register_collision_over_http() {
        let t = test_app().await;

        let s1 = create_session(&t.app, "t").await;
        let h1 = attach_videocall(&t.app, s1).await;
        register(&t.app, s1, h1, "alice").await;

        let s2 = create_session(&t.app, "t").await;
        let h2 = attach_videocall(&t.app, s2).await;
        let (_, ack) = post(
            &t.app,
            &format!("/janus/{s2}/{h2}"),
            json!({
                "janus": "message",
                "transaction": "tx",
                "body": {"request": "register", "username": "alice"},
            }),
        )
        .await;
        assert_eq!(ack["janus"], "ack");

        let (_, event) = get(&t.app, &format!("/janus/{s2}")).await;
        assert_eq!(event["janus"], "event");
        assert_eq!(event["sender"], h2);
        assert_eq!(
            event["plugindata"]["data"]["error"],
            "Username 'alice' already taken"
        );
    }

    // --- Scenario: a full call -------------------------------------------

    #[tokio::test]
    async fn full_videocall_over_http() {
        let t = test_app().await;

        let (alice_session, alice_handle) = {
            let s = create_session(&t.app, "t").await;
            let h = attach_videocall(&t.app, s).await;
            register(&t.app, s, h, "alice").await;
            (s, h)
        };
        let (bob_session, bob_handle) = {
            let s = create_session(&t.app, "t").await;
            let h = attach_videocall(&t.app, s).await;
            register(&t.app, s, h, "bob").await;
            (s, h)
        };

        // Alice calls Bob with an offer.
        let (_, ack) = post(
            &t.app,
            &format!("/janus/{alice_session}/{alice_handle}"),
            json!({
                "janus": "message",
                "transaction": "t-call",
                "body": {"request": "call", "username": "bob"},
                "jsep": {"type": "offer", "sdp": OFFER},
            }),
        )
        .await;
        assert_eq!(ack["janus"], "ack");
        assert_eq!(ack["transaction"], "t-call");

        let (_, calling) = get(&t.app, &format!("/janus/{alice_session}")).await;
        assert_eq!(calling["plugindata"]["data"]["event"], "calling");

        let (_, incoming) = get(&t.app, &format!("/janus/{bob_session}")).await;
        assert_eq!(incoming["plugindata"]["data"]["event"], "incomingcall");
        assert_eq!(incoming["plugindata"]["data"]["username"], "alice");
        assert_eq!(incoming["jsep"]["type"], "offer");
        let offered_sdp = incoming["jsep"]["sdp"].as_str().unwrap();
        assert!(
            !offered_sdp.contains("alicefrag"),
            "browser credentials must not cross the gateway"
        );
        assert!(offered_sdp.contains("a=ice-ufrag:memfrag"));

        // Bob accepts with an answer.
        let (_, ack) = post(
            &t.app,
            &format!("/janus/{bob_session}/{bob_handle}"),
            json!({
                "janus": "message",
                "transaction": "t-accept",
                "body": {"request": "accept"},
                "jsep": {"type": "answer", "sdp": ANSWER},
            }),
        )
        .await;
        assert_eq!(ack["janus"], "ack");

        let (_, accepted_ack) = get(&t.app, &format!("/janus/{bob_session}")).await;
        assert_eq!(accepted_ack["plugindata"]["data"]["event"], "accepted");

        let (_, accepted) = get(&t.app, &format!("/janus/{alice_session}")).await;
        assert_eq!(accepted["plugindata"]["data"]["event"], "accepted");
        assert_eq!(accepted["plugindata"]["data"]["username"], "bob");
        assert_eq!(accepted["jsep"]["type"], "answer");
    }

    // --- Scenario: muting audio drops its RTP ----------------------------

    #[tokio::test]
    async fn muted_audio_is_dropped_not_relayed() {
        let t = test_app().await;

        let alice_session = create_session(&t.app, "t").await;
        let alice_handle = attach_videocall(&t.app, alice_session).await;
        register(&t.app, alice_session, alice_handle, "alice").await;
        let bob_session = create_session(&t.app, "t").await;
        let bob_handle = attach_videocall(&t.app, bob_session).await;
        register(&t.app, bob_session, bob_handle, "bob").await;

        post(
            &t.app,
            &format!("/janus/{alice_session}/{alice_handle}"),
            json!({
                "janus": "message", "transaction": "t",
                "body": {"request": "call", "username": "bob"},
                "jsep": {"type": "offer", "sdp": OFFER},
            }),
        )
        .await;
        get(&t.app, &format!("/janus/{alice_session}")).await; // calling
        get(&t.app, &format!("/janus/{bob_session}")).await; // incomingcall
        post(
            &t.app,
            &format!("/janus/{bob_session}/{bob_handle}"),
            json!({
                "janus": "message", "transaction": "t",
                "body": {"request": "accept"},
                "jsep": {"type": "answer", "sdp": ANSWER},
            }),
        )
        .await;
        get(&t.app, &format!("/janus/{bob_session}")).await; // accepted ack
        get(&t.app, &format!("/janus/{alice_session}")).await; // accepted

        // Mute Alice's audio.
        post(
            &t.app,
            &format!("/janus/{alice_session}/{alice_handle}"),
            json!({
                "janus": "message", "transaction": "t",
                "body": {"request": "set", "audio": false},
            }),
        )
        .await;
        let (_, ack) = get(&t.app, &format!("/janus/{alice_session}")).await;
        assert_eq!(ack["plugindata"]["data"]["event"], "set");

        // Audio frames from Alice vanish; video still reaches Bob.
        let session = t
            .gateway
            .registry()
            .find_session(alice_session)
            .await
            .unwrap();
        let alice = t
            .gateway
            .registry()
            .find_handle(&session, alice_handle)
            .await
            .unwrap();
        t.plugin.incoming_rtp(&alice, false, b"audio");
        t.plugin.incoming_rtp(&alice, true, b"video");

        let bob_transport = t.transports.transport_for(bob_handle).unwrap();
        assert_eq!(bob_transport.sent_rtp(), vec![(true, b"video".to_vec())]);
    }

    // --- Scenario: long-poll timeout -------------------------------------

    #[tokio::test(start_paused = true)]
    async fn idle_long_poll_returns_keepalive() {
        let t = test_app().await;
        let session_id = create_session(&t.app, "t").await;

        let request = axum::http::Request::builder()
            .uri(format!("/janus/{session_id}"))
            .body(Body::empty())
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = body_json(response).await;
        assert_eq!(reply, json!({"janus": "keepalive"}));
    }

    // --- Path/method/envelope edge cases ---------------------------------

    #[tokio::test]
    async fn get_on_root_requires_post() {
        let t = test_app().await;
        let (status, reply) = get(&t.app, "/janus").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["janus"], "error");
        assert_eq!(reply["error"]["code"], ErrorCode::UsePost.code());
    }

    #[tokio::test]
    async fn get_on_handle_path_redirects_to_session() {
        let t = test_app().await;
        let request = axum::http::Request::builder()
            .uri("/janus/11/22")
            .body(Body::empty())
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "/janus/11"
        );
    }

    #[tokio::test]
    async fn unsupported_methods_are_501() {
        let t = test_app().await;
        for uri in ["/janus", "/janus/1", "/janus/1/2"] {
            let request = axum::http::Request::builder()
                .method("PUT")
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let response = t.app.clone().oneshot(request).await.unwrap();
            assert_eq!(
                response.status(),
                StatusCode::NOT_IMPLEMENTED,
                "PUT {uri} should be 501"
            );
        }
    }

    #[tokio::test]
    async fn malformed_paths_are_404() {
        let t = test_app().await;
        for uri in ["/janus/abc", "/janus/1/xyz", "/janus/1/2/3", "/elsewhere"] {
            let request = axum::http::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let response = t.app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "GET {uri}");
        }
    }

    #[tokio::test]
    async fn malformed_json_reports_position() {
        let t = test_app().await;
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/janus")
            .body(Body::from("{oops"))
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = body_json(response).await;
        assert_eq!(reply["error"]["code"], ErrorCode::InvalidJson.code());
        assert!(
            reply["error"]["reason"]
                .as_str()
                .unwrap()
                .contains("line 1")
        );
    }

    #[tokio::test]
    async fn message_at_session_scope_is_an_invalid_path() {
        let t = test_app().await;
        let session_id = create_session(&t.app, "t").await;
        let (_, reply) = post(
            &t.app,
            &format!("/janus/{session_id}"),
            json!({"janus": "message", "transaction": "t", "body": {}}),
        )
        .await;
        assert_eq!(reply["janus"], "error");
        assert_eq!(
            reply["error"]["code"],
            ErrorCode::InvalidRequestPath.code()
        );
    }

    #[tokio::test]
    async fn unknown_verb_is_unknown_request() {
        let t = test_app().await;
        let (_, reply) = post(
            &t.app,
            "/janus",
            json!({"janus": "teleport", "transaction": "t"}),
        )
        .await;
        assert_eq!(reply["error"]["code"], ErrorCode::UnknownRequest.code());
        assert_eq!(reply["transaction"], "t");
    }

    #[tokio::test]
    async fn message_without_body_is_missing_element() {
        let t = test_app().await;
        let session_id = create_session(&t.app, "t").await;
        let handle_id = attach_videocall(&t.app, session_id).await;
        let (_, reply) = post(
            &t.app,
            &format!("/janus/{session_id}/{handle_id}"),
            json!({"janus": "message", "transaction": "t"}),
        )
        .await;
        assert_eq!(
            reply["error"]["code"],
            ErrorCode::MissingMandatoryElement.code()
        );
        assert!(reply["error"]["reason"].as_str().unwrap().contains("body"));
    }

    #[tokio::test]
    async fn message_to_unknown_handle_is_handle_not_found() {
        let t = test_app().await;
        let session_id = create_session(&t.app, "t").await;
        let (_, reply) = post(
            &t.app,
            &format!("/janus/{session_id}/12345"),
            json!({"janus": "message", "transaction": "t", "body": {}}),
        )
        .await;
        assert_eq!(reply["error"]["code"], ErrorCode::HandleNotFound.code());
    }

    #[tokio::test]
    async fn preflight_echoes_requested_methods_and_headers() {
        let t = test_app().await;
        let request = axum::http::Request::builder()
            .method("OPTIONS")
            .uri("/janus")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(headers.get("access-control-allow-methods").unwrap(), "POST");
        assert_eq!(
            headers.get("access-control-allow-headers").unwrap(),
            "content-type"
        );
    }

    #[tokio::test]
    async fn every_response_allows_any_origin() {
        let t = test_app().await;
        let (_, _) = post(&t.app, "/janus", json!({"janus": "create", "transaction": "t"})).await;
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/janus")
            .body(Body::from(
                serde_json::to_vec(&json!({"janus": "create", "transaction": "t"})).unwrap(),
            ))
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn info_lists_the_videocall_plugin() {
        let t = test_app().await;
        let (_, reply) = post(
            &t.app,
            "/janus",
            json!({"janus": "info", "transaction": "t-info"}),
        )
        .await;
        assert_eq!(reply["janus"], "server_info");
        assert_eq!(reply["transaction"], "t-info");
        assert!(reply["plugins"][VIDEOCALL_PACKAGE].is_object());
    }

    #[tokio::test]
    async fn destroy_unknown_session_is_session_not_found() {
        let t = test_app().await;
        let (_, reply) = post(
            &t.app,
            "/janus/424242",
            json!({"janus": "destroy", "transaction": "t"}),
        )
        .await;
        assert_eq!(reply["error"]["code"], ErrorCode::SessionNotFound.code());
    }
}
