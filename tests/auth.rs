//! Login handshake tests: SCRAM, OAuth2 and cookie/digest against a
//! scripted in-memory transport.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::*;
use haystack_client::auth::scram::{client_proof, parse_server_first, salted_password, server_signature};
use haystack_client::{
    AuthMethod, Credentials, Error, HttpRequest, HttpResponse, Method, ProtocolError, Session,
};

const SALT_B64: &str = "c2FsdHNhbHRzYWx0c2FsdA==";
const ITERATIONS: u32 = 1024;

/// Server-side SCRAM state shared between handshake rounds.
#[derive(Default)]
struct ScramServer {
    client_first: Option<String>,
    server_first: Option<String>,
    proof_ok: bool,
    first_msgs: usize,
}

fn with_cookie(mut response: HttpResponse, name: &str, value: &str) -> HttpResponse {
    response.cookies.push((name.to_string(), value.to_string()));
    response
}

/// Answer one SCRAM round the way a Niagara 4 station would, deriving the
/// server signature from the same password the client was configured with.
fn scram_round(
    state: &Mutex<ScramServer>,
    password: &str,
    request: &HttpRequest,
    extend_nonce: bool,
) -> HttpResponse {
    let body = String::from_utf8(request.body.clone().unwrap_or_default()).unwrap();
    if let Some(client_first) =
        body.strip_prefix("action=sendClientFirstMessage&clientFirstMessage=n,,")
    {
        let mut server = state.lock();
        server.first_msgs += 1;
        let nonce = client_first.split_once(",r=").map(|(_, n)| n).unwrap();
        let server_nonce = if extend_nonce {
            format!("{nonce}srvpart")
        } else {
            "unrelated-nonce".to_string()
        };
        let server_first = format!("r={server_nonce},s={SALT_B64},i={ITERATIONS}");
        server.client_first = Some(client_first.to_string());
        server.server_first = Some(server_first.clone());
        return with_cookie(text_response(&server_first), "JSESSIONID", "sess-1");
    }
    if let Some(client_final) =
        body.strip_prefix("action=sendClientFinalMessage&clientFinalMessage=")
    {
        let mut server = state.lock();
        let (without_proof, proof) = client_final.rsplit_once(",p=").unwrap();
        let auth_message = format!(
            "{},{},{}",
            server.client_first.as_deref().unwrap(),
            server.server_first.as_deref().unwrap(),
            without_proof
        );
        let (_, salt, iterations) =
            parse_server_first(server.server_first.as_deref().unwrap()).unwrap();
        let salted = salted_password(password, &salt, iterations);
        server.proof_ok = proof == client_proof(&salted, &auth_message);
        let signature = B64.encode(server_signature(&salted, &auth_message));
        return text_response(&format!("v={signature}"));
    }
    // Empty body: the login-confirmation round.
    text_response("")
}

fn scram_session(transport: Arc<FakeTransport>) -> Session {
    Session::builder("http://test.local/")
        .api_dir("haystack")
        .auth_method(AuthMethod::Scram)
        .username("user")
        .password("pencil")
        .retry_policy(fast_retries())
        .transport(transport)
        .build()
        .unwrap()
}

#[tokio::test]
async fn scram_login_installs_session_cookies() {
    let state = Arc::new(Mutex::new(ScramServer::default()));
    let server = state.clone();
    let transport = FakeTransport::new(move |req| {
        if req.uri.ends_with("/prelogin") {
            return Ok(text_response(""));
        }
        if req.uri.ends_with("/j_security_check") {
            return Ok(scram_round(&server, "pencil", req, true));
        }
        Ok(grid_response(sites_grid()))
    });
    let session = scram_session(transport.clone());

    let auth = session.authenticate();
    auth.done().await;
    let Credentials::Cookies(cookies) = auth.result().unwrap() else {
        panic!("expected cookie credentials");
    };
    assert!(cookies.contains(&("niagara_userid".to_string(), "user".to_string())));
    assert!(cookies.contains(&("JSESSIONID".to_string(), "sess-1".to_string())));
    assert!(state.lock().proof_ok, "server rejected the client proof");

    // Subsequent operations carry the session cookies.
    let op = session.about();
    op.done().await;
    assert!(op.result().is_ok());
    let request = transport.last_request();
    assert_eq!(request.uri, "http://test.local/haystack/about");
    assert_eq!(cookie(&request, "JSESSIONID"), Some("sess-1"));
    assert_eq!(cookie(&request, "niagara_userid"), Some("user"));
}

#[tokio::test]
async fn scram_rejects_a_bad_server_signature_without_retrying() {
    let state = Arc::new(Mutex::new(ScramServer::default()));
    let server = state.clone();
    let transport = FakeTransport::new(move |req| {
        if req.uri.ends_with("/prelogin") {
            return Ok(text_response(""));
        }
        let response = scram_round(&server, "pencil", req, true);
        if response.text().starts_with("v=") {
            // Tampered final message.
            return Ok(text_response(&format!("v={}", B64.encode([0u8; 32]))));
        }
        Ok(response)
    });
    let session = scram_session(transport);

    let auth = session.authenticate();
    auth.done().await;
    assert!(matches!(auth.result().unwrap_err(), Error::Auth { .. }));
    // A signature mismatch is fatal: exactly one handshake ran.
    assert_eq!(state.lock().first_msgs, 1);
}

#[tokio::test]
async fn a_non_extending_server_nonce_is_fatal_only_in_strict_mode() {
    for strict in [false, true] {
        let state = Arc::new(Mutex::new(ScramServer::default()));
        let server = state.clone();
        let transport = FakeTransport::new(move |req| {
            if req.uri.ends_with("/prelogin") {
                return Ok(text_response(""));
            }
            Ok(scram_round(&server, "pencil", req, false))
        });
        let session = Session::builder("http://test.local/")
            .auth_method(AuthMethod::Scram)
            .username("user")
            .password("pencil")
            .strict_nonce(strict)
            .retry_policy(fast_retries())
            .transport(transport)
            .build()
            .unwrap();

        let auth = session.authenticate();
        auth.done().await;
        if strict {
            assert!(matches!(auth.result().unwrap_err(), Error::Auth { .. }));
        } else {
            assert!(auth.result().is_ok(), "lenient mode should warn and continue");
        }
    }
}

#[tokio::test]
async fn scram_restarts_the_handshake_after_a_transport_failure() {
    let state = Arc::new(Mutex::new(ScramServer::default()));
    let server = state.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let transport = FakeTransport::new(move |req| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(connection_refused());
        }
        if req.uri.ends_with("/prelogin") {
            return Ok(text_response(""));
        }
        Ok(scram_round(&server, "pencil", req, true))
    });
    let session = scram_session(transport.clone());

    let auth = session.authenticate();
    auth.done().await;
    assert!(auth.result().is_ok());
    // The failed session-clear round was repeated.
    assert_eq!(
        transport
            .requests_to("/prelogin")
            .iter()
            .filter(|req| req.method == Method::Get)
            .count(),
        2
    );
}

fn oauth_session(transport: Arc<FakeTransport>) -> Session {
    Session::builder("http://test.local/")
        .api_dir("haystack")
        .auth_method(AuthMethod::OAuth2)
        .username("alice")
        .password("wonderland")
        .client_credentials("cid", "secret")
        .retry_policy(fast_retries())
        .transport(transport)
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oauth_token_exchange_is_single_flight() {
    let transport = FakeTransport::with_delay(Duration::from_millis(25), |req| {
        if req.uri.ends_with("/oauth2/token") {
            assert_eq!(
                header(req, "Authorization"),
                Some(format!("Basic {}", B64.encode("cid:secret")).as_str())
            );
            let body = body_json(req);
            assert_eq!(body["grant_type"], "password");
            assert_eq!(body["username"], "alice");
            return Ok(grid_response(json!({
                "token_type": "Bearer",
                "access_token": "tok-1",
                "expires_in": 3600,
            })));
        }
        Ok(grid_response(sites_grid()))
    });
    let session = oauth_session(transport.clone());

    let first = session.authenticate();
    let second = session.authenticate();
    first.done().await;
    second.done().await;
    assert!(first.result().is_ok());
    assert!(second.result().is_ok());
    assert_eq!(transport.requests_to("/oauth2/token").len(), 1);

    let op = session.about();
    op.done().await;
    assert!(op.result().is_ok());
    assert_eq!(
        header(&transport.last_request(), "Authorization"),
        Some("Bearer tok-1")
    );
}

#[tokio::test]
async fn operations_trigger_the_login_on_demand() {
    let transport = FakeTransport::new(|req| {
        if req.uri.ends_with("/oauth2/token") {
            return Ok(grid_response(json!({
                "token_type": "Bearer",
                "access_token": "tok-1",
                "expires_in": 3600,
            })));
        }
        Ok(grid_response(sites_grid()))
    });
    let session = oauth_session(transport.clone());

    let op = session.read("site", None);
    op.done().await;
    assert!(op.result().is_ok());

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].uri.ends_with("/oauth2/token"));
    assert!(requests[1].uri.ends_with("/haystack/read"));
}

#[tokio::test]
async fn an_incomplete_token_reply_is_a_protocol_error() {
    let transport = FakeTransport::new(|_| Ok(grid_response(json!({"access_token": "tok-1"}))));
    let session = oauth_session(transport);

    let auth = session.authenticate();
    auth.done().await;
    assert!(matches!(
        auth.result().unwrap_err(),
        Error::Protocol(ProtocolError::Malformed { .. })
    ));
}

#[tokio::test]
async fn a_non_json_token_reply_is_rejected() {
    let transport = FakeTransport::new(|_| Ok(text_response("tok-1")));
    let session = oauth_session(transport);

    let auth = session.authenticate();
    auth.done().await;
    assert!(matches!(
        auth.result().unwrap_err(),
        Error::Protocol(ProtocolError::UnrecognizedContentType { .. })
    ));
}

#[tokio::test]
async fn a_failed_login_fails_the_triggering_operation() {
    let transport = FakeTransport::new(|req| {
        if req.uri.ends_with("/oauth2/token") {
            return Err(connection_refused());
        }
        Ok(grid_response(sites_grid()))
    });
    let session = Session::builder("http://test.local/")
        .api_dir("haystack")
        .auth_method(AuthMethod::OAuth2)
        .client_credentials("cid", "secret")
        .retries(0)
        .retry_policy(fast_retries())
        .transport(transport.clone())
        .build()
        .unwrap();

    let op = session.about();
    op.done().await;
    assert!(matches!(op.result().unwrap_err(), Error::Auth { .. }));
    // The verb itself never hit the wire.
    assert!(transport.requests_to("/haystack/about").is_empty());
}

fn digest_session(transport: Arc<FakeTransport>) -> Session {
    Session::builder("http://test.local/")
        .api_dir("haystack")
        .auth_method(AuthMethod::CookieDigest)
        .username("user")
        .password("pw")
        .retry_policy(fast_retries())
        .transport(transport)
        .build()
        .unwrap()
}

#[tokio::test]
async fn cookie_digest_login_collects_cookies_and_keeps_basic_auth() {
    let transport = FakeTransport::new(|req| {
        if req.uri.ends_with("/login") && req.method == Method::Get {
            let mut resp = response(404, "text/html", "not here");
            resp.cookies
                .push(("niagara_session".to_string(), "abc123".to_string()));
            return Ok(resp);
        }
        if req.uri.ends_with("/login") && req.method == Method::Post {
            assert_eq!(param(req, "scheme"), Some("cookieDigest"));
            assert_eq!(param(req, "cookiePostfix"), Some("abc123"));
            assert_eq!(param(req, "Referer"), Some("http://test.local/login/"));
            assert_eq!(
                header(req, "Authorization"),
                Some(format!("Basic {}", B64.encode("user:pw")).as_str())
            );
            assert_eq!(cookie(req, "niagara_session"), Some("abc123"));
            return Ok(text_response("ok"));
        }
        Ok(grid_response(sites_grid()))
    });
    let session = digest_session(transport.clone());

    let auth = session.authenticate();
    auth.done().await;
    let Credentials::BasicWithCookies { cookies, .. } = auth.result().unwrap() else {
        panic!("expected basic-with-cookies credentials");
    };
    assert!(cookies.contains(&("niagara_session".to_string(), "abc123".to_string())));

    let op = session.about();
    op.done().await;
    assert!(op.result().is_ok());
    let request = transport.last_request();
    assert!(header(&request, "Authorization").is_some());
    assert_eq!(cookie(&request, "niagara_session"), Some("abc123"));
}

#[tokio::test]
async fn a_login_page_in_the_reply_means_bad_credentials() {
    let transport = FakeTransport::new(|req| {
        if req.method == Method::Post {
            return Ok(text_response("Login required"));
        }
        Ok(response(404, "text/html", ""))
    });
    let session = digest_session(transport);

    let auth = session.authenticate();
    auth.done().await;
    assert!(matches!(auth.result().unwrap_err(), Error::Auth { .. }));
}
