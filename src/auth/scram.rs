//! SCRAM-SHA-256 login handshake over HTTP.
//!
//! The exchange runs over plain POSTs rather than SASL framing: the client
//! first/final messages travel in an `action=...` form body and the server
//! answers with the comma-separated SCRAM fields in the response body. The
//! derivation itself is standard RFC 5802/7677 SCRAM with SHA-256:
//!
//! 1. clear any previous server-side session,
//! 2. prime the server with the bare username,
//! 3. send `n,,n=<user>,r=<client_nonce>`, receive nonce/salt/iterations
//!    and the session cookie that threads the remaining rounds,
//! 4. send the client proof derived from the PBKDF2 salted password,
//! 5. verify the server's signature (mismatch is fatal) and confirm the
//!    session with one final exchange.
//!
//! Transport failures restart the whole handshake with a fresh nonce, up
//! to the session's retry budget.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64_URL};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::core::{ContractError, Error, OpHandle, ProtocolError, StateMachine};
use crate::http::HttpRequest;
use crate::session::SessionInner;

use super::Credentials;

const LOGIN_SUPPORT_TYPE: &str = "application/x-niagara-login-support";
const USERID_COOKIE: &str = "niagara_userid";
const SESSION_COOKIE: &str = "JSESSIONID";

/// base64 of the GS2 header `n,,`.
const GS2_HEADER_B64: &str = "biws";

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScramState {
    Init,
    NewSession,
    Prelogin,
    FirstMsg,
    SecondMsg,
    ValidateLogin,
    Failed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScramEvent {
    Start,
    SessionOk,
    PreloginOk,
    FirstOk,
    SecondOk,
    LoginOk,
    Exception,
    Retry,
    Abort,
}

fn scram_machine() -> Result<StateMachine<ScramState, ScramEvent>, ContractError> {
    use ScramEvent as E;
    use ScramState as S;
    StateMachine::new(
        S::Init,
        &[S::Done],
        &[
            // Event            Current state            New state
            (E::Start, Some(S::Init), S::NewSession),
            (E::SessionOk, Some(S::NewSession), S::Prelogin),
            (E::PreloginOk, Some(S::Prelogin), S::FirstMsg),
            (E::FirstOk, Some(S::FirstMsg), S::SecondMsg),
            (E::SecondOk, Some(S::SecondMsg), S::ValidateLogin),
            (E::LoginOk, Some(S::ValidateLogin), S::Done),
            (E::Exception, None, S::Failed),
            (E::Retry, Some(S::Failed), S::NewSession),
            (E::Abort, Some(S::Failed), S::Done),
        ],
    )
}

/// Per-attempt handshake state. A retry discards all of it, including the
/// nonce.
#[derive(Default)]
struct Attempt {
    client_nonce: String,
    client_first_msg: String,
    server_first_msg: String,
    server_nonce: String,
    salted_password: [u8; 32],
    session_cookie: Option<String>,
}

impl Attempt {
    fn auth_message(&self) -> String {
        format!(
            "{},{},{}",
            self.client_first_msg,
            self.server_first_msg,
            self.client_final_without_proof()
        )
    }

    fn client_final_without_proof(&self) -> String {
        format!("c={GS2_HEADER_B64},r={}", self.server_nonce)
    }

    fn round_cookies(&self, username: &str) -> Vec<(String, String)> {
        let mut cookies = vec![(USERID_COOKIE.to_string(), username.to_string())];
        if let Some(jsession) = &self.session_cookie {
            cookies.push((SESSION_COOKIE.to_string(), jsession.clone()));
        }
        cookies
    }
}

pub(crate) fn spawn_login(session: Arc<SessionInner>) -> OpHandle<Credentials> {
    let handle = OpHandle::new();
    let driver_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = drive(&session, &driver_handle).await {
            driver_handle.complete(Err(err));
        }
    });
    handle
}

async fn drive(session: &Arc<SessionInner>, handle: &OpHandle<Credentials>) -> Result<(), Error> {
    let mut machine = scram_machine()?;
    let mut budget = session.config().retries;
    let mut attempt = Attempt::default();
    let mut failure: Option<Error> = None;

    loop {
        match machine.current() {
            ScramState::Init => {
                machine.fire(ScramEvent::Start)?;
            }
            ScramState::NewSession => {
                attempt = Attempt::default();
                match new_session(session).await {
                    Ok(()) => machine.fire(ScramEvent::SessionOk)?,
                    Err(e) => {
                        failure = Some(e);
                        machine.fire(ScramEvent::Exception)?
                    }
                };
            }
            ScramState::Prelogin => {
                match prelogin(session).await {
                    Ok(()) => machine.fire(ScramEvent::PreloginOk)?,
                    Err(e) => {
                        failure = Some(e);
                        machine.fire(ScramEvent::Exception)?
                    }
                };
            }
            ScramState::FirstMsg => {
                match first_msg(session, &mut attempt).await {
                    Ok(()) => machine.fire(ScramEvent::FirstOk)?,
                    Err(e) => {
                        failure = Some(e);
                        machine.fire(ScramEvent::Exception)?
                    }
                };
            }
            ScramState::SecondMsg => {
                match second_msg(session, &mut attempt).await {
                    Ok(()) => machine.fire(ScramEvent::SecondOk)?,
                    Err(e) => {
                        failure = Some(e);
                        machine.fire(ScramEvent::Exception)?
                    }
                };
            }
            ScramState::ValidateLogin => {
                match validate_login(session, &attempt).await {
                    Ok(()) => machine.fire(ScramEvent::LoginOk)?,
                    Err(e) => {
                        failure = Some(e);
                        machine.fire(ScramEvent::Exception)?
                    }
                };
            }
            ScramState::Failed => {
                let err = failure.take().ok_or(ContractError::NotReady)?;
                if err.is_retryable() && budget > 0 {
                    budget -= 1;
                    tracing::warn!(remaining = budget, error = %err, "login handshake failed, restarting");
                    machine.fire(ScramEvent::Retry)?;
                } else {
                    failure = Some(err);
                    machine.fire(ScramEvent::Abort)?;
                }
            }
            ScramState::Done => {
                let result = match failure.take() {
                    Some(err) => Err(err),
                    None => Ok(Credentials::Cookies(
                        attempt.round_cookies(&session.config().username),
                    )),
                };
                handle.complete(result);
                return Ok(());
            }
        }
    }
}

/// Clear any previous server-side session.
async fn new_session(session: &SessionInner) -> Result<(), Error> {
    let request = HttpRequest::get("prelogin").param("clear", "true").pristine();
    session.request(request).await?;
    Ok(())
}

/// Prime the server with the username alone.
async fn prelogin(session: &SessionInner) -> Result<(), Error> {
    let username = &session.config().username;
    let request = HttpRequest::post("prelogin")
        .param("j_username", username)
        .pristine();
    session.request(request).await?;
    Ok(())
}

/// First round: send the client nonce, receive nonce/salt/iterations and
/// the session cookie.
async fn first_msg(session: &SessionInner, attempt: &mut Attempt) -> Result<(), Error> {
    let config = session.config();
    attempt.client_nonce = client_nonce();
    attempt.client_first_msg = format!("n={},r={}", config.username, attempt.client_nonce);

    let body = format!(
        "action=sendClientFirstMessage&clientFirstMessage=n,,{}",
        attempt.client_first_msg
    );
    let request = HttpRequest::post("j_security_check")
        .cookie(USERID_COOKIE, &config.username)
        .body(body.into_bytes(), LOGIN_SUPPORT_TYPE)
        .pristine();
    let response = session.request(request).await?;

    attempt.session_cookie = response.cookie(SESSION_COOKIE).map(str::to_string);
    attempt.server_first_msg = response.text();
    let (server_nonce, salt, iterations) = parse_server_first(&attempt.server_first_msg)?;

    if !server_nonce.starts_with(&attempt.client_nonce) {
        if config.strict_nonce {
            return Err(Error::auth("server nonce does not extend the client nonce"));
        }
        tracing::warn!("server nonce does not extend the client nonce");
    }
    attempt.server_nonce = server_nonce;
    attempt.salted_password = salted_password(&config.password, &salt, iterations);
    Ok(())
}

/// Second round: send the client proof, verify the server signature.
async fn second_msg(session: &SessionInner, attempt: &mut Attempt) -> Result<(), Error> {
    let config = session.config();
    let auth_message = attempt.auth_message();
    let proof = client_proof(&attempt.salted_password, &auth_message);
    let body = format!(
        "action=sendClientFinalMessage&clientFinalMessage={},p={}",
        attempt.client_final_without_proof(),
        proof
    );
    let request = HttpRequest::post("j_security_check")
        .body(body.into_bytes(), LOGIN_SUPPORT_TYPE)
        .pristine();
    let request = attempt
        .round_cookies(&config.username)
        .into_iter()
        .fold(request, |req, (name, value)| req.cookie(name, value));
    let response = session.request(request).await?;

    let server_final = response.text();
    let remote = B64
        .decode(field_value(server_final.trim())?)
        .map_err(|_| malformed("server signature is not valid base64"))?;
    let expected = server_signature(&attempt.salted_password, &auth_message);
    if !bool::from(expected.ct_eq(remote.as_slice())) {
        // Wrong password or a tampered exchange. Retrying cannot help.
        return Err(Error::auth("local and remote signatures differ"));
    }
    Ok(())
}

/// Final exchange confirming the server accepted the login.
async fn validate_login(session: &SessionInner, attempt: &Attempt) -> Result<(), Error> {
    let config = session.config();
    let request = HttpRequest::post("j_security_check")
        .body(Vec::new(), LOGIN_SUPPORT_TYPE)
        .pristine();
    let request = attempt
        .round_cookies(&config.username)
        .into_iter()
        .fold(request, |req, (name, value)| req.cookie(name, value));
    session.request(request).await?;
    Ok(())
}

/// 16 random bytes, base64url without padding.
fn client_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    B64_URL.encode(bytes)
}

/// PBKDF2-HMAC-SHA256 of the password.
pub fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), salt, iterations)
}

/// `base64(ClientKey XOR HMAC(H(ClientKey), auth_message))`.
pub fn client_proof(salted_password: &[u8], auth_message: &str) -> String {
    let client_key = hmac_sha256(salted_password, b"Client Key");
    let stored_key = Sha256::digest(client_key);
    let signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let proof: Vec<u8> = client_key
        .iter()
        .zip(signature)
        .map(|(key, sig)| key ^ sig)
        .collect();
    B64.encode(proof)
}

/// `HMAC(HMAC(salted_password, "Server Key"), auth_message)`.
pub fn server_signature(salted_password: &[u8], auth_message: &str) -> [u8; 32] {
    let server_key = hmac_sha256(salted_password, b"Server Key");
    hmac_sha256(&server_key, auth_message.as_bytes())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC key");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Parse the server-first message: nonce, salt and iteration count as
/// comma-separated `key=value` fields in fixed order.
pub fn parse_server_first(message: &str) -> Result<(String, Vec<u8>, u32), Error> {
    let mut fields = message.trim().splitn(3, ',');
    let nonce = field_value(fields.next().unwrap_or(""))?.to_string();
    let salt = B64
        .decode(field_value(fields.next().unwrap_or(""))?)
        .map_err(|_| malformed("server salt is not valid base64"))?;
    let iterations: u32 = field_value(fields.next().unwrap_or(""))?
        .parse()
        .map_err(|_| malformed("iteration count is not a number"))?;
    Ok((nonce, salt, iterations))
}

fn field_value(field: &str) -> Result<&str, Error> {
    field
        .split_once('=')
        .map(|(_, value)| value)
        .ok_or_else(|| malformed(format!("expected key=value, got {field:?}")))
}

fn malformed(message: impl Into<String>) -> Error {
    ProtocolError::Malformed {
        message: message.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // RFC 7677 SCRAM-SHA-256 test vector.
    const USERNAME: &str = "user";
    const PASSWORD: &str = "pencil";
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    fn vector_auth_message() -> String {
        let server_nonce = "rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";
        format!("n={USERNAME},r={CLIENT_NONCE},{SERVER_FIRST},c=biws,r={server_nonce}")
    }

    #[test]
    fn known_vector_client_proof() {
        let (_, salt, iterations) = parse_server_first(SERVER_FIRST).unwrap();
        let salted = salted_password(PASSWORD, &salt, iterations);
        assert_eq!(
            client_proof(&salted, &vector_auth_message()),
            "dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
    }

    #[test]
    fn known_vector_server_signature() {
        let (_, salt, iterations) = parse_server_first(SERVER_FIRST).unwrap();
        let salted = salted_password(PASSWORD, &salt, iterations);
        assert_eq!(
            B64.encode(server_signature(&salted, &vector_auth_message())),
            "6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4="
        );
    }

    #[test]
    fn server_first_fields_parse_in_order() {
        let (nonce, salt, iterations) = parse_server_first(SERVER_FIRST).unwrap();
        assert!(nonce.starts_with(CLIENT_NONCE));
        assert_eq!(salt.len(), 16);
        assert_eq!(iterations, 4096);
    }

    #[test]
    fn malformed_server_first_is_a_protocol_error() {
        assert!(parse_server_first("not scram at all").is_err());
        assert!(parse_server_first("r=abc,s=!!!,i=4096").is_err());
        assert!(parse_server_first("r=abc,s=c2FsdA==,i=lots").is_err());
    }

    #[test]
    fn client_nonces_are_unpadded_base64url() {
        let nonce = client_nonce();
        assert_eq!(nonce.len(), 22);
        assert!(!nonce.contains('='));
        assert_ne!(nonce, client_nonce());
    }

    #[test]
    fn handshake_machine_table_is_unambiguous() {
        let mut machine = scram_machine().unwrap();
        machine.fire(ScramEvent::Start).unwrap();
        machine.fire(ScramEvent::Exception).unwrap();
        machine.fire(ScramEvent::Retry).unwrap();
        assert_eq!(machine.current(), ScramState::NewSession);
    }
}
