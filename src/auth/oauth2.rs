//! OAuth2 token-exchange login.
//!
//! One POST to the token endpoint with HTTP Basic client credentials and a
//! JSON grant body; the reply must be JSON carrying `token_type`,
//! `access_token` and `expires_in`. The resulting bearer token is attached
//! to every subsequent request until it expires, at which point the next
//! operation's auth check runs the exchange again.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};

use crate::core::{ContractError, Error, OpHandle, ProtocolError, StateMachine};
use crate::http::HttpRequest;
use crate::session::SessionInner;

use super::Credentials;

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokenState {
    Init,
    Login,
    Failed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokenEvent {
    Start,
    LoginOk,
    Exception,
    Retry,
    Abort,
}

fn token_machine() -> Result<StateMachine<TokenState, TokenEvent>, ContractError> {
    use TokenEvent as E;
    use TokenState as S;
    StateMachine::new(
        S::Init,
        &[S::Done],
        &[
            // Event            Current state       New state
            (E::Start, Some(S::Init), S::Login),
            (E::LoginOk, Some(S::Login), S::Done),
            (E::Exception, None, S::Failed),
            (E::Retry, Some(S::Failed), S::Login),
            (E::Abort, Some(S::Failed), S::Done),
        ],
    )
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
    let mut machine = token_machine()?;
    let mut budget = session.config().retries;
    let mut creds: Option<Credentials> = None;
    let mut failure: Option<Error> = None;

    loop {
        match machine.current() {
            TokenState::Init => {
                machine.fire(TokenEvent::Start)?;
            }
            TokenState::Login => {
                match exchange(session).await {
                    Ok(c) => {
                        creds = Some(c);
                        machine.fire(TokenEvent::LoginOk)?
                    }
                    Err(e) => {
                        failure = Some(e);
                        machine.fire(TokenEvent::Exception)?
                    }
                };
            }
            TokenState::Failed => {
                let err = failure.take().ok_or(ContractError::NotReady)?;
                if err.is_retryable() && budget > 0 {
                    budget -= 1;
                    tracing::warn!(remaining = budget, error = %err, "token exchange failed, retrying");
                    machine.fire(TokenEvent::Retry)?;
                } else {
                    failure = Some(err);
                    machine.fire(TokenEvent::Abort)?;
                }
            }
            TokenState::Done => {
                let result = match failure.take() {
                    Some(err) => Err(err),
                    None => creds
                        .take()
                        .ok_or(ContractError::NotReady)
                        .map_err(Error::from),
                };
                handle.complete(result);
                return Ok(());
            }
        }
    }
}

async fn exchange(session: &SessionInner) -> Result<Credentials, Error> {
    let config = session.config();
    let body = grant_body(&config.username, &config.password);
    let request = HttpRequest::post(&config.token_path)
        .header(
            "Authorization",
            super::basic_authorization(&config.client_id, &config.client_secret),
        )
        .header("Accept", "application/json")
        .body(body.to_string().into_bytes(), "application/json")
        .pristine();
    let response = session.request(request).await?;

    if response.content_type() != Some("application/json") {
        return Err(ProtocolError::UnrecognizedContentType {
            content_type: response.content_type().unwrap_or("").to_string(),
        }
        .into());
    }
    let reply: Value = serde_json::from_str(&response.text()).map_err(|e| {
        Error::from(ProtocolError::Malformed {
            message: format!("token reply is not valid JSON: {e}"),
        })
    })?;
    parse_token_reply(&reply)
}

/// Password grant when a username is configured, client-credentials grant
/// otherwise.
fn grant_body(username: &str, password: &str) -> Value {
    if username.is_empty() {
        json!({ "grant_type": "client_credentials" })
    } else {
        json!({
            "username": username,
            "password": password,
            "grant_type": "password",
        })
    }
}

fn parse_token_reply(reply: &Value) -> Result<Credentials, Error> {
    for key in ["token_type", "access_token", "expires_in"] {
        if reply.get(key).is_none() {
            return Err(ProtocolError::Malformed {
                message: format!("missing {key} in token reply"),
            }
            .into());
        }
    }
    let token = reply["access_token"]
        .as_str()
        .ok_or_else(|| {
            Error::from(ProtocolError::Malformed {
                message: "access_token is not a string".to_string(),
            })
        })?
        .to_string();
    let expires = reply["expires_in"]
        .as_i64()
        .map(|secs| Utc::now() + TimeDelta::seconds(secs));
    Ok(Credentials::Bearer { token, expires })
}
