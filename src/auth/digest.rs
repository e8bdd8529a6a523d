//! Cookie-bootstrap plus digest-scheme login (older Niagara servers).
//!
//! Two rounds: an unauthenticated GET of the login page to collect the
//! server's session cookies, then a POST carrying the `cookieDigest`
//! scheme parameters with HTTP Basic credentials. A response body that
//! still looks like a login page means the server rejected the
//! credentials. Both rounds tolerate a 404, which some firmware returns
//! for the login URL even on success.

use std::sync::Arc;

use crate::core::{ContractError, Error, OpHandle, StateMachine};
use crate::http::HttpRequest;
use crate::session::SessionInner;

use super::Credentials;

#[derive(Debug, Clone, Copy, PartialEq)]
enum DigestState {
    Init,
    NewSession,
    Login,
    Failed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DigestEvent {
    Start,
    SessionOk,
    LoginOk,
    Exception,
    Retry,
    Abort,
}

fn digest_machine() -> Result<StateMachine<DigestState, DigestEvent>, ContractError> {
    use DigestEvent as E;
    use DigestState as S;
    StateMachine::new(
        S::Init,
        &[S::Done],
        &[
            // Event            Current state           New state
            (E::Start, Some(S::Init), S::NewSession),
            (E::SessionOk, Some(S::NewSession), S::Login),
            (E::LoginOk, Some(S::Login), S::Done),
            (E::Exception, None, S::Failed),
            (E::Retry, Some(S::Failed), S::NewSession),
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
    let mut machine = digest_machine()?;
    let mut budget = session.config().retries;
    let mut cookies: Vec<(String, String)> = Vec::new();
    let mut failure: Option<Error> = None;

    loop {
        match machine.current() {
            DigestState::Init => {
                machine.fire(DigestEvent::Start)?;
            }
            DigestState::NewSession => {
                cookies.clear();
                match new_session(session).await {
                    Ok(c) => {
                        cookies = c;
                        machine.fire(DigestEvent::SessionOk)?
                    }
                    Err(e) => {
                        failure = Some(e);
                        machine.fire(DigestEvent::Exception)?
                    }
                };
            }
            DigestState::Login => {
                match login(session, &cookies).await {
                    Ok(()) => machine.fire(DigestEvent::LoginOk)?,
                    Err(e) => {
                        failure = Some(e);
                        machine.fire(DigestEvent::Exception)?
                    }
                };
            }
            DigestState::Failed => {
                let err = failure.take().ok_or(ContractError::NotReady)?;
                if err.is_retryable() && budget > 0 {
                    budget -= 1;
                    tracing::warn!(remaining = budget, error = %err, "cookie login failed, retrying");
                    machine.fire(DigestEvent::Retry)?;
                } else {
                    failure = Some(err);
                    machine.fire(DigestEvent::Abort)?;
                }
            }
            DigestState::Done => {
                let result = match failure.take() {
                    Some(err) => Err(err),
                    None => {
                        let config = session.config();
                        Ok(Credentials::BasicWithCookies {
                            authorization: super::basic_authorization(
                                &config.username,
                                &config.password,
                            ),
                            cookies: std::mem::take(&mut cookies),
                        })
                    }
                };
                handle.complete(result);
                return Ok(());
            }
        }
    }
}

/// Fetch the login page without credentials to pick up session cookies.
async fn new_session(session: &SessionInner) -> Result<Vec<(String, String)>, Error> {
    let request = HttpRequest::get("login").accept_status(&[404]).pristine();
    let response = session.request(request).await?;
    Ok(response.cookies.clone())
}

/// Submit the digest-scheme login with HTTP Basic credentials.
async fn login(session: &SessionInner, cookies: &[(String, String)]) -> Result<(), Error> {
    let config = session.config();
    // Niagara AX 3.7 does not hand out this cookie; an empty postfix is
    // accepted there.
    let niagara_session = cookies
        .iter()
        .find(|(name, _)| name == "niagara_session")
        .map(|(_, value)| value.clone())
        .unwrap_or_default();

    let request = HttpRequest::post("login")
        .param("token", "")
        .param("scheme", "cookieDigest")
        .param("absPathBase", "/")
        .param("content-type", "application/x-niagara-login-support")
        .param("Referer", session.resolve("login/")?)
        .param("accept", "text/zinc; charset=utf-8")
        .param("cookiePostfix", niagara_session)
        .header(
            "Authorization",
            super::basic_authorization(&config.username, &config.password),
        )
        .accept_status(&[404])
        .pristine();
    let request = cookies
        .iter()
        .fold(request, |req, (name, value)| req.cookie(name, value));
    let response = session.request(request).await?;

    if looks_like_login_page(&response.text()) {
        return Err(Error::auth("server presented the login page again"));
    }
    Ok(())
}

fn looks_like_login_page(text: &str) -> bool {
    text.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("login"))
}
