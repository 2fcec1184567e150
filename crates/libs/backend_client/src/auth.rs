use crate::error::body_to_error;
use crate::resource::api_url;
use crate::retry::{retry, ExponentialBackoff, RetryError};
use crate::{Backend, BackendError};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Request, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize)]
struct LoginRequest {
    id: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    id: String,
    #[allow(dead_code)]
    name: String,
    #[allow(dead_code)]
    role: String,
    token: String,
}

/// Credentials as served by the attender.
#[derive(Debug, Clone)]
pub struct AuthReply {
    pub user_id: String,
    pub token: String,
    /// True once the token has been served from cache at least once; a
    /// 401/403 with a cached token triggers one re-authentication.
    pub cached: bool,
}

/// A query for credentials, answered over its reply channel.
pub struct AuthQuery {
    pub(crate) fresh: bool,
    pub(crate) reply: oneshot::Sender<Result<AuthReply, BackendError>>,
}

impl Backend {
    /// Attends credential queries, one at a time, so token refresh is
    /// serialized and concurrent callers cannot stampede `/api/login`.
    pub async fn watch_auth(&self, cancel: CancellationToken, mut queries: mpsc::Receiver<AuthQuery>) {
        let mut backoff = ExponentialBackoff::eternal();
        let mut cached: Option<AuthReply> = None;
        loop {
            let query = tokio::select! {
                () = cancel.cancelled() => {
                    info!("credential attender stopping");
                    return;
                }
                query = queries.recv() => match query {
                    Some(query) => query,
                    None => {
                        info!("credential query channel closed");
                        return;
                    }
                },
            };
            if query.fresh {
                cached = None;
            }
            if cached.is_none() {
                match self.login(&cancel, &mut backoff).await {
                    Ok(reply) => cached = Some(reply),
                    Err(err) => {
                        if !err.is_cancelled() {
                            error!(error = %err, "authentication failed");
                        }
                        let _ = query.reply.send(Err(err));
                        continue;
                    }
                }
            }
            if let Some(reply) = &mut cached {
                let _ = query.reply.send(Ok(reply.clone()));
                // the next caller that gets this reply knows it was cached
                reply.cached = true;
            }
        }
    }

    /// Asks the attender for credentials. `fresh` discards the cached token
    /// first.
    pub(crate) async fn auth(&self, fresh: bool) -> Result<AuthReply, BackendError> {
        let (tx, rx) = oneshot::channel();
        self.auth_tx
            .send(AuthQuery { fresh, reply: tx })
            .await
            .map_err(|_| BackendError::AuthChannelClosed)?;
        rx.await.map_err(|_| BackendError::Cancelled)?
    }

    async fn login(
        &self,
        cancel: &CancellationToken,
        backoff: &mut ExponentialBackoff,
    ) -> Result<AuthReply, BackendError> {
        let url = api_url(self.api_url(), &["api", "login"])?;
        let request = LoginRequest {
            id: self.username.clone(),
            password: self.password.clone(),
        };
        let this = self;
        retry(cancel, backoff, None, move || {
            let url = url.clone();
            let request = request.clone();
            async move {
                let resp = this
                    .http()
                    .post(url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|err| RetryError::Transient(err.into()))?;
                if resp.status() != StatusCode::OK {
                    return Err(RetryError::Transient(body_to_error(resp).await));
                }
                let reply: LoginReply = resp
                    .json()
                    .await
                    .map_err(|err| RetryError::Transient(err.into()))?;
                if reply.token.is_empty() {
                    return Err(RetryError::Transient(BackendError::EmptyToken));
                }
                Ok(AuthReply {
                    user_id: reply.id,
                    token: reply.token,
                    cached: false,
                })
            }
        })
        .await
    }

    /// Executes a request with a bearer token. On 401/403 with a cached
    /// token, requests fresh credentials and retries exactly once.
    pub(crate) async fn do_authorized(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        let reply = self.auth(false).await?;
        let (client, request) = builder.build_split();
        let mut request = request?;
        set_bearer(&mut request, &reply.token)?;
        self.log_request(&request);
        let replay = request.try_clone();
        let resp = client.execute(request).await?;
        if matches!(
            resp.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) && reply.cached
        {
            let fresh = self.auth(true).await?;
            match replay {
                Some(mut request) => {
                    set_bearer(&mut request, &fresh.token)?;
                    self.log_request(&request);
                    Ok(client.execute(request).await?)
                }
                // A streaming body cannot be replayed in place. The token is
                // fresh now, so the surrounding retry loop rebuilds the body
                // and the next attempt goes through.
                None => Ok(resp),
            }
        } else {
            Ok(resp)
        }
    }

    fn log_request(&self, request: &Request) {
        if self.debug {
            debug!(method = %request.method(), url = %request.url(), "api request");
        }
    }
}

fn set_bearer(request: &mut Request, token: &str) -> Result<(), BackendError> {
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| BackendError::InvalidToken)?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}
