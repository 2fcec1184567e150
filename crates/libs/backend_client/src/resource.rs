use crate::error::body_to_error;
use crate::retry::{retry, ExponentialBackoff, RetryError};
use crate::{Backend, BackendError};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// A resource that can be created with POST and optionally updated with
/// PUT. Implementations build a fresh request (including its body) per
/// attempt, so retries never reuse a consumed stream.
pub(crate) trait Resource {
    fn post(&self, backend: &Backend) -> Result<RequestBuilder, BackendError>;
    /// `None` when the resource cannot be updated in place.
    fn put(&self, backend: &Backend) -> Option<Result<RequestBuilder, BackendError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SendOptions {
    pub max_retries: Option<u32>,
    pub only_post: bool,
    pub only_put: bool,
}

impl SendOptions {
    pub(crate) fn post_only(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            only_post: true,
            only_put: false,
        }
    }

    pub(crate) fn put_only(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            only_post: false,
            only_put: true,
        }
    }
}

/// Joins path segments onto the API base URL, percent-encoding each
/// segment.
pub(crate) fn api_url(base: &str, segments: &[&str]) -> Result<Url, BackendError> {
    let mut url = Url::parse(base)?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| BackendError::UrlNotABase)?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

/// Splits transport-level failures into what is worth retrying and what is
/// not. Construction failures and cancellation never improve with retries.
fn classify_transport(err: BackendError) -> RetryError {
    match err {
        BackendError::Cancelled => RetryError::Permanent(BackendError::Cancelled),
        BackendError::AuthChannelClosed => RetryError::Permanent(BackendError::AuthChannelClosed),
        BackendError::InvalidToken => RetryError::Permanent(BackendError::InvalidToken),
        BackendError::Request(err) if err.is_builder() => {
            RetryError::Permanent(BackendError::Request(err))
        }
        other => RetryError::Transient(other),
    }
}

impl Backend {
    /// Sends a resource with the POST/PUT upsert protocol: POST unless
    /// `only_put`; fall back to PUT on 409/500 when a PUT URL exists;
    /// 200/201/204 succeed; anything else retries with backoff up to
    /// `max_retries`.
    pub(crate) async fn send_resource<R: Resource + ?Sized>(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        resource: &R,
        opts: SendOptions,
    ) -> Result<(), BackendError> {
        let mut backoff = ExponentialBackoff::eternal();
        let this = self;
        let opts_ref = &opts;
        retry(cancel, &mut backoff, opts.max_retries, move || {
            this.try_send(resource, opts_ref)
        })
        .await
    }

    async fn try_send<R: Resource + ?Sized>(
        &self,
        resource: &R,
        opts: &SendOptions,
    ) -> Result<(), RetryError> {
        let mut resp: Option<Response> = None;
        if !opts.only_put {
            let builder = resource.post(self).map_err(RetryError::Permanent)?;
            resp = Some(self.do_authorized(builder).await.map_err(classify_transport)?);
        }
        let post_status = resp.as_ref().map(Response::status);
        let wants_put = !opts.only_post
            && (opts.only_put
                || matches!(
                    post_status,
                    Some(StatusCode::CONFLICT | StatusCode::INTERNAL_SERVER_ERROR)
                ));
        if wants_put {
            let Some(builder) = resource.put(self) else {
                return Err(RetryError::Permanent(BackendError::PostFailed));
            };
            let builder = builder.map_err(RetryError::Permanent)?;
            resp = Some(self.do_authorized(builder).await.map_err(classify_transport)?);
        }
        let Some(resp) = resp else {
            // the option combination excluded both verbs
            return Err(RetryError::Permanent(BackendError::PostFailed));
        };
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(RetryError::Transient(body_to_error(resp).await)),
        }
    }

    /// A single authorized GET attempt, classified for the retry driver.
    /// Decode failures are permanent.
    pub(crate) async fn get_json_once<T: DeserializeOwned>(&self, url: Url) -> Result<T, RetryError> {
        let builder = self.http().get(url);
        let resp = self.do_authorized(builder).await.map_err(classify_transport)?;
        let status = resp.status().as_u16();
        if !(200..=204).contains(&status) {
            return Err(RetryError::Transient(body_to_error(resp).await));
        }
        resp.json::<T>()
            .await
            .map_err(|err| RetryError::Permanent(err.into()))
    }

    /// GETs a JSON resource with the same retry envelope as
    /// [`Backend::send_resource`].
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        url: Url,
        max_retries: Option<u32>,
    ) -> Result<T, BackendError> {
        let mut backoff = ExponentialBackoff::eternal();
        let this = self;
        let url_ref = &url;
        retry(cancel, &mut backoff, max_retries, move || {
            this.get_json_once(url_ref.clone())
        })
        .await
    }
}
