//! Same-origin relay: forwards the engine's credentialed status stream to an
//! anonymous client connection.
//!
//! One upstream request per call to [`Relay::open`]. On success the upstream
//! body is handed back as a [`RelayStream`] that yields the upstream bytes
//! untouched; frames are decoded on the side for logging only.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::{bail, Context as _};
use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::{
    api::status_stream_url,
    config::RelayConfig,
    error::RelayError,
    frame::{Frame, FrameDecoder, Payload},
};

#[derive(Clone)]
pub struct Relay {
    config: RelayConfig,
    base: Url,
    key_header: HeaderName,
    client: reqwest::Client,
}

impl Relay {
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.upstream_base_url)
            .with_context(|| format!("Invalid upstream URL: {}", config.upstream_base_url))?;
        if base.cannot_be_a_base() {
            bail!("Upstream URL cannot carry a path: {}", config.upstream_base_url);
        }
        let key_header = HeaderName::from_bytes(config.api_key_header.as_bytes())
            .with_context(|| format!("Invalid API key header name: {}", config.api_key_header))?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .context("Failed to build upstream HTTP client")?;

        if config.api_key.is_none() {
            warn!("no upstream API key configured; status streams will answer 500");
        }
        Ok(Self { config, base, key_header, client })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn upstream_url(&self, run_id: &str) -> Url {
        status_stream_url(&self.base, run_id)
    }

    /// Opens the upstream stream for `run_id`.
    ///
    /// `cancel` fires when the client connection goes away. Before the
    /// upstream answers that yields [`RelayError::ClientClosed`]; afterwards
    /// it ends the returned stream and drops the upstream connection.
    pub async fn open(&self, run_id: &str, cancel: CancellationToken) -> Result<RelayStream, RelayError> {
        let secret = self.config.api_key.clone().ok_or(RelayError::Misconfigured)?;
        let mut key = HeaderValue::from_str(secret.expose()).map_err(|_| RelayError::Misconfigured)?;
        key.set_sensitive(true);

        let request = self
            .client
            .get(self.upstream_url(run_id))
            .header(self.key_header.clone(), key)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(run_id = %run_id, "client closed request before upstream answered");
                return Err(RelayError::ClientClosed);
            }
            res = tokio::time::timeout(self.config.response_timeout(), request.send()) => match res {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    warn!(run_id = %run_id, error = %e, "failed to connect to upstream status stream");
                    return Err(RelayError::ConnectFailed(e.to_string()));
                }
                Err(_) => {
                    warn!(run_id = %run_id, timeout_ms = self.config.response_timeout_ms, "upstream status stream did not answer in time");
                    return Err(RelayError::ConnectFailed("timed out waiting for upstream".into()));
                }
            },
        };

        let status = resp.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::ClientClosed),
                body = resp.text() => body.unwrap_or_default(),
            };
            info!(run_id = %run_id, status = status.as_u16(), "upstream rejected status stream");
            return Err(RelayError::UpstreamRejected { status, body });
        }

        info!(run_id = %run_id, "relaying status stream");
        Ok(RelayStream::new(run_id.to_string(), resp, cancel))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Upstream body on its way to the client.
pub struct RelayStream {
    inner: ByteStream,
    guard: Option<DropGuard>,
}

impl RelayStream {
    fn new(run_id: String, upstream: reqwest::Response, cancel: CancellationToken) -> Self {
        let mut decoder = FrameDecoder::new();
        let inner = upstream
            .bytes_stream()
            .take_until(cancel.cancelled_owned())
            .inspect(move |chunk| match chunk {
                Ok(bytes) => decoder.feed(bytes).iter().for_each(|frame| log_frame(&run_id, frame)),
                Err(e) => warn!(run_id = %run_id, error = %e, "upstream status stream broke"),
            })
            .map(|chunk| chunk.map_err(io::Error::other));
        Self { inner: Box::pin(inner), guard: None }
    }

    /// Cancels the token behind this stream when the stream is dropped, i.e.
    /// when the client connection goes away.
    pub fn cancel_on_drop(mut self, guard: DropGuard) -> Self {
        self.guard = Some(guard);
        self
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl IntoResponse for RelayStream {
    fn into_response(self) -> Response {
        (
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            ],
            Body::from_stream(self),
        )
            .into_response()
    }
}

fn log_frame(run_id: &str, frame: &Frame) {
    match &frame.payload {
        Payload::Event(evt) => debug!(
            run_id = %run_id,
            status = %evt.status,
            node = evt.node.as_ref().map(|n| n.label()).unwrap_or("-"),
            "relayed status frame"
        ),
        Payload::Done => debug!(run_id = %run_id, "relayed end-of-stream marker"),
        Payload::Malformed { error, .. } => warn!(run_id = %run_id, %error, "relayed undecodable frame"),
        Payload::Empty => {}
    }
}
