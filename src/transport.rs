//! Client transport for event streams, modelled on a browser `EventSource`.
//!
//! A network error or a clean end of stream is followed by a reconnect after
//! the current retry delay (initially from config, then whatever the server
//! last sent in a `retry:` field). A non-success status or a response that is
//! not `text/event-stream` fails for good. No backoff is layered on top.

use std::{ops::ControlFlow, time::Duration};

use futures_util::StreamExt;
use reqwest::{header, Url};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::TrackerError,
    frame::{Frame, FrameDecoder, Payload},
};

#[derive(Debug)]
pub enum TransportEvent {
    Open,
    /// A frame carrying a payload. `retry:`/`id:`-only frames are consumed
    /// by the transport.
    Frame(Frame),
    Error { error: TrackerError, will_retry: bool },
}

pub struct EventSource {
    client: reqwest::Client,
    url: Url,
    retry: Duration,
    last_event_id: Option<String>,
}

impl EventSource {
    pub fn new(client: reqwest::Client, url: Url, retry: Duration) -> Self {
        Self { client, url, retry, last_event_id: None }
    }

    /// Drives the connection until `on_event` breaks, the failure is
    /// permanent, or `cancel` fires. Nothing is delivered after any of those.
    pub async fn run<F>(mut self, cancel: CancellationToken, mut on_event: F)
    where
        F: FnMut(TransportEvent) -> ControlFlow<()>,
    {
        loop {
            let mut request = self
                .client
                .get(self.url.clone())
                .header(header::ACCEPT, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache");
            if let Some(id) = &self.last_event_id {
                request = request.header("Last-Event-ID", id.as_str());
            }

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = request.send() => sent,
            };

            let error = match sent {
                Err(e) => TrackerError::Connect(e.to_string()),
                Ok(resp) if !resp.status().is_success() => {
                    let error = TrackerError::Rejected { status: resp.status().as_u16() };
                    let _ = on_event(TransportEvent::Error { error, will_retry: false });
                    return;
                }
                Ok(resp) if !is_event_stream(&resp) => {
                    let content_type = resp
                        .headers()
                        .get(header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let error = TrackerError::InvalidContentType(content_type);
                    let _ = on_event(TransportEvent::Error { error, will_retry: false });
                    return;
                }
                Ok(resp) => {
                    debug!(url = %self.url, "event stream open");
                    if on_event(TransportEvent::Open).is_break() {
                        return;
                    }
                    match self.pump(resp, &cancel, &mut on_event).await {
                        ControlFlow::Break(()) => return,
                        ControlFlow::Continue(error) => error,
                    }
                }
            };

            debug!(url = %self.url, %error, retry_ms = self.retry.as_millis() as u64, "event stream lost, reconnecting");
            if on_event(TransportEvent::Error { error, will_retry: true }).is_break() {
                return;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.retry) => {}
            }
        }
    }

    /// Reads one connection to its end. `Continue` carries why it ended.
    async fn pump<F>(
        &mut self,
        resp: reqwest::Response,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> ControlFlow<(), TrackerError>
    where
        F: FnMut(TransportEvent) -> ControlFlow<()>,
    {
        let mut decoder = FrameDecoder::new();
        let mut body = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ControlFlow::Break(()),
                chunk = body.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return ControlFlow::Continue(TrackerError::Stream(e.to_string())),
                None => return ControlFlow::Continue(TrackerError::Stream("connection closed by server".into())),
            };
            for frame in decoder.feed(&bytes) {
                if let Some(id) = &frame.id {
                    self.last_event_id = Some(id.clone());
                }
                if let Some(ms) = frame.retry_ms {
                    self.retry = Duration::from_millis(ms);
                }
                if frame.payload != Payload::Empty {
                    on_event(TransportEvent::Frame(frame))?;
                }
            }
        }
    }
}

fn is_event_stream(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}
