//! Subscribes to a run's status stream through the relay and publishes the
//! resulting [`TrackerState`] on a `tokio::sync::watch` channel.

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use reqwest::Url;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::status_stream_url,
    config::TrackerConfig,
    error::TrackerError,
    frame::Payload,
    state::{Applied, Phase, TrackerState},
    transport::{EventSource, TransportEvent},
};

struct Subscription {
    run_id: String,
    cancel: CancellationToken,
}

/// One logical connection per watched run.
///
/// Every write to the published state is made under the channel's lock and
/// only if the writing subscription is still the current one, so a replaced
/// or torn-down subscription can never leak an update.
pub struct StatusTracker {
    base: Url,
    retry: Duration,
    client: reqwest::Client,
    tx: Arc<watch::Sender<TrackerState>>,
    generation: Arc<AtomicU64>,
    active: Option<Subscription>,
}

impl StatusTracker {
    pub fn new(config: TrackerConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.relay_base_url)
            .with_context(|| format!("Invalid relay URL: {}", config.relay_base_url))?;
        let (tx, _rx) = watch::channel(TrackerState::default());
        Ok(Self {
            base,
            retry: Duration::from_millis(config.retry_ms),
            client: reqwest::Client::new(),
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
            active: None,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TrackerState {
        self.tx.borrow().clone()
    }

    /// Run currently subscribed to, if any.
    pub fn watching(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.run_id.as_str())
    }

    /// Starts or keeps a subscription to `run_id`.
    ///
    /// An empty `run_id` or `enabled == false` opens nothing and tears down
    /// any current subscription. Watching the same run again is a no-op,
    /// unless its connection failed for good: then it starts over.
    /// Must be called from within a tokio runtime.
    pub fn watch(&mut self, run_id: &str, enabled: bool) {
        if run_id.is_empty() || !enabled {
            self.unwatch();
            return;
        }
        if self.watching() == Some(run_id) && self.tx.borrow().phase != Phase::ClosedError {
            return;
        }

        if let Some(old) = self.active.take() {
            debug!(run_id = %old.run_id, "replacing status subscription");
            old.cancel.cancel();
        }

        // reset and the move to connecting go out as one notification
        let generation = Arc::clone(&self.generation);
        let mut current = 0;
        self.tx.send_modify(|st| {
            current = generation.fetch_add(1, Ordering::SeqCst) + 1;
            *st = TrackerState::for_run(run_id);
        });

        let cancel = CancellationToken::new();
        let source = EventSource::new(self.client.clone(), status_stream_url(&self.base, run_id), self.retry);
        tokio::spawn(drive(
            source,
            cancel.clone(),
            Arc::clone(&self.tx),
            Arc::clone(&self.generation),
            current,
            run_id.to_string(),
        ));

        info!(run_id = %run_id, "watching run status");
        self.active = Some(Subscription { run_id: run_id.to_string(), cancel });
    }

    /// Closes the current subscription. The last known state stays visible
    /// but no further update is delivered for it.
    pub fn unwatch(&mut self) {
        let Some(sub) = self.active.take() else { return };
        sub.cancel.cancel();

        let generation = Arc::clone(&self.generation);
        self.tx.send_if_modified(|st| {
            generation.fetch_add(1, Ordering::SeqCst);
            let was_live = matches!(st.phase, Phase::Connecting | Phase::Open);
            if was_live {
                st.phase = Phase::Idle;
                st.is_connected = false;
            }
            was_live
        });
        debug!(run_id = %sub.run_id, "stopped watching run status");
    }
}

impl Drop for StatusTracker {
    fn drop(&mut self) {
        self.unwatch();
    }
}

async fn drive(
    source: EventSource,
    cancel: CancellationToken,
    tx: Arc<watch::Sender<TrackerState>>,
    generation: Arc<AtomicU64>,
    current: u64,
    run_id: String,
) {
    source
        .run(cancel.clone(), |event| {
            let mut close = false;
            tx.send_if_modified(|st| {
                if generation.load(Ordering::SeqCst) != current {
                    close = true;
                    return false;
                }
                let (changed, done) = handle(st, event, &run_id);
                close = done;
                changed
            });
            if close {
                cancel.cancel();
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await;
    debug!(run_id = %run_id, "status subscription finished");
}

/// Applies one transport event. Returns (state changed, close connection).
fn handle(st: &mut TrackerState, event: TransportEvent, run_id: &str) -> (bool, bool) {
    match event {
        TransportEvent::Open => {
            st.opened();
            (true, false)
        }
        TransportEvent::Error { error, will_retry } => {
            warn!(run_id = %run_id, %error, will_retry, "status stream connection error");
            st.connection_lost(error, will_retry);
            (true, !will_retry)
        }
        TransportEvent::Frame(frame) => match frame.payload {
            Payload::Event(evt) => match st.apply(&evt) {
                Applied::Updated => (true, false),
                Applied::Unchanged => (false, false),
                Applied::Terminal => {
                    info!(run_id = %run_id, status = %evt.status, "run reached terminal status");
                    (true, true)
                }
                Applied::Ignored => (false, true),
            },
            Payload::Done => {
                st.ended();
                (true, true)
            }
            Payload::Malformed { error, .. } => {
                warn!(run_id = %run_id, %error, "dropping malformed status frame");
                st.malformed(TrackerError::MalformedFrame(error));
                (true, false)
            }
            Payload::Empty => (false, false),
        },
    }
}
