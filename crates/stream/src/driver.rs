//! Async loop that turns camera-rest signals into cache updates.
//!
//! A rest signal arms a debounce timer of `restDelayMs`. Signals arriving
//! while the timer is armed only replace the pending camera; when the timer
//! fires the latest camera is culled and fed to the cache. Sweeps run on
//! their own interval and fetch completions are applied as they arrive.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cache::{StreamError, StreamEvent, StreamingCache};
use crate::culler::{CameraState, VisibilityOracle};
use crate::policy::Millis;

/// Caller side of a running [`StreamDriver`].
pub struct StreamHandle {
    camera: watch::Sender<Option<CameraState>>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<StreamingCache>,
}

impl StreamHandle {
    /// Report that the camera came to rest in `state`.
    pub fn camera_rest(&self, state: CameraState) {
        self.camera.send_replace(Some(state));
    }

    /// Stop the driver and get the cache back.
    pub async fn shutdown(self) -> Result<StreamingCache, StreamError> {
        // The driver may already be gone, in which case the join reports why.
        let _ = self.stop.send(());
        self.task.await.map_err(|err| {
            tracing::warn!(error = %err, "stream driver task failed");
            StreamError::Stopped
        })
    }
}

/// Owns a cache and an oracle and reacts to camera, timer and fetch events.
pub struct StreamDriver {
    cache: StreamingCache,
    oracle: Arc<dyn VisibilityOracle>,
    events: mpsc::UnboundedSender<StreamEvent>,
    started: Instant,
    passes: u64,
}

impl StreamDriver {
    pub fn new(
        cache: StreamingCache,
        oracle: Arc<dyn VisibilityOracle>,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            cache,
            oracle,
            events,
            started: Instant::now(),
            passes: 0,
        }
    }

    /// Spawn the driver loop. Must be called from within a Tokio runtime.
    pub fn spawn(self) -> StreamHandle {
        let (camera_tx, camera_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(camera_rx, stop_rx));
        StreamHandle {
            camera: camera_tx,
            stop: stop_tx,
            task,
        }
    }

    fn now(&self) -> Millis {
        self.started.elapsed().as_millis() as Millis
    }

    async fn run(
        mut self,
        mut camera: watch::Receiver<Option<CameraState>>,
        mut stop: oneshot::Receiver<()>,
    ) -> StreamingCache {
        let rest_delay = self.cache.policy().rest_delay();
        let mut sweep = tokio::time::interval(self.cache.policy().sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline: Option<Instant> = None;
        let mut camera_open = true;

        loop {
            let debounce = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut stop => break,
                changed = camera.changed(), if camera_open => {
                    if changed.is_err() {
                        camera_open = false;
                        continue;
                    }
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + rest_delay);
                    }
                }
                _ = debounce => {
                    deadline = None;
                    let state = *camera.borrow_and_update();
                    if let Some(state) = state {
                        self.pass(&state);
                    }
                }
                _ = sweep.tick() => {
                    let now = self.now();
                    let events = self.cache.sweep(now);
                    self.forward(events);
                }
                Some(completion) = self.cache.next_completion() => {
                    let events = self.cache.apply_completion(completion);
                    self.forward(events);
                }
            }
        }

        tracing::debug!(passes = self.passes, "stream driver stopped");
        self.cache
    }

    fn pass(&mut self, camera: &CameraState) {
        let now = self.now();
        let visible = self.oracle.query(camera, self.cache.index());
        self.passes += 1;
        match self.cache.on_visibility_update(&visible, now) {
            Ok(events) => self.forward(events),
            Err(error) => tracing::warn!(%error, "visibility update rejected"),
        }
    }

    fn forward(&self, events: Vec<StreamEvent>) {
        for event in events {
            if self.events.send(event).is_err() {
                tracing::trace!("stream event dropped, no listener");
                return;
            }
        }
    }
}
