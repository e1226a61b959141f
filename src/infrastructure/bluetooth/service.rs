//! Link Manager
//!
//! Owns the single peripheral link: drives scan → connect → subscribe through
//! the injected transport adapter, answers heartbeats, records telemetry,
//! gates outbound commands and broadcasts every [`LinkState`] replacement to
//! the registered observers.
//!
//! Every connect attempt is tagged with a generation. `disconnect()` bumps the
//! generation, so late results and notifications from an abandoned attempt
//! are dropped instead of overwriting newer state.
//!
//! Adapter teardown runs under the transport lock, and a new attempt waits on
//! that lock before touching the adapter. A teardown that is still running for
//! an abandoned attempt therefore never reaches the next attempt's session.

use crate::domain::models::{DeviceHandle, LinkPhase, LinkState, ScanOptions, StructuredCommand};
use crate::infrastructure::bluetooth::observers::{Observer, ObserverId, ObserverRegistry};
use crate::infrastructure::bluetooth::protocol::{
    self, Channel, CodecError, ModeCommand, HEARTBEAT_REPLY, SERVICE_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    DeviceCallback, NotificationFuture, NotificationHandler, TransportAdapter, TransportError,
    WriteReliability,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("A connection attempt is already active")]
    Busy,
    #[error("Not connected. Cannot send command.")]
    NotSubscribed,
    #[error("Connection attempt was superseded")]
    Superseded,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

struct Cell {
    state: LinkState,
    observers: ObserverRegistry,
    generation: u64,
}

struct Inner {
    adapter: Arc<dyn TransportAdapter>,
    cell: Mutex<Cell>,
    // Serializes replace-and-broadcast so observers see mutations in order.
    dispatch: Mutex<()>,
    // Held across adapter teardown.
    transport: AsyncMutex<()>,
}

/// Cheap-to-clone handle to the link. Construct once in the composition root
/// and hand clones to whatever needs it.
#[derive(Clone)]
pub struct LinkManager {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct WeakLink {
    inner: Weak<Inner>,
}

impl WeakLink {
    fn upgrade(&self) -> Option<LinkManager> {
        self.inner.upgrade().map(|inner| LinkManager { inner })
    }
}

impl LinkManager {
    pub fn new(adapter: Arc<dyn TransportAdapter>) -> Self {
        info!("Link manager using {} transport", adapter.name());
        Self {
            inner: Arc::new(Inner {
                adapter,
                cell: Mutex::new(Cell {
                    state: LinkState::disconnected(),
                    observers: ObserverRegistry::default(),
                    generation: 0,
                }),
                dispatch: Mutex::new(()),
                transport: AsyncMutex::new(()),
            }),
        }
    }

    /// Current snapshot
    pub fn state(&self) -> LinkState {
        self.lock_cell().state.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock_cell().state.is_subscribed()
    }

    /// Register an observer. It is called once right away with the current
    /// state, then on every change.
    ///
    /// Must not be called from inside an observer callback;
    /// [`unsubscribe_observer`](Self::unsubscribe_observer) may be.
    pub fn subscribe_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&LinkState) + Send + Sync + 'static,
    {
        let observer: Observer = Arc::new(observer);
        let _dispatch = self.lock_dispatch();
        let (id, current) = {
            let mut cell = self.lock_cell();
            let id = cell.observers.register(observer.clone());
            (id, cell.state.clone())
        };
        observer(&current);
        id
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unsubscribe_observer(&self, id: ObserverId) -> bool {
        self.lock_cell().observers.remove(id)
    }

    /// Run one connect attempt: scan, connect to the first device found,
    /// subscribe heartbeat then telemetry.
    ///
    /// Failures land in the link state as `FailedToConnect` and are also
    /// returned. Only valid from `Disconnected` or `FailedToConnect`;
    /// otherwise returns [`LinkError::Busy`] without touching state.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let generation = self.begin_attempt().inspect_err(|e| {
            warn!("connect() ignored: {}", e);
        })?;
        info!(
            generation,
            transport = self.inner.adapter.name(),
            "Starting connection attempt"
        );

        let err = match self.run_attempt(generation).await {
            Ok(()) => {
                info!(generation, "Link subscribed");
                return Ok(());
            }
            Err(err) => err,
        };

        if matches!(err, LinkError::Superseded) || !self.is_current(generation) {
            info!(generation, "Connection attempt abandoned");
            self.dispose_stale_attempt().await;
            return Err(LinkError::Superseded);
        }

        error!("Connection attempt failed: {}", err);
        {
            let _transport = self.inner.transport.lock().await;
            if let Err(e) = self.release_transport(Some(generation)).await {
                debug!("Teardown after failed attempt: {}", e);
            }
        }
        let message = err.to_string();
        let recorded = self.replace_state(Some(generation), |s| {
            Some(LinkState {
                phase: LinkPhase::FailedToConnect,
                error: Some(message),
                ..s.clone()
            })
        });
        if !recorded {
            return Err(LinkError::Superseded);
        }
        Err(err)
    }

    /// Tear the link down from any state, including mid-attempt.
    ///
    /// Always completes: adapter failures are logged and recorded in
    /// `error`, never returned.
    pub async fn disconnect(&self) {
        let generation = {
            let mut cell = self.lock_cell();
            cell.generation += 1;
            cell.generation
        };
        info!(generation, "Disconnecting");

        let teardown = {
            let _transport = self.inner.transport.lock().await;
            self.release_transport(None).await
        };
        if let Err(e) = &teardown {
            warn!("Disconnect reported an error: {}", e);
        }

        self.replace_state(Some(generation), |_| {
            let state = LinkState::disconnected();
            Some(match &teardown {
                Ok(()) => state,
                Err(e) => state.with_error(e.to_string()),
            })
        });
    }

    /// Write the `MANUAL` token (acknowledged). Rejections and failures are
    /// surfaced through `error`.
    pub async fn send_manual_command(&self) -> Result<(), LinkError> {
        self.clear_error();
        let Some(generation) = self.operating_generation() else {
            warn!("Not connected. Cannot send 'MANUAL' command.");
            self.replace_state(None, |s| Some(s.with_error(LinkError::NotSubscribed.to_string())));
            return Err(LinkError::NotSubscribed);
        };

        info!("Sending 'MANUAL' command...");
        match self.write_mode(ModeCommand::Manual).await {
            Ok(()) => {
                info!("'MANUAL' command sent.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to send 'MANUAL' command: {}", e);
                let message = format!("Failed to send 'MANUAL' command: {}", e);
                self.replace_state(Some(generation), |s| Some(s.with_error(message)));
                Err(e.into())
            }
        }
    }

    /// Write the `START` token (acknowledged). Outside `Subscribed` this is a
    /// silent no-op: nothing is written and `error` stays clear.
    pub async fn send_auto_command(&self) -> Result<(), LinkError> {
        self.clear_error();
        let Some(generation) = self.operating_generation() else {
            debug!("Auto command skipped: link not subscribed");
            return Err(LinkError::NotSubscribed);
        };

        match self.write_mode(ModeCommand::Auto).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Auto command failed: {}", e);
                let message = format!("Cmd Error: {}", e);
                self.replace_state(Some(generation), |s| Some(s.with_error(message)));
                Err(e.into())
            }
        }
    }

    /// Stream a structured command (joystick axes and the like) without
    /// waiting for acknowledgment. Failures are logged only.
    pub async fn send_structured_command(
        &self,
        command: &StructuredCommand,
    ) -> Result<(), LinkError> {
        self.clear_error();
        if self.operating_generation().is_none() {
            trace!("Structured command dropped: link not subscribed");
            return Err(LinkError::NotSubscribed);
        }

        let payload = protocol::encode_structured(command).inspect_err(|e| {
            warn!("Joystick send error: {}", e);
        })?;
        self.inner
            .adapter
            .write(Channel::Command, &payload, WriteReliability::FireAndForget)
            .await
            .map_err(|e| {
                warn!("Joystick send error: {}", e);
                LinkError::from(e)
            })
    }

    async fn run_attempt(&self, generation: u64) -> Result<(), LinkError> {
        let adapter = self.inner.adapter.clone();

        // Wait out any teardown still running for an earlier attempt.
        drop(self.inner.transport.lock().await);
        self.ensure_current(generation)?;

        if !adapter.is_available().await {
            return Err(TransportError::AdapterUnavailable(
                "Bluetooth is not available on this platform".to_string(),
            )
            .into());
        }
        self.ensure_current(generation)?;

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let on_device: DeviceCallback = {
            let link = self.downgrade();
            Arc::new(move |device: DeviceHandle| {
                if let Some(link) = link.upgrade() {
                    let label = device.display_name().to_string();
                    link.replace_state(Some(generation), |s| match s.phase {
                        LinkPhase::Scanning | LinkPhase::DeviceFound(_) => {
                            Some(s.with_phase(LinkPhase::DeviceFound(label)))
                        }
                        _ => None,
                    });
                }
                let _ = found_tx.send(device);
            })
        };

        adapter
            .scan(on_device, ScanOptions::for_service(SERVICE_UUID))
            .await?;
        let device = found_rx.recv().await;
        drop(found_rx);
        adapter.stop_scan().await;
        self.ensure_current(generation)?;
        let device =
            device.ok_or_else(|| TransportError::ScanFailure("No device found".to_string()))?;

        self.advance(generation, LinkPhase::Connecting)?;
        adapter.connect(&device).await?;

        self.advance(generation, LinkPhase::ConnectedSubscribing)?;
        adapter
            .subscribe(Channel::HeartbeatIn, self.heartbeat_handler(generation))
            .await?;
        self.ensure_current(generation)?;
        adapter
            .subscribe(Channel::Telemetry, self.telemetry_handler(generation))
            .await?;

        self.advance(generation, LinkPhase::Subscribed)
    }

    /// Stop scanning, detach both handlers and close the session. With an
    /// `owner` generation, stops early once that attempt has been superseded.
    /// Callers hold the transport lock.
    async fn release_transport(&self, owner: Option<u64>) -> Result<(), TransportError> {
        let owned = || owner.map_or(true, |g| self.is_current(g));
        let adapter = &self.inner.adapter;

        if !owned() {
            return Ok(());
        }
        adapter.stop_scan().await;
        for channel in [Channel::HeartbeatIn, Channel::Telemetry] {
            if !owned() {
                return Ok(());
            }
            if let Err(e) = adapter.unsubscribe(channel).await {
                debug!("Ignoring unsubscribe failure on {}: {}", channel, e);
            }
        }
        if !owned() {
            return Ok(());
        }
        adapter.disconnect().await
    }

    /// An abandoned attempt may still have completed its connection. Close it,
    /// unless a newer attempt has started and now owns the adapter.
    async fn dispose_stale_attempt(&self) {
        let _transport = self.inner.transport.lock().await;
        let idle = self.lock_cell().state.phase.accepts_connect();
        if !idle {
            return;
        }
        if let Err(e) = self.release_transport(None).await {
            debug!("Closing connection of an abandoned attempt: {}", e);
        }
    }

    async fn write_mode(&self, command: ModeCommand) -> Result<(), TransportError> {
        self.inner
            .adapter
            .write(
                Channel::Command,
                command.as_bytes(),
                WriteReliability::Acknowledged,
            )
            .await
    }

    fn heartbeat_handler(&self, generation: u64) -> NotificationHandler {
        let link = self.downgrade();
        Arc::new(move |_ping: Vec<u8>| -> NotificationFuture {
            let link = link.clone();
            Box::pin(async move {
                if let Some(link) = link.upgrade() {
                    link.answer_heartbeat(generation).await;
                }
            })
        })
    }

    fn telemetry_handler(&self, generation: u64) -> NotificationHandler {
        let link = self.downgrade();
        Arc::new(move |payload: Vec<u8>| -> NotificationFuture {
            let link = link.clone();
            Box::pin(async move {
                if let Some(link) = link.upgrade() {
                    link.record_telemetry(generation, &payload);
                }
            })
        })
    }

    async fn answer_heartbeat(&self, generation: u64) {
        if !self.is_current(generation) {
            trace!("Ignoring heartbeat from a stale attempt");
            return;
        }
        let result = self
            .inner
            .adapter
            .write(
                Channel::HeartbeatOut,
                HEARTBEAT_REPLY,
                WriteReliability::FireAndForget,
            )
            .await;
        if let Err(e) = result {
            warn!("Failed to send PONG: {}", e);
            let message = format!("Failed to send PONG: {}", e);
            self.replace_state(Some(generation), |s| Some(s.with_error(message)));
        }
    }

    fn record_telemetry(&self, generation: u64, payload: &[u8]) {
        let text = protocol::decode_text(payload);
        debug!("Received telemetry: {}", text);
        if !self.replace_state(Some(generation), |s| Some(s.with_telemetry(text))) {
            trace!("Dropped telemetry from a stale attempt");
        }
    }

    /// Check the gate, bump the generation and publish `Scanning` in one step.
    fn begin_attempt(&self) -> Result<u64, LinkError> {
        let mut outcome = Err(LinkError::Busy);
        self.commit(|cell| {
            if !cell.state.phase.accepts_connect() {
                return None;
            }
            cell.generation += 1;
            outcome = Ok(cell.generation);
            Some(LinkState {
                phase: LinkPhase::Scanning,
                error: None,
                last_telemetry: None,
            })
        });
        outcome
    }

    fn advance(&self, generation: u64, phase: LinkPhase) -> Result<(), LinkError> {
        if self.replace_state(Some(generation), |s| Some(s.with_phase(phase))) {
            Ok(())
        } else {
            Err(LinkError::Superseded)
        }
    }

    fn ensure_current(&self, generation: u64) -> Result<(), LinkError> {
        if self.is_current(generation) {
            Ok(())
        } else {
            Err(LinkError::Superseded)
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_cell().generation == generation
    }

    fn operating_generation(&self) -> Option<u64> {
        let cell = self.lock_cell();
        cell.state.is_subscribed().then_some(cell.generation)
    }

    fn clear_error(&self) {
        self.replace_state(None, |s| s.error.as_ref().map(|_| s.without_error()));
    }

    /// Replace the state when `generation` (if given) is still current.
    /// `next` returns `None` to leave the state untouched.
    fn replace_state(
        &self,
        generation: Option<u64>,
        next: impl FnOnce(&LinkState) -> Option<LinkState>,
    ) -> bool {
        self.commit(|cell| {
            if generation.is_some_and(|g| g != cell.generation) {
                return None;
            }
            next(&cell.state)
        })
    }

    /// The single state-replacement primitive: swap in the new snapshot and
    /// call every observer with it, in registration order.
    fn commit(&self, apply: impl FnOnce(&mut Cell) -> Option<LinkState>) -> bool {
        let _dispatch = self.lock_dispatch();
        let (snapshot, observers) = {
            let mut cell = self.lock_cell();
            let Some(next) = apply(&mut *cell) else {
                return false;
            };
            cell.state = next.clone();
            (next, cell.observers.snapshot())
        };

        trace!(status = %snapshot.phase, "Broadcasting link state");
        for observer in observers {
            observer(&snapshot);
        }
        true
    }

    fn downgrade(&self) -> WeakLink {
        WeakLink {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn lock_cell(&self) -> MutexGuard<'_, Cell> {
        self.inner.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dispatch(&self) -> MutexGuard<'_, ()> {
        self.inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
