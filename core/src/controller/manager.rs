//! Connection lifecycle controller
//!
//! One [`ConnectionManager`] supervises one peripheral. `connect` spawns a run
//! task that cycles through scan, connect and the live session, backing off
//! between cycles until it is stopped, reconnecting is disabled, or too many
//! cycles fail in a row. Every suspension point races the stop signal.
//!
//! Each live session gets a line pump task that owns the session's
//! [`LineAssembler`]. It turns inbound chunks into formatted lines, publishes
//! them and hands them to the log sink. The pump is halted and awaited before
//! the session is considered over, so partial lines are flushed exactly once
//! and nothing outlives its session.

use super::events::{ControllerEvent, EVENT_CHANNEL_CAPACITY};
use super::settings::Settings;
use super::state::{ConnectionState, DeviceSummary, SessionEnd, Status};
use crate::error::LoggerError;
use crate::format::LineFormatter;
use crate::retry::BackoffSequence;
use crate::signal::{StopHandle, StopSignal};
use crate::sink::LogSink;
use crate::stream::{Broadcaster, LineAssembler, Subscription};
use crate::transport::{select_candidate, DiscoveredDevice, ScanFilter, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Snapshot {
    state: ConnectionState,
    device: Option<DiscoveredDevice>,
    retry_count: u64,
    pinned_address: Option<String>,
}

/// State shared between the manager, its run task and the line pump
struct Shared {
    settings: RwLock<Settings>,
    snapshot: RwLock<Snapshot>,
    sink: Mutex<Option<Box<dyn LogSink>>>,
    events: broadcast::Sender<ControllerEvent>,
    outcome: watch::Sender<Option<SessionEnd>>,
}

impl Shared {
    fn emit(&self, event: ControllerEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn state(&self) -> ConnectionState {
        self.snapshot.read().state
    }

    fn transition(&self, to: ConnectionState) {
        self.transition_with(to, |_| {});
    }

    /// Move to `to`, applying `update` under the same lock
    fn transition_with(&self, to: ConnectionState, update: impl FnOnce(&mut Snapshot)) {
        let from = {
            let mut snapshot = self.snapshot.write();
            update(&mut snapshot);
            std::mem::replace(&mut snapshot.state, to)
        };
        if from != to {
            debug!("State {} -> {}", from, to);
            self.emit(ControllerEvent::StateChanged { from, to });
        }
    }

    fn write_sink(&self, line: &str) {
        let mut sink = self.sink.lock();
        if let Some(sink) = sink.as_mut() {
            if let Err(e) = sink.write_line(line) {
                warn!("Log sink write failed: {}", e);
            }
        }
    }
}

/// Publishes `Stopped` if the run task unwinds before reporting an outcome
struct OutcomeGuard {
    shared: Arc<Shared>,
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if self.shared.outcome.borrow().is_some() {
            return;
        }
        warn!("Run task ended without an outcome");
        self.shared.transition(ConnectionState::Stopped);
        self.shared.outcome.send_replace(Some(SessionEnd::Stopped));
        self.shared.emit(ControllerEvent::Finished {
            outcome: SessionEnd::Stopped,
        });
    }
}

struct RunHandle {
    stop: StopHandle,
    task: JoinHandle<SessionEnd>,
}

/// Supervises the connection to one NUS peripheral
pub struct ConnectionManager<T: Transport + 'static> {
    transport: Arc<T>,
    broadcaster: Broadcaster,
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
}

impl<T: Transport + 'static> ConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        Self::with_broadcaster(Arc::new(transport), Broadcaster::new())
    }

    /// Share an existing transport and broadcaster
    pub fn with_broadcaster(transport: Arc<T>, broadcaster: Broadcaster) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (outcome, _) = watch::channel(None);
        Self {
            transport,
            broadcaster,
            shared: Arc::new(Shared {
                settings: RwLock::new(Settings::default()),
                snapshot: RwLock::new(Snapshot::default()),
                sink: Mutex::new(None),
                events,
                outcome,
            }),
            run: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Start supervising the device described by `settings`.
    ///
    /// Returns once the run task is spawned. While a run is active this only
    /// stores `settings` for the next cycle. Must be called from within a
    /// Tokio runtime.
    pub async fn connect(&self, settings: Settings) -> Result<(), LoggerError> {
        settings.validate()?;
        let backoff = BackoffSequence::new(settings.reconnect.backoff_config())?;
        *self.shared.settings.write() = settings;

        let mut run = self.run.lock();
        if let Some(handle) = run.as_ref() {
            if !handle.task.is_finished() {
                debug!("Already running, new settings apply from the next cycle");
                return Ok(());
            }
        }

        {
            let mut snapshot = self.shared.snapshot.write();
            snapshot.device = None;
            snapshot.retry_count = 0;
            snapshot.pinned_address = None;
        }
        self.shared.outcome.send_replace(None);

        let (stop, signal) = StopHandle::new();
        let runner = Runner {
            transport: Arc::clone(&self.transport),
            broadcaster: self.broadcaster.clone(),
            shared: Arc::clone(&self.shared),
            stop: signal,
            backoff,
        };
        let task = tokio::spawn(runner.run());
        *run = Some(RunHandle { stop, task });
        info!("Connection controller started");
        Ok(())
    }

    /// Stop the run and wait for it to wind down.
    ///
    /// Safe to call in any state and more than once. The state is `Stopped`
    /// when this returns.
    pub async fn disconnect(&self) -> Result<SessionEnd, LoggerError> {
        let handle = self.run.lock().take();
        let Some(RunHandle { stop, task }) = handle else {
            self.shared.transition(ConnectionState::Stopped);
            let last = self.shared.outcome.borrow().clone();
            return Ok(last.unwrap_or(SessionEnd::Stopped));
        };

        stop.stop();
        if self.shared.state() == ConnectionState::Connected {
            if let Err(e) = self.transport.disconnect().await {
                debug!("Proactive disconnect failed: {}", e);
            }
        }

        match task.await {
            Ok(end) => Ok(end),
            Err(e) => {
                warn!("Run task ended abnormally: {}", e);
                self.shared.transition(ConnectionState::Stopped);
                self.shared.outcome.send_replace(Some(SessionEnd::Stopped));
                Err(LoggerError::TaskFailed(e.to_string()))
            }
        }
    }

    /// Wait for the current run to end. `None` if nothing was ever started.
    pub async fn wait(&self) -> Option<SessionEnd> {
        let mut outcome = self.shared.outcome.subscribe();
        if !self.is_running() && outcome.borrow().is_none() {
            return None;
        }
        let end = match outcome.wait_for(|end| end.is_some()).await {
            Ok(end) => end.clone(),
            Err(_) => None,
        };
        end
    }

    /// Whether a run task is active
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.task.is_finished())
    }

    /// One-shot scan outside of a run.
    ///
    /// Uses the adapter and service requirement of the current settings.
    pub async fn scan(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, LoggerError> {
        let mut filter = self.shared.settings.read().scan_filter(None);
        filter.name = name.to_string();
        filter.timeout = timeout;
        self.scan_with(&filter).await
    }

    /// One-shot scan with an explicit filter
    pub async fn scan_with(&self, filter: &ScanFilter) -> Result<Vec<DiscoveredDevice>, LoggerError> {
        if self.is_running() {
            return Err(LoggerError::AlreadyRunning);
        }
        Ok(self.transport.scan(filter).await?)
    }

    /// Send bytes to the connected peripheral
    pub async fn write(&self, data: &[u8]) -> Result<(), LoggerError> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected.into());
        }
        self.transport.write(data).await?;
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        self.broadcaster.subscribe_with_capacity(capacity)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.broadcaster.unsubscribe(subscription);
    }

    /// The most recent `limit` lines, oldest first
    pub fn tail(&self, limit: usize) -> Vec<String> {
        self.broadcaster.tail(limit)
    }

    pub fn status(&self) -> Status {
        let snapshot = self.shared.snapshot.read();
        Status {
            state: snapshot.state,
            connected: snapshot.state == ConnectionState::Connected,
            connecting: snapshot.state.is_connecting(),
            device: snapshot.device.as_ref().map(DeviceSummary::from),
            retry_count: snapshot.retry_count,
            pinned_address: snapshot.pinned_address.clone(),
            settings: self.shared.settings.read().clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn settings(&self) -> Settings {
        self.shared.settings.read().clone()
    }

    /// Lifecycle notifications from now on
    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }

    /// Edit the settings used from the next scan cycle on
    pub fn update_settings(&self, edit: impl FnOnce(&mut Settings)) -> Result<(), LoggerError> {
        let mut settings = self.shared.settings.read().clone();
        edit(&mut settings);
        settings.validate()?;
        *self.shared.settings.write() = settings;
        Ok(())
    }

    /// Replace the log sink, closing the previous one
    pub fn set_sink(&self, sink: Option<Box<dyn LogSink>>) {
        let previous = std::mem::replace(&mut *self.shared.sink.lock(), sink);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.close() {
                warn!("Closing log sink failed: {}", e);
            }
        }
    }

    /// The transport's listing of the connected device's services
    pub async fn services_debug(&self) -> String {
        if self.shared.state() != ConnectionState::Connected {
            return "<not connected>".to_string();
        }
        self.transport.services_debug().await
    }
}

/// How one scan/connect/session cycle ended
enum Attempt {
    Stopped,
    Failed(TransportError),
    SessionEnded { lasted: Duration },
}

/// The run task
struct Runner<T: Transport + 'static> {
    transport: Arc<T>,
    broadcaster: Broadcaster,
    shared: Arc<Shared>,
    stop: StopSignal,
    backoff: BackoffSequence,
}

impl<T: Transport + 'static> Runner<T> {
    async fn run(mut self) -> SessionEnd {
        let _guard = OutcomeGuard {
            shared: Arc::clone(&self.shared),
        };
        let end = self.cycle().await;

        self.shared.transition(ConnectionState::Stopped);
        info!("Connection controller stopped: {:?}", end);
        self.shared.outcome.send_replace(Some(end.clone()));
        self.shared.emit(ControllerEvent::Finished {
            outcome: end.clone(),
        });
        end
    }

    async fn cycle(&mut self) -> SessionEnd {
        let mut stop = self.stop.clone();
        loop {
            if stop.is_stopped() {
                return SessionEnd::Stopped;
            }

            let settings = self.shared.settings.read().clone();
            let policy = &settings.reconnect;
            if policy.backoff_config() != *self.backoff.config() {
                if let Ok(backoff) = BackoffSequence::new(policy.backoff_config()) {
                    debug!("Backoff parameters changed, restarting sequence");
                    self.backoff = backoff;
                }
            }

            let failure = match self.attempt(&settings).await {
                Attempt::Stopped => return SessionEnd::Stopped,
                Attempt::Failed(error) => Some(error),
                Attempt::SessionEnded { lasted } => {
                    if lasted >= policy.stable_period {
                        debug!("Session lasted {:?}, resetting backoff", lasted);
                        self.backoff.reset();
                    }
                    None
                }
            };

            if stop.is_stopped() {
                return SessionEnd::Stopped;
            }
            if !policy.auto_reconnect {
                return match failure {
                    Some(error) => SessionEnd::Failed { error },
                    None => SessionEnd::Disconnected,
                };
            }

            let attempt = {
                let mut snapshot = self.shared.snapshot.write();
                snapshot.retry_count += 1;
                snapshot.retry_count
            };
            if attempt > policy.max_retries {
                warn!("Giving up after {} failed cycles", attempt);
                self.shared
                    .emit(ControllerEvent::RetryExhausted { attempts: attempt });
                return SessionEnd::RetryExhausted { attempts: attempt };
            }

            let delay = self.backoff.next_delay();
            self.shared.transition(ConnectionState::Backoff);
            info!(
                "Reconnecting in {:.2}s (attempt {})",
                delay.as_secs_f64(),
                attempt
            );
            self.shared
                .emit(ControllerEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = stop.stopped() => return SessionEnd::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&mut self, settings: &Settings) -> Attempt {
        let transport = Arc::clone(&self.transport);
        let mut stop = self.stop.clone();

        let pinned = self.shared.snapshot.read().pinned_address.clone();
        let preferred = pinned.clone().or_else(|| settings.preferred_address.clone());
        let filter = settings.scan_filter(preferred.clone());

        self.shared.transition(ConnectionState::Scanning);
        self.shared.emit(ControllerEvent::Scanning {
            target: settings.target_name.clone(),
            pinned_address: pinned,
        });
        info!(
            "Scanning for '{}' ({:.1}s)",
            settings.target_name,
            settings.scan_timeout.as_secs_f64()
        );

        let scanned = tokio::select! {
            _ = stop.stopped() => {
                self.abandon().await;
                return Attempt::Stopped;
            }
            result = transport.scan(&filter) => result,
        };
        let candidates = match scanned {
            Ok(candidates) => candidates,
            Err(error) => return self.failed(error),
        };
        debug!("Scan found {} candidate(s)", candidates.len());

        let Some(device) = select_candidate(candidates, preferred.as_deref()) else {
            return self.failed(TransportError::Scan(format!(
                "no device matching '{}' found",
                settings.target_name
            )));
        };

        self.shared.transition(ConnectionState::Connecting);
        info!("Connecting to {}", device);
        let connected = tokio::select! {
            _ = stop.stopped() => {
                self.abandon().await;
                return Attempt::Stopped;
            }
            result = transport.connect(&device) => result,
        };
        let session = match connected {
            Ok(session) => session,
            Err(error) => {
                self.abandon().await;
                return self.failed(error);
            }
        };

        let device = session.device.clone();
        let summary = DeviceSummary::from(&device);
        self.shared
            .transition_with(ConnectionState::Connected, |snapshot| {
                snapshot.device = Some(device.clone());
                snapshot.retry_count = 0;
                snapshot.pinned_address = Some(device.address.clone());
            });
        info!("Connected to {}", device);
        self.shared.emit(ControllerEvent::Connected {
            device: summary.clone(),
        });

        let started = Instant::now();
        let (halt, halted) = StopHandle::new();
        let pump = LinePump {
            shared: Arc::clone(&self.shared),
            broadcaster: self.broadcaster.clone(),
            formatter: LineFormatter::new(settings.format),
            flush_interval: settings.reconnect.idle_flush_interval,
            idle_threshold: settings.reconnect.idle_threshold,
        };
        let pump = tokio::spawn(pump.run(session.inbound, halted));

        if let Err(e) = transport.run_until_disconnected(self.stop.clone()).await {
            debug!("Session wait ended with error: {}", e);
        }
        self.abandon().await;
        halt.stop();
        if let Err(e) = pump.await {
            warn!("Line pump ended abnormally: {}", e);
        }
        let lasted = started.elapsed();

        self.shared
            .transition_with(ConnectionState::Disconnected, |snapshot| {
                snapshot.device = None;
            });
        info!(
            "Disconnected from {} after {:.1}s",
            device,
            lasted.as_secs_f64()
        );
        self.shared.emit(ControllerEvent::Disconnected {
            device: summary,
            session: lasted,
        });
        Attempt::SessionEnded { lasted }
    }

    /// Make sure nothing is left connected or scanning
    async fn abandon(&self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!("Transport disconnect failed: {}", e);
        }
    }

    fn failed(&self, error: TransportError) -> Attempt {
        warn!("Attempt failed: {}", error);
        self.shared.transition(ConnectionState::Disconnected);
        self.shared.emit(ControllerEvent::AttemptFailed {
            error: error.clone(),
        });
        Attempt::Failed(error)
    }
}

/// Per-session inbound byte handling
struct LinePump {
    shared: Arc<Shared>,
    broadcaster: Broadcaster,
    formatter: LineFormatter,
    flush_interval: Duration,
    idle_threshold: Duration,
}

impl LinePump {
    async fn run(self, mut inbound: mpsc::Receiver<Vec<u8>>, mut halt: StopSignal) {
        let mut assembler = LineAssembler::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            tokio::select! {
                biased;
                _ = halt.stopped() => break,
                chunk = inbound.recv(), if open => match chunk {
                    Some(chunk) => self.feed(&mut assembler, &chunk),
                    None => open = false,
                },
                _ = ticker.tick() => {
                    if let Some(partial) = assembler.flush_if_idle(self.idle_threshold) {
                        self.deliver(&partial);
                    }
                }
            }
        }

        while let Ok(chunk) = inbound.try_recv() {
            self.feed(&mut assembler, &chunk);
        }
        if let Some(rest) = assembler.take_remaining() {
            self.deliver(&rest);
        }
    }

    fn feed(&self, assembler: &mut LineAssembler, chunk: &[u8]) {
        for line in assembler.feed(chunk) {
            self.deliver(&line);
        }
    }

    fn deliver(&self, raw: &[u8]) {
        let line = self.formatter.format(raw);
        self.shared.write_sink(&line);
        self.broadcaster.publish(line);
    }
}
