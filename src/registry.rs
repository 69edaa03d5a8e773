//! Ownership of live card sessions: open, close, kill and the rule that a
//! card's backend is fixed while its session is active.
//!
//! Each card moves through `NoSession -> Starting -> Active -> NoSession`.
//! Every active session has one watcher task; whichever of the watcher or an
//! explicit close/kill notices the end first reports it, and
//! [`RegistryEvent::SessionEnded`] is sent exactly once per session.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, OwnedMutexGuard};

use crate::card::{BackendKind, CardId, CardMetadata, CardSpec};
use crate::config::Config;
use crate::control::{ControlOptions, ControlSession, LinkState, Snapshot};
use crate::error::{SessionError, SessionResult};
use crate::metadata::{MetadataSync, PushReport};
use crate::process::{wait_exit, ExitReason, LaunchSpec, ProcessHandle};
use crate::tmux::Multiplexer;

/// The live mechanism behind a card.
pub enum Backend {
    Direct(ProcessHandle),
    /// A tmux client on a PTY, attached to the card's session.
    Attach(ProcessHandle),
    Control(ControlSession),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Direct(_) => BackendKind::Direct,
            Backend::Attach(_) => BackendKind::Attach,
            Backend::Control(_) => BackendKind::Control,
        }
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        match self {
            Backend::Direct(p) | Backend::Attach(p) => Some(p),
            Backend::Control(_) => None,
        }
    }

    pub fn control(&self) -> Option<&ControlSession> {
        match self {
            Backend::Control(c) => Some(c),
            _ => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Backend::Direct(p) | Backend::Attach(p) => p.pid(),
            Backend::Control(c) => c.pid(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Closed,
    Killed,
    Exited(ExitReason),
    /// The control-mode stream ended on its own.
    Disconnected,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Closed => write!(f, "closed"),
            EndReason::Killed => write!(f, "killed"),
            EndReason::Exited(reason) => write!(f, "exited ({reason})"),
            EndReason::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Opened {
        card: CardId,
        kind: BackendKind,
    },
    /// tmux was requested but unavailable; the card runs on Direct.
    BackendFallback {
        card: CardId,
        requested: BackendKind,
        reason: String,
    },
    SessionEnded {
        card: CardId,
        kind: BackendKind,
        reason: EndReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Starting(BackendKind),
    Active(BackendKind),
}

/// Informational: the requested backend was replaced by Direct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackNotice {
    pub requested: BackendKind,
    pub reason: String,
}

pub struct Opened {
    pub session: SessionRef,
    pub fallback: Option<FallbackNotice>,
}

/// One active card session. Owned by the registry; callers hold references.
pub struct ManagedSession {
    card: CardId,
    session_name: String,
    backend: Backend,
    metadata: Mutex<CardMetadata>,
    end_request: Mutex<Option<EndReason>>,
    ended: watch::Sender<bool>,
    sync_lock: tokio::sync::Mutex<()>,
    started_at: DateTime<Local>,
}

pub type SessionRef = Arc<ManagedSession>;

impl ManagedSession {
    fn new(spec: &CardSpec, backend: Backend) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            card: spec.id,
            session_name: spec.session_name(),
            backend,
            metadata: Mutex::new(spec.metadata.clone()),
            end_request: Mutex::new(None),
            ended,
            sync_lock: tokio::sync::Mutex::new(()),
            started_at: Local::now(),
        }
    }

    pub fn card(&self) -> CardId {
        self.card
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn metadata(&self) -> CardMetadata {
        self.metadata.lock().clone()
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    pub async fn wait_ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Windows and panes of a Control session.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.backend.control().map(ControlSession::snapshot)
    }

    pub async fn send_input(&self, data: &[u8]) -> SessionResult<()> {
        match &self.backend {
            Backend::Direct(p) | Backend::Attach(p) => p.write(data),
            Backend::Control(c) => c.send_input(data).await,
        }
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> SessionResult<()> {
        match &self.backend {
            Backend::Direct(p) | Backend::Attach(p) => p.resize(cols, rows),
            Backend::Control(c) => c.resize(cols, rows).await,
        }
    }

    /// Record why the session is being torn down. Returns false if a
    /// teardown was already requested.
    fn request_end(&self, reason: EndReason) -> bool {
        let mut request = self.end_request.lock();
        if request.is_some() {
            return false;
        }
        *request = Some(reason);
        true
    }

    fn requested_end(&self) -> Option<EndReason> {
        self.end_request.lock().clone()
    }

    /// Flip to ended. Only the first caller gets `true`.
    fn mark_ended(&self) -> bool {
        self.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        })
    }
}

/// What the watcher waits on.
enum EndSignal {
    Process(watch::Receiver<Option<ExitReason>>),
    Control(watch::Receiver<LinkState>),
}

impl EndSignal {
    fn of(backend: &Backend) -> Self {
        match backend {
            Backend::Direct(p) | Backend::Attach(p) => EndSignal::Process(p.exit_watch()),
            Backend::Control(c) => EndSignal::Control(c.link_watch()),
        }
    }

    async fn wait(self) -> EndReason {
        match self {
            EndSignal::Process(rx) => EndReason::Exited(wait_exit(rx).await),
            EndSignal::Control(mut rx) => {
                let _ = rx.wait_for(|s| *s == LinkState::Closed).await;
                EndReason::Disconnected
            }
        }
    }
}

enum Slot {
    Starting(BackendKind),
    Active(SessionRef),
}

struct Inner {
    mux: Arc<dyn Multiplexer>,
    config: Config,
    slots: Mutex<HashMap<CardId, Slot>>,
    card_locks: Mutex<HashMap<CardId, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<RegistryEvent>,
    sync: MetadataSync,
    recovering: watch::Sender<usize>,
    deferred: Mutex<HashSet<CardId>>,
}

impl Inner {
    async fn lock_card(&self, card: CardId) -> CardLock<'_> {
        let lock = self.card_locks.lock().entry(card).or_default().clone();
        CardLock {
            inner: self,
            card,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn finish(&self, session: &SessionRef, natural: EndReason) {
        if !session.mark_ended() {
            return;
        }
        let reason = session.requested_end().unwrap_or(natural);
        {
            let mut slots = self.slots.lock();
            let current = matches!(
                slots.get(&session.card),
                Some(Slot::Active(s)) if Arc::ptr_eq(s, session)
            );
            if current {
                slots.remove(&session.card);
            }
        }
        tracing::info!(card = %session.card, session = %session.session_name, %reason, "session ended");
        self.emit(RegistryEvent::SessionEnded {
            card: session.card,
            kind: session.kind(),
            reason,
        });
    }
}

/// Serializes open/close/kill of one card. The lock table entry goes away
/// once no other call holds or waits on it.
struct CardLock<'a> {
    inner: &'a Inner,
    card: CardId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CardLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.inner.card_locks.lock();
        self.guard = None;
        if locks
            .get(&self.card)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.card);
        }
    }
}

/// A `Starting` slot that is removed again unless the open commits, so a
/// cancelled or failed start leaves the card at `NoSession`.
struct StartingSlot<'a> {
    inner: &'a Inner,
    card: CardId,
    /// The card was deferred; keep it deferred if the start does not finish.
    deferred: bool,
    committed: bool,
}

impl Drop for StartingSlot<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        {
            let mut slots = self.inner.slots.lock();
            if matches!(slots.get(&self.card), Some(Slot::Starting(_))) {
                slots.remove(&self.card);
            }
        }
        if self.deferred {
            self.inner.deferred.lock().insert(self.card);
        }
        tracing::debug!(card = %self.card, "start abandoned");
    }
}

/// Held while startup recovery runs; user opens wait until it is dropped.
pub struct RecoveryGate {
    inner: Arc<Inner>,
}

impl Drop for RecoveryGate {
    fn drop(&mut self) {
        self.inner
            .recovering
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Backend used to reattach a running tmux session. A plain shell cannot be
/// re-adopted, so Direct cards come back through a tmux client.
pub fn recovery_backend(kind: BackendKind) -> BackendKind {
    match kind {
        BackendKind::Direct => BackendKind::Attach,
        other => other,
    }
}

/// Maps card ids to their live session. Cheap to clone; all clones share
/// one table.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(mux: Arc<dyn Multiplexer>, config: Config) -> Self {
        let (events, _) = broadcast::channel(config.output_buffer.max(16));
        let (recovering, _) = watch::channel(0);
        let sync = MetadataSync::new(mux.clone());
        Self {
            inner: Arc::new(Inner {
                mux,
                config,
                slots: Mutex::new(HashMap::new()),
                card_locks: Mutex::new(HashMap::new()),
                events,
                sync,
                recovering,
                deferred: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn multiplexer(&self) -> Arc<dyn Multiplexer> {
        self.inner.mux.clone()
    }

    pub fn metadata_sync(&self) -> MetadataSync {
        self.inner.sync.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get(&self, card: &CardId) -> Option<SessionRef> {
        match self.inner.slots.lock().get(card) {
            Some(Slot::Active(s)) if !s.is_ended() => Some(s.clone()),
            _ => None,
        }
    }

    pub fn state(&self, card: &CardId) -> SessionState {
        match self.inner.slots.lock().get(card) {
            Some(Slot::Starting(kind)) => SessionState::Starting(*kind),
            Some(Slot::Active(s)) if !s.is_ended() => SessionState::Active(s.kind()),
            _ => SessionState::NoSession,
        }
    }

    pub fn backend_of(&self, card: &CardId) -> Option<BackendKind> {
        match self.state(card) {
            SessionState::NoSession => None,
            SessionState::Starting(kind) | SessionState::Active(kind) => Some(kind),
        }
    }

    pub fn active_cards(&self) -> Vec<CardId> {
        let mut cards: Vec<CardId> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Active(s) if !s.is_ended() => Some(*id),
                _ => None,
            })
            .collect();
        cards.sort();
        cards
    }

    /// Windows and panes of the card's Control session. `None` for other
    /// backends or when nothing is open.
    pub fn get_snapshot(&self, card: &CardId) -> Option<Snapshot> {
        self.get(card).and_then(|s| s.snapshot())
    }

    /// Fails with `BackendLocked` if the card has a session on another backend.
    pub fn check_backend_change(&self, card: &CardId, requested: BackendKind) -> SessionResult<()> {
        match self.backend_of(card) {
            Some(current) if current != requested => Err(SessionError::BackendLocked {
                card: *card,
                current,
                requested,
            }),
            _ => Ok(()),
        }
    }

    // ── Recovery coordination ───────────────────────────────────────

    /// Hold user opens until the returned gate is dropped.
    pub fn begin_recovery(&self) -> RecoveryGate {
        self.inner.recovering.send_modify(|n| *n += 1);
        RecoveryGate {
            inner: self.inner.clone(),
        }
    }

    pub fn is_recovering(&self) -> bool {
        *self.inner.recovering.borrow() > 0
    }

    async fn wait_for_recovery(&self) {
        let mut rx = self.inner.recovering.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Mark cards whose sessions were not classified before recovery gave up.
    /// Their next open reattaches a running tmux session if one exists.
    pub fn defer(&self, cards: impl IntoIterator<Item = CardId>) {
        self.inner.deferred.lock().extend(cards);
    }

    pub fn is_deferred(&self, card: &CardId) -> bool {
        self.inner.deferred.lock().contains(card)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open the card's session, or return the one already running. The
    /// backend of an existing session is kept whatever `spec` asks for.
    pub async fn open(&self, spec: &CardSpec) -> SessionResult<Opened> {
        self.wait_for_recovery().await;
        self.open_unguarded(spec).await
    }

    pub(crate) async fn open_unguarded(&self, spec: &CardSpec) -> SessionResult<Opened> {
        let _lock = self.inner.lock_card(spec.id).await;

        if let Some(session) = self.get(&spec.id) {
            tracing::debug!(card = %spec.id, kind = %session.kind(), "session already open");
            return Ok(Opened {
                session,
                fallback: None,
            });
        }

        let mut requested = spec.backend;
        let deferred = self.inner.deferred.lock().remove(&spec.id);
        if deferred && self.external_session_exists(&spec.session_name()).await {
            requested = recovery_backend(requested);
            tracing::info!(card = %spec.id, kind = %requested, "reattaching deferred session");
        }

        self.inner
            .slots
            .lock()
            .insert(spec.id, Slot::Starting(requested));
        let mut starting = StartingSlot {
            inner: &self.inner,
            card: spec.id,
            deferred,
            committed: false,
        };
        let (backend, fallback) = match self.start_with_fallback(spec, requested).await {
            Ok(started) => started,
            Err(e) => {
                tracing::warn!(card = %spec.id, kind = %requested, error = %e, "open failed");
                return Err(e);
            }
        };

        let session = Arc::new(ManagedSession::new(spec, backend));
        self.inner
            .slots
            .lock()
            .insert(spec.id, Slot::Active(session.clone()));
        starting.committed = true;
        self.spawn_watcher(&session);

        tracing::info!(
            card = %spec.id,
            session = %session.session_name,
            kind = %session.kind(),
            pid = ?session.backend.pid(),
            "session opened"
        );
        self.inner.emit(RegistryEvent::Opened {
            card: spec.id,
            kind: session.kind(),
        });
        if let Some(notice) = &fallback {
            self.inner.emit(RegistryEvent::BackendFallback {
                card: spec.id,
                requested: notice.requested,
                reason: notice.reason.clone(),
            });
        }
        if session.kind().uses_multiplexer() {
            let sync = self.inner.sync.clone();
            let session = session.clone();
            let ready = self.inner.config.handshake_timeout();
            tokio::spawn(async move {
                push_metadata(&sync, &session, ready).await;
            });
        }

        Ok(Opened { session, fallback })
    }

    async fn start_with_fallback(
        &self,
        spec: &CardSpec,
        requested: BackendKind,
    ) -> SessionResult<(Backend, Option<FallbackNotice>)> {
        match self.start_backend(spec, requested).await {
            Err(SessionError::BackendUnavailable(reason)) if requested.uses_multiplexer() => {
                tracing::warn!(card = %spec.id, %requested, %reason, "falling back to direct shell");
                self.inner
                    .slots
                    .lock()
                    .insert(spec.id, Slot::Starting(BackendKind::Direct));
                let backend = self.start_backend(spec, BackendKind::Direct).await?;
                Ok((backend, Some(FallbackNotice { requested, reason })))
            }
            other => other.map(|backend| (backend, None)),
        }
    }

    async fn start_backend(&self, spec: &CardSpec, kind: BackendKind) -> SessionResult<Backend> {
        let config = &self.inner.config;
        let (cols, rows) = (config.default_cols, config.default_rows);
        match kind {
            BackendKind::Direct => {
                let launch = LaunchSpec::new(spec.shell.clone())
                    .cwd(spec.working_directory.clone())
                    .envs(&spec.env);
                Ok(Backend::Direct(ProcessHandle::start(&launch, cols, rows)?))
            }
            BackendKind::Attach => {
                let launch = self.multiplexer_launch(spec, kind)?;
                Ok(Backend::Attach(ProcessHandle::start(&launch, cols, rows)?))
            }
            BackendKind::Control => {
                let launch = self.multiplexer_launch(spec, kind)?;
                let options = ControlOptions::from_config(config);
                let session = ControlSession::spawn(&launch, &spec.session_name(), options).await?;
                Ok(Backend::Control(session))
            }
        }
    }

    fn multiplexer_launch(&self, spec: &CardSpec, kind: BackendKind) -> SessionResult<LaunchSpec> {
        let mux = &self.inner.mux;
        if !mux.is_available() {
            return Err(SessionError::BackendUnavailable(
                "tmux binary not found".to_string(),
            ));
        }
        let name = spec.session_name();
        let launch = match kind {
            BackendKind::Control => {
                mux.control_spec(&name, &spec.working_directory, &spec.shell, &spec.env)
            }
            _ => mux.attach_spec(&name, &spec.working_directory, &spec.shell, &spec.env),
        };
        launch.ok_or_else(|| SessionError::BackendUnavailable("tmux binary not found".to_string()))
    }

    fn spawn_watcher(&self, session: &SessionRef) {
        let signal = EndSignal::of(&session.backend);
        let inner = Arc::downgrade(&self.inner);
        let session: Weak<ManagedSession> = Arc::downgrade(session);
        tokio::spawn(async move {
            let natural = signal.wait().await;
            if let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) {
                inner.finish(&session, natural);
            }
        });
    }

    /// Detach or terminate the card's session. The tmux session itself keeps
    /// running. Succeeds when nothing is open.
    pub async fn close(&self, card: &CardId) -> SessionResult<()> {
        let _lock = self.inner.lock_card(*card).await;

        let Some(session) = self.get(card) else {
            return Ok(());
        };
        if !session.request_end(EndReason::Closed) {
            return Ok(());
        }
        tracing::debug!(card = %card, kind = %session.kind(), "closing session");
        self.teardown(&session).await;
        Ok(())
    }

    /// End the card's session and its tmux session.
    pub async fn kill(&self, card: &CardId) -> SessionResult<()> {
        let _lock = self.inner.lock_card(*card).await;

        let name = card.session_name();
        let active = self.get(card);
        if let Some(session) = &active {
            session.request_end(EndReason::Killed);
        }

        let external = self.external_session_exists(&name).await;
        let killed = if external {
            self.inner
                .mux
                .kill_session(&name)
                .await
                .map_err(|e| SessionError::Multiplexer(format!("{e:#}")))
        } else {
            Ok(())
        };
        if let Some(session) = &active {
            self.teardown(session).await;
        }
        killed?;

        if active.is_none() && !external {
            return Err(SessionError::UnknownSession(*card));
        }
        tracing::info!(card = %card, session = %name, "session killed");
        Ok(())
    }

    async fn teardown(&self, session: &SessionRef) {
        let grace = self.inner.config.close_grace();
        match &session.backend {
            Backend::Direct(p) | Backend::Attach(p) => {
                if p.terminate(grace).await.is_none() {
                    tracing::warn!(card = %session.card, pid = ?p.pid(), "process did not exit");
                }
            }
            Backend::Control(c) => c.detach(grace).await,
        }
        if tokio::time::timeout(grace, session.wait_ended()).await.is_err() {
            tracing::debug!(card = %session.card, "end not observed, finishing anyway");
        }
        self.inner.finish(session, EndReason::Closed);
    }

    /// Close every open session, leaving tmux sessions running.
    pub async fn shutdown_all(&self) {
        let cards = self.active_cards();
        let results = futures::future::join_all(cards.iter().map(|card| self.close(card))).await;
        for (card, result) in cards.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(card = %card, error = %e, "close during shutdown failed");
            }
        }
    }

    async fn external_session_exists(&self, name: &str) -> bool {
        self.inner.mux.is_available() && self.inner.mux.has_session(name).await.unwrap_or(false)
    }

    // ── Input and metadata ──────────────────────────────────────────

    pub async fn send_input(&self, card: &CardId, data: &[u8]) -> SessionResult<()> {
        let session = self.get(card).ok_or(SessionError::UnknownSession(*card))?;
        session.send_input(data).await
    }

    pub async fn resize(&self, card: &CardId, cols: u16, rows: u16) -> SessionResult<()> {
        let session = self.get(card).ok_or(SessionError::UnknownSession(*card))?;
        session.resize(cols, rows).await
    }

    /// Store new metadata and push it into the tmux session environment.
    pub async fn update_metadata(
        &self,
        card: &CardId,
        metadata: CardMetadata,
    ) -> SessionResult<PushReport> {
        let session = self.get(card).ok_or(SessionError::UnknownSession(*card))?;
        *session.metadata.lock() = metadata;
        Ok(self.push_if_multiplexed(&session).await)
    }

    /// Push the stored metadata again and wait for it to land.
    pub async fn sync_metadata(&self, card: &CardId) -> SessionResult<PushReport> {
        let session = self.get(card).ok_or(SessionError::UnknownSession(*card))?;
        Ok(self.push_if_multiplexed(&session).await)
    }

    async fn push_if_multiplexed(&self, session: &SessionRef) -> PushReport {
        if !session.kind().uses_multiplexer() {
            return PushReport::default();
        }
        push_metadata(&self.inner.sync, session, self.inner.config.handshake_timeout()).await
    }
}

/// Pushes are serialized per session and always write the latest metadata.
/// The tmux session may still be starting, so wait up to `ready` for it.
async fn push_metadata(
    sync: &MetadataSync,
    session: &ManagedSession,
    ready: Duration,
) -> PushReport {
    let _guard = session.sync_lock.lock().await;
    sync.wait_for_session(&session.session_name, ready).await;
    let metadata = session.metadata();
    sync.push(&session.session_name, &session.card, &metadata)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMux;
    use std::str::FromStr;

    const WAIT: Duration = Duration::from_secs(10);

    fn config() -> Config {
        Config {
            close_grace_ms: 500,
            handshake_timeout_ms: 5000,
            ..Config::default()
        }
    }

    fn registry(mux: Arc<FakeMux>) -> SessionRegistry {
        SessionRegistry::new(mux, config())
    }

    fn spec(backend: BackendKind) -> CardSpec {
        let mut spec = CardSpec::new(CardId::new(), backend);
        spec.shell = "/bin/sh".to_string();
        spec.working_directory = std::env::temp_dir();
        spec
    }

    async fn ended_events(
        rx: &mut broadcast::Receiver<RegistryEvent>,
        card: CardId,
    ) -> Vec<EndReason> {
        let mut reasons = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
        {
            if let RegistryEvent::SessionEnded { card: c, reason, .. } = event {
                if c == card {
                    reasons.push(reason);
                }
            }
        }
        reasons
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let registry = registry(Arc::new(FakeMux::new()));
        let spec = spec(BackendKind::Direct);

        let first = registry.open(&spec).await.unwrap();
        let mut other = spec.clone();
        other.backend = BackendKind::Control;
        let second = registry.open(&other).await.unwrap();

        assert!(Arc::ptr_eq(&first.session, &second.session));
        assert_eq!(second.session.kind(), BackendKind::Direct);
        assert_eq!(registry.active_cards(), vec![spec.id]);
        registry.close(&spec.id).await.unwrap();
    }

    #[tokio::test]
    async fn missing_tmux_falls_back_to_direct() {
        let registry = registry(Arc::new(FakeMux::unavailable()));
        let mut events = registry.subscribe();
        let spec = spec(BackendKind::Control);

        let opened = registry.open(&spec).await.unwrap();
        assert_eq!(opened.session.kind(), BackendKind::Direct);
        let notice = opened.fallback.unwrap();
        assert_eq!(notice.requested, BackendKind::Control);
        assert!(notice.reason.contains("tmux"));

        let mut saw_fallback = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RegistryEvent::BackendFallback { card, .. } if card == spec.id) {
                saw_fallback = true;
            }
        }
        assert!(saw_fallback);
        registry.close(&spec.id).await.unwrap();
    }

    #[tokio::test]
    async fn backend_is_locked_while_active() {
        let registry = registry(Arc::new(FakeMux::new()));
        let spec = spec(BackendKind::Direct);
        registry.open(&spec).await.unwrap();

        let err = registry
            .check_backend_change(&spec.id, BackendKind::Control)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::BackendLocked {
                current: BackendKind::Direct,
                requested: BackendKind::Control,
                ..
            }
        ));
        assert!(registry
            .check_backend_change(&spec.id, BackendKind::Direct)
            .is_ok());

        registry.close(&spec.id).await.unwrap();
        assert!(registry
            .check_backend_change(&spec.id, BackendKind::Control)
            .is_ok());
    }

    #[tokio::test]
    async fn concurrent_kill_and_close_end_once() {
        let registry = registry(Arc::new(FakeMux::new()));
        let spec = spec(BackendKind::Direct);
        let mut events = registry.subscribe();
        registry.open(&spec).await.unwrap();

        let (killed, closed) = tokio::join!(registry.kill(&spec.id), registry.close(&spec.id));
        assert!(closed.is_ok());
        // Loses the race to close: the Direct shell has no tmux session.
        if let Err(e) = killed {
            assert!(matches!(e, SessionError::UnknownSession(_)));
        }

        assert_eq!(ended_events(&mut events, spec.id).await.len(), 1);
        assert_eq!(registry.state(&spec.id), SessionState::NoSession);
    }

    #[tokio::test]
    async fn external_process_death_ends_session_once() {
        let registry = registry(Arc::new(FakeMux::new()));
        let spec = spec(BackendKind::Direct);
        let mut events = registry.subscribe();
        let opened = registry.open(&spec).await.unwrap();

        opened.session.backend().process().unwrap().kill();
        let (closed, ended) = tokio::join!(
            registry.close(&spec.id),
            tokio::time::timeout(WAIT, opened.session.wait_ended())
        );
        closed.unwrap();
        ended.unwrap();

        let reasons = ended_events(&mut events, spec.id).await;
        assert_eq!(reasons.len(), 1);
        assert_eq!(registry.state(&spec.id), SessionState::NoSession);
        assert!(registry.get(&spec.id).is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = registry(Arc::new(FakeMux::new()));
        let spec = spec(BackendKind::Direct);
        registry.open(&spec).await.unwrap();
        registry.close(&spec.id).await.unwrap();
        registry.close(&spec.id).await.unwrap();
        registry.close(&CardId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn kill_without_any_session_is_unknown() {
        let registry = registry(Arc::new(FakeMux::new()));
        let card = CardId::new();
        let err = registry.kill(&card).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(c) if c == card));
    }

    #[tokio::test]
    async fn kill_removes_unmanaged_tmux_session() {
        let mux = Arc::new(FakeMux::new());
        let registry = registry(mux.clone());
        let card = CardId::new();
        mux.add_session(&card.session_name());

        registry.kill(&card).await.unwrap();
        assert!(!mux.has(&card.session_name()));
    }

    #[tokio::test]
    async fn attach_close_leaves_tmux_session_running() {
        let mux = Arc::new(FakeMux::new());
        let registry = registry(mux.clone());
        let spec = spec(BackendKind::Attach);
        let mut events = registry.subscribe();

        registry.open(&spec).await.unwrap();
        assert_eq!(
            registry.state(&spec.id),
            SessionState::Active(BackendKind::Attach)
        );
        // The metadata push lands once the client has created its session.
        let report = registry.sync_metadata(&spec.id).await.unwrap();
        assert!(report.failed.is_empty());
        registry.close(&spec.id).await.unwrap();

        assert!(mux.has(&spec.session_name()));
        assert_eq!(
            ended_events(&mut events, spec.id).await,
            vec![EndReason::Closed]
        );
    }

    #[tokio::test]
    async fn control_backend_exposes_snapshot() {
        let registry = registry(Arc::new(FakeMux::new()));
        let control = spec(BackendKind::Control);
        let direct = spec(BackendKind::Direct);

        registry.open(&control).await.unwrap();
        registry.open(&direct).await.unwrap();

        let snapshot = registry.get_snapshot(&control.id).unwrap();
        assert_eq!(snapshot.session, control.session_name());
        assert!(registry.get_snapshot(&direct.id).is_none());
        assert!(registry.get_snapshot(&CardId::new()).is_none());

        registry.shutdown_all().await;
        assert!(registry.active_cards().is_empty());
    }

    #[tokio::test]
    async fn metadata_survives_reattach() {
        let mux = Arc::new(FakeMux::new());
        let registry = registry(mux.clone());
        let mut spec = spec(BackendKind::Attach);
        registry.open(&spec).await.unwrap();

        let updated = CardMetadata {
            title: "build farm".to_string(),
            description: "two\nlines".to_string(),
            tags: vec![("team".to_string(), "infra".to_string())],
            badges: vec!["ci".to_string()],
            column: "Doing".to_string(),
            favourite: true,
            ..CardMetadata::default()
        };
        let report = registry
            .update_metadata(&spec.id, updated.clone())
            .await
            .unwrap();
        assert!(report.failed.is_empty());
        registry.close(&spec.id).await.unwrap();

        spec.metadata = updated.clone();
        let reopened = registry.open(&spec).await.unwrap();
        registry.sync_metadata(&spec.id).await.unwrap();
        assert_eq!(reopened.session.metadata(), updated);

        let synced = registry
            .metadata_sync()
            .read(&spec.session_name())
            .await
            .unwrap();
        assert_eq!(synced.card, Some(spec.id));
        assert_eq!(synced.metadata, updated);
        assert_eq!(mux.launches().len(), 2);
        registry.close(&spec.id).await.unwrap();
    }

    #[tokio::test]
    async fn card_locks_are_released_after_use() {
        let registry = registry(Arc::new(FakeMux::new()));
        let spec = spec(BackendKind::Direct);
        registry.open(&spec).await.unwrap();
        registry.close(&spec.id).await.unwrap();
        let _ = registry.kill(&CardId::new()).await;
        assert!(registry.inner.card_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelled_open_returns_card_to_no_session() {
        let mux = Arc::new(FakeMux::new());
        mux.stall_control();
        let registry = registry(mux);
        let spec = spec(BackendKind::Control);

        let opening = tokio::time::timeout(Duration::from_millis(100), registry.open(&spec));
        assert!(opening.await.is_err());

        assert_eq!(registry.state(&spec.id), SessionState::NoSession);
        assert!(registry
            .check_backend_change(&spec.id, BackendKind::Attach)
            .is_ok());
        assert!(registry.inner.card_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn open_waits_for_recovery() {
        let registry = registry(Arc::new(FakeMux::new()));
        let spec = spec(BackendKind::Direct);
        let gate = registry.begin_recovery();

        let pending = {
            let registry = registry.clone();
            let spec = spec.clone();
            tokio::spawn(async move { registry.open(&spec).await.map(|o| o.session.card()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());
        assert_eq!(registry.state(&spec.id), SessionState::NoSession);

        drop(gate);
        let card = tokio::time::timeout(WAIT, pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(card, spec.id);
        registry.close(&spec.id).await.unwrap();
    }

    #[tokio::test]
    async fn deferred_direct_card_reattaches_running_session() {
        let mux = Arc::new(FakeMux::new());
        let registry = registry(mux.clone());
        let spec = spec(BackendKind::Direct);
        mux.add_session(&spec.session_name());
        registry.defer([spec.id]);

        let opened = registry.open(&spec).await.unwrap();
        assert_eq!(opened.session.kind(), BackendKind::Attach);
        assert!(!registry.is_deferred(&spec.id));
        registry.close(&spec.id).await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_returns_to_no_session() {
        let registry = registry(Arc::new(FakeMux::new()));
        let mut spec = spec(BackendKind::Direct);
        spec.shell = "/nonexistent/termq-shell".to_string();

        let err = registry.open(&spec).await.err().unwrap();
        assert!(matches!(err, SessionError::SpawnFailed { .. }));
        assert_eq!(registry.state(&spec.id), SessionState::NoSession);
    }

    #[tokio::test]
    async fn operations_on_unknown_card_fail() {
        let registry = registry(Arc::new(FakeMux::new()));
        let card = CardId::from_str("ab12cd34-5678-4abc-9def-0123456789ab").unwrap();
        assert!(matches!(
            registry.send_input(&card, b"x").await,
            Err(SessionError::UnknownSession(_))
        ));
        assert!(matches!(
            registry.resize(&card, 100, 30).await,
            Err(SessionError::UnknownSession(_))
        ));
        assert!(matches!(
            registry.update_metadata(&card, CardMetadata::default()).await,
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[test]
    fn recovery_backend_promotes_direct() {
        assert_eq!(recovery_backend(BackendKind::Direct), BackendKind::Attach);
        assert_eq!(recovery_backend(BackendKind::Attach), BackendKind::Attach);
        assert_eq!(recovery_backend(BackendKind::Control), BackendKind::Control);
    }
}
