//! Startup reconciliation of running tmux sessions with known cards.
//!
//! Sessions named `termq-<8 hex>` are matched to cards by that suffix.
//! Matched sessions are reattached silently when auto-reattach is on;
//! otherwise they are surfaced next to orphans for the user to decide.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::card::{parse_session_name, CardId, CardSpec};
use crate::error::{SessionError, SessionResult};
use crate::metadata::{MetadataSync, SyncedMetadata};
use crate::registry::{recovery_backend, SessionRef, SessionRegistry, SessionState};
use crate::tmux::{ExternalSession, Multiplexer};

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateKind {
    /// Belongs to a known card that has no open session.
    Matched(CardSpec),
    /// Follows the naming convention but no known card has that name.
    Orphan,
}

/// A running session waiting for the user's decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryCandidate {
    pub session: ExternalSession,
    pub kind: CandidateKind,
    /// What the session environment says about its card, when readable.
    pub metadata: Option<SyncedMetadata>,
}

impl RecoveryCandidate {
    pub fn is_orphan(&self) -> bool {
        matches!(self.kind, CandidateKind::Orphan)
    }

    /// The card this session belongs to, from the board or its environment.
    pub fn card_id(&self) -> Option<CardId> {
        match &self.kind {
            CandidateKind::Matched(spec) => Some(spec.id),
            CandidateKind::Orphan => self
                .metadata
                .as_ref()
                .and_then(|m| m.card)
                .filter(|id| id.session_name() == self.session.name),
        }
    }

    /// Title for display: the synced card title, else the session name.
    pub fn title(&self) -> String {
        match &self.kind {
            CandidateKind::Matched(spec) if !spec.metadata.title.is_empty() => {
                spec.metadata.title.clone()
            }
            _ => self
                .metadata
                .as_ref()
                .map(|m| m.metadata.title.clone())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| self.session.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Reattach,
    /// Leave the session running and unmanaged until the app exits.
    Dismiss,
    Kill,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub reattached: Vec<CardId>,
    pub candidates: Vec<RecoveryCandidate>,
    /// Cards to recover lazily on their next open.
    pub deferred: Vec<CardId>,
    pub failed: Vec<(CardId, String)>,
    pub timed_out: bool,
}

#[derive(Default)]
struct Progress {
    report: RecoveryReport,
    settled: HashSet<CardId>,
    complete: bool,
}

pub struct RecoveryCoordinator {
    registry: SessionRegistry,
    mux: Arc<dyn Multiplexer>,
    sync: MetadataSync,
    auto_reattach: bool,
    timeout: Duration,
    dismissed: Mutex<HashSet<String>>,
}

impl RecoveryCoordinator {
    pub fn new(registry: SessionRegistry) -> Self {
        let config = registry.config();
        let auto_reattach = config.auto_reattach;
        let timeout = config.recovery_timeout();
        Self {
            mux: registry.multiplexer(),
            sync: registry.metadata_sync(),
            registry,
            auto_reattach,
            timeout,
            dismissed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_auto_reattach(mut self, enabled: bool) -> Self {
        self.auto_reattach = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_dismissed(&self, session: &str) -> bool {
        self.dismissed.lock().contains(session)
    }

    /// Classify running sessions against `known` cards. User opens on the
    /// registry wait until this returns. Cards not classified within the
    /// timeout are deferred to their next open.
    pub async fn run(&self, known: &[CardSpec]) -> RecoveryReport {
        let _gate = self.registry.begin_recovery();
        let progress = Mutex::new(Progress::default());

        let finished = tokio::time::timeout(self.timeout, self.classify(known, &progress))
            .await
            .is_ok();

        let mut progress = progress.into_inner();
        let mut report = std::mem::take(&mut progress.report);
        if !finished || !progress.complete {
            report.timed_out = !finished;
            report.deferred = known
                .iter()
                .map(|spec| spec.id)
                .filter(|id| !progress.settled.contains(id))
                .collect();
        } else {
            report.deferred = report.failed.iter().map(|(id, _)| *id).collect();
        }
        self.registry.defer(report.deferred.iter().copied());

        tracing::info!(
            reattached = report.reattached.len(),
            candidates = report.candidates.len(),
            deferred = report.deferred.len(),
            timed_out = report.timed_out,
            "recovery finished"
        );
        report
    }

    async fn classify(&self, known: &[CardSpec], progress: &Mutex<Progress>) {
        let sessions = match self.mux.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::debug!(error = %e, "no tmux sessions to recover");
                return;
            }
        };

        let by_suffix: HashMap<String, &CardSpec> =
            known.iter().map(|spec| (spec.id.short(), spec)).collect();
        let running: HashSet<String> = sessions.iter().map(|s| s.name.clone()).collect();

        // Cards without a running session have nothing to recover.
        {
            let mut progress = progress.lock();
            progress.settled.extend(
                known
                    .iter()
                    .filter(|spec| !running.contains(&spec.session_name()))
                    .map(|spec| spec.id),
            );
        }

        for session in sessions {
            let Some(suffix) = parse_session_name(&session.name) else {
                continue;
            };
            if self.is_dismissed(&session.name) {
                continue;
            }
            let metadata = match self.sync.read(&session.name).await {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    tracing::debug!(session = %session.name, error = %e, "environment unreadable");
                    None
                }
            };

            match by_suffix.get(&suffix).copied() {
                Some(spec) => self.classify_matched(spec, session, metadata, progress).await,
                None => {
                    tracing::info!(session = %session.name, "orphan session found");
                    progress.lock().report.candidates.push(RecoveryCandidate {
                        session,
                        kind: CandidateKind::Orphan,
                        metadata,
                    });
                }
            }
        }
        progress.lock().complete = true;
    }

    async fn classify_matched(
        &self,
        spec: &CardSpec,
        session: ExternalSession,
        metadata: Option<SyncedMetadata>,
        progress: &Mutex<Progress>,
    ) {
        if self.registry.state(&spec.id) != SessionState::NoSession {
            progress.lock().settled.insert(spec.id);
            return;
        }
        if !self.auto_reattach {
            let mut progress = progress.lock();
            progress.settled.insert(spec.id);
            progress.report.candidates.push(RecoveryCandidate {
                session,
                kind: CandidateKind::Matched(spec.clone()),
                metadata,
            });
            return;
        }

        let mut reattach = spec.clone();
        reattach.backend = recovery_backend(spec.backend);
        let outcome = self.registry.open_unguarded(&reattach).await;
        let mut progress = progress.lock();
        match outcome {
            Ok(_) => {
                tracing::info!(card = %spec.id, session = %session.name, "session reattached");
                progress.settled.insert(spec.id);
                progress.report.reattached.push(spec.id);
            }
            Err(e) => {
                tracing::warn!(card = %spec.id, error = %e, "reattach failed");
                progress.report.failed.push((spec.id, e.to_string()));
            }
        }
    }

    /// Apply the user's choice for one candidate. Reattach returns the
    /// opened session.
    pub async fn resolve(
        &self,
        candidate: &RecoveryCandidate,
        disposition: Disposition,
    ) -> SessionResult<Option<SessionRef>> {
        let name = &candidate.session.name;
        match disposition {
            Disposition::Dismiss => {
                tracing::info!(session = %name, "session dismissed");
                self.dismissed.lock().insert(name.clone());
                Ok(None)
            }
            Disposition::Kill => {
                match &candidate.kind {
                    CandidateKind::Matched(spec) => self.registry.kill(&spec.id).await?,
                    CandidateKind::Orphan => self
                        .mux
                        .kill_session(name)
                        .await
                        .map_err(|e| SessionError::Multiplexer(format!("{e:#}")))?,
                }
                tracing::info!(session = %name, "session killed during recovery");
                Ok(None)
            }
            Disposition::Reattach => {
                let spec = self.reattach_spec(candidate)?;
                let opened = self.registry.open(&spec).await?;
                Ok(Some(opened.session))
            }
        }
    }

    fn reattach_spec(&self, candidate: &RecoveryCandidate) -> SessionResult<CardSpec> {
        let mut spec = match &candidate.kind {
            CandidateKind::Matched(spec) => spec.clone(),
            CandidateKind::Orphan => {
                let id = candidate.card_id().ok_or_else(|| {
                    SessionError::Multiplexer(format!(
                        "session {} does not record its card",
                        candidate.session.name
                    ))
                })?;
                let mut spec = CardSpec::new(id, self.registry.config().default_backend);
                if let Some(synced) = &candidate.metadata {
                    spec.metadata = synced.metadata.clone();
                }
                spec
            }
        };
        spec.backend = recovery_backend(spec.backend);
        Ok(spec)
    }
}
