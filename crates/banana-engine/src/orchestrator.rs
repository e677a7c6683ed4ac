//! Session controller: turns UI actions into validated requests, runs them
//! through the [`GenerationClient`] and records successes in the history.
//!
//! Policy for overlapping actions is last-request-wins: issuing a request
//! cancels the one in flight, and a completion whose ticket has been
//! superseded is discarded without touching history or the published state.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use banana_contracts::errors::{BusyError, GenerationError, NotFoundError, ValidationError};
use banana_contracts::events::{EventPayload, EventWriter};
use banana_contracts::history::manifest::SessionManifest;
use banana_contracts::history::{EntryId, GenerationResult, HistoryStore};
use banana_contracts::image::{Image, Mask};
use banana_contracts::payload;
use banana_contracts::request::{build, GenerationMode};
use banana_contracts::resolution::ResolutionTier;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::cancel::CancelToken;
use crate::client::GenerationClient;
use crate::credentials::Credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Validating,
    Requesting,
    Succeeded,
    Failed,
    Cancelled,
}

impl OrchestratorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Requesting => "requesting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderKind {
    /// Base image is a mist/depth pass.
    Depth,
    /// Base image is a colour render.
    Regular,
}

/// One user intent. Edits without an explicit base work on the current
/// history image.
#[derive(Debug, Clone)]
pub struct Action {
    mode: GenerationMode,
    base: Option<Image>,
    mask: Option<Mask>,
    reference: Option<Image>,
    prompt: String,
    resolution: ResolutionTier,
}

impl Action {
    fn new(mode: GenerationMode, prompt: impl Into<String>) -> Self {
        Self {
            mode,
            base: None,
            mask: None,
            reference: None,
            prompt: prompt.into(),
            resolution: ResolutionTier::Auto,
        }
    }

    pub fn render(kind: RenderKind, base: Image, prompt: impl Into<String>) -> Self {
        let mode = match kind {
            RenderKind::Depth => GenerationMode::DepthRender,
            RenderKind::Regular => GenerationMode::RegularRender,
        };
        Self::new(mode, prompt).with_base(base)
    }

    pub fn inpaint(mask: Mask, prompt: impl Into<String>) -> Self {
        let mut action = Self::new(GenerationMode::Inpaint, prompt);
        action.mask = Some(mask);
        action
    }

    pub fn integrate(mask: Mask, reference: Image, prompt: impl Into<String>) -> Self {
        let mut action = Self::new(GenerationMode::Integrate, prompt);
        action.mask = Some(mask);
        action.with_reference(reference)
    }

    pub fn full_edit(prompt: impl Into<String>) -> Self {
        Self::new(GenerationMode::FullEdit, prompt)
    }

    pub fn with_base(mut self, base: Image) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_reference(mut self, reference: Image) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_resolution(mut self, resolution: ResolutionTier) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Busy(#[from] BusyError),
}

impl ActionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Generation(err) if err.is_cancelled())
    }
}

/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    client: GenerationClient,
    credentials: Credentials,
    events: EventWriter,
    state: watch::Sender<OrchestratorState>,
    session: Mutex<Session>,
}

struct Session {
    history: HistoryStore,
    in_flight: Option<InFlight>,
    next_ticket: u64,
}

struct InFlight {
    ticket: u64,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(client: GenerationClient, credentials: Credentials, events: EventWriter) -> Self {
        Self::with_history(client, credentials, events, HistoryStore::new())
    }

    /// Resumes a session, e.g. one rebuilt by [`SessionManifest::load`].
    pub fn with_history(
        client: GenerationClient,
        credentials: Credentials,
        events: EventWriter,
        history: HistoryStore,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        let orchestrator = Self {
            shared: Arc::new(Shared {
                client: client.with_events(events.clone()),
                credentials,
                events,
                state,
                session: Mutex::new(Session {
                    history,
                    in_flight: None,
                    next_ticket: 1,
                }),
            }),
        };
        let versions = orchestrator.history(HistoryStore::len);
        orchestrator.emit(
            "session_started",
            payload! {
                "versions" => versions,
                "credentials" => orchestrator.shared.credentials.is_present(),
            },
        );
        orchestrator
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        *self.shared.state.borrow()
    }

    pub fn events(&self) -> &EventWriter {
        &self.shared.events
    }

    pub async fn perform_action(&self, action: Action) -> Result<EntryId, ActionError> {
        let Action {
            mode,
            base,
            mask,
            reference,
            prompt,
            resolution,
        } = action;

        let (parent, base) = {
            let session = self.lock();
            let parent = session.history.current_id();
            let base = base.or_else(|| {
                session
                    .history
                    .current()
                    .map(|entry| entry.image().clone())
            });
            if session.in_flight.is_none() {
                self.publish(OrchestratorState::Validating);
            }
            (parent, base)
        };
        self.emit(
            "action_started",
            payload! {
                "mode" => mode.as_str(),
                "resolution" => resolution.as_str(),
                "parent" => parent.map(EntryId::version_label),
            },
        );

        let request = match build(mode, base, mask, reference, &prompt, resolution) {
            Ok(request) => request,
            Err(err) => {
                let session = self.lock();
                self.emit(
                    "action_rejected",
                    payload! {
                        "kind" => err.kind.as_str(),
                        "field" => err.field,
                        "message" => err.message.as_str(),
                    },
                );
                if session.in_flight.is_none() {
                    self.publish(OrchestratorState::Failed);
                    self.publish(OrchestratorState::Idle);
                }
                return Err(err.into());
            }
        };

        let (ticket, cancel) = {
            let mut session = self.lock();
            if let Some(previous) = session.in_flight.take() {
                previous.cancel.cancel();
            }
            let ticket = session.next_ticket;
            session.next_ticket += 1;
            let cancel = CancelToken::new();
            session.in_flight = Some(InFlight {
                ticket,
                cancel: cancel.clone(),
            });
            self.publish(OrchestratorState::Requesting);
            (ticket, cancel)
        };

        let mut guard = FlightGuard {
            orchestrator: self,
            ticket,
            mode,
            armed: true,
        };
        let outcome = self
            .shared
            .client
            .generate(&request, &self.shared.credentials, &cancel)
            .await;
        guard.armed = false;

        let mut session = self.lock();
        let superseded = session
            .in_flight
            .as_ref()
            .map(|flight| flight.ticket)
            != Some(ticket);
        if superseded {
            self.discard(ticket, mode, "superseded");
            return Err(GenerationError::cancelled().into());
        }
        session.in_flight = None;

        // A cancel acknowledged after the transport answered still wins.
        let outcome = if cancel.is_cancelled() {
            if outcome.is_ok() {
                self.discard(ticket, mode, "cancelled");
            }
            Err(GenerationError::cancelled())
        } else {
            outcome
        };

        let image = match outcome {
            Ok(image) => image,
            Err(err) => {
                let state = if err.is_cancelled() {
                    OrchestratorState::Cancelled
                } else {
                    OrchestratorState::Failed
                };
                self.publish(state);
                self.publish(OrchestratorState::Idle);
                return Err(err.into());
            }
        };

        match session
            .history
            .append(GenerationResult::new(image, request), parent)
        {
            Ok(id) => {
                self.emit(
                    "version_created",
                    payload! {
                        "version" => id.version_label(),
                        "parent" => parent.map(EntryId::version_label),
                        "mode" => mode.as_str(),
                    },
                );
                self.publish(OrchestratorState::Succeeded);
                self.publish(OrchestratorState::Idle);
                Ok(id)
            }
            Err(err) => {
                self.discard(ticket, mode, "parent_removed");
                self.publish(OrchestratorState::Failed);
                self.publish(OrchestratorState::Idle);
                Err(err.into())
            }
        }
    }

    /// Cancels the in-flight request, if any. The pending
    /// [`perform_action`](Self::perform_action) resolves to `Cancelled`.
    pub fn cancel(&self) -> bool {
        let session = self.lock();
        match session.in_flight.as_ref() {
            Some(flight) => {
                flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn restore(&self, id: EntryId) -> Result<(), ActionError> {
        let mut session = self.lock();
        session.history.restore(id)?;
        self.emit(
            "history_restored",
            payload! { "version" => id.version_label() },
        );
        Ok(())
    }

    pub fn clear_history(&self) {
        let mut session = self.lock();
        let dropped = session.history.len();
        session.history.clear();
        self.emit("history_cleared", payload! { "dropped" => dropped });
    }

    /// Read access to the version tree.
    pub fn history<R>(&self, read: impl FnOnce(&HistoryStore) -> R) -> R {
        read(&self.lock().history)
    }

    pub fn current(&self) -> Option<(EntryId, Image)> {
        self.history(|history| {
            history
                .current()
                .map(|entry| (entry.id(), entry.image().clone()))
        })
    }

    /// Writes the session working file into `dir`.
    pub fn save_session(&self, dir: &Path) -> anyhow::Result<SessionManifest> {
        let snapshot = self.history(HistoryStore::clone);
        let manifest = SessionManifest::save(&snapshot, dir)?;
        self.emit(
            "session_saved",
            payload! {
                "dir" => dir.display().to_string(),
                "versions" => manifest.versions.len(),
                "current" => manifest.current_version_id.clone(),
            },
        );
        Ok(manifest)
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.shared
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: OrchestratorState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            self.emit(
                "state_changed",
                payload! { "from" => previous.as_str(), "to" => state.as_str() },
            );
        }
    }

    fn discard(&self, ticket: u64, mode: GenerationMode, reason: &str) {
        self.emit(
            "version_discarded",
            payload! { "ticket" => ticket, "mode" => mode.as_str(), "reason" => reason },
        );
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        self.shared.events.record(event_type, payload);
    }
}

/// Releases the in-flight slot when a [`Orchestrator::perform_action`]
/// future is dropped while it waits on the client.
struct FlightGuard<'a> {
    orchestrator: &'a Orchestrator,
    ticket: u64,
    mode: GenerationMode,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let orchestrator = self.orchestrator;
        let mut session = orchestrator.lock();
        let owned = session
            .in_flight
            .as_ref()
            .is_some_and(|flight| flight.ticket == self.ticket);
        if !owned {
            return;
        }
        if let Some(flight) = session.in_flight.take() {
            flight.cancel.cancel();
        }
        orchestrator.discard(self.ticket, self.mode, "dropped");
        orchestrator.publish(OrchestratorState::Cancelled);
        orchestrator.publish(OrchestratorState::Idle);
    }
}
