//! The update state machine.
//!
//! [`Updater`] is a cheap handle on a single actor task that owns all
//! state. Commands (`Poll`, `Fetch`, `Apply`, `Cancel`) and completion
//! events from background operations are handled one at a time, so every
//! client observes one linear sequence of state changes. Long-running work
//! runs in its own task with a fresh cancellation token and reports back
//! with the generation it was started under; stale reports are dropped.

pub mod apply;
pub mod candidate;
pub mod fetch;
pub mod poll;
pub mod state;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, UpdaterError};
use crate::live_boot::is_live_boot;
use crate::metrics::Metrics;
use crate::repo::PullProgress;
use crate::sysroot::{PendingUpdate, Sysroot};

pub use apply::ApplyOutcome;
pub use candidate::UpdateCandidate;
pub use poll::PollSource;
pub use state::{Properties, UpdaterState};

const COMMAND_BUFFER: usize = 32;

enum Command {
    Poll {
        source: PollSource,
        reply: oneshot::Sender<Result<()>>,
    },
    Fetch {
        reply: oneshot::Sender<Result<()>>,
    },
    Apply {
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        reply: oneshot::Sender<UpdaterState>,
    },
}

enum Event {
    Polled {
        generation: u64,
        outcome: Result<Option<UpdateCandidate>>,
    },
    Fetched {
        generation: u64,
        outcome: Result<()>,
    },
    Applied {
        generation: u64,
        outcome: Result<ApplyOutcome>,
    },
    Progress {
        generation: u64,
        bytes: u64,
    },
}

/// Handle on the updater actor. Clones share the same actor.
#[derive(Clone)]
pub struct Updater {
    commands: mpsc::Sender<Command>,
    properties: watch::Receiver<Properties>,
}

impl Updater {
    /// Initialise the state from the sysroot and start the actor.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(config: Config) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (properties_tx, properties_rx) = watch::channel(Properties::default());

        let mut actor = Actor::new(config, properties_tx, events_tx);
        actor.initialise();
        tokio::spawn(actor.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            properties: properties_rx,
        }
    }

    /// Start polling the configured sources.
    pub async fn poll(&self) -> Result<()> {
        self.request(|reply| Command::Poll {
            source: PollSource::Configured,
            reply,
        })
        .await
    }

    /// Start polling a single mounted volume.
    pub async fn poll_volume(&self, path: impl Into<std::path::PathBuf>) -> Result<()> {
        let source = PollSource::Volume(path.into());
        self.request(|reply| Command::Poll { source, reply }).await
    }

    /// Start downloading the update found by the last poll.
    pub async fn fetch(&self) -> Result<()> {
        self.request(|reply| Command::Fetch { reply }).await
    }

    /// Start deploying the fetched update.
    pub async fn apply(&self) -> Result<()> {
        self.request(|reply| Command::Apply { reply }).await
    }

    /// Cancel the running operation and wait for it to settle.
    ///
    /// Returns the state afterwards; without a running operation this is a
    /// no-op.
    pub async fn cancel(&self) -> Result<UpdaterState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Cancel { reply })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }

    /// Current properties.
    pub fn properties(&self) -> Properties {
        self.properties.borrow().clone()
    }

    pub fn state(&self) -> UpdaterState {
        self.properties.borrow().state
    }

    /// Receiver notified on every property change.
    pub fn watch(&self) -> watch::Receiver<Properties> {
        self.properties.clone()
    }

    /// Wait until the state satisfies `done`, returning the properties.
    pub async fn wait_for(&self, mut done: impl FnMut(UpdaterState) -> bool) -> Result<Properties> {
        let mut rx = self.properties.clone();
        let props = rx
            .wait_for(|props| done(props.state))
            .await
            .map_err(|_| actor_gone())?;
        Ok(props.clone())
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }
}

fn actor_gone() -> UpdaterError {
    UpdaterError::Io("Updater is not running".to_string())
}

fn wrong_state(method: &str, state: UpdaterState) -> UpdaterError {
    UpdaterError::WrongState(format!("Can't call {}() while in state {}", method, state))
}

// ============================================================================
// Actor
// ============================================================================

struct Running {
    generation: u64,
    cancel: CancellationToken,
}

struct Actor {
    config: Arc<Config>,
    metrics: Metrics,
    properties: watch::Sender<Properties>,
    /// Set while `UpdateAvailable` through `ApplyingUpdate`.
    candidate: Option<UpdateCandidate>,
    running: Option<Running>,
    generation: u64,
    cancel_waiters: Vec<oneshot::Sender<UpdaterState>>,
    events: mpsc::UnboundedSender<Event>,
}

impl Actor {
    fn new(
        config: Config,
        properties: watch::Sender<Properties>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            metrics: Metrics::from_settings(&config.metrics),
            config: Arc::new(config),
            properties,
            candidate: None,
            running: None,
            generation: 0,
            cancel_waiters: Vec::new(),
            events,
        }
    }

    fn initialise(&mut self) {
        if self.is_live_boot() {
            info!("Updater disabled on live systems");
            self.change_state(UpdaterState::Ready);
            return;
        }

        let mut sysroot = Sysroot::new(&self.config.sysroot);
        match sysroot.load() {
            Ok(()) if sysroot.booted_deployment().is_some() => {
                self.change_state(UpdaterState::Ready);
            }
            Ok(()) => self.set_error(UpdaterError::not_ostree_system()),
            Err(e) => self.set_error(e.into()),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        if let Some(running) = self.running.take() {
            running.cancel.cancel();
        }
        debug!("Updater stopped");
    }

    fn state(&self) -> UpdaterState {
        self.properties.borrow().state
    }

    fn is_live_boot(&self) -> bool {
        is_live_boot(&self.config.sysroot.cmdline_path)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Poll { source, reply } => {
                let _ = reply.send(self.start_poll(source));
            }
            Command::Fetch { reply } => {
                let _ = reply.send(self.start_fetch());
            }
            Command::Apply { reply } => {
                let _ = reply.send(self.start_apply());
            }
            Command::Cancel { reply } => match &self.running {
                Some(running) => {
                    info!(state = %self.state(), "Cancelling the running operation");
                    running.cancel.cancel();
                    self.cancel_waiters.push(reply);
                }
                None => {
                    debug!(state = %self.state(), "Nothing to cancel");
                    let _ = reply.send(self.state());
                }
            },
        }
    }

    /// Allocate the generation and cancellation token of a new operation.
    fn begin(&mut self) -> (u64, CancellationToken) {
        self.generation += 1;
        let cancel = CancellationToken::new();
        self.running = Some(Running {
            generation: self.generation,
            cancel: cancel.clone(),
        });
        (self.generation, cancel)
    }

    fn start_poll(&mut self, source: PollSource) -> Result<()> {
        let method = match source {
            PollSource::Configured => "Poll",
            PollSource::Volume(_) => "PollVolume",
        };
        if self.is_live_boot() {
            return Err(UpdaterError::live_boot());
        }
        let state = self.state();
        if !state.can_poll() {
            return Err(wrong_state(method, state));
        }

        let (generation, cancel) = self.begin();
        self.candidate = None;
        self.change_state(UpdaterState::Polling);

        let config = Arc::clone(&self.config);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = poll::poll(&config, &source, &cancel).await;
            let _ = events.send(Event::Polled { generation, outcome });
        });
        Ok(())
    }

    fn start_fetch(&mut self) -> Result<()> {
        if self.is_live_boot() {
            return Err(UpdaterError::live_boot());
        }
        let state = self.state();
        if !state.can_fetch() {
            return Err(wrong_state("Fetch", state));
        }
        let Some(candidate) = self.candidate.clone() else {
            return Err(wrong_state("Fetch", state));
        };

        let (generation, cancel) = self.begin();
        self.change_state(UpdaterState::Fetching);

        let config = Arc::clone(&self.config);
        let events = self.events.clone();
        tokio::spawn(async move {
            let progress_events = events.clone();
            let progress = move |progress: PullProgress| {
                let _ = progress_events.send(Event::Progress {
                    generation,
                    bytes: progress.bytes_transferred,
                });
            };
            let outcome = fetch::fetch(&config, &candidate, &progress, &cancel).await;
            let _ = events.send(Event::Fetched { generation, outcome });
        });
        Ok(())
    }

    fn start_apply(&mut self) -> Result<()> {
        if self.is_live_boot() {
            return Err(UpdaterError::live_boot());
        }
        let state = self.state();
        if !state.can_apply() {
            return Err(wrong_state("Apply", state));
        }
        let expected = self.candidate.as_ref().map(|candidate| PendingUpdate {
            checksum: candidate.checksum.clone(),
            refspec: candidate.new_refspec.to_string(),
            original_refspec: candidate.old_refspec.to_string(),
        });

        let (generation, cancel) = self.begin();
        self.change_state(UpdaterState::ApplyingUpdate);

        let config = Arc::clone(&self.config);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = apply::apply(&config.sysroot, expected, &cancel).await;
            let _ = events.send(Event::Applied { generation, outcome });
        });
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Progress { generation, bytes } => {
                if self.is_current(generation) && self.state() == UpdaterState::Fetching {
                    self.properties.send_if_modified(|props| {
                        let before = props.downloaded_bytes;
                        props.record_progress(bytes);
                        props.downloaded_bytes != before
                    });
                }
            }
            Event::Polled { generation, outcome } => {
                if let Some(cancelled) = self.finish(generation) {
                    self.poll_done(cancelled, outcome);
                    self.answer_cancel_waiters();
                }
            }
            Event::Fetched { generation, outcome } => {
                if let Some(cancelled) = self.finish(generation) {
                    match outcome {
                        Ok(()) if cancelled => self.set_error(UpdaterError::cancelled()),
                        Ok(()) => self.change_state(UpdaterState::UpdateReady),
                        Err(e) => self.set_error(e),
                    }
                    self.answer_cancel_waiters();
                }
            }
            // Cancel cannot undo a completed deployment.
            Event::Applied { generation, outcome } => {
                if self.finish(generation).is_some() {
                    match outcome {
                        Ok(outcome) => {
                            let version = self.properties.borrow().version.clone();
                            self.metrics.report_applied(&outcome.deployment.checksum, &version);
                            self.change_state(UpdaterState::UpdateApplied);
                        }
                        Err(e) => self.set_error(e),
                    }
                    self.answer_cancel_waiters();
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.generation == generation)
    }

    /// End the operation `generation`; `Some(cancelled)` if it was current.
    fn finish(&mut self, generation: u64) -> Option<bool> {
        if !self.is_current(generation) {
            debug!(generation, "Dropping completion of a stale operation");
            return None;
        }
        self.running.take().map(|running| running.cancel.is_cancelled())
    }

    fn poll_done(&mut self, cancelled: bool, outcome: Result<Option<UpdateCandidate>>) {
        match outcome {
            _ if cancelled => self.set_error(UpdaterError::cancelled()),
            Ok(Some(candidate)) => {
                self.properties.send_modify(|props| props.set_candidate(&candidate));
                self.candidate = Some(candidate);
                self.change_state(UpdaterState::UpdateAvailable);
            }
            Ok(None) => {
                self.properties.send_modify(Properties::clear_update);
                self.change_state(UpdaterState::Ready);
            }
            Err(e) => self.set_error(e),
        }
    }

    fn answer_cancel_waiters(&mut self) {
        let state = self.state();
        for waiter in self.cancel_waiters.drain(..) {
            let _ = waiter.send(state);
        }
    }

    fn change_state(&mut self, next: UpdaterState) {
        let current = self.state();
        if !current.allows(next) {
            warn!(from = %current, to = %next, "Unexpected state transition");
        }
        self.properties.send_modify(|props| {
            if props.has_error() && next != UpdaterState::Error {
                info!("Clearing error state and changing to state {}", next);
                props.clear_error();
            } else {
                info!("Changing to state {}", next);
            }
            props.state = next;
        });
    }

    fn set_error(&mut self, error: UpdaterError) {
        info!(
            "Changing to error state: {}, {}, {}",
            error.name(),
            error.code(),
            error
        );
        self.metrics.report_failure(&error);
        self.candidate = None;
        self.properties.send_modify(|props| {
            props.set_error(&error);
            props.state = UpdaterState::Error;
        });
    }
}
