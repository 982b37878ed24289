//! Push client: one background worker that drives the session state machine
//! (connect, register, message loop, backoff) until it is told to stop.

use crate::connection::{Connector, PushError, Session};
use crate::dispatch::{run_message_loop, Dispatcher, LoopExit};
use crate::host::HostHandle;
use crate::protocol::Command;
use crate::registration::RegistrationIdentity;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Wait after a failed connect or a failed REGISTER, and after a clean close.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Wait after the active session ended with an error.
pub const FAILURE_DELAY: Duration = Duration::from_secs(5);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Registering,
    Active,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Active => "active",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

struct Shared<C> {
    connector: C,
    registration: Vec<u8>,
    dispatcher: Dispatcher,
    state: watch::Sender<SessionState>,
}

impl<C> Shared<C> {
    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "session state changed");
        }
    }
}

type SessionSlot<S> = Arc<Mutex<Option<Arc<Session<S>>>>>;

struct Worker<S> {
    stop: watch::Sender<bool>,
    current: SessionSlot<S>,
    handle: JoinHandle<()>,
}

pub struct PushClient<C: Connector> {
    shared: Arc<Shared<C>>,
    worker: Mutex<Option<Worker<C::Stream>>>,
}

impl<C: Connector> PushClient<C> {
    pub fn new(connector: C, identity: &RegistrationIdentity, host: HostHandle) -> Result<Self, PushError> {
        let registration = identity
            .to_payload()
            .map_err(|err| PushError::Registration(err.to_string()))?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                registration,
                dispatcher: Dispatcher::new(host),
                state,
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Last push token the server handed out, if any.
    pub fn push_token(&self) -> Option<String> {
        self.shared.dispatcher.push_token()
    }

    /// Spawns the worker. A no-op while a worker is already running.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            tracing::debug!("push client already running");
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let current: SessionSlot<C::Stream> = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(run_session_loop(self.shared.clone(), stop_rx, current.clone()));
        *worker = Some(Worker { stop, current, handle });
    }

    /// Sets the stop flag, closes the live session to release a pending read
    /// or write, and waits up to `STOP_TIMEOUT` for the worker. A worker that
    /// overruns is aborted, so a later `start` never runs alongside it. Safe
    /// to call repeatedly.
    pub async fn stop(&self) {
        let worker = self.worker.lock().unwrap().take();
        let Some(Worker { stop, current, mut handle }) = worker else {
            tracing::debug!("push client not running");
            return;
        };

        stop.send_replace(true);
        let session = current.lock().unwrap().clone();
        let finished = timeout(STOP_TIMEOUT, async {
            if let Some(session) = session {
                session.disconnect().await;
            }
            (&mut handle).await
        })
        .await;

        match finished {
            Ok(Ok(())) => tracing::info!("push client stopped"),
            Ok(Err(err)) => tracing::warn!(error = %err, "push worker ended abnormally"),
            Err(_) => {
                tracing::warn!("push worker did not exit in time, aborting");
                handle.abort();
                self.shared.set_state(SessionState::Stopped);
            }
        }
    }
}

async fn run_session_loop<C: Connector>(
    shared: Arc<Shared<C>>,
    mut stop: watch::Receiver<bool>,
    current: SessionSlot<C::Stream>,
) {
    let endpoint = shared.connector.endpoint();
    tracing::info!(endpoint = %endpoint, "push worker started");

    while !is_stopped(&stop) {
        let delay = run_session(&shared, &mut stop, &current).await;
        shared.set_state(SessionState::Disconnected);
        if is_stopped(&stop) || wait_or_stop(&mut stop, delay).await {
            break;
        }
    }

    shared.set_state(SessionState::Stopped);
    tracing::info!(endpoint = %endpoint, "push worker exited");
}

/// One pass through Connecting, Registering and Active. Returns how long to
/// wait before the next attempt.
async fn run_session<C: Connector>(
    shared: &Shared<C>,
    stop: &mut watch::Receiver<bool>,
    current: &SessionSlot<C::Stream>,
) -> Duration {
    shared.set_state(SessionState::Connecting);
    let connected = tokio::select! {
        biased;
        _ = stopped(stop) => return Duration::ZERO,
        connected = shared.connector.connect() => connected,
    };
    let stream = match connected {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(endpoint = %shared.connector.endpoint(), error = %err, "connect failed");
            return RECONNECT_DELAY;
        }
    };

    let (session, mut reader) = Session::open(stream);
    *current.lock().unwrap() = Some(session.clone());
    // stop() may have looked at the slot before it was filled.
    if is_stopped(stop) {
        session.disconnect().await;
        current.lock().unwrap().take();
        return Duration::ZERO;
    }
    tracing::info!(session_id = %session.id(), endpoint = %shared.connector.endpoint(), "connected to push server");

    shared.set_state(SessionState::Registering);
    let delay = match session.send(Command::Register, &shared.registration).await {
        Err(err) => {
            tracing::warn!(session_id = %session.id(), error = %err, "registration failed");
            RECONNECT_DELAY
        }
        Ok(()) => {
            tracing::info!(session_id = %session.id(), "registered with push server");
            shared.set_state(SessionState::Active);
            match run_message_loop(&session, &mut reader, &shared.dispatcher).await {
                Ok(LoopExit::PeerClosed) | Ok(LoopExit::Disconnected) => RECONNECT_DELAY,
                Err(err) => {
                    tracing::error!(session_id = %session.id(), error = %err, "push session failed");
                    FAILURE_DELAY
                }
            }
        }
    };

    session.disconnect().await;
    current.lock().unwrap().take();
    delay
}

/// A dropped sender counts as a stop request.
fn is_stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Returns true when the stop signal arrived before `delay` elapsed.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if delay.is_zero() {
        return false;
    }
    tracing::debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
    tokio::select! {
        _ = stopped(stop) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
