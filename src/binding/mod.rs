use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

pub type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The HTTP control-plane operations the push client relies on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn login(&self) -> Result<(), AnyError>;

    fn session_token(&self) -> Option<String>;

    async fn bind_call_push_token(&self, push_token: &str) -> Result<(), AnyError>;

    async fn bind_message_push_token(&self, push_token: &str) -> Result<(), AnyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStep {
    Call,
    Message,
}

impl fmt::Display for BindingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => f.write_str("call-notification binding"),
            Self::Message => f.write_str("message-notification binding"),
        }
    }
}

#[derive(Debug)]
pub enum BindingError {
    Login(String),
    Rejected { step: BindingStep, reason: String },
}

impl fmt::Display for BindingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login(msg) => write!(f, "login failed: {msg}"),
            Self::Rejected { step, reason } => write!(f, "{step} failed: {reason}"),
        }
    }
}

impl std::error::Error for BindingError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingOutcome {
    Bound,
    AlreadyBound,
    InFlight,
    /// Both calls succeeded but a newer push token arrived meanwhile.
    Superseded,
}

#[derive(Debug, Default)]
struct BindingState {
    latest: Option<String>,
    bound: Option<String>,
    in_flight: HashSet<String>,
}

/// Binds push tokens to the account. Completion is keyed by token value:
/// repeating a bound value is a no-op, a new value clears the old binding.
/// Failures are not retried here; the next TOKEN frame triggers another run.
pub struct BindingCoordinator {
    control_plane: Arc<dyn ControlPlane>,
    state: Mutex<BindingState>,
}

impl BindingCoordinator {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            control_plane,
            state: Mutex::new(BindingState::default()),
        }
    }

    pub fn bound_token(&self) -> Option<String> {
        self.state.lock().unwrap().bound.clone()
    }

    pub async fn bind(&self, push_token: String) -> Result<BindingOutcome, BindingError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.latest.as_deref() != Some(push_token.as_str()) {
                if state.bound.take().is_some() {
                    tracing::info!("push token changed, previous binding cleared");
                }
                state.latest = Some(push_token.clone());
            }
            if state.bound.as_deref() == Some(push_token.as_str()) {
                tracing::debug!("push token already bound, skipping");
                return Ok(BindingOutcome::AlreadyBound);
            }
            if !state.in_flight.insert(push_token.clone()) {
                tracing::debug!("binding for this push token already in flight");
                return Ok(BindingOutcome::InFlight);
            }
        }

        tracing::info!(push_token = %redact(&push_token), "binding push token");
        let result = self.run_sequence(&push_token).await;

        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&push_token);
        match result {
            Ok(()) if state.latest.as_deref() == Some(push_token.as_str()) => {
                state.bound = Some(push_token);
                tracing::info!("push token binding complete");
                Ok(BindingOutcome::Bound)
            }
            Ok(()) => {
                tracing::info!("push token superseded while binding");
                Ok(BindingOutcome::Superseded)
            }
            Err(err) => {
                tracing::error!(error = %err, "push token binding failed");
                Err(err)
            }
        }
    }

    async fn run_sequence(&self, push_token: &str) -> Result<(), BindingError> {
        if self.control_plane.session_token().is_none() {
            tracing::info!("no session token, logging in before binding");
            self.control_plane
                .login()
                .await
                .map_err(|err| BindingError::Login(err.to_string()))?;
            if self.control_plane.session_token().is_none() {
                return Err(BindingError::Login("login returned no session token".to_string()));
            }
        }

        self.control_plane
            .bind_call_push_token(push_token)
            .await
            .map_err(|err| BindingError::Rejected {
                step: BindingStep::Call,
                reason: err.to_string(),
            })?;
        tracing::info!("call-notification push token bound");

        self.control_plane
            .bind_message_push_token(push_token)
            .await
            .map_err(|err| BindingError::Rejected {
                step: BindingStep::Message,
                reason: err.to_string(),
            })?;
        tracing::info!("message-notification push token bound");
        Ok(())
    }
}

pub fn redact(token: &str) -> String {
    match token.char_indices().nth(10) {
        Some((idx, _)) => format!("{}...", &token[..idx]),
        None => token.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    pub(crate) struct FakeControlPlane {
        pub session: Mutex<Option<String>>,
        pub logins: AtomicUsize,
        pub call_binds: Mutex<Vec<String>>,
        pub message_binds: Mutex<Vec<String>>,
        pub fail_login: AtomicBool,
        pub fail_call: AtomicBool,
        pub gate: Option<Arc<Notify>>,
    }

    impl FakeControlPlane {
        pub fn logged_in() -> Self {
            Self {
                session: Mutex::new(Some("session-token".to_string())),
                ..Default::default()
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_binds.lock().unwrap().len()
        }

        pub fn message_count(&self) -> usize {
            self.message_binds.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn login(&self) -> Result<(), AnyError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.fail_login.load(Ordering::SeqCst) {
                return Err("bad credentials".into());
            }
            *self.session.lock().unwrap() = Some("fresh-session".to_string());
            Ok(())
        }

        fn session_token(&self) -> Option<String> {
            self.session.lock().unwrap().clone()
        }

        async fn bind_call_push_token(&self, push_token: &str) -> Result<(), AnyError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.call_binds.lock().unwrap().push(push_token.to_string());
            if self.fail_call.load(Ordering::SeqCst) {
                return Err("message != success".into());
            }
            Ok(())
        }

        async fn bind_message_push_token(&self, push_token: &str) -> Result<(), AnyError> {
            self.message_binds.lock().unwrap().push(push_token.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn same_token_binds_once_and_new_token_rebinds() {
        let plane = Arc::new(FakeControlPlane::logged_in());
        let coordinator = BindingCoordinator::new(plane.clone());

        assert_eq!(coordinator.bind("abc".into()).await.unwrap(), BindingOutcome::Bound);
        assert_eq!((plane.call_count(), plane.message_count()), (1, 1));

        assert_eq!(
            coordinator.bind("abc".into()).await.unwrap(),
            BindingOutcome::AlreadyBound
        );
        assert_eq!((plane.call_count(), plane.message_count()), (1, 1));

        assert_eq!(coordinator.bind("xyz".into()).await.unwrap(), BindingOutcome::Bound);
        assert_eq!((plane.call_count(), plane.message_count()), (2, 2));
        assert_eq!(coordinator.bound_token().as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn missing_session_triggers_login_first() {
        let plane = Arc::new(FakeControlPlane::default());
        let coordinator = BindingCoordinator::new(plane.clone());

        coordinator.bind("abc".into()).await.unwrap();
        assert_eq!(plane.logins.load(Ordering::SeqCst), 1);
        assert_eq!(plane.call_count(), 1);
    }

    #[tokio::test]
    async fn login_failure_aborts_without_binding() {
        let plane = Arc::new(FakeControlPlane::default());
        plane.fail_login.store(true, Ordering::SeqCst);
        let coordinator = BindingCoordinator::new(plane.clone());

        let err = coordinator.bind("abc".into()).await.unwrap_err();
        assert!(matches!(err, BindingError::Login(_)));
        assert_eq!(plane.call_count(), 0);
        assert_eq!(coordinator.bound_token(), None);
    }

    #[tokio::test]
    async fn call_binding_failure_skips_message_binding_and_allows_retry() {
        let plane = Arc::new(FakeControlPlane::logged_in());
        plane.fail_call.store(true, Ordering::SeqCst);
        let coordinator = BindingCoordinator::new(plane.clone());

        let err = coordinator.bind("abc".into()).await.unwrap_err();
        assert!(matches!(
            err,
            BindingError::Rejected {
                step: BindingStep::Call,
                ..
            }
        ));
        assert_eq!(plane.message_count(), 0);

        plane.fail_call.store(false, Ordering::SeqCst);
        assert_eq!(coordinator.bind("abc".into()).await.unwrap(), BindingOutcome::Bound);
        assert_eq!((plane.call_count(), plane.message_count()), (2, 1));
    }

    #[tokio::test]
    async fn concurrent_bind_for_same_token_is_not_double_submitted() {
        let gate = Arc::new(Notify::new());
        let plane = Arc::new(FakeControlPlane {
            session: Mutex::new(Some("session".to_string())),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let coordinator = Arc::new(BindingCoordinator::new(plane.clone()));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.bind("abc".into()).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(coordinator.bind("abc".into()).await.unwrap(), BindingOutcome::InFlight);

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), BindingOutcome::Bound);
        assert_eq!(plane.call_count(), 1);
    }

    #[tokio::test]
    async fn older_token_still_in_flight_is_not_resubmitted() {
        let gate = Arc::new(Notify::new());
        let plane = Arc::new(FakeControlPlane {
            session: Mutex::new(Some("session".to_string())),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let coordinator = Arc::new(BindingCoordinator::new(plane.clone()));
        let spawn_bind = |token: &str| {
            let coordinator = coordinator.clone();
            let token = token.to_string();
            tokio::spawn(async move { coordinator.bind(token).await })
        };

        let abc = spawn_bind("abc");
        tokio::task::yield_now().await;
        let xyz = spawn_bind("xyz");
        tokio::task::yield_now().await;

        assert_eq!(coordinator.bind("abc".into()).await.unwrap(), BindingOutcome::InFlight);

        gate.notify_waiters();
        assert_eq!(abc.await.unwrap().unwrap(), BindingOutcome::Bound);
        assert_eq!(xyz.await.unwrap().unwrap(), BindingOutcome::Superseded);
        let abc_calls = plane.call_binds.lock().unwrap().iter().filter(|t| *t == "abc").count();
        assert_eq!(abc_calls, 1);
        assert_eq!(coordinator.bound_token().as_deref(), Some("abc"));
    }

    #[test]
    fn redact_keeps_ten_characters() {
        assert_eq!(redact("0123456789abcdef"), "0123456789...");
        assert_eq!(redact("short"), "short");
    }
}
