use std::sync::Mutex;
use std::sync::PoisonError;

use derive_more::Display;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// Lifecycle of the plugin's session with the kubelet.
///
/// `Unregistered -> Registering -> Active -> Draining -> Stopped`, where
/// `Registering` may also go straight to `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Unregistered,
    Registering,
    Active,
    Draining,
    Stopped,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Registering, Active)
                | (Registering, Draining)
                | (Active, Draining)
                | (Draining, Stopped)
        )
    }
}

/// Why the session left the serving states.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum DrainReason {
    #[display("received {_0}")]
    Signal(String),
    #[display("registration failed: {_0}")]
    RegistrationFailed(String),
    #[display("node agent disappeared: {_0}")]
    PeerGone(String),
    #[display("plugin stopped")]
    Stopped,
}

impl DrainReason {
    /// Whether the process should exit successfully after this drain.
    pub fn is_graceful(&self) -> bool {
        matches!(self, DrainReason::Signal(_) | DrainReason::Stopped)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Shared session state.
///
/// The first drain wins: its reason is kept and the drain token is
/// cancelled, which ends every open device list stream.
#[derive(Debug)]
pub struct Session {
    state: watch::Sender<SessionState>,
    reason: Mutex<Option<DrainReason>>,
    drained: CancellationToken,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Unregistered);
        Self {
            state,
            reason: Mutex::new(None),
            drained: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, next: SessionState) -> Result<(), InvalidTransition> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                info!("session {} -> {}", state, next);
                *state = next;
                true
            } else {
                result = Err(InvalidTransition {
                    from: *state,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// The endpoint is bound and serving.
    pub fn bound(&self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Registering)
    }

    /// The kubelet accepted the registration.
    pub fn activate(&self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Active)
    }

    /// Starts draining. Returns `false` when the session is already draining
    /// or cannot drain from its current state.
    pub fn drain(&self, reason: DrainReason) -> bool {
        match self.transition(SessionState::Draining) {
            Ok(()) => {
                info!("session draining: {reason}");
                *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
                self.drained.cancel();
                true
            }
            Err(e) => {
                debug!("ignoring drain ({reason}): {e}");
                false
            }
        }
    }

    /// The server is stopped and the endpoint removed.
    pub fn stopped(&self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Stopped)
    }

    pub fn drain_reason(&self) -> Option<DrainReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Token cancelled once the session starts draining.
    pub fn drain_token(&self) -> CancellationToken {
        self.drained.clone()
    }

    pub async fn drained(&self) {
        self.drained.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn happy_path() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Unregistered);

        session.bound().expect("should register");
        session.activate().expect("should activate");
        assert!(session.drain(DrainReason::Signal("SIGTERM".to_string())));
        session.stopped().expect("should stop");

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(
            session.drain_reason(),
            Some(DrainReason::Signal("SIGTERM".to_string()))
        );
    }

    #[test]
    fn rejects_invalid_transitions() {
        let session = Session::new();

        assert_eq!(
            session.activate(),
            Err(InvalidTransition {
                from: SessionState::Unregistered,
                to: SessionState::Active,
            })
        );
        assert!(!session.drain(DrainReason::Stopped));
        assert!(session.stopped().is_err());
        assert_eq!(session.state(), SessionState::Unregistered);
        assert!(!session.drain_token().is_cancelled());
    }

    #[test]
    fn first_drain_reason_wins() {
        let session = Session::new();
        session.bound().expect("should register");

        assert!(session.drain(DrainReason::RegistrationFailed("denied".to_string())));
        assert!(!session.drain(DrainReason::Signal("SIGINT".to_string())));

        assert!(session.drain_token().is_cancelled());
        assert_eq!(
            session.drain_reason(),
            Some(DrainReason::RegistrationFailed("denied".to_string()))
        );
        assert!(!session.drain_reason().is_some_and(|r| r.is_graceful()));
    }
}
