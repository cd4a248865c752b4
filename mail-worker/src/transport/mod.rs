//! Persistent mail transport session.
//!
//! A single SMTP connection is kept open for the lifetime of the worker and
//! shared by every in-flight delivery. The connection is probed before each
//! send and transparently replaced when it has gone away. All operations on
//! it are serialized behind one lock because an SMTP conversation cannot be
//! interleaved.
//!
//! ```text
//! send() → lock → probe (NOOP) → [reconnect] → submit → unlock
//! ```

pub mod smtp;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::Message;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::TransportError;
use crate::processor::Dispatch;

pub use smtp::{SmtpConnector, SmtpLink};

/// An established, authenticated connection to the mail gateway.
#[async_trait]
pub trait Link: Send {
    /// Cheap liveness check; false means the link must be replaced.
    async fn probe(&mut self) -> bool;

    async fn submit(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Graceful logout.
    async fn quit(&mut self) -> Result<(), TransportError>;
}

/// Opens new [`Link`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    type Link: Link;

    async fn connect(&self) -> Result<Self::Link, TransportError>;
}

/// Connection state guarded by the session lock.
enum State<L> {
    Disconnected,
    Connected(L),
    /// Terminal: set by `close`, never left again.
    Closed,
}

/// Long-lived, lock-guarded session on top of a [`Connector`].
pub struct TransportSession<C: Connector> {
    connector: C,
    sender: Mailbox,
    state: Mutex<State<C::Link>>,
}

impl<C: Connector> TransportSession<C> {
    /// Create a disconnected session. Fails only on an unusable sender address.
    pub fn new(connector: C, sender: &str) -> Result<Self, TransportError> {
        let sender = sender
            .parse::<Mailbox>()
            .map_err(|e| TransportError::Message(format!("invalid sender address: {e}")))?;

        Ok(Self {
            connector,
            sender,
            state: Mutex::new(State::Disconnected),
        })
    }

    /// Connect eagerly at startup.
    ///
    /// A failure here is not fatal: the next `send` reconnects.
    pub async fn open(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            State::Connected(_) => return true,
            State::Closed => return false,
            State::Disconnected => {}
        }

        match self.connector.connect().await {
            Ok(link) => {
                *state = State::Connected(link);
                true
            }
            Err(e) => {
                warn!(error = %e, "smtp_initial_connect_failed");
                false
            }
        }
    }

    /// Send a plain text email. Returns true once the gateway accepted it.
    ///
    /// Always false after `close`: a closed session never reconnects.
    pub async fn send(&self, subject: &str, body: &str, recipient: &str) -> bool {
        let mut state = self.state.lock().await;

        match self.try_send(&mut state, subject, body, recipient).await {
            Ok(()) => {
                info!(to = %recipient, "smtp_message_sent");
                true
            }
            Err(e) => {
                error!(to = %recipient, error = %e, "smtp_send_failed");
                false
            }
        }
    }

    async fn try_send(
        &self,
        state: &mut State<C::Link>,
        subject: &str,
        body: &str,
        recipient: &str,
    ) -> Result<(), TransportError> {
        if matches!(state, State::Closed) {
            return Err(TransportError::Closed);
        }

        let message = self.compose(subject, body, recipient)?;

        let alive = match state {
            State::Connected(link) => link.probe().await,
            State::Disconnected | State::Closed => false,
        };

        if !alive {
            if matches!(state, State::Connected(_)) {
                warn!("smtp_connection_lost");
            }
            *state = State::Disconnected;
            info!("smtp_reconnecting");
            *state = State::Connected(self.connector.connect().await?);
        }

        match state {
            State::Connected(link) => link.submit(&message).await,
            State::Disconnected | State::Closed => {
                Err(TransportError::Connect("no connection available".to_string()))
            }
        }
    }

    fn compose(&self, subject: &str, body: &str, recipient: &str) -> Result<Message, TransportError> {
        let to = recipient
            .parse::<Mailbox>()
            .map_err(|e| TransportError::Message(format!("invalid recipient address: {e}")))?;

        Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| TransportError::Message(e.to_string()))
    }

    /// Log out and drop the connection for good. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;

        match std::mem::replace(&mut *state, State::Closed) {
            State::Connected(mut link) => {
                link.quit().await?;
                info!("smtp_session_closed");
                Ok(())
            }
            State::Disconnected | State::Closed => Ok(()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, State::Connected(_))
    }
}

#[async_trait]
impl<C: Connector> Dispatch for TransportSession<C> {
    async fn send(&self, subject: &str, body: &str, recipient: &str) -> bool {
        TransportSession::send(self, subject, body, recipient).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;

    /// Shared knobs and counters behind the fake transport.
    #[derive(Default)]
    pub(crate) struct FakeState {
        pub connects: AtomicUsize,
        pub probes: AtomicUsize,
        pub quits: AtomicUsize,
        pub dead: AtomicBool,
        pub refuse_connect: AtomicBool,
        pub refuse_submit: AtomicBool,
        pub sent: StdMutex<Vec<String>>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeConnector {
        pub state: Arc<FakeState>,
    }

    pub(crate) struct FakeLink {
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Link = FakeLink;

        async fn connect(&self) -> Result<FakeLink, TransportError> {
            if self.state.refuse_connect.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("connection refused".into()));
            }
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            self.state.dead.store(false, Ordering::SeqCst);
            Ok(FakeLink {
                state: Arc::clone(&self.state),
            })
        }
    }

    #[async_trait]
    impl Link for FakeLink {
        async fn probe(&mut self) -> bool {
            self.state.probes.fetch_add(1, Ordering::SeqCst);
            !self.state.dead.load(Ordering::SeqCst)
        }

        async fn submit(&mut self, message: &Message) -> Result<(), TransportError> {
            if self.state.refuse_submit.load(Ordering::SeqCst) {
                return Err(TransportError::Submit("451 try again later".into()));
            }
            let to = message
                .envelope()
                .to()
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(",");
            self.state.sent.lock().unwrap().push(to);
            Ok(())
        }

        async fn quit(&mut self) -> Result<(), TransportError> {
            self.state.quits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn fake_session() -> (TransportSession<FakeConnector>, Arc<FakeState>) {
        let connector = FakeConnector::default();
        let state = Arc::clone(&connector.state);
        let session = TransportSession::new(connector, "support@example.com").unwrap();
        (session, state)
    }

    #[test]
    fn test_new_rejects_bad_sender() {
        let result = TransportSession::new(FakeConnector::default(), "not an address");
        assert!(matches!(result, Err(TransportError::Message(_))));
    }

    #[tokio::test]
    async fn test_send_connects_lazily() {
        let (session, state) = fake_session();
        assert!(!session.is_connected().await);

        assert!(session.send("Hi", "Hello", "a@b.com").await);

        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(*state.sent.lock().unwrap(), vec!["a@b.com".to_string()]);
        assert!(session.is_connected().await);
    }

    #[tokio::test]
    async fn test_send_reuses_live_connection() {
        let (session, state) = fake_session();

        assert!(session.send("Hi", "Hello", "a@b.com").await);
        assert!(session.send("Hi again", "Hello", "c@d.org").await);

        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(state.probes.load(Ordering::SeqCst), 1);
        assert_eq!(state.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_send_reconnects_after_failed_probe() {
        let (session, state) = fake_session();
        assert!(session.open().await);

        state.dead.store(true, Ordering::SeqCst);
        assert!(session.send("Hi", "Hello", "a@b.com").await);

        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(state.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_returns_false_when_reconnect_fails() {
        let (session, state) = fake_session();
        state.refuse_connect.store(true, Ordering::SeqCst);

        assert!(!session.send("Hi", "Hello", "a@b.com").await);
        assert!(state.sent.lock().unwrap().is_empty());

        // Gateway comes back: the next send recovers on its own
        state.refuse_connect.store(false, Ordering::SeqCst);
        assert!(session.send("Hi", "Hello", "a@b.com").await);
    }

    #[tokio::test]
    async fn test_send_returns_false_on_submit_error() {
        let (session, state) = fake_session();
        state.refuse_submit.store(true, Ordering::SeqCst);

        assert!(!session.send("Hi", "Hello", "a@b.com").await);
    }

    #[tokio::test]
    async fn test_send_rejects_unparsable_recipient_without_connecting() {
        let (session, state) = fake_session();

        assert!(!session.send("Hi", "Hello", "a@@b").await);
        assert_eq!(state.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_not_fatal() {
        let (session, state) = fake_session();
        state.refuse_connect.store(true, Ordering::SeqCst);

        assert!(!session.open().await);
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, state) = fake_session();
        assert!(session.open().await);

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(state.quits.load(Ordering::SeqCst), 1);
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn test_send_after_close_does_not_reconnect() {
        let (session, state) = fake_session();
        assert!(session.open().await);
        session.close().await.unwrap();

        assert!(!session.send("Hi", "Hello", "a@b.com").await);
        assert!(!session.open().await);

        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(state.quits.load(Ordering::SeqCst), 1);
        assert!(state.sent.lock().unwrap().is_empty());
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn test_send_queued_behind_close_fails() {
        let (session, state) = fake_session();
        let session = Arc::new(session);
        assert!(session.open().await);

        // Hold the lock so close and then send queue up behind it, in that order
        let guard = session.state.lock().await;

        let closing = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.close().await }
        });
        tokio::task::yield_now().await;

        let sending = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("Hi", "Hello", "a@b.com").await }
        });
        tokio::task::yield_now().await;

        drop(guard);
        closing.await.unwrap().unwrap();

        assert!(!sending.await.unwrap());
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(state.quits.load(Ordering::SeqCst), 1);
        assert!(state.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let (session, state) = fake_session();

        session.close().await.unwrap();
        assert_eq!(state.quits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sends_share_one_connection() {
        let (session, state) = fake_session();
        let session = Arc::new(session);

        let sends = (0..8).map(|i| {
            let session = Arc::clone(&session);
            async move {
                let to = format!("user{i}@example.com");
                session.send("Hi", "Hello", &to).await
            }
        });
        let results = futures::future::join_all(sends).await;

        assert!(results.into_iter().all(|ok| ok));
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(state.sent.lock().unwrap().len(), 8);
    }
}
