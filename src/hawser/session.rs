use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// A bidirectional async byte stream relayed through the tunnel.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// The authenticated, encrypted transport channel the tunnel runs through.
///
/// All key exchange, encryption and authentication is delegated to the
/// implementation; the tunnel core only opens byte streams through it.
#[async_trait]
pub trait SecureSession: Send + Sync {
    /// Open a logical byte-stream channel through the session to `addr`
    /// (`host:port`, resolved on the far side).
    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream>;

    /// Bind a remote-side accept endpoint through the session.
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn SessionListener>>;

    /// Tear the session down. Idempotent; never reports already-closed.
    async fn close(&self);
}

#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// Establishes fresh secure sessions. Implementations carry the target
/// address and credentials; the supervisor carries the retry discipline.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn SecureSession>>;
}

struct Slot {
    session: Option<Arc<dyn SecureSession>>,
    // Bumped on every replacement or close, so callers that observed a dial
    // failure can tell whether someone else already reconnected.
    epoch: u64,
}

/// Exclusive owner of the secure session handle.
///
/// Every connect, reconnect and close is serialized through one mutex, so at
/// most one connect attempt is in flight at any instant even when many
/// connections hit dial failures at once. Other components only borrow the
/// session `Arc` for the duration of a single dial or listen call.
pub struct SessionSupervisor {
    connector: Arc<dyn SessionConnector>,
    state: Mutex<Slot>,
}

impl SessionSupervisor {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            state: Mutex::new(Slot {
                session: None,
                epoch: 0,
            }),
        }
    }

    /// Establish a new session, closing any previous one first. Failures are
    /// reported to the caller; retry cadence belongs to the tunnel loop.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let mut slot = self.state.lock().await;
        self.replace_locked(&mut slot).await?;
        Ok(())
    }

    /// Borrow the current session, if any, tagged with its epoch.
    #[allow(dead_code)]
    pub async fn current(&self) -> Option<(Arc<dyn SecureSession>, u64)> {
        let slot = self.state.lock().await;
        slot.session.as_ref().map(|s| (s.clone(), slot.epoch))
    }

    /// Borrow the current session, connecting first if none is live.
    pub async fn ensure(&self) -> anyhow::Result<(Arc<dyn SecureSession>, u64)> {
        let mut slot = self.state.lock().await;
        if let Some(s) = slot.session.as_ref() {
            return Ok((s.clone(), slot.epoch));
        }
        let sess = self.replace_locked(&mut slot).await?;
        Ok((sess, slot.epoch))
    }

    /// Replace the session observed at `observed` epoch. Single-flight:
    /// callers that lost the race see a bumped epoch and get the fresh
    /// session back without triggering another connect.
    pub async fn reconnect(
        &self,
        observed: u64,
    ) -> anyhow::Result<(Arc<dyn SecureSession>, u64)> {
        let mut slot = self.state.lock().await;
        if slot.epoch != observed {
            if let Some(s) = slot.session.as_ref() {
                return Ok((s.clone(), slot.epoch));
            }
        }
        tracing::debug!(epoch = slot.epoch, "session: reconnecting");
        let sess = self.replace_locked(&mut slot).await?;
        Ok((sess, slot.epoch))
    }

    /// Tear down the session and invalidate the handle. Idempotent.
    pub async fn close(&self) {
        let mut slot = self.state.lock().await;
        if let Some(old) = slot.session.take() {
            old.close().await;
            tracing::debug!("session: closed");
        }
        slot.epoch = slot.epoch.wrapping_add(1);
    }

    async fn replace_locked(&self, slot: &mut Slot) -> anyhow::Result<Arc<dyn SecureSession>> {
        if let Some(old) = slot.session.take() {
            old.close().await;
        }
        let sess = self.connector.connect().await?;
        slot.session = Some(sess.clone());
        slot.epoch = slot.epoch.wrapping_add(1);
        Ok(sess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeSession {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SecureSession for FakeSession {
        async fn dial(&self, _addr: &str) -> anyhow::Result<BoxedStream> {
            anyhow::bail!("not implemented")
        }

        async fn listen(&self, _addr: &str) -> anyhow::Result<Box<dyn SessionListener>> {
            anyhow::bail!("not implemented")
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        connects: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl FakeConnector {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let connects = Arc::new(AtomicUsize::new(0));
            let closes = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    connects: connects.clone(),
                    closes: closes.clone(),
                    delay: Duration::from_millis(0),
                },
                connects,
                closes,
            )
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(&self) -> anyhow::Result<Arc<dyn SecureSession>> {
            if self.delay > Duration::from_millis(0) {
                tokio::time::sleep(self.delay).await;
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSession {
                closes: self.closes.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn connect_replaces_and_closes_previous_session() {
        let (conn, connects, closes) = FakeConnector::new();
        let sup = SessionSupervisor::new(Arc::new(conn));

        sup.connect().await.unwrap();
        sup.connect().await.unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(sup.current().await.is_some());
    }

    #[tokio::test]
    async fn reconnect_is_single_flight_under_concurrent_failures() {
        let (mut conn, connects, _closes) = FakeConnector::new();
        // Long enough that both failing callers overlap the reconnect window.
        conn.delay = Duration::from_millis(50);
        let sup = Arc::new(SessionSupervisor::new(Arc::new(conn)));

        sup.connect().await.unwrap();
        let (_sess, epoch) = sup.current().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let sup = sup.clone();
            tasks.push(tokio::spawn(
                async move { sup.reconnect(epoch).await.unwrap().1 },
            ));
        }
        let mut epochs = Vec::new();
        for t in tasks {
            epochs.push(t.await.unwrap());
        }

        // One initial connect plus exactly one reconnect, and every caller
        // ends up on the same fresh epoch.
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert!(epochs.iter().all(|e| *e == epochs[0]));
    }

    #[tokio::test]
    async fn ensure_connects_when_session_is_missing() {
        let (conn, connects, _closes) = FakeConnector::new();
        let sup = SessionSupervisor::new(Arc::new(conn));

        assert!(sup.current().await.is_none());
        sup.ensure().await.unwrap();
        sup.ensure().await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_after_close_establishes_fresh_session() {
        let (conn, connects, _closes) = FakeConnector::new();
        let sup = SessionSupervisor::new(Arc::new(conn));

        sup.connect().await.unwrap();
        let (_sess, epoch) = sup.current().await.unwrap();
        sup.close().await;
        assert!(sup.current().await.is_none());

        // The epoch observed before close is stale, but with no live session
        // the reconnect must still go through.
        sup.reconnect(epoch).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _connects, closes) = FakeConnector::new();
        let sup = SessionSupervisor::new(Arc::new(conn));

        sup.close().await;
        sup.connect().await.unwrap();
        sup.close().await;
        sup.close().await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
