use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};

use crate::hawser::{
    config::{Orientation, TunnelConfig},
    net,
    session::{BoxedStream, SessionListener, SessionSupervisor},
};

/// Broker failures, split by the scope that has to recover from them.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Binding a listener failed; retried from the listen loop.
    #[error("bind failed: {0}")]
    Bind(#[source] anyhow::Error),
    /// The listener itself broke; the accept loop must rebuild it.
    #[error("accept failed: {0}")]
    Accept(#[source] anyhow::Error),
    /// Pairing the accepted connection with its peer failed; only this one
    /// connection is lost.
    #[error("dial failed: {0}")]
    Dial(#[source] anyhow::Error),
}

/// The currently bound accept endpoint. At most one live per tunnel, owned by
/// the supervisory loop and replaced on every accept-loop restart.
pub enum ListenerHandle {
    Local(TcpListener),
    Session(Box<dyn SessionListener>),
}

impl ListenerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenerHandle::Local(ln) => ln.local_addr().ok(),
            ListenerHandle::Session(_) => None,
        }
    }

    pub async fn close(&self) {
        match self {
            // A local listener closes on drop.
            ListenerHandle::Local(_) => {}
            ListenerHandle::Session(ln) => {
                if let Err(err) = ln.close().await {
                    tracing::debug!(err = %err, "broker: listener close failed");
                }
            }
        }
    }
}

/// One accepted connection paired with its dialed peer, ready for a relay
/// task. Neither stream outlives that task.
pub struct ConnPair {
    pub accepted: BoxedStream,
    pub dialed: BoxedStream,
    pub peer: Option<SocketAddr>,
}

impl std::fmt::Debug for ConnPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPair")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Performs the "accept one side, obtain the other side" step for the
/// configured orientation. Session access goes through the supervisor; a
/// failed session dial or listen gets exactly one reconnect-and-retry.
pub struct Broker {
    orientation: Orientation,
    local_addr: String,
    remote_addr: String,
    dial_timeout: Duration,
    sessions: Arc<SessionSupervisor>,
}

impl Broker {
    pub fn new(cfg: &TunnelConfig, sessions: Arc<SessionSupervisor>) -> Self {
        Self {
            orientation: cfg.orientation,
            local_addr: cfg.local_addr.clone(),
            remote_addr: cfg.remote_addr.clone(),
            dial_timeout: cfg.dial_timeout,
            sessions,
        }
    }

    /// Bind the accept side for this orientation.
    pub async fn bind(&self) -> Result<ListenerHandle, BrokerError> {
        match self.orientation {
            Orientation::Forward => {
                let bind = net::normalize_bind_addr(&self.local_addr);
                let ln = TcpListener::bind(bind.as_ref())
                    .await
                    .with_context(|| format!("bind tcp {}", self.local_addr))
                    .map_err(BrokerError::Bind)?;
                Ok(ListenerHandle::Local(ln))
            }
            Orientation::Reverse => {
                let ln = self.session_listen().await.map_err(BrokerError::Bind)?;
                Ok(ListenerHandle::Session(ln))
            }
        }
    }

    /// Accept one connection and dial its peer.
    ///
    /// On a dial failure the accepted connection is dropped (closed) before
    /// the error returns, so nothing leaks while the accept loop carries on.
    pub async fn acquire(&self, ln: &ListenerHandle) -> Result<ConnPair, BrokerError> {
        let (accepted, peer) = match ln {
            ListenerHandle::Local(l) => {
                let (conn, peer) = l
                    .accept()
                    .await
                    .context("accept tcp")
                    .map_err(BrokerError::Accept)?;
                (Box::new(conn) as BoxedStream, Some(peer))
            }
            ListenerHandle::Session(l) => {
                let conn = l.accept().await.map_err(BrokerError::Accept)?;
                (conn, None)
            }
        };

        let dialed = match self.orientation {
            Orientation::Forward => self.session_dial().await.map_err(BrokerError::Dial)?,
            // Local dial failures are not retried against the session: the
            // listener, not this dial, depends on it.
            Orientation::Reverse => self.local_dial().await.map_err(BrokerError::Dial)?,
        };

        Ok(ConnPair {
            accepted,
            dialed,
            peer,
        })
    }

    async fn session_dial(&self) -> anyhow::Result<BoxedStream> {
        let (sess, epoch) = self.sessions.ensure().await?;
        match sess.dial(&self.remote_addr).await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                tracing::debug!(
                    addr = %self.remote_addr,
                    err = %err,
                    "broker: session dial failed, reconnecting"
                );
                let (sess, _epoch) = self.sessions.reconnect(epoch).await?;
                sess.dial(&self.remote_addr).await
            }
        }
    }

    async fn session_listen(&self) -> anyhow::Result<Box<dyn SessionListener>> {
        let (sess, epoch) = self.sessions.ensure().await?;
        match sess.listen(&self.remote_addr).await {
            Ok(ln) => Ok(ln),
            Err(err) => {
                tracing::debug!(
                    addr = %self.remote_addr,
                    err = %err,
                    "broker: session listen failed, reconnecting"
                );
                let (sess, _epoch) = self.sessions.reconnect(epoch).await?;
                sess.listen(&self.remote_addr).await
            }
        }
    }

    async fn local_dial(&self) -> anyhow::Result<BoxedStream> {
        let conn = if self.dial_timeout > Duration::from_millis(0) {
            time::timeout(self.dial_timeout, TcpStream::connect(self.local_addr.as_str()))
                .await
                .with_context(|| format!("dial timeout {}", self.local_addr))??
        } else {
            TcpStream::connect(self.local_addr.as_str()).await?
        };
        Ok(Box::new(conn))
    }
}
