use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinSet};

use crate::hawser::{
    broker::{Broker, BrokerError, ListenerHandle},
    config::TunnelConfig,
    relay::{self, RelayOutcome},
    session::{SessionConnector, SessionSupervisor},
};

/// Lifecycle of one tunnel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Listening,
    Accepting,
    Closing,
    Closed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::Listening => "listening",
            TunnelState::Accepting => "accepting",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Injectable backoff sleep, so tests can observe retries without waiting
/// out real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, d: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// One running tunnel: a supervisory loop that owns the listener, plus one
/// short-lived relay task per accepted connection.
///
/// Every failure is handled at the narrowest scope that can resolve it: a
/// failed pairing dial drops one connection, a broken listener is rebuilt
/// without touching the session, and a dead session is reconnected without
/// rebinding a healthy local listener. Each retry scope sleeps the fixed
/// backoff first. Nothing here is ever fatal to the process.
pub struct Tunnel {
    inner: Arc<Inner>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Inner {
    cfg: TunnelConfig,
    broker: Broker,
    sessions: Arc<SessionSupervisor>,
    sleeper: Arc<dyn Sleeper>,
    started: AtomicBool,
    state: watch::Sender<TunnelState>,
    shutdown: watch::Sender<bool>,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl Tunnel {
    pub fn new(cfg: TunnelConfig, connector: Arc<dyn SessionConnector>) -> Self {
        Self::with_sleeper(cfg, connector, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        cfg: TunnelConfig,
        connector: Arc<dyn SessionConnector>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let sessions = Arc::new(SessionSupervisor::new(connector));
        let broker = Broker::new(&cfg, sessions.clone());
        let (state, _) = watch::channel(TunnelState::Idle);
        let (shutdown, _) = watch::channel(false);
        let (bound, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                cfg,
                broker,
                sessions,
                sleeper,
                started: AtomicBool::new(false),
                state,
                shutdown,
                bound,
            }),
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Spawn the supervisory loop. Idempotent-once; returns immediately.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.state.send_replace(TunnelState::Connecting);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run().await });
        *self.worker.lock().expect("worker lock") = Some(handle);
    }

    /// Request close and block until the supervisory loop and every relay
    /// task have exited. Safe to call before `start`, after completion, and
    /// repeatedly.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);

        if !self.inner.started.load(Ordering::SeqCst) {
            self.inner.state.send_replace(TunnelState::Closed);
            return;
        }

        // Unblocks session-backed accepts and dials; the loop notices the
        // flag at its next continuation point either way.
        self.inner.sessions.close().await;

        let handle = self.worker.lock().expect("worker lock").take();
        match handle {
            Some(h) => {
                let _ = h.await;
            }
            // Another closer owns the join; wait for the loop to report.
            None => self.closed_observed().await,
        }
        tracing::info!("tunnel: close complete");
    }

    /// Block until all spawned work has exited, without requesting close.
    #[allow(dead_code)]
    pub async fn wait(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        self.closed_observed().await;
    }

    #[allow(dead_code)]
    pub fn state(&self) -> TunnelState {
        *self.inner.state.borrow()
    }

    /// Bound address of the current local listener (forward orientation),
    /// once the tunnel is accepting. Callers binding port 0 read the real
    /// port from here.
    #[allow(dead_code)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.borrow()
    }

    async fn closed_observed(&self) {
        let mut rx = self.inner.state.subscribe();
        while *rx.borrow() != TunnelState::Closed {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut tasks: JoinSet<()> = JoinSet::new();

        tracing::info!(
            orientation = %self.cfg.orientation,
            local = %self.cfg.local_addr,
            remote = %self.cfg.remote_addr,
            "tunnel: started"
        );

        if self.connect_until_ready(&mut shutdown).await {
            self.listen_loop(&mut shutdown, &mut tasks).await;
        }

        self.state.send_replace(TunnelState::Closing);
        if !tasks.is_empty() {
            tracing::debug!(outstanding = tasks.len(), "tunnel: draining relay tasks");
        }
        while tasks.join_next().await.is_some() {}
        self.state.send_replace(TunnelState::Closed);
        tracing::info!("tunnel: stopped");
    }

    /// Connecting state: retry the initial session connect at the fixed
    /// backoff until it succeeds. Returns false when shutdown was requested.
    async fn connect_until_ready(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }

            let res = tokio::select! {
                _ = shutdown.changed() => return false,
                res = self.sessions.connect() => res,
            };

            match res {
                Ok(()) => return true,
                Err(err) => {
                    tracing::warn!(
                        err = %err,
                        backoff = %humantime::format_duration(self.cfg.backoff),
                        "tunnel: session connect failed, retrying"
                    );
                }
            }

            if !self.backoff(shutdown).await {
                return false;
            }
        }
    }

    /// Listening state: bind, run the accept loop, rebind on listener
    /// failure. Only exits on shutdown.
    async fn listen_loop(&self, shutdown: &mut watch::Receiver<bool>, tasks: &mut JoinSet<()>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            self.state.send_replace(TunnelState::Listening);

            let ln = tokio::select! {
                _ = shutdown.changed() => return,
                res = self.broker.bind() => match res {
                    Ok(ln) => ln,
                    Err(err) => {
                        if *shutdown.borrow() {
                            return;
                        }
                        tracing::warn!(
                            err = %err,
                            backoff = %humantime::format_duration(self.cfg.backoff),
                            "tunnel: listen failed, retrying"
                        );
                        if !self.backoff(shutdown).await {
                            return;
                        }
                        continue;
                    }
                },
            };

            self.bound.send_replace(ln.local_addr());
            match ln.local_addr() {
                Some(addr) => tracing::info!(addr = %addr, "tunnel: listening"),
                None => tracing::info!(addr = %self.cfg.remote_addr, "tunnel: listening via session"),
            }

            let rebind = self.accept_loop(&ln, shutdown, tasks).await;

            ln.close().await;
            self.bound.send_replace(None);
            if !rebind {
                return;
            }
            if !self.backoff(shutdown).await {
                return;
            }
        }
    }

    /// Accepting state: pair connections and hand each to its own relay
    /// task. Returns true when the listener broke and must be rebuilt, false
    /// on shutdown.
    async fn accept_loop(
        &self,
        ln: &ListenerHandle,
        shutdown: &mut watch::Receiver<bool>,
        tasks: &mut JoinSet<()>,
    ) -> bool {
        self.state.send_replace(TunnelState::Accepting);

        loop {
            // Reap finished relay tasks so the set doesn't grow unbounded.
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
                res = self.broker.acquire(ln) => match res {
                    Ok(pair) => {
                        let idle = self.cfg.idle_timeout;
                        let peer = pair.peer;
                        tasks.spawn(async move {
                            let outcome =
                                relay::relay(pair.accepted, pair.dialed, idle).await;
                            match &outcome {
                                RelayOutcome::Closed { to_dialed, to_accepted } => {
                                    tracing::debug!(
                                        peer = ?peer,
                                        to_dialed,
                                        to_accepted,
                                        "relay: closed"
                                    );
                                }
                                RelayOutcome::TimedOut => {
                                    tracing::debug!(peer = ?peer, "relay: idle deadline reached");
                                }
                                RelayOutcome::Failed(err) => {
                                    tracing::debug!(peer = ?peer, err = %err, "relay: ended with error");
                                }
                            }
                        });
                    }
                    Err(BrokerError::Dial(err)) => {
                        if *shutdown.borrow() {
                            return false;
                        }
                        // One connection lost; the accept loop carries on.
                        tracing::warn!(err = %err, "tunnel: pairing dial failed, connection dropped");
                    }
                    Err(err) => {
                        if *shutdown.borrow() {
                            return false;
                        }
                        tracing::warn!(
                            err = %err,
                            backoff = %humantime::format_duration(self.cfg.backoff),
                            "tunnel: accept failed, rebinding listener"
                        );
                        return true;
                    }
                },
            }
        }
    }

    /// Sleep the fixed backoff, racing the shutdown signal so close latency
    /// never depends on the backoff interval. Returns false on shutdown.
    async fn backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => !*shutdown.borrow(),
            _ = self.sleeper.sleep(self.cfg.backoff) => true,
        }
    }
}
