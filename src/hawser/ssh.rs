use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use russh::client;
use tokio::sync::{Mutex, mpsc};

use crate::hawser::{
    config::SshConfig,
    net,
    session::{BoxedStream, SecureSession, SessionConnector, SessionListener},
};

/// Connects to the SSH endpoint with password authentication.
///
/// All key exchange, encryption and auth negotiation is delegated to russh;
/// hawser only opens byte-stream channels through the resulting session.
pub struct SshConnector {
    cfg: SshConfig,
    dial_timeout: Duration,
}

impl SshConnector {
    pub fn new(cfg: SshConfig, dial_timeout: Duration) -> Self {
        Self { cfg, dial_timeout }
    }

    async fn connect_inner(&self) -> anyhow::Result<Arc<dyn SecureSession>> {
        let config = Arc::new(client::Config::default());
        let (tx, rx) = mpsc::unbounded_channel();

        let mut handle = client::connect(
            config,
            (self.cfg.host.as_str(), self.cfg.port),
            ClientHandler { forwarded: tx },
        )
        .await
        .with_context(|| format!("ssh: connect {}", self.cfg.address()))?;

        let auth = handle
            .authenticate_password(self.cfg.user.clone(), self.cfg.password.clone())
            .await
            .context("ssh: password authentication")?;
        if !auth.success() {
            anyhow::bail!("ssh: authentication rejected for user {:?}", self.cfg.user);
        }

        tracing::info!(addr = %self.cfg.address(), user = %self.cfg.user, "ssh: session established");

        Ok(Arc::new(SshSession {
            inner: Arc::new(SshInner {
                handle: Mutex::new(handle),
                forwarded: Mutex::new(rx),
            }),
        }))
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn SecureSession>> {
        if self.dial_timeout > Duration::from_millis(0) {
            tokio::time::timeout(self.dial_timeout, self.connect_inner())
                .await
                .with_context(|| format!("ssh: connect timeout {}", self.cfg.address()))?
        } else {
            self.connect_inner().await
        }
    }
}

struct ClientHandler {
    forwarded: mpsc::UnboundedSender<russh::Channel<client::Msg>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Host keys are accepted unverified; a stricter checker slots in here
    // without touching the tunnel core.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        // A dropped receiver means the session wrapper is gone; the channel
        // closes with it.
        let _ = self.forwarded.send(channel);
        Ok(())
    }
}

struct SshInner {
    handle: Mutex<client::Handle<ClientHandler>>,
    forwarded: Mutex<mpsc::UnboundedReceiver<russh::Channel<client::Msg>>>,
}

struct SshSession {
    inner: Arc<SshInner>,
}

#[async_trait]
impl SecureSession for SshSession {
    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let (host, port) = net::split_host_port(addr)?;
        let handle = self.inner.handle.lock().await;
        let channel = handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .with_context(|| format!("ssh: direct-tcpip to {addr}"))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn SessionListener>> {
        let (host, port) = net::split_host_port(addr)?;
        let bound = {
            let mut handle = self.inner.handle.lock().await;
            handle
                .tcpip_forward(host.clone(), u32::from(port))
                .await
                .with_context(|| format!("ssh: tcpip-forward on {addr}"))?
        };
        tracing::debug!(addr = %addr, bound, "ssh: remote forward bound");

        Ok(Box::new(SshListener {
            inner: self.inner.clone(),
            host,
            port: bound,
        }))
    }

    async fn close(&self) {
        let handle = self.inner.handle.lock().await;
        if let Err(err) = handle
            .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
            .await
        {
            tracing::debug!(err = %err, "ssh: disconnect failed");
        }
    }
}

struct SshListener {
    inner: Arc<SshInner>,
    host: String,
    port: u32,
}

#[async_trait]
impl SessionListener for SshListener {
    async fn accept(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.inner.forwarded.lock().await;
        let channel = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("ssh: session closed"))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        let mut handle = self.inner.handle.lock().await;
        handle
            .cancel_tcpip_forward(self.host.clone(), self.port)
            .await
            .context("ssh: cancel tcpip-forward")?;
        Ok(())
    }
}
