//! Resilient SSH tunnel keeper.
//!
//! A hawser holds one authenticated SSH session open and relays TCP
//! connections through it, forward (local listener, remote dial) or reverse
//! (remote listener, local dial), reconnecting for as long as the process
//! lives.

pub mod app;
pub mod broker;
pub mod config;
pub mod logging;
pub mod net;
pub mod relay;
pub mod session;
pub mod ssh;
pub mod tunnel;

pub async fn run(opts: app::Options) -> anyhow::Result<()> {
    app::run(opts).await
}
