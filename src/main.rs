mod hawser;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "hawser",
    version,
    about = "Hawser - keeps an SSH tunnel moored to a remote endpoint"
)]
struct Cli {
    /// Path to hawser config file (.toml/.yaml/.yml). If omitted, uses HAWSER_CONFIG; then auto-detects hawser.toml > hawser.yaml > hawser.yml from CWD; then the OS default path if one exists.
    #[arg(long, env = "HAWSER_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// SSH server host (address).
    #[arg(long, env = "HAWSER_SSH_HOST")]
    host: Option<String>,

    /// SSH server port.
    #[arg(long, env = "HAWSER_SSH_PORT")]
    port: Option<u16>,

    /// SSH user.
    #[arg(long, env = "HAWSER_SSH_USER")]
    user: Option<String>,

    /// SSH password.
    #[arg(long, env = "HAWSER_SSH_PASSWORD")]
    password: Option<String>,

    /// Local side of the tunnel: a port, or host:port (defaults to localhost).
    #[arg(long, env = "HAWSER_LOCAL")]
    local: Option<String>,

    /// Remote side of the tunnel: a port, or host:port (defaults to localhost, resolved on the SSH server).
    #[arg(long, env = "HAWSER_REMOTE")]
    remote: Option<String>,

    /// Run a reverse tunnel (listener on the remote side, dial locally). Overrides the config file orientation when set.
    #[arg(long)]
    reverse: bool,

    /// Close the tunnel and exit after this long (e.g. "2m", "90s"). Runs until Ctrl-C when unset.
    #[arg(long, value_parser = humantime::parse_duration)]
    run_for: Option<std::time::Duration>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    hawser::run(hawser::app::Options {
        config_path: cli.config,
        overrides: hawser::config::Overrides {
            host: cli.host,
            port: cli.port,
            user: cli.user,
            password: cli.password,
            local: cli.local,
            remote: cli.remote,
            reverse: cli.reverse,
        },
        run_for: cli.run_for,
    })
    .await
}
