mod proxee;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "proxee",
    version,
    about = "Proxee - keeps a reverse tunnel to a proxy and serves the streams it opens"
)]
struct Cli {
    /// Path to config file (.toml/.yaml/.yml). If omitted, uses PROXEE_CONFIG; then auto-detects proxee.toml > proxee.yaml > proxee.yml from CWD; then falls back to the OS default path (Linux: /etc/proxee/proxee.toml; others: user config dir). A missing file is fine.
    #[arg(long, env = "PROXEE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Hostname announced to the proxy.
    #[arg(long, env = "PROXY_HOSTNAME")]
    hostname: Option<String>,

    /// Proxy tunnel host (direct mode).
    #[arg(long, env = "PROXY_PROXEE_SERVICE_ADVERTISED_HOST")]
    proxy_host: Option<String>,

    /// Proxy tunnel port (direct mode).
    #[arg(long, env = "PROXY_PROXEE_SERVICE_ADVERTISED_PORT")]
    proxy_port: Option<u16>,

    /// Rendezvous service base URL; switches to rendezvous mode.
    #[arg(long, env = "PROXY_API_HTTP_SERVICE_BASEURL")]
    rendezvous_url: Option<String>,

    /// Address advertised to the rendezvous service.
    #[arg(long, env = "PEER_SERVICE_ADVERTISED_HOST")]
    advertised_host: Option<String>,

    #[arg(long, env = "PEER_SERVICE_ADVERTISED_PORT")]
    advertised_port: Option<u16>,

    /// Derive the peer identity from the advertised port. Debugging only.
    #[arg(long, env = "PEER_SERVICE_DEBUG", value_parser = clap::builder::BoolishValueParser::new())]
    debug_identity: bool,

    /// Admin HTTP listen address (e.g. 127.0.0.1:9090 or :9090).
    #[arg(long, env = "PROXEE_ADMIN_ADDR")]
    admin_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = proxee::config::Overrides {
        hostname: cli.hostname,
        proxy_host: cli.proxy_host,
        proxy_port: cli.proxy_port,
        rendezvous_url: cli.rendezvous_url,
        advertised_host: cli.advertised_host,
        advertised_port: cli.advertised_port,
        debug_identity: cli.debug_identity,
        admin_addr: cli.admin_addr,
    };
    proxee::run(cli.config, overrides).await
}
