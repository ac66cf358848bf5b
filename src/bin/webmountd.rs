use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use webmount::auth::AuthenticatorsBuilder;
use webmount::config::Config;
use webmount::mount::FuserMountpointFactory;
use webmount::ServerProtocol;

/// Bridges WebSocket JSON-RPC filesystem providers into local FUSE mounts.
#[derive(Parser, Debug)]
#[command(name = "webmountd", version, about)]
struct Args {
    /// TOML config file; unset fields keep their built-in default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the config file's (or default) bind address.
    #[arg(long)]
    bind_addr: Option<SocketAddr>,

    /// Overrides the config file's (or default) mount root directory.
    #[arg(long)]
    mount_root: Option<PathBuf>,

    /// Grants any connection that authenticates with no credentials at
    /// all -- convenient for local testing, unsafe on a shared host.
    #[arg(long)]
    allow_anonymous: bool,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            log::error!("{e}; falling back to defaults");
            Config::default()
        }),
        None => Config::default(),
    };
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(mount_root) = args.mount_root {
        config.mount_root = mount_root;
    }

    let mut authenticators = AuthenticatorsBuilder::new();
    if args.allow_anonymous {
        authenticators = authenticators.allow_any("");
    }
    let authenticators = authenticators.build();

    let mountpoint_factory = Arc::new(FuserMountpointFactory::new(config.mount_root.clone()));
    let protocol = Arc::new(ServerProtocol::with_worker_channel_count(
        authenticators,
        mountpoint_factory,
        config.default_rpc_timeout,
        config.worker_channel_count,
    ));

    let bind_addr = config.bind_addr;
    let serving = protocol.clone();
    let serve = tokio::spawn(async move { serving.serve(bind_addr).await });

    tokio::select! {
        result = serve => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(join_err) => Err(std::io::Error::other(join_err)),
        },
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c, shutting down ({} session(s) live)", protocol.session_count());
            Ok(())
        }
    }
}
