//! fleetcast: clustered control plane for media-processing nodes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetcast_consensus::api::{
    serve_api, ApiOptions, ChannelLister, MediaEndpoint, MemFileStore, NullFileLister,
    NullResourceSampler,
};
use fleetcast_consensus::{Cluster, ClusterOptions, Operation, Store};
use fleetcast_core::config::{Config, LogFormat};
use fleetcast_iam::user::{User, UserAuthPassword};
use fleetcast_iam::Iam;
use fleetcast_proxy::{FileIndex, NodeRegistry};
use fleetcast_srt::{serve_srt, SrtServer, SrtServerConfig, TcpDialer};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_node(args).await,
        Commands::Version => {
            println!("fleetcast {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_node(args: cli::ServeArgs) -> Result<()> {
    let config = load_config(&args.config)?;

    init_logging(&config)?;

    info!(
        node_id = config.cluster.node_id,
        raft_addr = %config.cluster.raft_address,
        bootstrap = config.cluster.bootstrap,
        "starting node"
    );

    // Cluster coordinator: raft, log store, transport, forwarder.
    let cluster = Cluster::new(ClusterOptions {
        node_id: config.cluster.node_id,
        name: config.cluster.name.clone(),
        path: config.cluster.path.clone(),
        raft_address: config.cluster.raft_address,
        bootstrap: config.cluster.bootstrap,
        join_address: config.cluster.join_address.clone(),
        username: config.cluster.username.clone(),
        password: config.cluster.password.clone(),
    })
    .await
    .context("starting cluster")?;

    let store = cluster.store();

    // IAM over the replicated tables.
    let superuser = User {
        name: config.iam.superuser_name.clone(),
        superuser: true,
        auth: fleetcast_iam::user::UserAuth {
            api: fleetcast_iam::user::UserAuthApi {
                userpass: UserAuthPassword {
                    enable: !config.iam.superuser_password.is_empty(),
                    password: config.iam.superuser_password.clone(),
                },
                ..Default::default()
            },
            ..Default::default()
        },
    };
    let iam =
        Arc::new(Iam::new(superuser, &config.iam.jwt_realm, &config.iam.jwt_secret)
            .context("creating IAM")?);

    if let Some(users_file) = &config.iam.users_file {
        iam.identities().load_users_file(users_file).context("importing users")?;
    }

    // Node registry and the cluster file index.
    let (registry, updates_rx) = NodeRegistry::new(config.cluster.node_id, store.clone());
    let index = FileIndex::new(registry.clone());

    tokio::spawn(registry.clone().run(cluster.shutdown_signal()));
    tokio::spawn(index.clone().run(updates_rx, cluster.shutdown_signal()));

    // Apply events fan out to the local subsystems through a channel so
    // the hook itself never touches the store.
    let (apply_tx, mut apply_rx) = tokio::sync::mpsc::unbounded_channel::<Operation>();
    store.on_apply(move |op| {
        let _ = apply_tx.send(op);
    });

    // Entries replayed from the log before the hook was registered are
    // covered by one initial reload.
    iam.reload_identities(store.as_ref());
    iam.reload_policies(store.as_ref());

    {
        let iam = iam.clone();
        let store: Arc<Store> = store.clone();
        let registry_notify = registry.notifier();
        tokio::spawn(async move {
            while let Some(op) = apply_rx.recv().await {
                if op.touches_identities() {
                    iam.reload_identities(store.as_ref());
                }
                if op.touches_policies() {
                    iam.reload_policies(store.as_ref());
                }
                if op.touches_nodes() {
                    registry_notify.notify_one();
                }
            }
        });
    }

    // SRT server with cross-node proxying through the file index.
    let srt = if config.srt.enable {
        let server = SrtServer::new(SrtServerConfig {
            token: config.srt.token.clone(),
            passphrase: config.srt.passphrase.clone(),
            cluster: index.clone(),
            dialer: Arc::new(TcpDialer),
        });

        let addr = listen_addr(&config.srt.address);
        let shutdown = serve_srt(&addr, server.clone()).await.context("starting srt")?;
        Some((server, shutdown))
    } else {
        None
    };

    // The cluster API at raft port + 1. The media filesystems plug in
    // behind the lister seams; a bare control-plane node serves none.
    let api_addr = Cluster::api_addr(&config.cluster.raft_address.to_string())
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let api_shutdown = serve_api(
        api_addr.parse().context("api address")?,
        ApiOptions {
            cluster: cluster.clone(),
            name: config.cluster.name.clone(),
            username: config.cluster.username.clone(),
            password: config.cluster.password.clone(),
            rtmp: MediaEndpoint {
                enable: config.rtmp.enable,
                address: config.rtmp.address.clone(),
                address_tls: config.rtmp.address_tls.clone(),
                enable_tls: config.rtmp.enable_tls,
                token: config.rtmp.token.clone(),
                passphrase: String::new(),
            },
            srt: MediaEndpoint {
                enable: config.srt.enable,
                address: config.srt.address.clone(),
                token: config.srt.token.clone(),
                passphrase: config.srt.passphrase.clone(),
                ..Default::default()
            },
            mem_fs: Arc::new(MemFileStore::new()),
            disk_fs: Arc::new(NullFileLister),
            rtmp_channels: None,
            srt_channels: srt
                .as_ref()
                .map(|(server, _)| server.clone() as Arc<dyn ChannelLister>),
            sampler: Arc::new(NullResourceSampler),
        },
    )
    .await
    .context("starting cluster API")?;

    info!(api_addr = %api_addr, "node is up");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");

    // Shutdown order: stop accepting, close media connections, then
    // stop raft and the log store.
    let _ = api_shutdown.send(());
    if let Some((_, srt_shutdown)) = srt {
        let _ = srt_shutdown.send(());
    }
    cluster.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::from_file(p)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", p.display())),
        None => {
            let default_paths =
                [PathBuf::from("fleetcast.toml"), PathBuf::from("/etc/fleetcast/fleetcast.toml")];

            for p in &default_paths {
                if p.exists() {
                    return Config::from_file(p)
                        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", p.display()));
                }
            }

            warn!("no config file found, using defaults");
            Ok(Config::default())
        }
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let fmt_layer = tracing_subscriber::fmt::layer();

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }

    Ok(())
}

/// Turns `":6000"` into a bindable `0.0.0.0:6000`; full addresses pass
/// through.
fn listen_addr(address: &str) -> String {
    if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        address.to_string()
    }
}
