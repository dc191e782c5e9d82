use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use lease_lock::settings::{AppConfig, LogFormat, LockConfig};
use lease_lock::{KubeLeaseStore, LeaseLock, LeaseStore, LockEvent};

#[derive(Parser, Debug)]
#[command(version, about)]
/// Take or hold a Kubernetes Lease-based lock
struct Args {
    /// path to a TOML config file with a [lock] table
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// log output format (overrides the config file)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// lease name (overrides the config file)
    #[arg(long, env = "LEASE_LOCK_NAME")]
    lease: Option<String>,

    /// lease namespace (overrides the config file)
    #[arg(long, env = "LEASE_LOCK_NAMESPACE")]
    namespace: Option<String>,

    /// holder identity (defaults to <hostname>-<pid>)
    #[arg(long, env = "LEASE_LOCK_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Make one acquisition attempt and report the outcome
    Acquire {
        /// keep retrying until the lock is taken
        #[arg(long)]
        wait: bool,
    },
    /// Acquire the lock and keep renewing it until Ctrl-C
    Hold,
    /// Print the current lease record as JSON
    Show,
}

fn resolve_config(args: &Args) -> anyhow::Result<(LockConfig, LogFormat)> {
    let (mut lock, file_format) = match &args.config {
        Some(path) => {
            let cfg = AppConfig::load(path)?;
            (cfg.lock, cfg.log_format)
        }
        None => {
            let lease = args
                .lease
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--lease is required without --config"))?;
            let namespace = args
                .namespace
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--namespace is required without --config"))?;
            (LockConfig::new(lease, namespace), LogFormat::default())
        }
    };
    if let Some(lease) = &args.lease {
        lock.lease_name = lease.clone();
    }
    if let Some(namespace) = &args.namespace {
        lock.namespace = namespace.clone();
    }
    if let Some(identity) = &args.identity {
        lock.holder_identity = identity.clone();
    }
    lock.validate()?;
    Ok((lock, args.log_format.unwrap_or(file_format)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (config, log_format) = resolve_config(&args)?;
    lease_lock::trace::init(log_format)?;

    let store = KubeLeaseStore::try_default().await?;
    let lock = LeaseLock::new(config, store)?;
    let lease = lock.config().lease_name.clone();

    match args.command {
        Command::Acquire { wait } => {
            let acquired = lock.get_lock(wait).await?;
            println!("{}", if acquired { "acquired" } else { "busy" });
            if !acquired {
                std::process::exit(1);
            }
        }
        Command::Show => {
            let cfg = lock.config();
            match lock.store().get_lease(&cfg.namespace, &cfg.lease_name).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("lease {}/{} not found", cfg.namespace, cfg.lease_name),
            }
        }
        Command::Hold => {
            let mut events = lock.subscribe();
            let status = lock.start_locking().await?;
            if !status.is_locking {
                anyhow::bail!("could not acquire lease {lease}");
            }
            info!(lease = %lease, holder = %lock.config().holder_identity, "holding lease");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!(lease = %lease, "interrupted, stopping renewal");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(LockEvent::Lost) => {
                            warn!(lease = %lease, "lease lost");
                            break;
                        }
                        Ok(LockEvent::RenewalFailed { .. }) if !lock.keep_locking() => break,
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            lock.stop_locking();
            lock.stopped().await;
        }
    }

    Ok(())
}
