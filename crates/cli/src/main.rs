use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use idcache_api::{CachingIdentityAllocator, IdentityAllocatorOwner};
use idcache_core::config::Config;
use idcache_core::{IdentityAllocator, IdentityCache, IdentityModel, NumericIdentity};
use idcache_kvstore::KvAllocator;
use idcache_store::LocalIdentities;
use tokio::signal;
use tracing::{info, warn};

mod seed;

use seed::Seed;

#[derive(Parser, Debug)]
#[command(name = "idcachectl", version, about = "Inspect and watch an identity cache")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// JSON seed file with global/local identities
    #[arg(long = "seed", global = true, env = "IDCACHE_SEED")]
    seed: Option<PathBuf>,

    /// Run without the distributed allocator
    #[arg(long = "local-only", global = true, action = ArgAction::SetTrue)]
    local_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all known identities
    List,
    /// Print the id -> labels cache view
    Cache,
    /// Look up an identity by labels, e.g. `get k8s:app=foo`; lists everything without labels
    Get {
        labels: Vec<String>,
    },
    /// Look up an identity by numeric id (decimal or 0x-hex)
    GetId {
        id: String,
    },
    /// Watch allocator changes and print +/- lines per batch
    Watch {
        /// Delay between scripted seed changes
        #[arg(long = "interval-ms", default_value_t = 200)]
        interval_ms: u64,
    },
}

fn init_tracing(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::from_str(&cfg.log)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(cfg: &Config) {
    if let Some(addr) = &cfg.metrics_addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid IDCACHE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prints each batch as it is delivered.
struct PrintOwner {
    output: Output,
}

impl IdentityAllocatorOwner for PrintOwner {
    fn update_identities(&self, added: IdentityCache, deleted: IdentityCache) {
        let added: BTreeMap<u32, Vec<String>> = added.iter().map(|(id, l)| (id.get(), l.to_strings())).collect();
        let deleted: Vec<u32> = {
            let mut v: Vec<u32> = deleted.keys().map(|id| id.get()).collect();
            v.sort_unstable();
            v
        };
        match self.output {
            Output::Human => {
                for (id, labels) in &added {
                    println!("+ {:<8} {}", id, labels.join(","));
                }
                for id in &deleted {
                    println!("- {}", id);
                }
            }
            Output::Json => {
                let line = serde_json::json!({ "added": added, "deleted": deleted });
                println!("{}", line);
            }
        }
    }
}

fn print_models(output: Output, models: &[IdentityModel]) -> Result<()> {
    match output {
        Output::Human => {
            println!("ID         LABELS");
            for m in models {
                println!("{:<10} {}", m.id, m.labels.join(","));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(models)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cfg = Config::from_env();
    init_tracing(&cfg);
    init_metrics(&cfg);
    let cli = Cli::parse();
    if cli.local_only {
        cfg.kvstore_enabled = false;
    }

    let kv = cfg.kvstore_enabled.then(|| Arc::new(KvAllocator::from_config(&cfg)));
    let local = Arc::new(LocalIdentities::new());
    let seed = match &cli.seed {
        Some(path) => Seed::load(path)?,
        None => Seed::default(),
    };
    seed.apply(kv.as_deref(), &local)?;

    let alloc = kv.clone().map(|kv| kv as Arc<dyn IdentityAllocator>);
    let cache = CachingIdentityAllocator::new(alloc, local.clone());

    match cli.command {
        Commands::List => {
            info!("list invoked");
            print_models(cli.output, &cache.get_identities())?;
        }
        Commands::Cache => {
            info!("cache invoked");
            let view: BTreeMap<u32, Vec<String>> =
                cache.get_identity_cache().iter().map(|(id, l)| (id.get(), l.to_strings())).collect();
            match cli.output {
                Output::Human => {
                    for (id, labels) in &view {
                        println!("{:<10} {}", id, labels.join(","));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&view)?),
            }
        }
        Commands::Get { labels } => {
            info!(labels = ?labels, "get invoked");
            if labels.is_empty() {
                print_models(cli.output, &cache.get_identities())?;
            } else {
                let lbls = seed::parse_labels(&labels)?;
                match cache.lookup_identity(&lbls).await {
                    Some(identity) => print_models(cli.output, &[identity.model()])?,
                    None => bail!("identity not found for labels {}", lbls),
                }
            }
        }
        Commands::GetId { id } => {
            info!(id = %id, "get-id invoked");
            let nid: NumericIdentity = id.parse()?;
            match cache.lookup_identity_by_id(nid).await {
                Some(identity) => print_models(cli.output, &[identity.model()])?,
                None => bail!("identity {} not found", nid),
            }
        }
        Commands::Watch { interval_ms } => {
            info!(interval_ms, "watch invoked");
            let owner = Arc::new(PrintOwner { output: cli.output });
            let Some(watcher) = cache.watch(owner) else {
                bail!("watch needs the distributed allocator (drop --local-only)");
            };
            // Replay scripted changes in the background so batches show up
            let script = tokio::spawn({
                let kv = kv.clone();
                let changes = seed.changes.clone();
                async move {
                    let Some(kv) = kv else { return };
                    for c in changes {
                        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                        if let Err(e) = seed::apply_change(&kv, &c) {
                            warn!(error = %e, "scripted change failed");
                        }
                    }
                }
            });
            if signal::ctrl_c().await.is_err() {
                warn!("failed to listen for Ctrl-C");
            }
            info!("Ctrl-C received; stopping watcher");
            script.abort();
            let _ = watcher.stop().await;
        }
    }

    Ok(())
}
