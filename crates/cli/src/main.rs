use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kmirror_core::{ChangeSource, Delta, InformerConfig, LabelSelector};
use kmirror_informer::{HandlerFns, InformerFactory, SharedInformer};
use kmirror_store::Lister;
use kube::core::DynamicObject;
use kube::Client;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "List and watch cluster objects through a synced cache")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Sync the cache for a GVK once and print its contents
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Label selector, e.g. "app=web,tier!=db"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Keep the cache for a GVK synced and print +/~/- events
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KMIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMIRROR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KMIRROR_METRICS_ADDR; expected host:port");
        }
    }
}

fn wait_secs() -> u64 { std::env::var("KMIRROR_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8) }

fn parse_selector(selector: Option<&str>) -> Result<LabelSelector> {
    match selector {
        Some(s) => Ok(LabelSelector::parse(s)?),
        None => Ok(LabelSelector::everything()),
    }
}

type Cached = (Arc<SharedInformer<DynamicObject>>, Lister<DynamicObject>);

/// Register the dynamic informer for `gvk` on `factory`.
async fn cache_for(factory: &InformerFactory, gvk: &str, ns: Option<&str>, selector: Option<&str>) -> Result<Cached> {
    let client = Client::try_default().await.context("building kube client")?;
    let mut source = kmirror_kubehub::dynamic_source(client, gvk, ns).await?;
    if let Some(sel) = selector {
        source = source.labels(sel);
    }
    let source: Arc<dyn ChangeSource<DynamicObject>> = Arc::new(source);
    Ok(factory.for_resource(gvk, move || source)?)
}

fn key_line(d: &Delta<DynamicObject>) -> String { format!("{} rv={}", d.key, d.revision) }

fn print_delta(sign: char, output: Output, d: &Delta<DynamicObject>) {
    match output {
        Output::Human => println!("{} {}", sign, key_line(d)),
        Output::Json => {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "type": d.kind.as_str(),
                "key": d.key.as_str(),
                "revision": d.revision.as_str(),
                "tombstone": d.tombstone,
            });
            println!("{}", line);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let client = Client::try_default().await.context("building kube client")?;
            let resources = kmirror_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk, selector } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, selector = ?selector, "ls invoked");
            let filter = parse_selector(selector.as_deref())?;
            let factory = InformerFactory::new(InformerConfig::from_env());
            let (_informer, lister) = cache_for(&factory, &gvk, ns, selector.as_deref()).await?;
            factory.start_all()?;

            let wait = Duration::from_secs(wait_secs());
            match tokio::time::timeout(wait, factory.wait_for_cache_sync()).await {
                Ok(res) => res?,
                Err(_) => warn!(secs = wait.as_secs(), "ls: cache not synced in time; printing partial contents"),
            }
            let items = match ns {
                Some(ns) => lister.namespaced(ns).list_selected(&filter),
                None => lister.list_selected(&filter),
            };

            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   NAME                 AGE");
                    for item in &items {
                        let ns_col = item.namespace().unwrap_or("-");
                        println!("{:<11} {:<20} {}", ns_col, item.name(), render_age(item.meta.creation_ts));
                    }
                }
                Output::Json => {
                    let objs: Vec<_> = items.iter().map(|o| &o.payload).collect();
                    println!("{}", serde_json::to_string_pretty(&objs)?);
                }
            }
            factory.shutdown().await?;
        }
        Commands::Watch { gvk, selector } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, selector = ?selector, "watch invoked");
            let factory = InformerFactory::new(InformerConfig::from_env());
            let (informer, _lister) = cache_for(&factory, &gvk, ns, selector.as_deref()).await?;
            let output = cli.output;
            informer.add_handler(
                HandlerFns::<DynamicObject>::new()
                    .on_add(move |d| {
                        print_delta('+', output, d);
                        Ok(())
                    })
                    .on_update(move |d| {
                        // periodic resync re-delivers unchanged objects
                        if !d.resync {
                            print_delta('~', output, d);
                        }
                        Ok(())
                    })
                    .on_delete(move |d| {
                        print_delta('-', output, d);
                        Ok(())
                    })
                    .on_synced(|| {
                        info!("watch: cache synced");
                        Ok(())
                    }),
            );
            factory.start_all()?;

            let mut state = informer.subscribe_state();
            tokio::select! {
                _ = signal::ctrl_c() => info!("Ctrl-C received; shutting down watch loop"),
                ended = async { state.wait_for(|s| s.is_terminal()).await.is_ok() } => {
                    if ended {
                        warn!(state = ?informer.state(), "watch: informer stopped");
                    }
                }
            }
            factory.shutdown().await?;
            info!("watch loop ended (graceful shutdown)");
        }
    }

    Ok(())
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let mut secs = (chrono::Utc::now().timestamp() - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
