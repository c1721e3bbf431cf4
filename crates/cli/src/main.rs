use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kmirror_core::{Kind, KindDescriptor, MirrorError, Namespace, ResourceRecord};
use kmirror_kubehub::{DiscoveredResource, DynamicKind, KubeClient};
use kmirror_sync::{ClusterMirror, MirrorConfig, Snapshot};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod telemetry;

use telemetry::Telemetry;

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "Mirror Kubernetes resource collections locally")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(flatten)]
    telemetry: Telemetry,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Mirror one or more kinds until the first consistent snapshot, print it and exit
    Ls {
        /// GVK keys, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        #[arg(required = true)]
        gvks: Vec<String>,
        /// Give up waiting for the first snapshot after this many seconds
        #[arg(long = "wait-secs", env = "KMIRROR_WAIT_SECS", default_value_t = 8)]
        wait_secs: u64,
    },
    /// Mirror one or more kinds and print a line per snapshot until Ctrl-C
    Mirror {
        /// GVK keys, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        #[arg(required = true)]
        gvks: Vec<String>,
        /// Also print every object in each snapshot
        #[arg(long = "objects")]
        objects: bool,
    },
}

#[derive(Serialize)]
struct Summary {
    epoch: u64,
    kinds: Vec<KindCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    objects: Option<Vec<Row>>,
}

#[derive(Serialize)]
struct KindCount {
    kind: String,
    objects: usize,
}

#[derive(Serialize)]
struct Row {
    kind: String,
    namespace: Option<String>,
    name: String,
    uid: String,
    resource_version: String,
}

impl Row {
    fn from_record(r: &ResourceRecord) -> Self {
        Self {
            kind: r.kind.to_string(),
            namespace: r.namespace().map(str::to_string),
            name: r.name().unwrap_or("").to_string(),
            uid: r.uid.to_string(),
            resource_version: r.resource_version.to_string(),
        }
    }
}

fn summarize(snap: &Snapshot) -> Summary {
    let kinds = snap.kinds().into_iter().map(|k| KindCount { objects: snap.len(&k), kind: k.to_string() }).collect();
    Summary { epoch: snap.epoch(), kinds, objects: None }
}

fn rows(snap: &Snapshot) -> Vec<Row> {
    snap.kinds().iter().flat_map(|k| snap.list(k)).map(|r| Row::from_record(&r)).collect()
}

fn print_rows(output: Output, rows: &[Row]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<32} {:<16} {:<40} {}", "KIND", "NAMESPACE", "NAME", "RV");
            for row in rows {
                let ns = row.namespace.as_deref().unwrap_or("-");
                println!("{:<32} {:<16} {:<40} {}", row.kind, ns, row.name, row.resource_version);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(rows)?),
    }
    Ok(())
}

fn print_discovered(output: Output, resources: &[DiscoveredResource]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<48} {:<24} {}", "GVK", "PLURAL", "SCOPE");
            for r in resources {
                let scope = if r.namespaced { "Namespaced" } else { "Cluster" };
                println!("{:<48} {:<24} {}", r.gvk_key(), r.plural, scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(resources)?),
    }
    Ok(())
}

fn print_snapshot(output: Output, objects: bool, snap: &Snapshot) {
    let mut summary = summarize(snap);
    match output {
        Output::Human => {
            let counts: Vec<_> = summary.kinds.iter().map(|k| format!("{}={}", k.kind, k.objects)).collect();
            println!("epoch {} • {}", summary.epoch, counts.join(" "));
            if objects {
                for row in rows(snap) {
                    let key = match &row.namespace {
                        Some(ns) => format!("{}/{}", ns, row.name),
                        None => row.name.clone(),
                    };
                    println!("  {} {} rv={}", row.kind, key, row.resource_version);
                }
            }
        }
        Output::Json => {
            if objects {
                summary.objects = Some(rows(snap));
            }
            match serde_json::to_string(&summary) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to encode snapshot summary"),
            }
        }
    }
}

async fn build_mirror(
    client: &KubeClient,
    gvks: &[String],
    namespace: Namespace,
    callback: impl FnMut(Snapshot) + Send + 'static,
) -> Result<(ClusterMirror, Vec<Kind>)> {
    let mut mirror = ClusterMirror::with_config(Arc::new(client.clone()), MirrorConfig::from_env(), callback);
    let mut kinds = Vec::new();
    for gvk in gvks {
        let kind = DynamicKind::discover(client.client(), gvk).await?;
        // Cluster-scoped kinds are always mirrored across the whole cluster.
        let ns = if kind.namespaced() { namespace.clone() } else { Namespace::All };
        kinds.push(kind.kind());
        mirror.register_watch(ns, Arc::new(kind))?;
    }
    Ok((mirror, kinds))
}

fn exit_status(res: Result<std::convert::Infallible, MirrorError>) -> Result<()> {
    match res {
        Err(MirrorError::Canceled) => Ok(()),
        Err(e) => Err(anyhow!(e)),
        Ok(never) => match never {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.telemetry.install()?;
    let namespace = Namespace::from(cli.namespace.as_deref());

    match cli.command {
        Commands::Discover => {
            let client = KubeClient::try_default().await?;
            let resources = kmirror_kubehub::discover(client.client()).await.context("discover failed")?;
            info!(count = resources.len(), "discovered");
            print_discovered(cli.output, &resources)?;
        }
        Commands::Ls { gvks, wait_secs } => {
            info!(gvks = ?gvks, ns = %namespace, "ls invoked");
            let client = KubeClient::try_default().await?;
            let (mut mirror, _) = build_mirror(&client, &gvks, namespace, |_| {}).await?;
            let handle = mirror.handle();
            let shutdown = CancellationToken::new();
            let waiter = async {
                let snap = tokio::time::timeout(Duration::from_secs(wait_secs), handle.wait_for_epoch(1)).await;
                shutdown.cancel();
                snap
            };
            let (res, snap) = tokio::join!(mirror.run(shutdown.clone()), waiter);
            exit_status(res)?;
            match snap {
                Ok(snap) => print_rows(cli.output, &rows(&snap))?,
                Err(_) => {
                    warn!(wait_secs, "no consistent snapshot before deadline");
                    return Err(anyhow!("timed out after {}s waiting for the first snapshot", wait_secs));
                }
            }
        }
        Commands::Mirror { gvks, objects } => {
            info!(gvks = ?gvks, ns = %namespace, "mirror invoked");
            let client = KubeClient::try_default().await?;
            let output = cli.output;
            let (mut mirror, kinds) =
                build_mirror(&client, &gvks, namespace, move |snap| print_snapshot(output, objects, &snap)).await?;
            info!(kinds = ?kinds, "mirroring");
            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("Ctrl-C received; shutting down mirror");
                    }
                    shutdown.cancel();
                }
            });
            exit_status(mirror.run(shutdown).await)?;
            warn!("mirror ended (graceful shutdown)");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_flags_are_global() {
        let cli = Cli::try_parse_from([
            "kmirrorctl",
            "ls",
            "v1/Pod",
            "--log",
            "debug,kube=warn",
            "--metrics-addr",
            "127.0.0.1:9898",
        ])
        .unwrap();
        assert_eq!(cli.telemetry.log, "debug,kube=warn");
        assert_eq!(cli.telemetry.metrics_addr, Some("127.0.0.1:9898".parse().unwrap()));
        assert!(cli.telemetry.filter().is_ok());
        assert!(matches!(cli.command, Commands::Ls { ref gvks, .. } if gvks.len() == 1));
    }

    #[test]
    fn malformed_metrics_address_is_rejected() {
        let err = Cli::try_parse_from(["kmirrorctl", "--metrics-addr", "not-an-address", "discover"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn malformed_log_filter_is_reported() {
        let cli = Cli::try_parse_from(["kmirrorctl", "--log", "kmirror_sync=notalevel", "discover"]).unwrap();
        assert!(cli.telemetry.filter().is_err());
    }
}
