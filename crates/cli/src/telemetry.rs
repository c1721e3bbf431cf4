//! Log filter and Prometheus exporter settings shared by every subcommand.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Args;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Args, Debug, Clone)]
pub struct Telemetry {
    /// Log filter directives, e.g. "info,kmirror_sync=debug"
    #[arg(long = "log", global = true, env = "KMIRROR_LOG", default_value = "info")]
    pub log: String,

    /// Serve Prometheus metrics on this host:port
    #[arg(long = "metrics-addr", global = true, env = "KMIRROR_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Telemetry {
    /// Parse the log filter without installing anything.
    pub fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.log).with_context(|| format!("invalid log filter {:?}", self.log))
    }

    /// Install the stderr subscriber and, when an address is set, the exporter.
    /// Must run inside the tokio runtime.
    pub fn install(&self) -> Result<()> {
        tracing_subscriber::fmt().with_env_filter(self.filter()?).with_writer(std::io::stderr).init();
        if let Some(addr) = self.metrics_addr {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .with_context(|| format!("starting metrics exporter on {addr}"))?;
            info!(%addr, "serving metrics");
        }
        Ok(())
    }
}
