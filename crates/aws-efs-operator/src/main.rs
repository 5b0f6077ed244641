//! AWS EFS Operator
//!
//! Watches SharedVolume custom resources and provisions EFS-backed
//! PersistentVolumes and claims for them.

use anyhow::{Context, Result};
use aws_efs_operator::controller::run_controller;
use aws_efs_operator::crd::SharedVolume;
use aws_efs_operator::volume::{VolumeConfig, DEFAULT_CSI_DRIVER, DEFAULT_STORAGE_CLASS};
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// AWS EFS Operator
#[derive(Parser, Debug)]
#[command(name = "aws-efs-operator")]
#[command(about = "Kubernetes operator exposing EFS access points through SharedVolume resources")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// CSI driver written into generated volumes
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = DEFAULT_CSI_DRIVER)]
    csi_driver: String,

    /// Storage class of generated volumes and claims
    #[arg(long, env = "STORAGE_CLASS_NAME", default_value = DEFAULT_STORAGE_CLASS)]
    storage_class: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn volume_config(&self) -> Result<VolumeConfig> {
        VolumeConfig::new(&self.csi_driver, &self.storage_class)
            .context("Invalid volume configuration")
    }

    fn watch_namespace(&self) -> Option<String> {
        // Empty string means cluster-wide
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace.clone())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.volume_config()?;
    let namespace = args.watch_namespace();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = namespace.as_deref().unwrap_or("all"),
        csi_driver = %config.csi_driver,
        storage_class = %config.storage_class,
        "Starting AWS EFS operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    run_controller(client, namespace, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the SharedVolume CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let yaml = serde_yaml::to_string(&SharedVolume::crd())?;
    println!("{}", yaml);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["aws-efs-operator"]);
        assert_eq!(args.watch_namespace(), None);
        assert_eq!(args.volume_config().unwrap(), VolumeConfig::default());
        assert_eq!(args.log_level, Level::INFO);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "aws-efs-operator",
            "--namespace",
            "x",
            "--csi-driver",
            "custom.csi",
            "--storage-class",
            "fast",
        ]);
        assert_eq!(args.watch_namespace().as_deref(), Some("x"));
        let config = args.volume_config().unwrap();
        assert_eq!(config.csi_driver, "custom.csi");
        assert_eq!(config.storage_class, "fast");
    }

    #[test]
    fn test_empty_storage_class_is_rejected() {
        let args = Args::parse_from(["aws-efs-operator", "--storage-class", ""]);
        assert!(args.volume_config().is_err());
    }
}
