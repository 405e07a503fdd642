//! Command line front end of `admission-tls`.
//!
//! ```bash
//! NSM_WEBHOOK_MODE=selfregister admission-tls ca-bundle > ca.crt
//! NSM_CERT_DIR=/run/admission-webhook/certs admission-tls watch
//! admission-tls check
//! ```

use admission_tls::{
    CertificateWatcher, Config, CredentialProvider, Mode, SecretStore, TlsBootstrap, TlsVersion,
    WorkloadApiService,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "admission-tls")]
#[command(about = "TLS identity bootstrap and rotation for admission webhooks")]
struct Args {
    /// Name of the webhook instance
    #[arg(long, default_value = "admission-webhook-k8s", env = "NSM_NAME")]
    name: String,

    /// Service fronting the webhook
    #[arg(long, default_value = "default", env = "NSM_SERVICE_NAME")]
    service_name: String,

    /// Namespace of the webhook
    #[arg(long, default_value = "default", env = "NSM_NAMESPACE")]
    namespace: String,

    /// Identity mode: selfregister, spire or secret
    #[arg(long, default_value = "spire", env = "NSM_WEBHOOK_MODE")]
    webhook_mode: String,

    /// TLS secret read in secret mode
    #[arg(long, env = "NSM_SECRET_NAME")]
    secret_name: Option<String>,

    /// PEM certificate chain
    #[arg(long, env = "NSM_CERT_FILE_PATH")]
    cert_file_path: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "NSM_KEY_FILE_PATH")]
    key_file_path: Option<PathBuf>,

    /// PEM CA bundle registered with the API server
    #[arg(long, env = "NSM_CA_BUNDLE_FILE_PATH")]
    ca_bundle_file_path: Option<PathBuf>,

    /// Directory kept up to date in spire mode
    #[arg(long, default_value = "/run/admission-webhook/certs", env = "NSM_CERT_DIR")]
    cert_dir: PathBuf,

    /// Minimum TLS version
    #[arg(long, value_enum, default_value_t = MinTls::V1_2, env = "NSM_MIN_TLS_VERSION")]
    min_tls_version: MinTls,

    /// OpenTelemetry collector endpoint
    #[arg(
        long,
        default_value = "otel-collector.observability.svc.cluster.local:4317",
        env = "NSM_OPEN_TELEMETRY_ENDPOINT"
    )]
    open_telemetry_endpoint: String,

    /// Metric export interval in seconds
    #[arg(long, default_value_t = 10, env = "NSM_METRICS_EXPORT_INTERVAL")]
    metrics_export_interval: u64,

    /// SPIRE agent Workload API socket
    #[arg(
        long,
        default_value = admission_tls::constants::WORKLOAD_API_SOCKET,
        env = "SPIFFE_ENDPOINT_SOCKET"
    )]
    spiffe_socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the CA bundle to register with the API server
    CaBundle,
    /// Keep the certificate directory current until interrupted
    Watch,
    /// Run the full TLS bootstrap once and report the served identity
    Check,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MinTls {
    #[value(name = "1.2")]
    V1_2,
    #[value(name = "1.3")]
    V1_3,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::default()
            .with_name(&self.name)
            .with_service_name(&self.service_name)
            .with_namespace(&self.namespace)
            .with_webhook_mode(&self.webhook_mode)
            .with_cert_dir(&self.cert_dir)
            .with_min_tls_version(match self.min_tls_version {
                MinTls::V1_2 => TlsVersion::Tls12,
                MinTls::V1_3 => TlsVersion::Tls13,
            });
        config.secret_name = self.secret_name.clone();
        config.cert_file_path = self.cert_file_path.clone();
        config.key_file_path = self.key_file_path.clone();
        config.ca_bundle_file_path = self.ca_bundle_file_path.clone();
        config.open_telemetry_endpoint = self.open_telemetry_endpoint.clone();
        config.metrics_export_interval = Duration::from_secs(self.metrics_export_interval);
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = args.config();
    let mode = config.mode()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted; shutting down");
            }
            cancel.cancel();
        }
    });

    match args.command {
        Command::CaBundle => {
            let mut provider = CredentialProvider::new(config)?;
            if mode == Mode::SecretStore {
                provider = provider.with_secret_store(secret_store(&args.namespace).await?);
            }
            let bundle = provider.ca_bundle().await?;
            std::io::stdout()
                .write_all(&bundle)
                .context("writing CA bundle")?;
        }

        Command::Watch => {
            if mode != Mode::WorkloadIdentity {
                bail!("watch requires webhook mode 'spire', got '{mode}'");
            }
            let service = Arc::new(WorkloadApiService::new(&args.spiffe_socket));
            let handle = CertificateWatcher::start(service, &config.cert_dir, cancel).await?;
            handle.join().await?;
        }

        Command::Check => {
            let mut bootstrap = TlsBootstrap::new(config).with_identity_service(Arc::new(
                WorkloadApiService::new(&args.spiffe_socket),
            ));
            if mode == Mode::SecretStore {
                bootstrap = bootstrap.with_secret_store(secret_store(&args.namespace).await?);
            }

            let identity = bootstrap.start(cancel.clone()).await?;
            let credential = match &identity.watcher {
                Some(watcher) => watcher.updates().current(),
                None => Some(identity.provider.certificate().await?),
            };
            println!("mode: {}", identity.mode);
            if let Some(credential) = credential {
                println!("certificate chain length: {}", credential.cert_chain().len());
                println!("not after: {}", credential.not_after());
            }
            cancel.cancel();
        }
    }

    Ok(())
}

#[cfg(feature = "kube")]
async fn secret_store(namespace: &str) -> Result<Arc<dyn SecretStore>> {
    let store = admission_tls::provider::KubeSecretStore::infer(namespace).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "kube"))]
async fn secret_store(_namespace: &str) -> Result<Arc<dyn SecretStore>> {
    bail!("webhook mode 'secret' needs the `kube` feature")
}
