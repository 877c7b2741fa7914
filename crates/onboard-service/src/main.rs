use clap::{Parser, ValueEnum};
use onboard_core::workflow::UNKNOWN_IP;
use onboard_core::{Locale, OnboardConfig, DEFAULT_TEMPLATE_ID};
use onboard_service::{
    build_router, AdminBootstrap, BlobConfig, IpLookupConfig, ServiceConfig, ServiceState,
    StorageConfig,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "onboardd", version, about = "Investor onboarding REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092")]
    listen: SocketAddr,
    /// Document store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "ONBOARD_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for investor and admin records.
    #[arg(long, env = "ONBOARD_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "ONBOARD_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Directory for signed agreements. Kept in memory when unset.
    #[arg(long, env = "ONBOARD_BLOB_DIR")]
    blob_dir: Option<PathBuf>,
    /// Public URL under which `--blob-dir` is served by a file server. Required with it.
    #[arg(long, env = "ONBOARD_BLOB_BASE_URL")]
    blob_base_url: Option<String>,
    /// Reverse proxy address whose forwarding headers carry the client address. Repeatable.
    #[arg(long = "trusted-proxy", env = "ONBOARD_TRUSTED_PROXIES", value_delimiter = ',')]
    trusted_proxies: Vec<IpAddr>,
    /// JSON endpoint answering `{"ip": "..."}`, asked only when the peer address is unknown.
    /// The signer IP is recorded as `unknown` in that case when unset.
    #[arg(long, env = "ONBOARD_IP_LOOKUP_URL")]
    ip_lookup_url: Option<String>,
    /// Minutes an untouched signing session is kept.
    #[arg(long, default_value_t = 30, env = "ONBOARD_WORKFLOW_IDLE_MINS")]
    workflow_idle_mins: u64,
    /// Agreement version recorded on signatures.
    #[arg(long, default_value = "1.0", env = "ONBOARD_NDA_VERSION")]
    nda_version: String,
    #[arg(long, default_value = DEFAULT_TEMPLATE_ID, env = "ONBOARD_NDA_TEMPLATE")]
    nda_template: String,
    /// Agreement language: pt or en.
    #[arg(long, default_value = "pt", env = "ONBOARD_LOCALE")]
    locale: Locale,
    #[arg(long, default_value = "Lisboa", env = "ONBOARD_SIGNING_LOCATION")]
    signing_location: String,
    /// Upper bound in seconds for long-poll status waits.
    #[arg(long, default_value_t = 30, env = "ONBOARD_MAX_WAIT_SECS")]
    max_wait_secs: u64,
    #[arg(long, env = "ONBOARD_ADMIN_EMAIL")]
    admin_email: Option<String>,
    #[arg(long, env = "ONBOARD_ADMIN_PASSWORD")]
    admin_password: Option<String>,
    #[arg(long, default_value = "Administrator", env = "ONBOARD_ADMIN_NAME")]
    admin_name: String,
    /// Issue this fixed OTP code instead of random ones. Development only.
    #[arg(long, env = "ONBOARD_DEV_OTP_CODE")]
    dev_otp_code: Option<String>,
    /// Log issued OTP codes. Development only.
    #[arg(long, default_value_t = false)]
    dev_log_otp: bool,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::Postgres {
                database_url,
                max_connections: cli.pg_max_connections,
            }
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::Postgres {
                database_url,
                max_connections: cli.pg_max_connections,
            },
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn resolve_admin(cli: &Cli) -> anyhow::Result<Option<AdminBootstrap>> {
    match (&cli.admin_email, &cli.admin_password) {
        (Some(email), Some(password)) => Ok(Some(AdminBootstrap {
            email: email.clone(),
            password: password.clone(),
            name: cli.admin_name.clone(),
        })),
        (None, None) => Ok(None),
        _ => Err(anyhow::anyhow!(
            "--admin-email and --admin-password must be given together"
        )),
    }
}

fn resolve_blobs(cli: &Cli) -> anyhow::Result<BlobConfig> {
    match (&cli.blob_dir, &cli.blob_base_url) {
        (Some(root), Some(base_url)) => Ok(BlobConfig::Filesystem {
            root: root.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }),
        (Some(_), None) => Err(anyhow::anyhow!(
            "--blob-dir requires --blob-base-url naming where the directory is served"
        )),
        (None, base_url) => {
            if base_url.is_some() {
                warn!("--blob-base-url has no effect without --blob-dir");
            }
            warn!("no --blob-dir configured; signed agreements are kept in memory only");
            Ok(BlobConfig::Memory)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "onboard_service=info,onboard_core=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let admin = resolve_admin(&cli)?;

    let blobs = resolve_blobs(&cli)?;
    let ip_lookup = match &cli.ip_lookup_url {
        Some(endpoint) => IpLookupConfig::Http {
            endpoint: endpoint.clone(),
        },
        None => IpLookupConfig::Fixed(UNKNOWN_IP.to_string()),
    };
    if cli.dev_otp_code.is_some() || cli.dev_log_otp {
        warn!("development otp options are enabled");
    }

    let config = ServiceConfig {
        storage,
        blobs,
        ip_lookup,
        trusted_proxies: cli.trusted_proxies,
        workflow_idle: Duration::from_secs(cli.workflow_idle_mins.max(1) * 60),
        admin,
        onboard: OnboardConfig {
            nda_version: cli.nda_version,
            template_id: cli.nda_template,
            locale: cli.locale,
            signing_location: cli.signing_location,
            max_wait: Duration::from_secs(cli.max_wait_secs.max(1)),
            ..OnboardConfig::default()
        },
        fixed_otp_code: cli.dev_otp_code,
        log_otp_codes: cli.dev_log_otp,
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("onboard-service REST listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("onboardd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn blob_dir_needs_a_base_url() {
        let cli = parse(&["--blob-dir", "/var/lib/onboard"]);
        assert!(resolve_blobs(&cli).is_err());

        let cli = parse(&[
            "--blob-dir",
            "/var/lib/onboard",
            "--blob-base-url",
            "https://files.example.com/nda/",
        ]);
        match resolve_blobs(&cli).unwrap() {
            BlobConfig::Filesystem { base_url, .. } => {
                assert_eq!(base_url, "https://files.example.com/nda")
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(resolve_blobs(&parse(&[])).unwrap(), BlobConfig::Memory));
    }

    #[test]
    fn trusted_proxies_accept_a_list() {
        let cli = parse(&["--trusted-proxy", "10.0.0.1,10.0.0.2", "--trusted-proxy", "::1"]);
        assert_eq!(cli.trusted_proxies.len(), 3);
        assert!(cli.ip_lookup_url.is_none());
    }
}
