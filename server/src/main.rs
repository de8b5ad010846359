mod services;

use anyhow::Context;
use clap::Parser;
use signlib::config::UploadLimits;
use signlib::{Config, JobCoordinator};
use std::path::PathBuf;
use std::time::Duration;

/// HTTP service that re-signs uploaded IPA packages with an external
/// signing tool.
#[derive(Parser, Debug)]
#[command(name = "signd", about = "IPA re-signing job service")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "SIGND_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Path to the external signing executable.
    #[arg(long, env = "SIGND_SIGNER", default_value = "zsign")]
    signer: PathBuf,

    /// Directory for per-job workspaces (defaults to the system temp dir).
    #[arg(long, env = "SIGND_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Signing-tool processes allowed to run at once.
    #[arg(long, env = "SIGND_MAX_CONCURRENT", default_value_t = 2)]
    max_concurrent: usize,

    /// Admitted jobs allowed to queue for a slot before submissions are
    /// rejected.
    #[arg(long, env = "SIGND_MAX_QUEUE_DEPTH", default_value_t = 8)]
    max_queue_depth: usize,

    /// Package upload ceiling in mebibytes.
    #[arg(long, env = "SIGND_MAX_PACKAGE_MB", default_value_t = 512)]
    max_package_mb: u64,

    /// Per-invocation timeout for the signing tool, in seconds.
    #[arg(long, env = "SIGND_INVOCATION_TIMEOUT_SECS", default_value_t = 300)]
    invocation_timeout_secs: u64,

    /// End-to-end budget per job (staging + invocation + delivery), in
    /// seconds.
    #[arg(long, env = "SIGND_MAX_JOB_LIFETIME_SECS", default_value_t = 600)]
    max_job_lifetime_secs: u64,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, env = "SIGND_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log)?;

    let config = Config {
        max_concurrent_invocations: args.max_concurrent,
        max_queue_depth: args.max_queue_depth,
        upload_limits: UploadLimits {
            package: args.max_package_mb * 1024 * 1024,
            ..UploadLimits::default()
        },
        invocation_timeout: Duration::from_secs(args.invocation_timeout_secs),
        max_job_lifetime: Duration::from_secs(args.max_job_lifetime_secs),
        workspace_root: args
            .workspace_root
            .unwrap_or_else(|| std::env::temp_dir().join("signd-workspaces")),
        signer_program: args.signer,
        ..Config::default()
    };
    // download requests wait at most one full job lifetime
    let await_timeout = config.max_job_lifetime;

    let coordinator = JobCoordinator::spawn(config);
    let app = services::signservice::router(coordinator, await_timeout);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("cannot listen on {}", args.listen))?;
    tracing::info!(addr = %args.listen, "signd listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}
