//! The `commit-scanner` binary.

#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::sync::Arc;

use atty::Stream;
use clap::{Parser, Subcommand};
use commit_scanner::{
    config::{self, Config},
    db::{self, Database},
    doc,
    ext::error_stack::{DescribeContext, ErrorDocReference, ErrorHelper, FatalErrorReport},
    executor::Deps,
    exporter::ExportJob,
    fork_finder,
    http::{self, AppState},
    ingest::IngestJob,
    model::CommitTask,
    queue::{self, Priority, Queue, Receiver, Sender},
    reconciler, scanner,
    worker, worktree,
    AppContext,
};
use error_stack::{fmt::ColorMode, IntoReport, Report, Result, ResultExt};
use tap::TapFallible;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("determine effective configuration")]
    DetermineEffectiveConfig,

    #[error("a fatal error occurred during internal setup")]
    InternalSetup,

    #[error("a fatal error occurred at runtime")]
    Runtime,
}

#[derive(Debug, Parser)]
#[clap(version)]
struct Opts {
    /// This binary supports a number of subcommands.
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate configuration and provision the database, without running
    /// the scheduling/execution core itself.
    Init(config::RawArgs),

    /// Run the commit-scan scheduling and execution core: the webhook HTTP
    /// server, every queue worker, and the periodic reconciler.
    Run(config::RawArgs),

    /// Register a build-history CSV as a `DataSource` and enqueue its
    /// ingestion, the ops-CLI counterpart to the HTTP upload surface this
    /// service does not itself expose.
    Ingest {
        #[clap(flatten)]
        args: config::RawArgs,

        /// A human-readable name for this dataset.
        #[clap(long)]
        name: String,

        /// Path to the build-history CSV to ingest.
        #[clap(long)]
        source: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    if atty::is(Stream::Stdout) {
        Report::set_color_mode(ColorMode::Color);
    } else {
        Report::set_color_mode(ColorMode::None);
    }

    let Opts { command } = Opts::parse();
    let subcommand = || async {
        match command {
            Commands::Init(args) => main_init(args).await,
            Commands::Run(args) => main_run(args).await,
            Commands::Ingest { args, name, source } => main_ingest(args, name, source).await,
        }
    };

    tokio::select! {
        biased;

        result = tokio::signal::ctrl_c() => {
            result
                .tap_ok(|_| eprintln!("Shut down due to OS signal"))
                .context(Error::InternalSetup)
        },

        result = subcommand() => {
            result
        }
    }
    .request_support()
    .describe_lazy(|| format!("commit-scanner version: {}", doc::crate_version()))
}

/// Validate config, connect to the database (running migrations), and exit.
/// Operators run this once before `run` to catch configuration mistakes and
/// provision a fresh database file without starting the service itself.
async fn main_init(args: config::RawArgs) -> Result<(), Error> {
    let args = args.validate().await.change_context(Error::DetermineEffectiveConfig)?;
    let conf = config::load(&args).await.change_context(Error::DetermineEffectiveConfig)?;

    let db_path = conf.database_path().unwrap_or(args.database_path().path());
    let database = db::connect_sqlite(db_path).await.change_context(Error::InternalSetup)?;
    database.claim_schema_version().await.change_context(Error::InternalSetup)?;

    info!(backends = conf.backends().len(), database = %db_path.display(), "configuration is valid; database provisioned");
    Ok(())
}

/// Run the commit-scan scheduling and execution core to completion (i.e.
/// forever, until interrupted): the webhook HTTP server, one worker per
/// queue tier, and the periodic reconciler.
async fn main_run(args: config::RawArgs) -> Result<(), Error> {
    let args = args
        .validate()
        .await
        .change_context(Error::DetermineEffectiveConfig)
        .help("try running with the '--help' argument to see available options and usage")?;

    let conf = config::load(&args)
        .await
        .change_context(Error::DetermineEffectiveConfig)
        .documentation_lazy(doc::link::config_file_reference)?;
    debug!("loaded {conf:?}");

    let _tracing_guard = conf.debug().run_tracing_sink().change_context(Error::InternalSetup)?;

    let db_path = conf.database_path().unwrap_or(args.database_path().path()).to_path_buf();
    let database = Arc::new(db::connect_sqlite(&db_path).await.change_context(Error::InternalSetup)?);
    database.claim_schema_version().await.change_context(Error::InternalSetup)?;

    let ctx = AppContext::new(args.data_root().path().clone());
    let (scan_sender, scan_receiver) = queue::open::<CommitTask>(&ctx, Queue::Scan).await.change_context(Error::InternalSetup)?;
    let (export_sender, export_receiver) = queue::open::<ExportJob>(&ctx, Queue::Export).await.change_context(Error::InternalSetup)?;
    let ingest_receiver: Receiver<IngestJob> = Receiver::open(&ctx, Queue::Ingest).await.change_context(Error::InternalSetup)?;
    let scan_sender = Arc::new(Mutex::new(scan_sender));
    let export_sender = Arc::new(Mutex::new(export_sender));

    let deps_by_backend = build_deps(&conf, &database, args.data_root().path().clone()).change_context(Error::InternalSetup)?;

    let scan_task = tokio::spawn(worker::run_scan_worker(
        Arc::clone(&database),
        scan_receiver,
        Arc::clone(&scan_sender),
        Arc::clone(&export_sender),
        Arc::new(deps_by_backend),
        *conf.task_retry(),
    ));

    let conf_for_export = conf.clone();
    let backend_for: &'static dyn Fn(&str) -> Option<config::BackendInstance> =
        Box::leak(Box::new(move |name: &str| conf_for_export.backend(name).cloned()));
    let export_task = tokio::spawn(worker::run_export_worker(
        Arc::clone(&database),
        export_receiver,
        Arc::clone(&export_sender),
        backend_for,
        Arc::new(conf.metrics().clone()),
        Arc::new(conf.metrics().export_root().clone()),
        *conf.export_retry(),
    ));

    let ingest_task = tokio::spawn(worker::run_ingest_worker(Arc::clone(&database), ingest_receiver, Arc::clone(&scan_sender)));

    let reconciler_task = tokio::spawn(reconciler::run(
        Arc::clone(&database),
        Arc::clone(&scan_sender),
        conf.reconcile_interval(),
        conf.failure_policy(),
    ));

    let state = AppState {
        db: Arc::clone(&database),
        webhook_config: Arc::new(conf.webhook().clone()),
        export_sender: Arc::clone(&export_sender),
        scan_sender: Arc::clone(&scan_sender),
    };
    let router = http::router(state);
    let listener = tokio::net::TcpListener::bind(conf.webhook_bind())
        .await
        .into_report()
        .change_context(Error::InternalSetup)
        .describe_lazy(|| format!("bind webhook listener to {}", conf.webhook_bind()))?;
    info!(addr = %conf.webhook_bind(), "listening for webhook callbacks");
    let server_task = tokio::spawn(async move { axum::serve(listener, router).await });

    tokio::select! {
        result = scan_task => log_worker_exit("scan", result),
        result = export_task => log_worker_exit("export", result),
        result = ingest_task => log_worker_exit("ingest", result),
        result = reconciler_task => log_worker_exit("reconciler", result),
        result = server_task => {
            if let Ok(Err(error)) = result {
                tracing::error!(%error, "webhook server exited");
            }
        }
    }

    Ok(())
}

fn log_worker_exit(name: &str, result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        tracing::error!(worker = name, %error, "worker task panicked");
    } else {
        tracing::warn!(worker = name, "worker task exited unexpectedly");
    }
}

/// Build one [`Deps`] per configured backend instance, in configuration
/// order, each sharing the same [`worktree::WorktreeManager`] cache (keyed
/// internally by `(backend, project)`) and fork-discovery client.
fn build_deps<D: Database>(
    conf: &Config,
    database: &Arc<D>,
    data_root: std::path::PathBuf,
) -> Result<Vec<Deps<D>>, commit_scanner::fork_finder::Error> {
    let worktree = Arc::new(worktree::WorktreeManager::new(data_root));
    let scanner = Arc::new(scanner::Scanner::new(conf.scanner_binary().clone()));
    let fork_finder = if conf.fork_finder().tokens().is_empty() {
        None
    } else {
        Some(Arc::new(fork_finder::Client::new(conf.fork_finder().api_base().clone(), conf.fork_finder().tokens().clone())?))
    };

    Ok(conf
        .backends()
        .iter()
        .map(|backend_instance| Deps {
            db: Arc::clone(database),
            worktree: Arc::clone(&worktree),
            scanner: Arc::clone(&scanner),
            backend_instance: backend_instance.clone(),
            fork_finder: fork_finder.clone(),
            fork_finder_api_base: conf.fork_finder().api_base().clone(),
            fork_finder_max_pages: conf.fork_finder().max_pages(),
            failure_policy: conf.failure_policy(),
        })
        .collect())
}

/// Register a build-history CSV as a pending `DataSource` and enqueue its
/// ingestion onto [`Queue::Ingest`]. Creating the `DataSource` row and
/// kicking off the fan-out is the one piece of the (otherwise out-of-scope)
/// upload surface the scheduling core can't function without a caller
/// having done.
async fn main_ingest(args: config::RawArgs, name: String, source: std::path::PathBuf) -> Result<(), Error> {
    let args = args.validate().await.change_context(Error::DetermineEffectiveConfig)?;
    let conf = config::load(&args).await.change_context(Error::DetermineEffectiveConfig)?;

    let db_path = conf.database_path().unwrap_or(args.database_path().path());
    let database = db::connect_sqlite(db_path).await.change_context(Error::InternalSetup)?;

    let content = tokio::fs::read_to_string(&source)
        .await
        .into_report()
        .change_context(Error::Runtime)
        .describe_lazy(|| format!("read source CSV at {}", source.display()))?;
    let total_commits = content.lines().filter(|line| !line.trim().is_empty()).count().saturating_sub(1) as i64;

    let source_path = source.to_string_lossy().into_owned();
    let data_source = database
        .create_data_source(&name, &source_path, total_commits, None)
        .await
        .change_context(Error::Runtime)?;

    let ctx = AppContext::new(args.data_root().path().clone());
    let mut sender: Sender<IngestJob> = Sender::open(&ctx, Queue::Ingest).await.change_context(Error::InternalSetup)?;
    sender
        .send(IngestJob { data_source_id: *data_source.id() }, Priority::Normal)
        .await
        .change_context(Error::Runtime)?;

    info!(data_source_id = %data_source.id(), total_commits, "enqueued data source for ingestion");
    Ok(())
}
