use clap::{Args, Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tailpipe::api::HttpFetchApi;
use tailpipe::auth::StaticTokenProvider;
use tailpipe::collector::{CollectSession, SessionObserver, SessionOutcome};
use tailpipe::provider::{
    LogProvider, PollingAppLogProvider, PollingAppLogProviderConfig, PollingBuildLogProvider,
    PollingBuildLogProviderConfig, StreamingLogProvider, StreamingLogProviderConfig,
};
use tailpipe::record::{LogRecord, StreamKind};
use tailpipe::ws::{StreamScope, WsConnector};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tailpipe")]
#[command(about = "Tail application and build logs from the platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail logs for a deployed app.
    AppLogs(AppLogsArgs),
    /// Tail logs for one build.
    BuildLogs(BuildLogsArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    /// Repeated fetches over HTTP.
    Poll,
    /// Live push over a websocket.
    Stream,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Project the app belongs to.
    #[arg(long)]
    project: String,

    /// Base URL of the log-fetch API.
    #[arg(long, default_value = "https://rest.cerebrium.ai")]
    api_url: String,

    /// Base URL of the log-stream service.
    #[arg(long, default_value = "wss://logs.cerebrium.ai")]
    stream_url: String,

    /// API token; falls back to the TAILPIPE_TOKEN environment variable.
    #[arg(long, env = "TAILPIPE_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Args)]
struct AppLogsArgs {
    #[command(flatten)]
    conn: ConnectionArgs,

    /// App ID to tail.
    #[arg(long)]
    app: String,

    #[arg(long, value_enum, default_value_t = Transport::Poll)]
    transport: Transport,

    /// Keep polling for new logs instead of fetching once.
    #[arg(long)]
    follow: bool,

    /// Only return logs after this RFC 3339 timestamp (polling only).
    #[arg(long)]
    since: Option<String>,

    /// Restrict to a single run.
    #[arg(long)]
    run_id: Option<String>,

    /// Restrict to a single container.
    #[arg(long)]
    container_id: Option<String>,

    /// Restrict to one output stream (stdout or stderr).
    #[arg(long)]
    stream: Option<String>,

    /// Server-side content search.
    #[arg(long)]
    search: Option<String>,

    #[arg(long)]
    page_size: Option<i32>,
}

#[derive(Args)]
struct BuildLogsArgs {
    #[command(flatten)]
    conn: ConnectionArgs,

    /// App name the build belongs to.
    #[arg(long)]
    app: String,

    /// Build ID to tail.
    #[arg(long)]
    build: String,

    #[arg(long, value_enum, default_value_t = Transport::Poll)]
    transport: Transport,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tailpipe=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let provider: Box<dyn LogProvider> = match cli.command {
        Commands::AppLogs(args) => app_logs_provider(args)?,
        Commands::BuildLogs(args) => build_logs_provider(args)?,
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let session = CollectSession::spawn(provider, cancel);
    let mut printer = Printer;
    let (_, outcome) = session.run(&mut printer).await;

    match outcome {
        SessionOutcome::Completed | SessionOutcome::Cancelled => Ok(()),
        SessionOutcome::Failed(e) => Err(e.into()),
    }
}

fn app_logs_provider(args: AppLogsArgs) -> Result<Box<dyn LogProvider>, tailpipe::api::ApiError> {
    let tokens = Arc::new(StaticTokenProvider::new(&args.conn.token));

    Ok(match args.transport {
        Transport::Poll => {
            let api = Arc::new(HttpFetchApi::new(&args.conn.api_url, tokens)?);
            Box::new(PollingAppLogProvider::new(PollingAppLogProviderConfig {
                api,
                project_id: args.conn.project,
                app_id: args.app,
                follow: args.follow,
                since: args.since,
                run_id: args.run_id,
                container_id: args.container_id,
                stream: args.stream,
                search_term: args.search,
                page_size: args.page_size,
                direction: None,
                poll_interval: None,
            }))
        }
        Transport::Stream => {
            let connector = Arc::new(WsConnector::new(&args.conn.stream_url, tokens));
            Box::new(StreamingLogProvider::new(StreamingLogProviderConfig {
                connector,
                scope: StreamScope::App {
                    project_id: args.conn.project,
                    app_id: args.app,
                },
                run_id: args.run_id,
                container_id: args.container_id,
                lookback: None,
                reconnect_delay: None,
                max_reconnect_attempts: None,
            }))
        }
    })
}

fn build_logs_provider(
    args: BuildLogsArgs,
) -> Result<Box<dyn LogProvider>, tailpipe::api::ApiError> {
    let tokens = Arc::new(StaticTokenProvider::new(&args.conn.token));

    Ok(match args.transport {
        Transport::Poll => {
            let api = Arc::new(HttpFetchApi::new(&args.conn.api_url, tokens)?);
            Box::new(PollingBuildLogProvider::new(PollingBuildLogProviderConfig {
                api,
                project_id: args.conn.project,
                app_name: args.app,
                build_id: args.build,
                poll_interval: None,
            }))
        }
        Transport::Stream => {
            let connector = Arc::new(WsConnector::new(&args.conn.stream_url, tokens));
            Box::new(StreamingLogProvider::new(StreamingLogProviderConfig {
                connector,
                scope: StreamScope::Build {
                    project_id: args.conn.project,
                    build_id: args.build,
                },
                run_id: None,
                container_id: None,
                lookback: None,
                reconnect_delay: None,
                max_reconnect_attempts: None,
            }))
        }
    })
}

/// Writes each record as "HH:MM:SS content", stderr lines to stderr.
struct Printer;

impl SessionObserver for Printer {
    fn on_batch(&mut self, records: &[LogRecord]) {
        for record in records {
            let line = format!("{} {}", record.timestamp.format("%H:%M:%S"), record.content);
            match record.stream {
                StreamKind::Stderr => eprintln!("{line}"),
                _ => println!("{line}"),
            }
        }
    }

    fn on_idle(&mut self, message: &'static str) {
        eprintln!("{message}");
    }
}
