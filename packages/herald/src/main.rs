use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use atomic_time::AtomicInstant;
use axum::http::HeaderValue;
use clap::Parser;
use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use herald::{
    api, auth::MetricsGate, config::ServeConfig, feed_reader::FeedReader, token::TokenCodec,
};
use tap::Pipe;
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_tree::time::FormatTime;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the Herald API server
    Serve(ServeConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_timer(Uptime::default())
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Command::Serve(config) => serve(config).await,
    }
}

async fn serve(config: ServeConfig) -> Result<()> {
    tracing::info!("constructing application router...");
    let settings = config.settings().context("resolve settings")?;
    tracing::info!(?settings, "resolved settings");

    let codec = TokenCodec::new(&config.token_secret).context("create token codec")?;
    let gate = MetricsGate::new(config.metrics_token.as_deref());
    let feed_reader = match (&config.feed_reader_url, &config.feed_reader_token) {
        (Some(url), Some(token)) => {
            tracing::info!(%url, "subscribing created feeds in feed reader");
            FeedReader::new(
                api::http_client()?,
                url.clone(),
                token.as_str(),
                config.feed_reader_category,
            )
            .pipe(Some)
        }
        _ => None,
    };
    let allowed_origins = config
        .allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin.trim())
                .with_context(|| format!("parse allowed origin {origin:?}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let state = api::state(settings, codec, gate, feed_reader)?;
    let router = api::router(state, allowed_origins);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    // Graceful shutdown: wait for SIGTERM or SIGINT, then allow in-flight
    // requests to complete.
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// If a handler can't be installed that signal is never observed; the other
/// one still works.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = ?err, "install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::error!(error = ?err, "install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}

/// Prints the overall latency and latency between tracing events.
struct Uptime {
    start: Instant,
    prior: AtomicInstant,
}

impl Uptime {
    /// Get the [`Duration`] since the last time this function was called.
    /// Uses relaxed atomic ordering; this isn't meant to be super precise,
    /// just fast to run and good enough for humans to eyeball.
    fn elapsed_since_prior(&self) -> Duration {
        const RELAXED: Ordering = Ordering::Relaxed;
        self.prior
            .fetch_update(RELAXED, RELAXED, |_| Some(Instant::now()))
            .unwrap_or_else(|_| Instant::now())
            .pipe(|prior| prior.elapsed())
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            prior: AtomicInstant::now(),
        }
    }
}

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut impl std::fmt::Write) -> std::fmt::Result {
        let seconds = self.start.elapsed().as_secs_f64();
        write!(w, "{seconds:.03}s")
    }

    // `elapsed` is the time spent in the current span; we want the time since
    // the previous message instead.
    fn style_timestamp(
        &self,
        _ansi: bool,
        _elapsed: Duration,
        w: &mut impl std::fmt::Write,
    ) -> std::fmt::Result {
        let elapsed = self.elapsed_since_prior().as_millis();
        write!(w, "{elapsed: >3}ms")
    }
}
