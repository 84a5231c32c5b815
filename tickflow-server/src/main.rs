use std::{path::PathBuf, sync::Arc};
use tickflow::{
    PipelineConfig, PipelineError, PipelineMode,
    enrich::threshold::ThresholdProvider,
    pipeline::{
        Pipeline, PipelineSummary, live_thresholds,
        sink::JsonLinesSink,
        source::{LiveTickSource, ReplayTickSource, TickSource},
        thresholds_for_mode,
    },
};
use tracing::{error, info, warn};

mod feed;

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    if let Err(error) = run().await {
        error!(%error, "tickflow-server stopped with a fatal error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), PipelineError> {
    let config = load_config().await?;
    config.validate()?;
    info!(
        mode = ?config.mode,
        instruments = config.instruments.len(),
        "loaded pipeline configuration"
    );

    // Configurable via TICKFLOW_OUTPUT_DIR env var (default: ./output)
    let output_dir = PathBuf::from(
        std::env::var("TICKFLOW_OUTPUT_DIR").unwrap_or_else(|_| "output".to_string()),
    );
    tokio::fs::create_dir_all(&output_dir)
        .await
        .map_err(|error| PipelineError::Config(format!("{}: {error}", output_dir.display())))?;

    let bar_sink = open_sink("bar", output_dir.join("bars.jsonl")).await?;
    let signal_sink = open_sink("signal", output_dir.join("signals.jsonl")).await?;
    info!(output = %output_dir.display(), "writing bars and signals as JSON lines");

    let summary = match config.mode {
        PipelineMode::Backtest => {
            let paths = replay_paths()?;
            let source = ReplayTickSource::from_json_lines(&paths).await?;
            info!(files = paths.len(), ticks = source.len(), "replaying history");

            let thresholds = thresholds_for_mode(&config, source.ticks());
            run_pipeline(config, thresholds, source, bar_sink, signal_sink).await?
        }
        PipelineMode::Realtime => {
            // Configurable via TICKFLOW_FEED_URL env var (default: ws://127.0.0.1:9001)
            let url = std::env::var("TICKFLOW_FEED_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:9001".to_string());

            let (tx, source) = LiveTickSource::channel(config.channel_capacity)?;
            let thresholds = live_thresholds(&config);
            tokio::spawn(feed::run(feed::FeedConfig::new(url), tx, thresholds.clone()));

            run_pipeline(config, Arc::new(thresholds), source, bar_sink, signal_sink).await?
        }
    };

    info!(
        ticks = summary.ticks_processed,
        unknown = summary.unknown_dropped,
        gaps = summary.gaps_skipped,
        bars = summary.bars_written,
        signals = summary.signals_written,
        "tickflow-server finished"
    );
    Ok(())
}

async fn run_pipeline<S: TickSource>(
    config: PipelineConfig,
    thresholds: Arc<dyn ThresholdProvider>,
    source: S,
    bar_sink: JsonLinesSink,
    signal_sink: JsonLinesSink,
) -> Result<PipelineSummary, PipelineError> {
    let pipeline = Pipeline::new(config, thresholds);

    let shutdown = pipeline.shutdown_trigger();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, draining pipeline");
                shutdown.trigger();
            }
            Err(error) => warn!(%error, "failed to listen for Ctrl+C"),
        }
    });

    pipeline.run(source, bar_sink, signal_sink).await
}

/// Load `TICKFLOW_CONFIG` (JSON) if set, then apply environment overrides.
async fn load_config() -> Result<PipelineConfig, PipelineError> {
    let config = match std::env::var("TICKFLOW_CONFIG") {
        Ok(path) => {
            let json = tokio::fs::read_to_string(&path)
                .await
                .map_err(|error| PipelineError::Config(format!("{path}: {error}")))?;
            PipelineConfig::from_json(&json)?
        }
        Err(_) => {
            warn!("TICKFLOW_CONFIG not set, using default configuration");
            PipelineConfig::default()
        }
    };
    config.with_env_overrides()
}

/// Comma separated JSON-lines files from `TICKFLOW_REPLAY_PATH`.
fn replay_paths() -> Result<Vec<PathBuf>, PipelineError> {
    let paths = std::env::var("TICKFLOW_REPLAY_PATH")
        .map_err(|_| PipelineError::Config("TICKFLOW_REPLAY_PATH is required in backtest mode".to_string()))?
        .split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .collect::<Vec<_>>();

    if paths.is_empty() {
        return Err(PipelineError::Config(
            "TICKFLOW_REPLAY_PATH names no files".to_string(),
        ));
    }
    Ok(paths)
}

async fn open_sink(name: &'static str, path: PathBuf) -> Result<JsonLinesSink, PipelineError> {
    JsonLinesSink::open(&path)
        .await
        .map_err(|source| PipelineError::SinkUnavailable {
            sink: name,
            attempts: 1,
            source,
        })
}

/// Human readable logs by default, JSON when `TICKFLOW_LOG_JSON=1`.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("TICKFLOW_LOG_JSON").is_ok_and(|value| value == "1") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
