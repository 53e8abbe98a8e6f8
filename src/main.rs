mod core;
mod utils;
mod workers;

use crate::core::config::LOG_FILE_NAME;
use crate::utils::log_file::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Initialize the global data directory before anything touches the cache
    crate::utils::data_dir::init(args.conf.as_deref())?;

    let filter = match args.verbose {
        0 => "warn,scenecast=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter_layer = EnvFilter::new(filter);
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Full logs are kept on disk regardless of what reaches the terminal
    let log_path = crate::utils::data_dir::logs_dir().join(LOG_FILE_NAME);
    let file_layer = FileLogLayer::new(&log_path)?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    workers::app::run(args, sos).await
}
