use anyhow::Context;
use clap::Parser;
use plant_monitoring::{MonitoringHub, config::read_config_file};
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("plant_monitoring", level),
        ("plant_hub", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = read_config_file(&args.file)
        .with_context(|| format!("failed to read config file {}", args.file))?;

    let level = match config.log_level.as_deref().map(str::parse::<LevelFilter>) {
        Some(Ok(level)) => level,
        Some(Err(_)) | None => LevelFilter::DEBUG,
    };
    init(level);
    trace!("started with args: {args:?}");

    let hub = MonitoringHub::from_config(&config).await?;
    hub.start_point_polling().await?;
    info!("plant hub running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl+C, stopping: {e}");
    }

    hub.shutdown().await
}
