use synapse_bridge::app::{self, Mode};
use synapse_bridge::config::Config;
use tracing_appender::non_blocking::WorkerGuard;

const HOST_LOG_FILE: &str = "host_client.log";

#[tokio::main]
async fn main() {
    let mode = Mode::from_args(std::env::args().skip(1));
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            std::process::exit(1);
        }
    };
    let _guard = init_logging(&config, &mode);
    if let Err(err) = app::run(config, mode).await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

/// Stdout carries the native messaging protocol in host mode, so the host
/// logs to a file instead.
fn init_logging(config: &Config, mode: &Mode) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Mode::Host { .. } = mode {
        let dir = config.logging.dir_path();
        if std::fs::create_dir_all(&dir).is_ok() {
            let appender = tracing_appender::rolling::never(&dir, HOST_LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            return Some(guard);
        }
    }

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    None
}
