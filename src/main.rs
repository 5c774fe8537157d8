use xdccd::{app, config};

#[tokio::main]
async fn main() {
    let config = config::Config::from_env();
    let _log_guard = config::init_tracing(&config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "xdccd booting");

    if let Err(error) = app::run(config).await {
        tracing::error!(error = %format!("{error:#}"), "fatal error");
        std::process::exit(1);
    }
}
