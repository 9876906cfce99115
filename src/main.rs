use clap::Parser;
use tracing::{debug, info, warn};

use aircheck::config::Config;

#[derive(Parser)]
#[command(version)]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let cfg = Config::parse(args.config);
    aircheck::log::set(format!("aircheck={}", cfg.log.level));
    warn!("set log level : {}", cfg.log.level);
    debug!("config : {:?}", cfg);
    cfg.validate().expect("invalid config");

    let listener = tokio::net::TcpListener::bind(cfg.http.listen)
        .await
        .unwrap();
    info!("Server listening on {}", listener.local_addr().unwrap());

    aircheck::serve(cfg, listener, shutdown_signal()).await;
    info!("Server shutdown");
}

async fn shutdown_signal() {
    let signal = aircheck::signal::wait_for_stop_signal().await;
    debug!("Received signal: {}", signal);
}
