use clap::Parser;
use openchat_core::config::DaemonConfig;

#[tokio::main]
async fn main() {
    let config = DaemonConfig::parse();
    if let Err(err) = openchat_core::kernel::run(config).await {
        eprintln!("openchat-daemon: {err:#}");
        std::process::exit(1);
    }
}
