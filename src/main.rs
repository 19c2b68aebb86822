use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use midi_hub_lib::{run_service_loop, Config};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {config_path}: {e}; using defaults");
            Config::default()
        }
    };
    info!("loaded config: {config:?}");

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrlc = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        running_ctrlc.store(false, Ordering::SeqCst);
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_service_loop(config, running))
}
