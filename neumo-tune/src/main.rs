//! neumo-tune: drive one DVB frontend by hand.

mod commands;
mod context;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use crate::context::Cli;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("Stopping");
            stop.store(true, Ordering::SeqCst);
        }) {
            error!("Failed to install the Ctrl-C handler: {}", e);
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start the runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(commands::run(cli.command, &stop)) {
        error!("{}", e);
        std::process::exit(1);
    }
}
