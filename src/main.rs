//! Float Engine CLI
//!
//! Dry-runs one request envelope against an in-memory ledger and prints the
//! response envelope as JSON.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- request.json [ledger.csv] > response.json
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `FLOAT_ENGINE_CONFIG`: Settings file holding the float configs
//! - `FLOAT_ENGINE__*`: Overrides for individual settings

use float_engine::memory::{MemoryCache, MemoryConfigStore, MemoryLedger};
use float_engine::{EngineError, EngineSettings, FloatEngine, Result};
use log::info;
use std::env;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::init();

    match run().await {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Returns whether the request succeeded.
async fn run() -> Result<bool> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        return Err(EngineError::MissingArgument);
    }

    let request = fs::read_to_string(&args[1])?;
    let settings = EngineSettings::load()?;

    let ledger = Arc::new(MemoryLedger::new());
    if let Some(ledger_path) = args.get(2) {
        let file = File::open(ledger_path)?;
        let loaded = ledger.load_csv(BufReader::new(file))?;
        info!("Loaded {} ledger rows from {}", loaded, ledger_path);
    }

    let engine = FloatEngine::new(
        ledger,
        Arc::new(MemoryConfigStore::from_configs(settings.floats.clone())),
        Arc::new(MemoryCache::new()),
        settings,
    );
    let response = engine.handle_json(&request).await;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer_pretty(&mut handle, &response)?;
    writeln!(handle)?;

    Ok(response.is_success())
}
