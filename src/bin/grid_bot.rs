//! Grid Maintenance Bot Binary
//!
//! Runs one grid engine per configured symbol against the paper exchange.
//!
//! ## Setup
//!
//! 1. Optionally create a `.env` file with overrides:
//!    ```
//!    RUST_LOG=debug
//!    APP__ENGINE__HEALTH_CHECK_INTERVAL_SECS=15
//!    ```
//!
//! 2. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- config.toml
//!    ```
//!
//! Ctrl-C cancels every order and exits once the engines have drained.

use perp_grid::BotRunner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    let dotenv = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let default_config = "config.toml".to_string();
    let config_path = args.get(1).unwrap_or(&default_config);
    if !std::path::Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let runner = BotRunner::new(config_path)?;
    if runner.settings().grids.is_empty() {
        eprintln!("No [[grids]] configured in '{}'.", config_path);
        std::process::exit(1);
    }
    if let Ok(path) = dotenv {
        println!("Loaded environment from: {}", path.display());
    }

    match runner.run().await {
        Ok(report) => {
            if !report.aborted.is_empty() {
                eprintln!("Engines aborted during shutdown: {:?}", report.aborted);
                std::process::exit(2);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Bot execution error: {}", e);
            std::process::exit(1);
        }
    }
}
