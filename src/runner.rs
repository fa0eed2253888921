use std::path::Path;
use std::sync::Arc;
use std::task::Poll;

use log::{error, info};
use tokio::sync::watch;

use crate::config::{ConfigError, Settings};
use crate::grid::{PaperExchange, Supervisor, SupervisorReport};

/// Runner for the grid engine in paper mode
pub struct BotRunner {
    config: Settings,
}

impl BotRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = config_path.as_ref().to_string_lossy().into_owned();
        let config = Settings::new(&path)?;
        Ok(Self { config })
    }

    pub fn from_settings(config: Settings) -> Self {
        Self { config }
    }

    pub fn settings(&self) -> &Settings {
        &self.config
    }

    /// Run until Ctrl-C, then drain every engine
    pub async fn run(self) -> Result<SupervisorReport, Box<dyn std::error::Error>> {
        // 1. Setup Logging
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.config.log.level);
        }
        env_logger::try_init().ok();

        info!("Starting BotRunner with {} grids...", self.config.grids.len());

        // 2. Simulated market
        let exchange = Arc::new(PaperExchange::new(&self.config.paper)?);
        let (sim_stop, sim_rx) = watch::channel(false);
        let simulation = tokio::spawn(exchange.clone().run(sim_rx));

        // 3. Ctrl-C handler, installed by the first poll before any order goes out
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);
        let early = futures_util::poll!(&mut interrupt);

        // 4. Supervisor, stopped by Ctrl-C
        let supervisor = Supervisor::new(
            exchange,
            self.config.grids.clone(),
            self.config.engine.clone(),
        );
        let result = supervisor
            .run(async move {
                let outcome = match early {
                    Poll::Ready(outcome) => outcome,
                    Poll::Pending => interrupt.await,
                };
                match outcome {
                    Ok(()) => info!("Interrupt received, shutting down"),
                    Err(e) => error!("Failed to listen for interrupt: {}", e),
                }
            })
            .await;

        let _ = sim_stop.send(true);
        let _ = simulation.await;

        result.map_err(|e| {
            error!("Run aborted: {}", e);
            e.into()
        })
    }
}
