use anyhow::{Context, Result};
use sgg::config::Config;
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};
use structopt::StructOpt;
use tracing::{info, trace_span, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Train and evaluate scene graph generation models
enum Args {
    /// Train the model, then evaluate it on the test split
    Train {
        #[structopt(long, default_value = "sgg.json5")]
        /// configuration file
        config_file: PathBuf,
        #[structopt(long)]
        /// do not evaluate after training
        skip_test: bool,
    },
    /// Evaluate the model restored from a checkpoint
    Test {
        #[structopt(long, default_value = "sgg.json5")]
        /// configuration file
        config_file: PathBuf,
        #[structopt(long)]
        /// save test images with predictions drawn
        visualize: bool,
    },
}

fn load_config(config_file: &Path) -> Result<Arc<Config>> {
    let config = Config::open(config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;
    Ok(Arc::new(config))
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse arguments
    let results = match Args::from_args() {
        Args::Train {
            config_file,
            skip_test,
        } => {
            let config = load_config(&config_file)?;
            sgg::start_train(config, skip_test)
                .instrument(trace_span!("train"))
                .await?
        }
        Args::Test {
            config_file,
            visualize,
        } => {
            let config = load_config(&config_file)?;
            sgg::start_test(config, visualize)
                .instrument(trace_span!("test"))
                .await?
        }
    };

    if let Some(results) = results {
        info!("evaluation results\n{}", results);
    }

    Ok(())
}
