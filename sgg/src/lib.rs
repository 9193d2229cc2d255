//! The training and evaluation program for scene graph generation.

pub mod checkpoint;
pub mod comm;
pub mod common;
pub mod config;
pub mod data;
pub mod evaluation;
pub mod logging;
pub mod metric_logger;
pub mod solver;
pub mod timer;
pub mod trainer;
pub mod visualize;

use crate::{
    checkpoint::Arguments, comm::ProcessGroup, common::*, config::Config,
    evaluation::EvalResults, logging::LoggingMessage, trainer::SceneGraphGeneration,
};

const LOGGING_CHANNEL_SIZE: usize = 64;

/// Train the model on every configured device, then evaluate it unless `skip_test` is set.
///
/// Returns the evaluation results of the main rank.
pub async fn start_train(config: Arc<Config>, skip_test: bool) -> Result<Option<EvalResults>> {
    run_ranks(config, move |mut model| {
        model.train()?;
        if skip_test {
            return Ok(None);
        }
        model.test(None, false)
    })
    .await
}

/// Evaluate the model restored from the configured checkpoint.
///
/// Returns the evaluation results of the main rank.
pub async fn start_test(config: Arc<Config>, visualize: bool) -> Result<Option<EvalResults>> {
    run_ranks(config, move |model| model.test(None, visualize)).await
}

/// Build a model per device, each on its own blocking thread, and run `f` on every rank.
async fn run_ranks<F>(config: Arc<Config>, f: F) -> Result<Option<EvalResults>>
where
    F: Fn(SceneGraphGeneration) -> Result<Option<EvalResults>> + Send + Sync + 'static,
{
    let output_dir = Arc::new(config.output_dir.clone());

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*output_dir).await?;
        let path = output_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    // start logger
    let (logging_tx, logging_future) = if config.logging.enable_summary {
        let (tx, rx) = broadcast::channel(LOGGING_CHANNEL_SIZE);
        let future = logging::logging_worker(output_dir.clone(), rx).await?;
        (Some(tx), Some(future))
    } else {
        (None, None)
    };

    // one worker per rank
    let world_size = config.device_config.devices().len();
    let group = ProcessGroup::new(world_size)?;
    info!("start {} ranks", world_size);

    let f = Arc::new(f);
    let workers = group.communicators().into_iter().map(|comm| {
        let config = config.clone();
        let f = f.clone();
        let rank = comm.rank();
        let logging_tx: Option<broadcast::Sender<LoggingMessage>> =
            logging_tx.clone().filter(|_| comm.is_main_process());

        tokio::task::spawn_blocking(move || {
            let model = SceneGraphGeneration::build_model(
                config,
                Arguments::default(),
                rank,
                comm,
                logging_tx,
            )?;
            f(model)
        })
        .map(|result| Fallible::Ok(result??))
    });
    let results = future::try_join_all(workers).await?;

    // close the channel to stop the logger
    drop(logging_tx);
    if let Some(future) = logging_future {
        future.await?;
    }

    Ok(results.into_iter().next().flatten())
}
