//! The scene graph generation training and evaluation driver.

use crate::{
    checkpoint::{Arguments, Checkpointer},
    comm::{accumulate_predictions, Communicator},
    common::*,
    config::Config,
    data::{make_data_loader, Batch, DataLoader, Split},
    evaluation::{evaluate, EvalArgs, EvalResults, IouType},
    logging::{EvaluationLog, LoggingMessage, TrainingStepLog},
    metric_logger::MetricLogger,
    solver::{build_optimizer, WarmupMultiStepLr},
    timer::{time_str, Timer},
    visualize::Visualizer,
};

const MODEL_NAME: &str = "scene_parser";
const INFERENCE_LOG_PERIOD: usize = 10;

/// Owns the model, the optimization state and the data loaders of one rank.
pub struct SceneGraphGeneration {
    config: Arc<Config>,
    arguments: Arguments,
    comm: Communicator,
    device: Device,
    vs: nn::VarStore,
    scene_parser: SceneParser,
    optimizer: nn::Optimizer,
    scheduler: WarmupMultiStepLr,
    checkpointer: Checkpointer,
    data_loader_train: DataLoader,
    data_loader_test: DataLoader,
    logging_tx: Option<broadcast::Sender<LoggingMessage>>,
}

impl Debug for SceneGraphGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneGraphGeneration")
            .field("arguments", &self.arguments)
            .field("rank", &self.comm.rank())
            .field("device", &self.device)
            .finish()
    }
}

impl SceneGraphGeneration {
    /// Build the model, solver, checkpointer and data loaders of the rank `local_rank`.
    ///
    /// The arguments stored in the loaded checkpoint, if any, replace `arguments`.
    pub fn build_model(
        config: Arc<Config>,
        arguments: Arguments,
        local_rank: usize,
        comm: Communicator,
        logging_tx: Option<broadcast::Sender<LoggingMessage>>,
    ) -> Result<Self> {
        let devices = config.device_config.devices();
        let device = *devices.get(local_rank).ok_or_else(|| {
            format_err!(
                "rank {} has no device, only {} devices are configured",
                local_rank,
                devices.len()
            )
        })?;
        info!("rank {} uses device {:?}", local_rank, device);

        let mut vs = nn::VarStore::new(device);
        let scene_parser = SceneParser::new(
            vs.root() / MODEL_NAME,
            &config.model.scene_parser,
            config.model.box_only(),
        )?;

        let checkpointer = Checkpointer::new(&config.output_dir, comm.is_main_process());
        let arguments = match checkpointer.load(&mut vs, &config.resume)? {
            Some(extra) => extra,
            None => arguments,
        };

        // start every rank from the same weights
        if comm.is_distributed() {
            let variables: Vec<Tensor> = vs
                .variables()
                .into_iter()
                .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
                .map(|(_, var)| var)
                .collect();
            comm.broadcast_(&variables, 0)?;
        }

        let optimizer = build_optimizer(&vs, &config.solver)?;
        let scheduler = WarmupMultiStepLr::new(&config.solver, arguments.iteration)?;

        let data_loader_train = make_data_loader(&config, Split::Train, &comm, arguments.iteration)?;
        let data_loader_test = make_data_loader(&config, Split::Test, &comm, 0)?;

        let num_classes = data_loader_test.dataset().num_classes();
        ensure!(
            num_classes == config.model.scene_parser.num_classes,
            "the dataset has {} classes including background, but the model is configured with {}",
            num_classes,
            config.model.scene_parser.num_classes
        );

        Ok(Self {
            config,
            arguments,
            comm,
            device,
            vs,
            scene_parser,
            optimizer,
            scheduler,
            checkpointer,
            data_loader_train,
            data_loader_test,
            logging_tx,
        })
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn scene_parser(&self) -> &SceneParser {
        &self.scene_parser
    }

    /// Train from `arguments.iteration` until the configured maximum iteration.
    pub fn train(&mut self) -> Result<()> {
        info!("Start training");

        let max_iter = self.data_loader_train.len();
        let start_iter = self.arguments.iteration;
        let log_period = self.config.logging.log_period.get();
        let checkpoint_period = self.config.solver.checkpoint_period.get();

        let mut meters = MetricLogger::default();
        let start_training_time = Instant::now();
        let mut end = Instant::now();

        for result in self.data_loader_train.iter() {
            let (iteration, batch) = result?;
            let data_time = end.elapsed().as_secs_f64();
            self.arguments.iteration = iteration;

            let lr = self.scheduler.step();
            self.optimizer.set_lr(lr);

            let Batch {
                images, targets, ..
            } = batch;
            let images = images.to_device(self.device);

            let loss_dict = self.scene_parser.forward_train(&images, &targets)?;
            let losses = loss_dict.total();

            // reduce losses over all ranks for logging
            let reduced = self.reduce_loss_dict(&loss_dict)?;
            let reduced_total = total_loss(&reduced, iteration)?;

            self.optimizer.zero_grad();
            losses.backward();
            self.all_reduce_gradients()?;
            self.optimizer.step();

            let batch_time = end.elapsed().as_secs_f64();
            end = Instant::now();

            meters.update("loss", reduced_total);
            for (name, value) in &reduced {
                meters.update(name.as_str(), *value);
            }
            meters.update("time", batch_time);
            meters.update("data", data_time);

            if iteration % log_period == 0 || iteration + 1 == max_iter {
                let eta_seconds = meters
                    .get("time")
                    .map(|meter| meter.global_avg())
                    .unwrap_or(0.0)
                    * (max_iter - iteration) as f64;
                info!(
                    "{}",
                    [
                        format!("model: {}", MODEL_NAME),
                        format!("eta: {}", time_str(eta_seconds)),
                        format!("iter: {}/{}", iteration, max_iter),
                        meters.to_string(),
                        format!("lr: {:.6}", lr),
                    ]
                    .join("  ")
                );
            }

            if (iteration + 1) % checkpoint_period == 0 {
                self.save_checkpoint(&format!("checkpoint_{:07}", iteration), iteration + 1)?;
            }
            if iteration + 1 == max_iter {
                self.save_checkpoint("checkpoint_final", iteration + 1)?;
            }

            if let Some(tx) = &self.logging_tx {
                let msg = LoggingMessage::new_training_step(
                    "train",
                    TrainingStepLog {
                        step: iteration,
                        lr,
                        total_loss: reduced_total,
                        losses: reduced,
                    },
                );
                tx.send(msg)
                    .map_err(|_| format_err!("cannot send message to logger"))?;
            }
        }

        let total_training_time = start_training_time.elapsed().as_secs_f64();
        let num_iters = max_iter.saturating_sub(start_iter).max(1);
        info!(
            "Total training time: {} ({:.4} s / it)",
            time_str(total_training_time),
            total_training_time / num_iters as f64
        );

        Ok(())
    }

    /// Run inference on the test split and evaluate on the main rank.
    ///
    /// Non-main ranks return `None`. If `timer` is given, it times the forward passes.
    pub fn test(&self, mut timer: Option<&mut Timer>, visualize: bool) -> Result<Option<EvalResults>> {
        let dataset = self.data_loader_test.dataset();
        let world_size = self.comm.world_size();
        info!(
            target: "sgg::inference",
            "Start evaluation on test dataset({} images).",
            dataset.len()
        );

        let visualizer = if visualize {
            Some(Visualizer::new(&self.config.output_dir, &self.config.visualize)?)
        } else {
            None
        };

        let mut total_timer = Timer::new();
        let mut inference_timer = Timer::new();
        total_timer.tic();

        let num_batches = self.data_loader_test.len();
        let mut results_dict: BTreeMap<usize, Detections> = BTreeMap::new();

        for result in self.data_loader_test.iter() {
            let (index, batch) = result?;
            if index % INFERENCE_LOG_PERIOD == 0 {
                info!(
                    target: "sgg::inference",
                    "inference on batch {}/{}...",
                    index,
                    num_batches
                );
            }

            let Batch {
                images, image_ids, ..
            } = batch;
            let images = images.to_device(self.device);

            if let Some(timer) = timer.as_deref_mut() {
                timer.tic();
            }
            inference_timer.tic();
            let output = self.scene_parser.forward_inference(&images)?;
            inference_timer.toc();
            if let Some(timer) = timer.as_deref_mut() {
                timer.toc();
            }

            if let Some(visualizer) = &visualizer {
                visualizer.visualize_detection(dataset, &image_ids, &images, &output)?;
            }

            results_dict.extend(izip!(image_ids, output));
        }

        self.comm.synchronize();

        let total_time = total_timer.toc();
        info!(
            target: "sgg::inference",
            "Total run time: {} ({:.4} s / img per device, on {} devices)",
            time_str(total_time),
            total_time * world_size as f64 / dataset.len().max(1) as f64,
            world_size
        );
        let inference_time = inference_timer.total_time();
        info!(
            target: "sgg::inference",
            "Model inference time: {} ({:.4} s / img per device, on {} devices)",
            time_str(inference_time),
            inference_time * world_size as f64 / dataset.len().max(1) as f64,
            world_size
        );

        let predictions = match accumulate_predictions(&self.comm, results_dict)? {
            Some(predictions) => predictions,
            None => return Ok(None),
        };

        let output_folder = self.config.output_dir.join("results");
        fs::create_dir_all(&output_folder)?;
        let predictions_file = output_folder.join("predictions.json");
        fs::write(&predictions_file, serde_json::to_string(&predictions)?)
            .with_context(|| format!("failed to write '{}'", predictions_file.display()))?;

        let args = EvalArgs {
            box_only: self.config.model.box_only(),
            iou_types: vec![IouType::Bbox],
            expected_results: self.config.test.expected_results.clone(),
            expected_results_sigma_tol: self.config.test.expected_results_sigma_tol,
        };
        let results = evaluate(dataset, &predictions, Some(&output_folder), &args)?;

        if let Some(tx) = &self.logging_tx {
            let metrics = results
                .iter()
                .map(|(task, metric, value)| (task.to_string(), metric.to_string(), value))
                .collect();
            let msg = LoggingMessage::new_evaluation(
                "test",
                EvaluationLog {
                    step: self.arguments.iteration,
                    metrics,
                },
            );
            tx.send(msg)
                .map_err(|_| format_err!("cannot send message to logger"))?;
        }

        Ok(Some(results))
    }

    fn save_checkpoint(&self, name: &str, next_iteration: usize) -> Result<()> {
        let arguments = Arguments {
            iteration: next_iteration,
        };
        self.checkpointer.save(&self.vs, name, &arguments)
    }

    /// Average each loss term over ranks.
    fn reduce_loss_dict(&self, loss_dict: &LossDict) -> Result<Vec<(String, f64)>> {
        let scalars = loss_dict.to_scalars();
        if !self.comm.is_distributed() {
            return Ok(scalars);
        }

        let world_size = self.comm.world_size() as f64;
        let gathered = self.comm.all_gather(&scalars)?;
        let reduced = scalars
            .iter()
            .enumerate()
            .map(|(index, (name, _))| {
                let sum: f64 = gathered.iter().map(|scalars| scalars[index].1).sum();
                (name.clone(), sum / world_size)
            })
            .collect();
        Ok(reduced)
    }

    fn all_reduce_gradients(&self) -> Result<()> {
        if !self.comm.is_distributed() {
            return Ok(());
        }

        let grads: Vec<Tensor> = self
            .vs
            .variables()
            .into_iter()
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .filter(|(_, var)| var.requires_grad())
            .map(|(_, var)| var.grad())
            .filter(|grad| grad.defined())
            .collect();
        self.comm.all_reduce_mean_(&grads)
    }
}

/// Sum the reduced loss terms, failing when the sum is not finite.
fn total_loss(reduced: &[(String, f64)], iteration: usize) -> Result<f64> {
    let total: f64 = reduced.iter().map(|(_, value)| value).sum();
    ensure!(
        total.is_finite(),
        "Loss is {} at iteration {}, stopping training",
        total,
        iteration
    );
    Ok(total)
}
