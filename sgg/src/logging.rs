//! TensorBoard summary logging.

use crate::common::*;
use async_std::{fs::File, io::BufWriter};

/// The time format naming the event directory of each run.
pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The summary logging worker.
    #[derive(Debug)]
    pub struct LoggingWorker {
        event_writer: EventWriter<BufWriter<File>>,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a worker writing event files under `<output_dir>/events/<start time>`.
        async fn new(output_dir: &Path, rx: broadcast::Receiver<LoggingMessage>) -> Result<Self> {
            let start_time = Local::now();
            let event_dir = output_dir
                .join("events")
                .join(format!("{}", start_time.format(FILE_STRFTIME)));
            let event_path_prefix = event_dir
                .join("sgg")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-UTF-8 event path {:?}", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None::<String>)
                .await?;

            Ok(Self { event_writer, rx })
        }

        /// Run until every sender is dropped.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("summary logging lags behind by {} messages", count);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match kind {
                    LoggingMessageKind::TrainingStep(msg) => {
                        self.log_training_step(&tag, msg).await?;
                    }
                    LoggingMessageKind::Evaluation(msg) => {
                        self.log_evaluation(&tag, msg).await?;
                    }
                }
            }

            Ok(())
        }

        async fn log_training_step(&mut self, tag: &str, msg: TrainingStepLog) -> Result<()> {
            let TrainingStepLog {
                step,
                lr,
                total_loss,
                losses,
            } = msg;
            let step = step as i64;

            self.event_writer
                .write_scalar_async(format!("{}/params/learning_rate", tag), step, lr as f32)
                .await?;
            self.event_writer
                .write_scalar_async(format!("{}/loss/total_loss", tag), step, total_loss as f32)
                .await?;

            for (name, value) in losses {
                self.event_writer
                    .write_scalar_async(format!("{}/loss/{}", tag, name), step, value as f32)
                    .await?;
            }

            Ok(())
        }

        async fn log_evaluation(&mut self, tag: &str, msg: EvaluationLog) -> Result<()> {
            let EvaluationLog { step, metrics } = msg;
            let step = step as i64;

            for (task, metric, value) in metrics {
                self.event_writer
                    .write_scalar_async(format!("{}/{}/{}", tag, task, metric), step, value as f32)
                    .await?;
            }

            Ok(())
        }
    }

    /// Start the summary logging worker and return its join future.
    pub async fn logging_worker(
        output_dir: Arc<PathBuf>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(&output_dir, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Fallible::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, Clone)]
    pub struct LoggingMessage {
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    impl LoggingMessage {
        pub fn new_training_step<S>(tag: S, msg: TrainingStepLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::TrainingStep(msg),
            }
        }

        pub fn new_evaluation<S>(tag: S, msg: EvaluationLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Evaluation(msg),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub enum LoggingMessageKind {
        TrainingStep(TrainingStepLog),
        Evaluation(EvaluationLog),
    }

    #[derive(Debug, Clone)]
    pub struct TrainingStepLog {
        pub step: usize,
        pub lr: f64,
        pub total_loss: f64,
        pub losses: Vec<(String, f64)>,
    }

    /// Metrics as `(task, metric, value)` triples.
    #[derive(Debug, Clone)]
    pub struct EvaluationLog {
        pub step: usize,
        pub metrics: Vec<(String, String, f64)>,
    }
}
