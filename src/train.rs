use crate::data::{CyclicCursor, ExampleSet, OneHotIndexing, StampGeometry};
use crate::error::{Operation, Result, StampNetError};
use crate::model::{accuracy, cross_entropy, ConvNet, ConvNetConfig};
use crate::source::StampSource;
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;
use std::path::Path;

/// Dropout keep probability used whenever accuracy is measured.
pub const EVAL_KEEP_PROB: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub steps: usize,
    pub report_interval: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub dropout_keep_prob: f32,
    pub geometry: StampGeometry,
    pub model: ConvNetConfig,
    pub one_hot: OneHotIndexing,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            steps: 20_000,
            report_interval: 1000,
            batch_size: 50,
            learning_rate: 1e-4,
            dropout_keep_prob: 0.5,
            geometry: StampGeometry::default(),
            model: ConvNetConfig::default(),
            one_hot: OneHotIndexing::default(),
            seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        if self.batch_size == 0 {
            return Err(StampNetError::PreconditionViolation(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.report_interval == 0 {
            return Err(StampNetError::PreconditionViolation(
                "report interval must be at least 1".to_string(),
            ));
        }
        if !(self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0) {
            return Err(StampNetError::PreconditionViolation(format!(
                "dropout keep probability {} must lie in (0, 1]",
                self.dropout_keep_prob
            )));
        }
        if !(self.learning_rate > 0.0) {
            return Err(StampNetError::PreconditionViolation(format!(
                "learning rate {} must be positive",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Receives the periodic training-accuracy measurements. A failing sink
/// aborts the training run.
pub trait ProgressSink {
    fn report(&mut self, step: usize, accuracy: f32) -> Result<()>;
}

pub fn progress_line(step: usize, accuracy: f32) -> String {
    format!("step {step}, training accuracy {accuracy}")
}

/// Writes [`progress_line`]s to stdout.
pub struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn report(&mut self, step: usize, accuracy: f32) -> Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", progress_line(step, accuracy))?;
        Ok(())
    }
}

impl ProgressSink for Vec<(usize, f32)> {
    fn report(&mut self, step: usize, accuracy: f32) -> Result<()> {
        self.push((step, accuracy));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Training { step: usize },
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub steps: usize,
    pub final_loss: Option<f32>,
}

/// Caller-owned training session: device, lifecycle state and, once
/// trained, the model parameters.
pub struct TrainingSession {
    device: Device,
    state: SessionState,
    model: Option<ConvNet>,
}

impl TrainingSession {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: SessionState::Uninitialized,
            model: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model(&self) -> Option<&ConvNet> {
        self.model.as_ref()
    }

    /// Load the design matrix through `source`, then train on it.
    pub fn train_from_source<S: StampSource>(
        &mut self,
        source: &S,
        runs: &[u32],
        expids: &[u32],
        artifacts: &[S::Artifact],
        cfg: &TrainConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<TrainReport> {
        cfg.validate()?;
        let files = source.training_filenames(runs, expids)?;
        let matrix = source.design_matrix(&files, artifacts, cfg.geometry)?;
        let labels = source.enumerate_labels(&matrix.labels);
        tracing::info!(
            examples = labels.len(),
            images = files.images.len(),
            "Loaded design matrix"
        );
        let examples = ExampleSet::from_labels(
            matrix.features,
            matrix.n_features,
            &labels,
            cfg.one_hot,
            &self.device,
        )?;
        self.train(&examples, cfg, sink)
    }

    /// Train a freshly initialised network on an already built example set.
    pub fn train(
        &mut self,
        examples: &ExampleSet,
        cfg: &TrainConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<TrainReport> {
        cfg.validate()?;
        if examples.n_features() != cfg.geometry.n_features() {
            return Err(StampNetError::DataShapeMismatch(format!(
                "examples have {} features, geometry {}x{} needs {}",
                examples.n_features(),
                cfg.geometry.side(),
                cfg.geometry.side(),
                cfg.geometry.n_features()
            )));
        }

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let model = ConvNet::new(
            &cfg.model,
            cfg.geometry.side(),
            examples.n_categories(),
            &self.device,
            &mut rng,
        )?;
        let params = ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optim = AdamW::new(model.varmap().all_vars(), params)?;
        tracing::info!(
            examples = examples.len(),
            categories = examples.n_categories(),
            steps = cfg.steps,
            batch_size = cfg.batch_size,
            "Starting training"
        );

        let final_loss = match self.run_steps(&model, &mut optim, examples, cfg, sink) {
            Ok(loss) => loss,
            Err(e) => {
                self.state = SessionState::Uninitialized;
                self.model = None;
                tracing::warn!("Training aborted: {e}");
                return Err(e);
            }
        };

        self.model = Some(model);
        self.state = SessionState::Done;
        tracing::info!(steps = cfg.steps, ?final_loss, "Training complete");
        Ok(TrainReport {
            steps: cfg.steps,
            final_loss,
        })
    }

    /// The step loop proper; returns the loss of the last step.
    fn run_steps(
        &mut self,
        model: &ConvNet,
        optim: &mut AdamW,
        examples: &ExampleSet,
        cfg: &TrainConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<Option<f32>> {
        let mut cursor = CyclicCursor::new(examples.len())?;
        let mut final_loss = None;
        for i in 0..cfg.steps {
            self.state = SessionState::Training { step: i };
            let indices = cursor.next_batch(cfg.batch_size);
            let (x, y) = examples.batch(&indices)?;

            if i % cfg.report_interval == 0 {
                let probs = model.forward(&x, EVAL_KEEP_PROB)?;
                let train_accuracy = accuracy(&probs, &y)?;
                tracing::info!(step = i, train_accuracy, "Training accuracy");
                sink.report(i, train_accuracy)?;
            }

            let logits = model.logits(&x, cfg.dropout_keep_prob)?;
            let loss = cross_entropy(&logits, &y)?;
            optim.backward_step(&loss)?;
            if i + 1 == cfg.steps {
                final_loss = Some(loss.to_scalar::<f32>()?);
            }
        }
        Ok(final_loss)
    }

    /// Evaluation on held-out data is not supported.
    pub fn test<T: ?Sized>(&self, _test_data: &T) -> Result<f32> {
        Err(StampNetError::UnimplementedOperation(Operation::Test))
    }

    /// Checkpoint writing is not supported.
    pub fn save_model(&self, _path: &Path) -> Result<()> {
        Err(StampNetError::UnimplementedOperation(Operation::SaveModel))
    }

    /// Checkpoint loading is not supported.
    pub fn resume_from(&mut self, _path: &Path) -> Result<()> {
        Err(StampNetError::UnimplementedOperation(Operation::ResumeFrom))
    }
}
