use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};
use burn::{
    config::Config,
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::backend::{AutodiffBackend, Backend},
    train::TrainingInterrupter,
};

use crate::{
    artifact::ModelArtifacts,
    cli::Settings,
    data::{CaptchaBatcher, ImageSequence},
    model::{CaptchaModel, ModelConfig},
    symbols::Alphabet,
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,

    pub optimizer: AdamConfig,

    pub epoch_count: usize,

    pub batch_size: usize,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    /// Epochs without validation loss improvement before stopping.
    #[config(default = 3)]
    pub patience: usize,
}

impl TrainingConfig {
    pub fn from_settings(settings: &Settings, alphabet: &Alphabet) -> Self {
        let model = ModelConfig::new(
            settings.length,
            alphabet.len(),
            settings.height as usize,
            settings.width as usize,
        )
        .with_depth(settings.model_depth)
        .with_module_size(settings.module_size);

        TrainingConfig::new(
            model,
            AdamConfig::new().with_epsilon(1e-7),
            settings.epochs,
            settings.batch_size,
        )
        .with_patience(settings.patience)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    /// `None` when the validation set is smaller than one batch.
    pub valid_loss: Option<f64>,
    /// Categorical accuracy of each head, `char_1` first.
    pub valid_accuracy: Vec<f64>,
    /// Weights saved at the end of the epoch, improved or not.
    pub checkpoint: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    EarlyStopped,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub epochs: Vec<EpochMetrics>,
    pub stop: StopReason,
}

/// Stops once the monitored loss has not improved for `patience` epochs.
#[derive(Debug)]
struct EarlyStopping {
    patience: usize,
    best: f64,
    wait: usize,
}

impl EarlyStopping {
    fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Records an epoch's loss and tells whether training should stop.
    fn update(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            self.wait = 0;
            return false;
        }

        self.wait += 1;
        self.wait >= self.patience
    }
}

pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    artifacts: ModelArtifacts,
    train: ImageSequence,
    valid: ImageSequence,
    batcher_train: CaptchaBatcher<B>,
    batcher_valid: CaptchaBatcher<B::InnerBackend>,
    interrupter: TrainingInterrupter,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        settings: &Settings,
        alphabet: Alphabet,
        device: &B::Device,
        interrupter: TrainingInterrupter,
    ) -> Result<Self> {
        let config = TrainingConfig::from_settings(settings, &alphabet);
        let [_, trunk_height, trunk_width] = config.model.trunk_output();
        ensure!(
            trunk_height > 0 && trunk_width > 0,
            "a {}x{} image is too small for {} pooling stages",
            settings.width,
            settings.height,
            config.model.depth
        );

        let mut train = ImageSequence::new(
            &settings.train_dataset,
            settings.batch_size,
            settings.length,
            alphabet.clone(),
            settings.width,
            settings.height,
        )?;
        let mut valid = ImageSequence::new(
            &settings.validate_dataset,
            settings.batch_size,
            settings.length,
            alphabet,
            settings.width,
            settings.height,
        )?;
        if let Some(seed) = settings.seed {
            train = train.with_seed(seed);
            valid = valid.with_seed(seed.wrapping_add(1));
        }

        let width = settings.width as usize;
        let height = settings.height as usize;
        let symbol_count = config.model.symbol_count;

        Ok(Self {
            artifacts: ModelArtifacts::new(&settings.output_model_name),
            train,
            valid,
            batcher_train: CaptchaBatcher::new(
                device.clone(),
                width,
                height,
                settings.length,
                symbol_count,
            ),
            batcher_valid: CaptchaBatcher::new(
                device.clone(),
                width,
                height,
                settings.length,
                symbol_count,
            ),
            interrupter,
            config,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ModelArtifacts {
        &self.artifacts
    }

    pub fn init_model(
        &self,
        input_model: Option<&Path>,
        device: &B::Device,
    ) -> Result<CaptchaModel<B>> {
        let model = self.config.model.init::<B>(device);

        match input_model {
            Some(path) => {
                tracing::info!("Loading weights from '{}'", path.display());
                self.artifacts.load_weights(model, path, device)
            }
            None => Ok(model),
        }
    }

    /// Runs the training loop, checkpointing after every epoch.
    pub fn fit(&mut self, mut model: CaptchaModel<B>) -> Result<(CaptchaModel<B>, TrainingReport)> {
        let mut optim = self.config.optimizer.init();
        let mut early_stopping = EarlyStopping::new(self.config.patience);
        let mut epochs = vec![];

        tracing::info!(
            "Training for {} epochs: {} train and {} validation batches of {}",
            self.config.epoch_count,
            self.train.len(),
            self.valid.len(),
            self.config.batch_size
        );
        if self.valid.is_empty() {
            tracing::warn!("Validation set is smaller than one batch, early stopping is disabled");
        }

        for epoch in 1..=self.config.epoch_count {
            let mut loss_sum = 0.0;
            let steps = self.train.len();

            for index in 0..steps {
                if self.interrupter.should_stop() {
                    return self.interrupted(model, epochs, epoch);
                }

                let batch = self.batcher_train.batch(self.train.get(index)?);
                let output = model.forward_loss(batch);
                loss_sum += output.loss_value();

                let grads = GradientsParams::from_grads(output.backward(), &model);
                model = optim.step(self.config.learning_rate, model, grads);

                tracing::debug!("Epoch {epoch} step {}/{steps}", index + 1);
            }

            let Some((valid_loss, valid_accuracy)) = self.validate(&model.valid())? else {
                return self.interrupted(model, epochs, epoch);
            };

            let checkpoint = self.artifacts.save_checkpoint(&model)?;
            let metrics = EpochMetrics {
                epoch,
                train_loss: loss_sum / steps.max(1) as f64,
                valid_loss,
                valid_accuracy,
                checkpoint,
            };
            log_epoch(&metrics, self.config.epoch_count);
            tracing::info!("Saved checkpoint to '{}'", metrics.checkpoint.display());

            let stop = metrics
                .valid_loss
                .is_some_and(|loss| early_stopping.update(loss));
            epochs.push(metrics);

            if stop {
                tracing::info!(
                    "Validation loss has not improved for {} epochs, stopping",
                    self.config.patience
                );
                return Ok((
                    model,
                    TrainingReport {
                        epochs,
                        stop: StopReason::EarlyStopped,
                    },
                ));
            }
        }

        Ok((
            model,
            TrainingReport {
                epochs,
                stop: StopReason::Completed,
            },
        ))
    }

    /// Mean loss and per-head accuracy over one pass of the validation set,
    /// or `None` if interrupted. The loss is `None` for an empty set.
    #[allow(clippy::type_complexity)]
    fn validate(
        &mut self,
        model: &CaptchaModel<B::InnerBackend>,
    ) -> Result<Option<(Option<f64>, Vec<f64>)>> {
        let length = self.config.model.length;
        let mut loss_sum = 0.0;
        let mut correct = vec![0; length];
        let mut seen = 0;

        for index in 0..self.valid.len() {
            if self.interrupter.should_stop() {
                return Ok(None);
            }

            let items = self.valid.get(index)?;
            seen += items.len();

            let output = model.forward_loss(self.batcher_valid.batch(items));
            loss_sum += output.loss_value();
            for (total, head) in correct.iter_mut().zip(output.correct()) {
                *total += head;
            }
        }

        if seen == 0 {
            return Ok(Some((None, vec![0.0; length])));
        }

        Ok(Some((
            Some(loss_sum / self.valid.len() as f64),
            head_accuracy(&correct, seen),
        )))
    }

    fn interrupted(
        &self,
        model: CaptchaModel<B>,
        epochs: Vec<EpochMetrics>,
        epoch: usize,
    ) -> Result<(CaptchaModel<B>, TrainingReport)> {
        let path = self.artifacts.resume();
        tracing::warn!(
            "Interrupted during epoch {epoch}, saving current weights as '{}'",
            path.display()
        );
        self.artifacts.save_resume(&model)?;

        Ok((
            model,
            TrainingReport {
                epochs,
                stop: StopReason::Interrupted,
            },
        ))
    }
}

/// Fraction of the `seen` rows each head got right.
fn head_accuracy(correct: &[usize], seen: usize) -> Vec<f64> {
    correct
        .iter()
        .map(|&head| head as f64 / seen.max(1) as f64)
        .collect()
}

fn log_epoch(metrics: &EpochMetrics, epoch_count: usize) {
    let accuracy = metrics
        .valid_accuracy
        .iter()
        .enumerate()
        .map(|(head, accuracy)| format!("char_{}_accuracy={accuracy:.4}", head + 1))
        .collect::<Vec<_>>()
        .join(" ");

    match metrics.valid_loss {
        Some(valid_loss) => tracing::info!(
            "Epoch {}/{epoch_count} loss={:.4} val_loss={valid_loss:.4} {accuracy}",
            metrics.epoch,
            metrics.train_loss
        ),
        None => tracing::info!(
            "Epoch {}/{epoch_count} loss={:.4}",
            metrics.epoch,
            metrics.train_loss
        ),
    }
}

/// Builds the model, writes its architecture and trains it.
pub fn train<B: AutodiffBackend>(
    settings: &Settings,
    device: B::Device,
    interrupter: TrainingInterrupter,
) -> Result<TrainingReport> {
    let alphabet = Alphabet::load(&settings.symbols)?;
    tracing::info!("Loaded {} captcha symbols", alphabet.len());

    if let Some(seed) = settings.seed {
        B::seed(seed);
    }

    let mut trainer = Trainer::<B>::new(settings, alphabet, &device, interrupter)?;
    let model = trainer.init_model(settings.input_model.as_deref(), &device)?;

    let config = &trainer.config().model;
    tracing::info!(
        "Model: {} stages of {} blocks, {} heads, {} features, {} parameters",
        config.depth,
        config.module_size,
        config.length,
        config.flattened_features(),
        model.num_params()
    );

    trainer
        .artifacts()
        .save_architecture(&trainer.config().model.architecture())?;

    let (_, report) = trainer.fit(model)?;
    Ok(report)
}

/// Device used when no backend specific device is requested.
pub fn default_device<B: Backend>() -> B::Device {
    Default::default()
}
