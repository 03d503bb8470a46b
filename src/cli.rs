use std::path::PathBuf;

use clap::Parser;

use crate::error::ConfigError;

/// Train a CNN to read fixed-length captchas.
///
/// Every flag is optional to clap so that missing values are reported one
/// at a time, in a fixed order, by [`Args::into_settings`].
#[derive(Parser, Debug, Default)]
#[command(name = "captcha-trainer", version)]
pub struct Args {
    /// Width of captcha image
    #[arg(long)]
    pub width: Option<u32>,

    /// Height of captcha image
    #[arg(long)]
    pub height: Option<u32>,

    /// Length of captchas in characters
    #[arg(long)]
    pub length: Option<usize>,

    /// How many images in training captcha batches
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Where to look for the training image dataset
    #[arg(long)]
    pub train_dataset: Option<PathBuf>,

    /// Where to look for the validation image dataset
    #[arg(long)]
    pub validate_dataset: Option<PathBuf>,

    /// Where to save the trained model
    #[arg(long)]
    pub output_model_name: Option<PathBuf>,

    /// Where to look for the input model to continue training
    #[arg(long)]
    pub input_model: Option<PathBuf>,

    /// How many training epochs to run
    #[arg(long)]
    pub epochs: Option<usize>,

    /// File with the symbols to use in captchas
    #[arg(long)]
    pub symbols: Option<PathBuf>,

    /// Number of convolution stages
    #[arg(long, default_value_t = 5)]
    pub model_depth: usize,

    /// Convolution blocks per stage
    #[arg(long, default_value_t = 2)]
    pub module_size: usize,

    /// Epochs without validation loss improvement before stopping
    #[arg(long, default_value_t = 3)]
    pub patience: usize,

    /// Seed for weight initialisation and sampling
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub width: u32,
    pub height: u32,
    pub length: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub train_dataset: PathBuf,
    pub validate_dataset: PathBuf,
    pub output_model_name: PathBuf,
    pub input_model: Option<PathBuf>,
    pub symbols: PathBuf,
    pub model_depth: usize,
    pub module_size: usize,
    pub patience: usize,
    pub seed: Option<u64>,
}

impl Args {
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let width = self.width.ok_or(ConfigError::MissingWidth)?;
        let height = self.height.ok_or(ConfigError::MissingHeight)?;
        let length = self.length.ok_or(ConfigError::MissingLength)?;
        let batch_size = self.batch_size.ok_or(ConfigError::MissingBatchSize)?;
        let epochs = self.epochs.ok_or(ConfigError::MissingEpochs)?;
        let train_dataset = self
            .train_dataset
            .ok_or(ConfigError::MissingTrainDataset)?;
        let validate_dataset = self
            .validate_dataset
            .ok_or(ConfigError::MissingValidateDataset)?;
        let output_model_name = self
            .output_model_name
            .ok_or(ConfigError::MissingOutputModelName)?;
        let symbols = self.symbols.ok_or(ConfigError::MissingSymbols)?;

        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        Ok(Settings {
            width,
            height,
            length,
            batch_size,
            epochs,
            train_dataset,
            validate_dataset,
            output_model_name,
            input_model: self.input_model,
            symbols,
            model_depth: self.model_depth,
            module_size: self.module_size,
            patience: self.patience,
            seed: self.seed,
        })
    }
}
