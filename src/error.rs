use std::path::PathBuf;

use thiserror::Error;

/// Problems with the command line, reported before any training happens.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Please specify the captcha image width")]
    MissingWidth,

    #[error("Please specify the captcha image height")]
    MissingHeight,

    #[error("Please specify the captcha length")]
    MissingLength,

    #[error("Please specify the training batch size")]
    MissingBatchSize,

    #[error("Please specify the number of training epochs to run")]
    MissingEpochs,

    #[error("Please specify the path to the training data set")]
    MissingTrainDataset,

    #[error("Please specify the path to the validation data set")]
    MissingValidateDataset,

    #[error("Please specify a name for the trained model")]
    MissingOutputModelName,

    #[error("Please specify the captcha symbols file")]
    MissingSymbols,

    #[error("The training batch size must be greater than zero")]
    ZeroBatchSize,

    #[error("The captcha symbols file {0} contains no symbols")]
    EmptySymbols(PathBuf),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label {label:?} has {found} characters but captchas are {expected} long")]
    TooLong {
        label: String,
        found: usize,
        expected: usize,
    },
}
