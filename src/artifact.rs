use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};

use crate::model::{Architecture, CaptchaModel};

pub type WeightsRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Extension the recorder forces onto every weights file. Paths handed to
/// it must already end in it, or a dotted model name gets truncated.
const WEIGHTS_EXTENSION: &str = "mpk";

/// Files written for a model named `<name>`:
///
/// * `<name>.json`: architecture, written once before training
/// * `<name>.mpk`: weights, rewritten after every epoch
/// * `<name>_resume.mpk`: weights saved when training is interrupted
///
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    name: PathBuf,
    recorder: WeightsRecorder,
}

impl ModelArtifacts {
    pub fn new(name: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            recorder: WeightsRecorder::new(),
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        append(&self.name, suffix)
    }

    pub fn architecture(&self) -> PathBuf {
        self.with_suffix(".json")
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.with_suffix(&format!(".{WEIGHTS_EXTENSION}"))
    }

    pub fn resume(&self) -> PathBuf {
        self.with_suffix(&format!("_resume.{WEIGHTS_EXTENSION}"))
    }

    fn create_parent(path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
                .with_context(|| format!("cannot create directory '{}'", parent.display())),
            _ => Ok(()),
        }
    }

    pub fn save_architecture(&self, architecture: &Architecture) -> Result<()> {
        let path = self.architecture();
        Self::create_parent(&path)?;

        let json = serde_json::to_string_pretty(architecture)?;
        fs::write(&path, json)
            .with_context(|| format!("cannot write architecture to '{}'", path.display()))?;

        tracing::info!("Saved model architecture to '{}'", path.display());
        Ok(())
    }

    pub fn load_architecture(&self) -> Result<Architecture> {
        let path = self.architecture();
        let json = fs::read_to_string(&path)
            .with_context(|| format!("cannot read architecture from '{}'", path.display()))?;

        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_checkpoint<B: Backend>(&self, model: &CaptchaModel<B>) -> Result<PathBuf> {
        self.save_weights(model, self.checkpoint())
    }

    pub fn save_resume<B: Backend>(&self, model: &CaptchaModel<B>) -> Result<PathBuf> {
        self.save_weights(model, self.resume())
    }

    fn save_weights<B: Backend>(&self, model: &CaptchaModel<B>, path: PathBuf) -> Result<PathBuf> {
        Self::create_parent(&path)?;

        model
            .clone()
            .save_file(path.clone(), &self.recorder)
            .map_err(|err| anyhow!("cannot save weights to '{}': {err:?}", path.display()))?;

        Ok(path)
    }

    /// Loads weights saved under any name into `model`. The `.mpk`
    /// extension may be left out.
    pub fn load_weights<B: Backend>(
        &self,
        model: CaptchaModel<B>,
        path: &Path,
        device: &B::Device,
    ) -> Result<CaptchaModel<B>> {
        let file = match path.extension() {
            Some(extension) if extension == WEIGHTS_EXTENSION => path.to_path_buf(),
            _ => append(path, &format!(".{WEIGHTS_EXTENSION}")),
        };

        model
            .load_file(file, &self.recorder, device)
            .map_err(|err| anyhow!("cannot load weights from '{}': {err:?}", path.display()))
    }
}

fn append(path: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(path.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}
