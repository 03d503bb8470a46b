use burn::{
    prelude::*,
    tensor::{
        activation::{log_softmax, softmax},
        backend::AutodiffBackend,
    },
};
use nn::{
    pool::{MaxPool2d, MaxPool2dConfig},
    Initializer, Linear, LinearConfig,
};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::{
    data::CaptchaBatch,
    module::conv_block::{ConvBlock, ConvBlockConfig},
    symbols::Alphabet,
};

const BASE_CHANNELS: usize = 32;
/// Channels stop doubling after this many stages.
const MAX_DOUBLINGS: usize = 3;
const KERNEL_SIZE: usize = 3;
const POOL_SIZE: usize = 2;

#[derive(Module, Debug)]
struct Stage<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> Stage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        self.pool.forward(x)
    }
}

/// Shared convolutional trunk with one classification head per captcha
/// character.
#[derive(Module, Debug)]
pub struct CaptchaModel<B: Backend> {
    stages: Vec<Stage<B>>,
    heads: Vec<Linear<B>>,
}

impl<B: Backend> CaptchaModel<B> {
    /// Takes `[batch, height, width, 3]` images and returns the logits of
    /// every head, `[batch, symbol_count]` each.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 2>> {
        let x = images.permute([0, 3, 1, 2]);
        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));
        let x: Tensor<B, 2> = x.flatten(1, 3);

        self.heads
            .iter()
            .map(|head| head.forward(x.clone()))
            .collect()
    }

    pub fn forward_loss(&self, batch: CaptchaBatch<B>) -> CaptchaOutput<B> {
        let device = batch.images.device();
        let logits = self.forward(batch.images);

        let loss = logits
            .iter()
            .zip(&batch.targets)
            .map(|(logits, targets)| categorical_cross_entropy(logits.clone(), targets.clone()))
            .reduce(|total, loss| total + loss)
            .unwrap_or_else(|| Tensor::zeros([1], &device));

        CaptchaOutput {
            loss,
            logits,
            targets: batch.targets,
        }
    }

    /// Most likely class index per head, one `Vec` per image.
    pub fn predict(&self, images: Tensor<B, 4>) -> Result<Vec<Vec<usize>>> {
        let batch_size = images.dims()[0];
        let mut predictions = vec![Vec::with_capacity(self.heads.len()); batch_size];

        for logits in self.forward(images) {
            let classes = softmax(logits, 1)
                .argmax(1)
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .map_err(|err| anyhow!("cannot read predicted classes: {err:?}"))?;

            for (prediction, class) in predictions.iter_mut().zip(classes) {
                prediction.push(class as usize);
            }
        }

        Ok(predictions)
    }

    pub fn predict_text(&self, images: Tensor<B, 4>, alphabet: &Alphabet) -> Result<Vec<String>> {
        Ok(self
            .predict(images)?
            .iter()
            .map(|indices| alphabet.decode(indices))
            .collect())
    }
}

/// Mean over the batch of `-sum(target * log(softmax(logits)))`.
///
/// An all-zero target row contributes nothing.
fn categorical_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    (targets * log_softmax(logits, 1))
        .sum_dim(1)
        .mean()
        .neg()
}

pub struct CaptchaOutput<B: Backend> {
    /// Sum of the per-head losses.
    pub loss: Tensor<B, 1>,
    pub logits: Vec<Tensor<B, 2>>,
    pub targets: Vec<Tensor<B, 2>>,
}

impl<B: Backend> CaptchaOutput<B> {
    pub fn loss_value(&self) -> f64 {
        self.loss.clone().into_scalar().elem::<f64>()
    }

    /// Rows per head whose predicted class matches the target's.
    pub fn correct(&self) -> Vec<usize> {
        self.logits
            .iter()
            .zip(&self.targets)
            .map(|(logits, targets)| {
                let matches: i64 = logits
                    .clone()
                    .argmax(1)
                    .equal(targets.clone().argmax(1))
                    .int()
                    .sum()
                    .into_scalar()
                    .elem();
                matches as usize
            })
            .collect()
    }
}

impl<B: AutodiffBackend> CaptchaOutput<B> {
    pub fn backward(self) -> B::Gradients {
        self.loss.backward()
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Characters per captcha, one head each.
    pub length: usize,
    pub symbol_count: usize,
    pub height: usize,
    pub width: usize,

    /// Number of convolution stages, each ending in a 2x2 max pool.
    #[config(default = 5)]
    pub depth: usize,

    /// Convolution blocks per stage.
    #[config(default = 2)]
    pub module_size: usize,
}

impl ModelConfig {
    fn stage_channels(stage: usize) -> usize {
        BASE_CHANNELS * 2usize.pow(stage.min(MAX_DOUBLINGS) as u32)
    }

    /// `[channels, height, width]` leaving the trunk.
    pub fn trunk_output(&self) -> [usize; 3] {
        let channels = match (self.depth, self.module_size) {
            (0, _) | (_, 0) => 3,
            (depth, _) => Self::stage_channels(depth - 1),
        };
        let shrink = |size: usize| (0..self.depth).fold(size, |size, _| size / POOL_SIZE);

        [channels, shrink(self.height), shrink(self.width)]
    }

    pub fn flattened_features(&self) -> usize {
        self.trunk_output().iter().product()
    }

    pub fn output_names(&self) -> Vec<String> {
        (1..=self.length).map(|i| format!("char_{i}")).collect()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> CaptchaModel<B> {
        let mut input_channels = 3;

        let stages = (0..self.depth)
            .map(|stage| {
                let channels = Self::stage_channels(stage);
                let blocks = (0..self.module_size)
                    .map(|_| {
                        let block = ConvBlockConfig::new([input_channels, channels]).init(device);
                        input_channels = channels;
                        block
                    })
                    .collect();

                Stage {
                    blocks,
                    pool: MaxPool2dConfig::new([POOL_SIZE, POOL_SIZE])
                        .with_strides([POOL_SIZE, POOL_SIZE])
                        .init(),
                }
            })
            .collect();

        let features = self.flattened_features();
        let heads = (0..self.length)
            .map(|_| {
                LinearConfig::new(features, self.symbol_count)
                    .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                    .init(device)
            })
            .collect();

        CaptchaModel { stages, heads }
    }

    /// Layer-by-layer description written next to the weights.
    pub fn architecture(&self) -> Architecture {
        let mut layers = vec![];
        let mut conv_index = 0;
        let mut height = self.height;
        let mut width = self.width;

        for stage in 0..self.depth {
            let filters = Self::stage_channels(stage);
            for _ in 0..self.module_size {
                conv_index += 1;
                layers.push(Layer::Conv2d {
                    name: format!("conv2d_{conv_index}"),
                    filters,
                    kernel_size: KERNEL_SIZE,
                    padding: "same".to_string(),
                    kernel_initializer: "he_uniform".to_string(),
                });
                layers.push(Layer::BatchNorm {
                    name: format!("batch_normalization_{conv_index}"),
                });
                layers.push(Layer::Relu {
                    name: format!("activation_{conv_index}"),
                });
            }

            height /= POOL_SIZE;
            width /= POOL_SIZE;
            layers.push(Layer::MaxPool2d {
                name: format!("max_pooling2d_{}", stage + 1),
                pool_size: POOL_SIZE,
                output_shape: [height, width, filters],
            });
        }

        layers.push(Layer::Flatten {
            name: "flatten".to_string(),
            units: self.flattened_features(),
        });

        let outputs = self.output_names();
        layers.extend(outputs.iter().map(|name| Layer::Dense {
            name: name.clone(),
            units: self.symbol_count,
            activation: "softmax".to_string(),
        }));

        Architecture {
            input_shape: [self.height, self.width, 3],
            layers,
            outputs,
            config: self.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layer {
    Conv2d {
        name: String,
        filters: usize,
        kernel_size: usize,
        padding: String,
        kernel_initializer: String,
    },
    BatchNorm {
        name: String,
    },
    Relu {
        name: String,
    },
    MaxPool2d {
        name: String,
        pool_size: usize,
        output_shape: [usize; 3],
    },
    Flatten {
        name: String,
        units: usize,
    },
    Dense {
        name: String,
        units: usize,
        activation: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Architecture {
    /// `[height, width, channels]`
    pub input_shape: [usize; 3],
    pub layers: Vec<Layer>,
    pub outputs: Vec<String>,
    pub config: ModelConfig,
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ModelConfig {
        ModelConfig::new(4, 36, 8, 12)
            .with_depth(2)
            .with_module_size(1)
    }

    fn one_hot_batch<B: Backend>(device: &B::Device, classes: [usize; 4]) -> CaptchaBatch<B> {
        let targets = classes
            .iter()
            .map(|&class| {
                let mut row = vec![0f32; 36];
                row[class] = 1.0;
                Tensor::<B, 2>::from_data(TensorData::new(row, [1, 36]), device)
            })
            .collect();

        CaptchaBatch {
            images: Tensor::ones([1, 8, 12, 3], device),
            targets,
        }
    }

    #[test]
    fn channels_double_until_cap() {
        let channels: Vec<_> = (0..6).map(ModelConfig::stage_channels).collect();
        assert_eq!(channels, vec![32, 64, 128, 256, 256, 256]);
    }

    #[test]
    fn trunk_output_shrinks_per_stage() {
        let config = ModelConfig::new(4, 36, 50, 200);
        assert_eq!(config.trunk_output(), [256, 1, 6]);
        assert_eq!(config.flattened_features(), 1536);

        assert_eq!(small_config().trunk_output(), [64, 2, 3]);
    }

    #[test]
    fn one_head_per_character() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let logits = model.forward(Tensor::zeros([3, 8, 12, 3], &device));
        assert_eq!(logits.len(), 4);
        for head in logits {
            assert_eq!(head.dims(), [3, 36]);
        }
    }

    #[test]
    fn predict_returns_an_index_per_head() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let predictions = model.predict(Tensor::zeros([2, 8, 12, 3], &device)).unwrap();
        assert_eq!(predictions.len(), 2);
        assert!(predictions
            .iter()
            .all(|indices| indices.len() == 4 && indices.iter().all(|&i| i < 36)));

        let alphabet = Alphabet::new("0123456789abcdefghijklmnopqrstuvwxyz");
        let texts = model
            .predict_text(Tensor::zeros([2, 8, 12, 3], &device), &alphabet)
            .unwrap();
        assert!(texts.iter().all(|text| text.chars().count() == 4));
    }

    #[test]
    fn zero_target_contributes_no_loss() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data([[1.0f32, 2.0, 3.0]], &device);

        let loss = categorical_cross_entropy(logits.clone(), Tensor::zeros([1, 3], &device));
        assert_eq!(loss.into_scalar(), 0.0);

        let loss = categorical_cross_entropy(logits, Tensor::from_data([[0.0f32, 0.0, 1.0]], &device));
        let loss: f32 = loss.into_scalar();
        assert!(loss > 0.0 && loss < 1.0);
    }

    #[test]
    fn loss_sums_heads_and_backpropagates() {
        let device = Default::default();
        let model = small_config().init::<Autodiff<TestBackend>>(&device);

        let output = model.forward_loss(one_hot_batch(&device, [10, 11, 1, 2]));
        assert!(output.loss_value().is_finite());
        assert_eq!(output.correct().len(), 4);
        assert!(output.correct().iter().all(|&correct| correct <= 1));

        let _gradients = output.backward();
    }

    #[test]
    fn correct_counts_matching_rows_per_head() {
        let device = Default::default();
        let tensor = |rows: [[f32; 3]; 2]| Tensor::<TestBackend, 2>::from_data(rows, &device);

        let output = CaptchaOutput {
            loss: Tensor::zeros([1], &device),
            logits: vec![
                tensor([[0.1, 0.9, 0.0], [0.8, 0.1, 0.1]]),
                tensor([[0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]),
                tensor([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]),
            ],
            targets: vec![
                tensor([[0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]),
                tensor([[0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]),
                // Unknown symbols: an all-zero row only matches class 0.
                tensor([[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]),
            ],
        };

        assert_eq!(output.correct(), vec![1, 2, 1]);
    }

    #[test]
    fn architecture_lists_named_outputs() {
        let architecture = small_config().architecture();

        assert_eq!(architecture.input_shape, [8, 12, 3]);
        assert_eq!(
            architecture.outputs,
            vec!["char_1", "char_2", "char_3", "char_4"]
        );

        let convs = architecture
            .layers
            .iter()
            .filter(|layer| matches!(layer, Layer::Conv2d { .. }))
            .count();
        assert_eq!(convs, 2);
        assert!(architecture.layers.contains(&Layer::Flatten {
            name: "flatten".to_string(),
            units: 384,
        }));

        let json = serde_json::to_string(&architecture).unwrap();
        let parsed: Architecture = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.layers, architecture.layers);
    }
}
