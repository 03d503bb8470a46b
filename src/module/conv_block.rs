use burn::{module::Module, nn::conv::Conv2d, prelude::*, tensor::activation::relu};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};

/// Convolution, batch normalisation and ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        relu(x)
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    channels: [usize; 2],

    #[config(default = "[3, 3]")]
    kernel_size: [usize; 2],
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            // He uniform: bound = sqrt(6 / fan_in)
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_padding(PaddingConfig2d::Same)
                .with_initializer(Initializer::KaimingUniform {
                    gain: 2f64.sqrt(),
                    fan_out_only: false,
                })
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
        }
    }
}
