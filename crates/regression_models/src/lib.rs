//! Burn encoder-decoder networks for image regression.
//!
//! `RegressionNet` is a four-stage U-Net: paired 3x3 conv + batch-norm + ReLU
//! blocks with max-pool down-sampling and transposed-conv up-sampling. The
//! hourglass variant is the same topology without the encoder-to-decoder
//! skip connections. Output shape always equals input shape; in residual mode
//! the network predicts a correction that is added to its input.
//!
//! Shapes: input/output `[B, nch, H, W]` with `H` and `W` divisible by
//! [`DOWNSAMPLE_FACTOR`].

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Total spatial reduction at the bottleneck (four 2x2 poolings).
pub const DOWNSAMPLE_FACTOR: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    UNet,
    Hourglass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningType {
    /// Output is the prediction itself.
    Plain,
    /// Output is input plus the predicted correction.
    Residual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionNetConfig {
    /// Image channels in and out (`nch`).
    pub channels: usize,
    /// Width of the first stage (`nker`); later stages double it.
    pub base_width: usize,
    pub network: Network,
    pub learning_type: LearningType,
}

impl Default for RegressionNetConfig {
    fn default() -> Self {
        Self {
            channels: 3,
            base_width: 64,
            network: Network::UNet,
            learning_type: LearningType::Plain,
        }
    }
}

/// Checks that a crop can pass through every pooling stage.
pub fn check_input_size(height: usize, width: usize) -> Result<(), String> {
    if height == 0 || width == 0 {
        return Err("image size must be non-zero".to_string());
    }
    if height % DOWNSAMPLE_FACTOR != 0 || width % DOWNSAMPLE_FACTOR != 0 {
        return Err(format!(
            "image size {height}x{width} must be divisible by {DOWNSAMPLE_FACTOR}"
        ));
    }
    Ok(())
}

/// conv3x3 -> batch-norm -> ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(true)
            .init(device);
        let norm = BatchNormConfig::new(out_channels).init(device);
        Self {
            conv,
            norm,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

/// Two [`ConvBlock`]s in sequence; one encoder or decoder stage.
#[derive(Module, Debug)]
pub struct DoubleBlock<B: Backend> {
    first: ConvBlock<B>,
    second: ConvBlock<B>,
}

impl<B: Backend> DoubleBlock<B> {
    pub fn new(
        in_channels: usize,
        mid_channels: usize,
        out_channels: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            first: ConvBlock::new(in_channels, mid_channels, device),
            second: ConvBlock::new(mid_channels, out_channels, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.second.forward(self.first.forward(input))
    }
}

fn upsample<B: Backend>(channels: usize, device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([channels, channels], [2, 2])
        .with_stride([2, 2])
        .with_bias(true)
        .init(device)
}

#[derive(Module, Debug)]
pub struct RegressionNet<B: Backend> {
    enc1: DoubleBlock<B>,
    enc2: DoubleBlock<B>,
    enc3: DoubleBlock<B>,
    enc4: DoubleBlock<B>,
    bottleneck: DoubleBlock<B>,
    up4: ConvTranspose2d<B>,
    dec4: DoubleBlock<B>,
    up3: ConvTranspose2d<B>,
    dec3: DoubleBlock<B>,
    up2: ConvTranspose2d<B>,
    dec2: DoubleBlock<B>,
    up1: ConvTranspose2d<B>,
    dec1: DoubleBlock<B>,
    head: Conv2d<B>,
    pool: MaxPool2d,
    pub config: Ignored<RegressionNetConfig>,
}

impl<B: Backend> RegressionNet<B> {
    pub fn new(config: RegressionNetConfig, device: &B::Device) -> Self {
        let k = config.base_width.max(1);
        let nch = config.channels;
        // Decoder inputs double when the encoder features are concatenated.
        let skip = match config.network {
            Network::UNet => 2,
            Network::Hourglass => 1,
        };

        Self {
            enc1: DoubleBlock::new(nch, k, k, device),
            enc2: DoubleBlock::new(k, 2 * k, 2 * k, device),
            enc3: DoubleBlock::new(2 * k, 4 * k, 4 * k, device),
            enc4: DoubleBlock::new(4 * k, 8 * k, 8 * k, device),
            bottleneck: DoubleBlock::new(8 * k, 16 * k, 8 * k, device),
            up4: upsample(8 * k, device),
            dec4: DoubleBlock::new(skip * 8 * k, 8 * k, 4 * k, device),
            up3: upsample(4 * k, device),
            dec3: DoubleBlock::new(skip * 4 * k, 4 * k, 2 * k, device),
            up2: upsample(2 * k, device),
            dec2: DoubleBlock::new(skip * 2 * k, 2 * k, k, device),
            up1: upsample(k, device),
            dec1: DoubleBlock::new(skip * k, k, k, device),
            head: Conv2dConfig::new([k, nch], [1, 1])
                .with_padding(PaddingConfig2d::Valid)
                .with_bias(true)
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            config: Ignored(config),
        }
    }

    pub fn config(&self) -> RegressionNetConfig {
        self.config.0
    }

    /// `[B, nch, H, W]` -> `[B, nch, H, W]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let e1 = self.enc1.forward(input.clone());
        let e2 = self.enc2.forward(self.pool.forward(e1.clone()));
        let e3 = self.enc3.forward(self.pool.forward(e2.clone()));
        let e4 = self.enc4.forward(self.pool.forward(e3.clone()));
        let b = self.bottleneck.forward(self.pool.forward(e4.clone()));

        let d4 = self.dec4.forward(self.merge(self.up4.forward(b), e4));
        let d3 = self.dec3.forward(self.merge(self.up3.forward(d4), e3));
        let d2 = self.dec2.forward(self.merge(self.up2.forward(d3), e2));
        let d1 = self.dec1.forward(self.merge(self.up1.forward(d2), e1));
        let out = self.head.forward(d1);

        match self.config.0.learning_type {
            LearningType::Plain => out,
            LearningType::Residual => out + input,
        }
    }

    fn merge(&self, up: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.config.0.network {
            Network::UNet => Tensor::cat(vec![up, skip], 1),
            Network::Hourglass => up,
        }
    }
}

pub mod prelude {
    pub use super::{
        check_input_size, LearningType, Network, RegressionNet, RegressionNetConfig,
        DOWNSAMPLE_FACTOR,
    };
}
