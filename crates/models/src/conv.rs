//! Convolution building blocks shared by both classifiers.
//!
//! 1-D models reshape `[B, C, T]` to `[B, C, 1, T]` and use `1 x k` kernels,
//! so one `Conv2d` implementation serves both dimensionalities.

use crate::ModelError;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvDim {
    One,
    Two,
}

impl TryFrom<usize> for ConvDim {
    type Error = ModelError;

    fn try_from(dim: usize) -> Result<Self, Self::Error> {
        match dim {
            1 => Ok(ConvDim::One),
            2 => Ok(ConvDim::Two),
            other => Err(ModelError::UnsupportedDim(other)),
        }
    }
}

impl ConvDim {
    /// Callers only store dims that passed validation; anything but 1 is 2-D.
    pub(crate) fn from_stored(dim: usize) -> Self {
        if dim == 1 {
            ConvDim::One
        } else {
            ConvDim::Two
        }
    }

    pub fn kernel(self, k: usize) -> [usize; 2] {
        match self {
            ConvDim::One => [1, k],
            ConvDim::Two => [k, k],
        }
    }

    pub fn padding(self, p: usize) -> PaddingConfig2d {
        match self {
            ConvDim::One => PaddingConfig2d::Explicit(0, p),
            ConvDim::Two => PaddingConfig2d::Explicit(p, p),
        }
    }

    /// Channels seen by the first convolution.
    pub fn image_channels(self, in_channels: usize) -> usize {
        match self {
            ConvDim::One => in_channels,
            ConvDim::Two => 1,
        }
    }

    pub fn to_image<B: Backend>(self, input: Tensor<B, 3>) -> Tensor<B, 4> {
        match self {
            ConvDim::One => {
                let [batch, channels, time] = input.dims();
                input.reshape([batch, channels, 1, time])
            }
            ConvDim::Two => input.unsqueeze_dim(1),
        }
    }

    pub fn max_pool(self, k: usize, stride: usize, padding: usize) -> WindowMaxPool {
        let padding = match self {
            ConvDim::One => [0, padding],
            ConvDim::Two => [padding, padding],
        };
        WindowMaxPool {
            kernel: self.kernel(k),
            stride: self.kernel(stride),
            padding,
        }
    }
}

/// Max pooling over `[B, C, H, W]` built from strided views and element-wise
/// maxima, so gradients reach exactly the cell that won each window.
///
/// Inputs shorter than the kernel are padded up to one window.
#[derive(Module, Clone, Debug)]
pub struct WindowMaxPool {
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

impl WindowMaxPool {
    pub fn output_size(&self, height: usize, width: usize) -> [usize; 2] {
        let out = |len: usize, axis: usize| {
            (len + 2 * self.padding[axis]).saturating_sub(self.kernel[axis]) / self.stride[axis] + 1
        };
        [out(height, 0), out(width, 1)]
    }

    pub fn forward<B: Backend>(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = input.dims();
        let [out_h, out_w] = self.output_size(height, width);
        let [kh, kw] = self.kernel;
        let [ph, pw] = self.padding;
        // every strided view below needs `offset + stride * out` cells
        let tail = |len: usize, pad: usize, axis: usize| {
            (self.kernel[axis] - 1 + self.stride[axis] * [out_h, out_w][axis])
                .saturating_sub(len + 2 * pad)
        };
        let padded = input.pad(
            (pw, pw + tail(width, pw, 1), ph, ph + tail(height, ph, 0)),
            f32::NEG_INFINITY,
        );

        let mut pooled = self.view(padded.clone(), 0, 0, out_h, out_w);
        for i in 0..kh {
            for j in 0..kw {
                if i + j > 0 {
                    pooled = pooled.max_pair(self.view(padded.clone(), i, j, out_h, out_w));
                }
            }
        }
        pooled
    }

    /// Cells `[i + stride_h * r, j + stride_w * c]` for every output `(r, c)`.
    fn view<B: Backend>(
        &self,
        padded: Tensor<B, 4>,
        i: usize,
        j: usize,
        out_h: usize,
        out_w: usize,
    ) -> Tensor<B, 4> {
        let [sh, sw] = self.stride;
        let [batch, channels, _, width] = padded.dims();
        let rows = padded
            .narrow(2, i, sh * out_h)
            .reshape([batch, channels, out_h, sh * width])
            .narrow(3, 0, width);
        rows.narrow(3, j, sw * out_w)
            .reshape([batch, channels, out_h * out_w, sw])
            .narrow(3, 0, 1)
            .reshape([batch, channels, out_h, out_w])
    }
}

/// Convolution, batch norm, optional ReLU.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activate: bool,
}

impl<B: Backend> ConvBn<B> {
    pub fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        padding: usize,
        activate: bool,
        dim: ConvDim,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new(channels, dim.kernel(kernel))
            .with_stride(dim.kernel(stride))
            .with_padding(dim.padding(padding))
            .with_bias(false)
            .init(device);
        let norm = BatchNormConfig::new(channels[1]).init(device);
        Self {
            conv,
            norm,
            activate,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.norm.forward(self.conv.forward(input));
        if self.activate {
            relu(x)
        } else {
            x
        }
    }
}

/// `[B, C, H, W]` to `[B, C]` by global average pooling.
pub fn global_average<B: Backend>(pool: &AdaptiveAvgPool2d, input: Tensor<B, 4>) -> Tensor<B, 2> {
    pool.forward(input).flatten(1, 3)
}

pub fn global_pool() -> AdaptiveAvgPool2d {
    AdaptiveAvgPool2dConfig::new([1, 1]).init()
}
