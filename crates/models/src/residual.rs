use crate::conv::{global_average, global_pool, ConvBn, ConvDim, WindowMaxPool};
use crate::{ClassifierConfig, SpeakerModel};
use burn::module::Module;
use burn::nn;
use burn::nn::pool::AdaptiveAvgPool2d;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Stage widths as multiples of `filters`.
const STAGE_WIDTHS: [usize; 4] = [1, 2, 4, 8];

/// Two 3-wide convolutions with an identity (or projected) shortcut.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    first: ConvBn<B>,
    second: ConvBn<B>,
    shortcut: Option<ConvBn<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, dim: ConvDim, device: &B::Device) -> Self {
        let shortcut = (stride != 1 || in_ch != out_ch)
            .then(|| ConvBn::new([in_ch, out_ch], 1, stride, 0, false, dim, device));
        Self {
            first: ConvBn::new([in_ch, out_ch], 3, stride, 1, true, dim, device),
            second: ConvBn::new([out_ch, out_ch], 3, 1, 1, false, dim, device),
            shortcut,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.shortcut {
            Some(projection) => projection.forward(input.clone()),
            None => input.clone(),
        };
        relu(self.second.forward(self.first.forward(input)) + identity)
    }
}

/// ResNet-style classifier: strided stem, four stages of [`BasicBlock`]s,
/// global average pooling and a linear classifier.
#[derive(Module, Debug)]
pub struct ResidualClassifier<B: Backend> {
    stem: ConvBn<B>,
    stem_pool: WindowMaxPool,
    blocks: Vec<BasicBlock<B>>,
    gap: AdaptiveAvgPool2d,
    classifier: nn::Linear<B>,
    dim: usize,
    margin: f64,
}

impl<B: Backend> SpeakerModel<B> for ResidualClassifier<B> {
    fn init(config: &ClassifierConfig, device: &B::Device) -> Self {
        let dim = ConvDim::from_stored(config.dim);
        let stem = ConvBn::new(
            [dim.image_channels(config.in_channels), config.filters],
            7,
            2,
            3,
            true,
            dim,
            device,
        );
        let mut blocks = Vec::new();
        let mut in_ch = config.filters;
        for (stage, (width, depth)) in STAGE_WIDTHS.iter().zip(config.layers).enumerate() {
            let out_ch = config.filters * width;
            for i in 0..depth {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                blocks.push(BasicBlock::new(in_ch, out_ch, stride, dim, device));
                in_ch = out_ch;
            }
        }
        Self {
            stem,
            stem_pool: dim.max_pool(3, 2, 1),
            blocks,
            gap: global_pool(),
            classifier: nn::LinearConfig::new(in_ch, config.num_classes).init(device),
            dim: config.dim,
            margin: config.margin,
        }
    }

    fn embed(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let x = ConvDim::from_stored(self.dim).to_image(input);
        let mut x = self.stem_pool.forward(self.stem.forward(x));
        for block in &self.blocks {
            x = block.forward(x);
        }
        global_average(&self.gap, x)
    }

    fn classify(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        self.classifier.forward(embedding)
    }

    fn margin(&self) -> f64 {
        self.margin
    }
}
