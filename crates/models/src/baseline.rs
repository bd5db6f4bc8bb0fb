use crate::conv::{global_average, global_pool, ConvBn, ConvDim, WindowMaxPool};
use crate::{ClassifierConfig, SpeakerModel};
use burn::module::Module;
use burn::nn;
use burn::nn::pool::AdaptiveAvgPool2d;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Block widths as multiples of `filters`.
const WIDTHS: [usize; 4] = [1, 2, 3, 4];

/// Four conv/batch-norm/ReLU/max-pool blocks, global average pooling,
/// a linear embedding and a linear classifier.
#[derive(Module, Debug)]
pub struct BaselineClassifier<B: Backend> {
    blocks: Vec<ConvBn<B>>,
    pool: WindowMaxPool,
    gap: AdaptiveAvgPool2d,
    embedding: nn::Linear<B>,
    classifier: nn::Linear<B>,
    dim: usize,
    margin: f64,
}

impl<B: Backend> SpeakerModel<B> for BaselineClassifier<B> {
    fn init(config: &ClassifierConfig, device: &B::Device) -> Self {
        let dim = ConvDim::from_stored(config.dim);
        let mut blocks = Vec::with_capacity(WIDTHS.len());
        let mut in_ch = dim.image_channels(config.in_channels);
        for w in WIDTHS {
            let out_ch = config.filters * w;
            blocks.push(ConvBn::new([in_ch, out_ch], 3, 1, 1, true, dim, device));
            in_ch = out_ch;
        }
        Self {
            blocks,
            pool: dim.max_pool(2, 2, 0),
            gap: global_pool(),
            embedding: nn::LinearConfig::new(in_ch, config.embedding_dim).init(device),
            classifier: nn::LinearConfig::new(config.embedding_dim, config.num_classes).init(device),
            dim: config.dim,
            margin: config.margin,
        }
    }

    fn embed(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let mut x = ConvDim::from_stored(self.dim).to_image(input);
        for block in &self.blocks {
            x = self.pool.forward(block.forward(x));
        }
        self.embedding.forward(global_average(&self.gap, x))
    }

    fn classify(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        self.classifier.forward(embedding)
    }

    fn margin(&self) -> f64 {
        self.margin
    }
}
