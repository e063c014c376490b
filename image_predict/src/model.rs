use std::{fmt::Display, str::FromStr};

use burn::{config::Config, module::{Module, ModuleVisitor, ParamId}, nn::{conv::{Conv2d, Conv2dConfig}, pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig}, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, ReLU}, tensor::{activation::log_softmax, backend::Backend, Tensor}};
use derive_new::new;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PredictError;

pub const INPUT_SHAPE: [usize; 3] = [3, 224, 224];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardMode {
    #[default]
    Deterministic,
    Stochastic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Alexnet,
    Vgg11,
    Vgg13,
    Vgg16,
    Vgg19,
}

#[derive(Clone, Copy)]
enum VggLayer {
    Conv(usize),
    Pool,
}

use VggLayer::{Conv as C, Pool as P};

// torchvision configurations A, B, D and E
const VGG11: &[VggLayer] = &[C(64), P, C(128), P, C(256), C(256), P, C(512), C(512), P, C(512), C(512), P];
const VGG13: &[VggLayer] = &[C(64), C(64), P, C(128), C(128), P, C(256), C(256), P, C(512), C(512), P, C(512), C(512), P];
const VGG16: &[VggLayer] = &[C(64), C(64), P, C(128), C(128), P, C(256), C(256), C(256), P, C(512), C(512), C(512), P, C(512), C(512), C(512), P];
const VGG19: &[VggLayer] = &[C(64), C(64), P, C(128), C(128), P, C(256), C(256), C(256), C(256), P, C(512), C(512), C(512), C(512), P, C(512), C(512), C(512), C(512), P];

impl Architecture {
    pub const ALL: [Architecture; 5] = [
        Architecture::Alexnet,
        Architecture::Vgg11,
        Architecture::Vgg13,
        Architecture::Vgg16,
        Architecture::Vgg19,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Alexnet => "alexnet",
            Architecture::Vgg11 => "vgg11",
            Architecture::Vgg13 => "vgg13",
            Architecture::Vgg16 => "vgg16",
            Architecture::Vgg19 => "vgg19",
        }
    }

    pub fn layers(&self) -> Vec<ConvLayer> {
        match self {
            Architecture::Alexnet => vec![
                ConvLayer::new([3, 64], 11, 4, 2, Some([3, 2])),
                ConvLayer::new([64, 192], 5, 1, 2, Some([3, 2])),
                ConvLayer::new([192, 384], 3, 1, 1, None),
                ConvLayer::new([384, 256], 3, 1, 1, None),
                ConvLayer::new([256, 256], 3, 1, 1, Some([3, 2])),
            ],
            Architecture::Vgg11 => vgg_layers(VGG11),
            Architecture::Vgg13 => vgg_layers(VGG13),
            Architecture::Vgg16 => vgg_layers(VGG16),
            Architecture::Vgg19 => vgg_layers(VGG19),
        }
    }

    pub fn pooled_size(&self) -> [usize; 2] {
        match self {
            Architecture::Alexnet => [6, 6],
            _ => [7, 7],
        }
    }

    pub fn feature_width(&self) -> usize {
        let channels = self
            .layers()
            .last()
            .map(|layer| layer.channels[1])
            .unwrap_or(INPUT_SHAPE[0]);
        let [height, width] = self.pooled_size();
        channels * height * width
    }
}

fn vgg_layers(table: &[VggLayer]) -> Vec<ConvLayer> {
    let mut layers: Vec<ConvLayer> = Vec::with_capacity(table.len());
    let mut channels_in = INPUT_SHAPE[0];
    for layer in table {
        match layer {
            VggLayer::Conv(channels_out) => {
                layers.push(ConvLayer::new([channels_in, *channels_out], 3, 1, 1, None));
                channels_in = *channels_out;
            }
            VggLayer::Pool => {
                if let Some(last) = layers.last_mut() {
                    last.pool = Some([2, 2]);
                }
            }
        }
    }
    layers
}

impl FromStr for Architecture {
    type Err = PredictError;

    fn from_str(name: &str) -> crate::error::Result<Self> {
        let lowered = name.trim().to_lowercase();
        Architecture::ALL
            .into_iter()
            .find(|arch| arch.name() == lowered)
            .ok_or_else(|| {
                let supported: Vec<&str> = Architecture::ALL.iter().map(|arch| arch.name()).collect();
                PredictError::unsupported_architecture(name, &supported)
            })
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct ConvLayer {
    pub channels: [usize; 2],
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    /// `[kernel, stride]` of the max pool after the activation.
    pub pool: Option<[usize; 2]>,
}

impl ConvLayer {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            conv: Conv2dConfig::new(self.channels, [self.kernel, self.kernel])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
                .init(device),
            activation: ReLU::new(),
            pool: self.pool.map(|[kernel, stride]| {
                MaxPool2dConfig::new([kernel, kernel]).with_strides([stride, stride]).init()
            }),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    activation: ReLU,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.activation.forward(x);
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    avg_pool: AdaptiveAvgPool2d,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .blocks
            .iter()
            .fold(images, |x, block| block.forward(x));
        let x = self.avg_pool.forward(x);
        let [batch_size, channels, height, width] = x.dims();

        x.reshape([batch_size, channels * height * width])
    }
}

#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    hidden: Linear<B>,
    activation: ReLU,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn forward(&self, features: Tensor<B, 2>, mode: ForwardMode) -> Tensor<B, 2> {
        let x = self.hidden.forward(features);
        let x = self.activation.forward(x);
        let x = match mode {
            ForwardMode::Stochastic => self.dropout.forward(x),
            ForwardMode::Deterministic => x,
        };
        let x = self.output.forward(x);

        log_softmax(x, 1)
    }
}

#[derive(Module, Debug)]
pub struct ImageClassifier<B: Backend> {
    backbone: Backbone<B>,
    head: ClassifierHead<B>,
}

impl<B: Backend> ImageClassifier<B> {
    pub fn forward(&self, images: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(features, mode)
    }

    /// Loads checkpoint parameters, refusing any record whose layout differs from this model.
    pub fn load_parameters(self, record: ImageClassifierRecord<B>) -> crate::error::Result<Self> {
        let expected_blocks = self.backbone.blocks.len();
        let found_blocks = record.backbone.blocks.len();
        if expected_blocks != found_blocks {
            return Err(PredictError::parameter_shape_mismatch(
                "backbone",
                format!("{expected_blocks} convolution layers"),
                format!("{found_blocks} convolution layers"),
            ));
        }

        let expected = ParamShapes::of::<B, _>(&self);
        let model = self.load_record(record);
        expected.ensure_same(&ParamShapes::of::<B, _>(&model))?;
        debug!("loaded {} parameter tensors", expected.0.len());

        Ok(model)
    }
}

#[derive(Config, Debug)]
pub struct ImageClassifierConfig {
    pub architecture: Architecture,
    pub hidden_units: usize,
    pub output_size: usize,
    pub drop_prob: f64,
}

impl ImageClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ImageClassifier<B> {
        let blocks = self
            .architecture
            .layers()
            .iter()
            .map(|layer| layer.init(device))
            .collect();

        ImageClassifier {
            backbone: Backbone {
                blocks,
                avg_pool: AdaptiveAvgPool2dConfig::new(self.architecture.pooled_size()).init(),
            },
            head: ClassifierHead {
                hidden: LinearConfig::new(self.architecture.feature_width(), self.hidden_units).init(device),
                activation: ReLU::new(),
                dropout: DropoutConfig::new(self.drop_prob).init(),
                output: LinearConfig::new(self.hidden_units, self.output_size).init(device),
            },
        }
    }
}

pub fn build(
    architecture: &str,
    hidden_units: usize,
    output_size: usize,
    drop_prob: f64,
) -> crate::error::Result<ImageClassifierConfig> {
    let architecture = architecture.parse::<Architecture>()?;
    Ok(ImageClassifierConfig::new(architecture, hidden_units, output_size, drop_prob))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ParamShapes(Vec<Vec<usize>>);

impl ParamShapes {
    fn of<B: Backend, M: Module<B>>(module: &M) -> Self {
        let mut shapes = ParamShapes::default();
        module.visit(&mut shapes);
        shapes
    }

    fn ensure_same(&self, found: &ParamShapes) -> crate::error::Result<()> {
        let count = self.0.len().max(found.0.len());
        for position in 0..count {
            match (self.0.get(position), found.0.get(position)) {
                (Some(expected), Some(actual)) if expected == actual => {}
                (expected, actual) => {
                    return Err(PredictError::parameter_shape_mismatch(
                        format!("parameter #{position}"),
                        describe(expected),
                        describe(actual),
                    ))
                }
            }
        }
        Ok(())
    }
}

fn describe(shape: Option<&Vec<usize>>) -> String {
    match shape {
        Some(shape) => format!("{shape:?}"),
        None => "no tensor".to_string(),
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
        self.0.push(tensor.dims().to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray<f32>;

    #[test]
    fn architecture_names_round_trip() {
        for arch in Architecture::ALL {
            assert_eq!(arch.name().parse::<Architecture>().unwrap(), arch);
        }
        assert_eq!("VGG16".parse::<Architecture>().unwrap(), Architecture::Vgg16);
    }

    #[test]
    fn unknown_architecture_is_rejected() {
        let err = "densenet121".parse::<Architecture>().unwrap_err();
        assert!(matches!(err, PredictError::UnsupportedArchitecture { ref name, .. } if name == "densenet121"));

        let err = build("resnet18", 16, 3, 0.2).unwrap_err();
        assert!(matches!(err, PredictError::UnsupportedArchitecture { .. }));
    }

    #[test]
    fn feature_widths_match_backbone_families() {
        assert_eq!(Architecture::Alexnet.feature_width(), 9216);
        for arch in [Architecture::Vgg11, Architecture::Vgg13, Architecture::Vgg16, Architecture::Vgg19] {
            assert_eq!(arch.feature_width(), 25088);
        }
    }

    #[test]
    fn vgg_tables_have_expected_depth() {
        let conv_counts: Vec<usize> = [Architecture::Vgg11, Architecture::Vgg13, Architecture::Vgg16, Architecture::Vgg19]
            .iter()
            .map(|arch| arch.layers().len())
            .collect();
        assert_eq!(conv_counts, vec![8, 10, 13, 16]);

        let vgg16 = Architecture::Vgg16.layers();
        assert_eq!(vgg16.iter().filter(|layer| layer.pool.is_some()).count(), 5);
        assert_eq!(vgg16[0].channels, [3, 64]);
        assert!(vgg16.windows(2).all(|pair| pair[0].channels[1] == pair[1].channels[0]));
    }

    #[test]
    fn head_outputs_normalized_log_probabilities() {
        let device = Default::default();
        let config = build("alexnet", 16, 5, 0.5).unwrap();
        let model = config.init::<TestBackend>(&device);

        let features = Tensor::<TestBackend, 2>::random([2, 9216], Distribution::Default, &device);
        let log_probs = model.head.forward(features, ForwardMode::Deterministic);
        assert_eq!(log_probs.dims(), [2, 5]);

        let probs: Vec<f32> = log_probs.exp().to_data().convert::<f32>().value;
        for row in probs.chunks(5) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "row sums to {sum}");
        }
    }

    #[test]
    fn alexnet_forward_on_zero_image_is_finite() {
        let device = Default::default();
        let model = build("alexnet", 8, 4, 0.2).unwrap().init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 224, 224], &device);
        let log_probs = model.forward(images, ForwardMode::Deterministic);
        assert_eq!(log_probs.dims(), [1, 4]);

        let values: Vec<f32> = log_probs.to_data().convert::<f32>().value;
        assert!(values.iter().all(|value| value.is_finite() && *value <= 0.0));
    }

    #[test]
    fn parameters_load_into_matching_model() {
        let device = Default::default();
        let config = build("alexnet", 8, 3, 0.2).unwrap();
        let trained = config.init::<TestBackend>(&device);
        let record = trained.clone().into_record();

        let loaded = config.init::<TestBackend>(&device).load_parameters(record).unwrap();
        assert_eq!(ParamShapes::of::<TestBackend, _>(&loaded), ParamShapes::of::<TestBackend, _>(&trained));
    }

    #[test]
    fn mismatched_head_is_rejected() {
        let device = Default::default();
        let record = build("alexnet", 8, 3, 0.2).unwrap().init::<TestBackend>(&device).into_record();

        let err = build("alexnet", 16, 3, 0.2)
            .unwrap()
            .init::<TestBackend>(&device)
            .load_parameters(record)
            .unwrap_err();
        match err {
            PredictError::ParameterShapeMismatch { expected, found, .. } => {
                assert_eq!(expected, "[9216, 16]");
                assert_eq!(found, "[9216, 8]");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn shape_comparison_reports_missing_tensors() {
        let expected = ParamShapes(vec![vec![4, 2], vec![2]]);
        let found = ParamShapes(vec![vec![4, 2]]);

        let err = expected.ensure_same(&found).unwrap_err();
        assert!(err.to_string().contains("parameter #1"));
        assert!(err.to_string().contains("no tensor"));
        assert!(expected.ensure_same(&ParamShapes(vec![vec![4, 2], vec![2]])).is_ok());
    }
}
