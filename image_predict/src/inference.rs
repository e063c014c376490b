use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use derive_new::new;
use tracing::{debug, info};

use crate::{checkpoint::{self, ClassIndex}, config::PredictConfig, data::ImagePreprocessor, error::{PredictError, Result}, labels::{self, NameMapping}, model::{ForwardMode, ImageClassifier, INPUT_SHAPE}};

/// A model producing log-probabilities over its classes for a batch of images.
pub trait LogProbClassifier<B: Backend> {
    fn input_shape(&self) -> [usize; 3];

    fn forward_log_probs(&self, images: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 2>;
}

impl<B: Backend> LogProbClassifier<B> for ImageClassifier<B> {
    fn input_shape(&self) -> [usize; 3] {
        INPUT_SHAPE
    }

    fn forward_log_probs(&self, images: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 2> {
        self.forward(images, mode)
    }
}

#[derive(Debug, Clone, PartialEq, new)]
pub struct ClassProbability {
    pub probability: f32,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Prediction {
    pub entries: Vec<ClassProbability>,
}

impl Prediction {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn best(&self) -> Option<&ClassProbability> {
        self.entries.first()
    }

    pub fn probabilities(&self) -> Vec<f32> {
        self.entries.iter().map(|entry| entry.probability).collect()
    }

    pub fn classes(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.class.as_str()).collect()
    }
}

pub fn class_probabilities<B: Backend, M: LogProbClassifier<B>>(image: Tensor<B, 3>, model: &M) -> Result<Vec<f32>> {
    let dims = image.dims();
    let expected = model.input_shape();
    if dims != expected {
        return Err(PredictError::invalid_argument(format!(
            "image tensor has shape {dims:?}, model expects {expected:?}"
        )));
    }

    let batch = image.unsqueeze::<4>();
    let log_probs = model.forward_log_probs(batch, ForwardMode::Deterministic);
    let probabilities: Vec<f32> = log_probs.exp().to_data().convert::<f32>().value;

    let max = probabilities.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    debug!("max probability {max} over {} classes", probabilities.len());

    Ok(probabilities)
}

/// Indices of the `k` largest probabilities, descending; equal probabilities keep index order.
pub fn top_k_indices(probabilities: &[f32], k: usize) -> Vec<usize> {
    let mut ranked: Vec<usize> = (0..probabilities.len()).collect();
    ranked.sort_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]).then(a.cmp(&b)));
    ranked.truncate(k);
    ranked
}

/// Runs one deterministic forward pass and decodes the `top_k` most probable classes.
///
/// `top_k` larger than the number of classes is clamped; zero is rejected.
pub fn predict<B: Backend, M: LogProbClassifier<B>>(
    image: Tensor<B, 3>,
    model: &M,
    classes: &ClassIndex,
    top_k: usize,
) -> Result<Prediction> {
    if top_k == 0 {
        return Err(PredictError::invalid_argument("top_k must be at least 1"));
    }

    let probabilities = class_probabilities(image, model)?;
    if probabilities.len() != classes.len() {
        return Err(PredictError::parameter_shape_mismatch(
            "output layer",
            format!("{} classes", classes.len()),
            format!("{} classes", probabilities.len()),
        ));
    }

    let entries = top_k_indices(&probabilities, top_k)
        .into_iter()
        .map(|idx| {
            let class = classes
                .class(idx)
                .ok_or_else(|| PredictError::invalid_argument(format!("class index {idx} has no identifier")))?;
            Ok(ClassProbability::new(probabilities[idx], class.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Prediction { entries })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionReport {
    pub prediction: Prediction,
    pub names: Vec<String>,
}

impl PredictionReport {
    pub fn rows(&self) -> impl Iterator<Item = (&ClassProbability, &str)> {
        self.prediction
            .entries
            .iter()
            .zip(self.names.iter().map(String::as_str))
    }
}

pub fn infer<B: Backend, P: ImagePreprocessor>(
    config: &PredictConfig,
    preprocessor: &P,
    device: &B::Device,
) -> Result<PredictionReport> {
    config.validate()?;

    let names = match config.category_names_file.as_deref() {
        Some(path) if !path.is_empty() => Some(NameMapping::load(path)?),
        _ => None,
    };

    let checkpoint = checkpoint::load::<B>(&config.checkpoint_path, device)?;
    let (model, classes) = checkpoint.into_model(device)?;
    info!("loading checkpoint complete");

    let image = preprocessor.process(Path::new(&config.image_path))?;
    let image = Tensor::<B, 3>::from_data(image.convert(), device);

    let prediction = predict(image, &model, &classes, config.top_k)?;
    let names = labels::resolve(&prediction.classes(), names.as_ref())?;

    Ok(PredictionReport { prediction, names })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::activation::log_softmax};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type TestBackend = NdArray<f32>;

    /// Ignores its input and always answers with the same log-probabilities.
    struct FixedLogProbs {
        log_probs: Vec<f32>,
    }

    impl<B: Backend> LogProbClassifier<B> for FixedLogProbs {
        fn input_shape(&self) -> [usize; 3] {
            [3, 2, 2]
        }

        fn forward_log_probs(&self, images: Tensor<B, 4>, _mode: ForwardMode) -> Tensor<B, 2> {
            let [batch_size, _, _, _] = images.dims();
            Tensor::<B, 1>::from_floats(self.log_probs.as_slice(), &images.device())
                .reshape([batch_size, self.log_probs.len()])
        }
    }

    fn image() -> Tensor<TestBackend, 3> {
        Tensor::zeros([3, 2, 2], &Default::default())
    }

    fn abc() -> ClassIndex {
        ClassIndex::from_classes(["a", "b", "c"]).unwrap()
    }

    fn stub(probabilities: &[f32]) -> FixedLogProbs {
        FixedLogProbs {
            log_probs: probabilities.iter().map(|p| p.ln()).collect(),
        }
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!((actual - expected).abs() < 1e-5, "{actual} != {expected}");
    }

    #[test]
    fn top_two_of_three() {
        let prediction = predict(image(), &stub(&[0.7, 0.2, 0.1]), &abc(), 2).unwrap();

        assert_eq!(prediction.classes(), vec!["a", "b"]);
        assert_eq!(prediction.best().map(|best| best.class.as_str()), Some("a"));
        assert_close(prediction.entries[0].probability, 0.7);
        assert_close(prediction.entries[1].probability, 0.2);
    }

    #[test]
    fn top_k_is_clamped_to_class_count() {
        let prediction = predict(image(), &stub(&[0.1, 0.6, 0.3]), &abc(), 10).unwrap();

        assert_eq!(prediction.len(), 3);
        assert_eq!(prediction.classes(), vec!["b", "c", "a"]);
    }

    #[test]
    fn zero_top_k_is_invalid() {
        let err = predict(image(), &stub(&[0.7, 0.2, 0.1]), &abc(), 0).unwrap_err();
        assert!(matches!(err, PredictError::InvalidArgument(_)));
    }

    #[test]
    fn wrong_image_shape_is_invalid() {
        let image = Tensor::<TestBackend, 3>::zeros([1, 2, 2], &Default::default());
        let err = predict(image, &stub(&[0.7, 0.2, 0.1]), &abc(), 1).unwrap_err();
        assert!(matches!(err, PredictError::InvalidArgument(ref reason) if reason.contains("[1, 2, 2]")));
    }

    #[test]
    fn class_count_must_match_output_layer() {
        let err = predict(image(), &stub(&[0.5, 0.5]), &abc(), 1).unwrap_err();
        assert!(matches!(err, PredictError::ParameterShapeMismatch { .. }));
    }

    #[test]
    fn ties_keep_index_order() {
        assert_eq!(top_k_indices(&[0.25, 0.5, 0.25, 0.0], 4), vec![1, 0, 2, 3]);

        let prediction = predict(image(), &stub(&[0.4, 0.2, 0.4]), &abc(), 3).unwrap();
        assert_eq!(prediction.classes(), vec!["a", "c", "b"]);
    }

    #[test]
    fn random_outputs_are_normalized_and_sorted() {
        let mut rng = StdRng::seed_from_u64(42);
        let device = Default::default();

        for _ in 0..20 {
            let classes: usize = rng.gen_range(1..40);
            let logits: Vec<f32> = (0..classes).map(|_| rng.gen_range(-8.0..8.0)).collect();
            let log_probs: Vec<f32> = log_softmax(Tensor::<TestBackend, 1>::from_floats(logits.as_slice(), &device), 0)
                .to_data()
                .convert::<f32>()
                .value;
            let model = FixedLogProbs { log_probs };
            let index = ClassIndex::from_classes((0..classes).map(|class| format!("class-{class}"))).unwrap();

            let probabilities = class_probabilities(image(), &model).unwrap();
            let sum: f32 = probabilities.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "probabilities sum to {sum}");

            let top_k = rng.gen_range(1..50);
            let prediction = predict(image(), &model, &index, top_k).unwrap();
            assert_eq!(prediction.len(), top_k.min(classes));
            assert!(prediction.probabilities().windows(2).all(|pair| pair[0] >= pair[1]));
        }
    }

    #[test]
    fn report_rows_pair_entries_with_names() {
        let report = PredictionReport {
            prediction: Prediction {
                entries: vec![ClassProbability::new(0.9, "21".to_string())],
            },
            names: vec!["fire lily".to_string()],
        };
        let rows: Vec<_> = report.rows().map(|(entry, name)| (entry.class.as_str(), name)).collect();
        assert_eq!(rows, vec![("21", "fire lily")]);
    }
}
