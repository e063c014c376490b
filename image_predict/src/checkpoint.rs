use std::{collections::BTreeMap, path::{Path, PathBuf}};

use burn::{module::Module, record::{BinFileRecorder, CompactRecorder, FullPrecisionSettings, NamedMpkFileRecorder, PrecisionSettings, PrettyJsonFileRecorder, Record, Recorder}, tensor::backend::Backend};
use tracing::info;

use crate::{error::{PredictError, Result}, model::{build, ImageClassifier, ImageClassifierConfig, ImageClassifierRecord}};

/// On-disk encoding, picked from the checkpoint file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Named msgpack, gzipped, half precision.
    Compact,
    NamedMpk,
    Json,
    Binary,
}

impl CheckpointFormat {
    const ALL: [CheckpointFormat; 4] = [
        CheckpointFormat::Compact,
        CheckpointFormat::NamedMpk,
        CheckpointFormat::Json,
        CheckpointFormat::Binary,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            CheckpointFormat::Compact => ".mpk.gz",
            CheckpointFormat::NamedMpk => ".mpk",
            CheckpointFormat::Json => ".json",
            CheckpointFormat::Binary => ".bin",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        // .mpk.gz is checked before .mpk
        Self::ALL
            .into_iter()
            .find(|format| file_name.len() > format.suffix().len() && file_name.ends_with(format.suffix()))
    }

    /// Path handed to the burn recorders, which append their own extension.
    fn recorder_path(&self, path: &Path) -> std::result::Result<PathBuf, String> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| "checkpoint path has no file name".to_string())?;
        let stem = &file_name[..file_name.len() - self.suffix().len()];
        if stem.contains('.') {
            return Err(format!(
                "file name `{file_name}` must not contain '.' before the `{}` suffix",
                self.suffix()
            ));
        }
        Ok(path.with_file_name(stem))
    }

    fn supported() -> String {
        Self::ALL
            .iter()
            .map(|format| format.suffix())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Raw `class_to_idx` table as persisted; validated into a [`ClassIndex`] on load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassToIdx(pub BTreeMap<String, usize>);

impl<B: Backend> Record<B> for ClassToIdx {
    type Item<S: PrecisionSettings> = BTreeMap<String, usize>;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        self.0
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, _device: &B::Device) -> Self {
        Self(item)
    }
}

/// The persisted checkpoint schema.
#[derive(Record)]
pub struct CheckpointRecord<B: Backend> {
    pub pretrained_model: String,
    pub hidden_units: usize,
    pub output_size: usize,
    pub drop_prob: f64,
    pub model_state_dict: ImageClassifierRecord<B>,
    pub class_to_idx: ClassToIdx,
}

/// Bijection between class identifiers and the dense indices of the output layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndex {
    to_idx: BTreeMap<String, usize>,
    to_class: Vec<String>,
}

impl ClassIndex {
    pub fn new(class_to_idx: BTreeMap<String, usize>, output_size: usize) -> std::result::Result<Self, String> {
        if class_to_idx.len() != output_size {
            return Err(format!(
                "class_to_idx maps {} classes but output_size is {output_size}",
                class_to_idx.len()
            ));
        }

        let mut slots: Vec<Option<&String>> = vec![None; output_size];
        for (class, &idx) in class_to_idx.iter() {
            let slot = slots
                .get_mut(idx)
                .ok_or_else(|| format!("class `{class}` has index {idx}, outside 0..{output_size}"))?;
            if let Some(previous) = slot.replace(class) {
                return Err(format!("classes `{previous}` and `{class}` share index {idx}"));
            }
        }

        let to_class = slots
            .into_iter()
            .enumerate()
            .map(|(idx, class)| class.cloned().ok_or_else(|| format!("no class has index {idx}")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { to_idx: class_to_idx, to_class })
    }

    /// Classes listed in index order.
    pub fn from_classes<S: Into<String>>(classes: impl IntoIterator<Item = S>) -> std::result::Result<Self, String> {
        let to_class: Vec<String> = classes.into_iter().map(Into::into).collect();
        let class_to_idx = to_class
            .iter()
            .enumerate()
            .map(|(idx, class)| (class.clone(), idx))
            .collect();
        Self::new(class_to_idx, to_class.len())
    }

    pub fn class(&self, idx: usize) -> Option<&str> {
        self.to_class.get(idx).map(String::as_str)
    }

    pub fn index(&self, class: &str) -> Option<usize> {
        self.to_idx.get(class).copied()
    }

    pub fn len(&self) -> usize {
        self.to_class.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_class.is_empty()
    }

    pub fn class_to_idx(&self) -> &BTreeMap<String, usize> {
        &self.to_idx
    }
}

/// A loaded checkpoint whose metadata has passed validation.
pub struct Checkpoint<B: Backend> {
    pub architecture: String,
    pub hidden_units: usize,
    pub output_size: usize,
    pub drop_prob: f64,
    pub parameters: ImageClassifierRecord<B>,
    pub classes: ClassIndex,
}

impl<B: Backend> Checkpoint<B> {
    /// Snapshot of a trained model, ready to be saved.
    pub fn new(config: &ImageClassifierConfig, model: ImageClassifier<B>, classes: ClassIndex) -> Self {
        Self {
            architecture: config.architecture.to_string(),
            hidden_units: config.hidden_units,
            output_size: config.output_size,
            drop_prob: config.drop_prob,
            parameters: model.into_record(),
            classes,
        }
    }

    pub fn model_config(&self) -> Result<ImageClassifierConfig> {
        build(&self.architecture, self.hidden_units, self.output_size, self.drop_prob)
    }

    /// Rebuilds the model the checkpoint was taken from.
    pub fn into_model(self, device: &B::Device) -> Result<(ImageClassifier<B>, ClassIndex)> {
        let config = self.model_config()?;
        info!("building {} with {} hidden units and {} classes", config.architecture, config.hidden_units, config.output_size);
        let model = config.init::<B>(device).load_parameters(self.parameters)?;

        Ok((model, self.classes))
    }

    fn from_record(record: CheckpointRecord<B>) -> std::result::Result<Self, String> {
        if record.hidden_units == 0 {
            return Err("hidden_units must be positive".to_string());
        }
        if record.output_size == 0 {
            return Err("output_size must be positive".to_string());
        }
        if !(0.0..1.0).contains(&record.drop_prob) {
            return Err(format!("drop_prob {} is outside [0, 1)", record.drop_prob));
        }
        let classes = ClassIndex::new(record.class_to_idx.0, record.output_size)?;

        Ok(Self {
            architecture: record.pretrained_model,
            hidden_units: record.hidden_units,
            output_size: record.output_size,
            drop_prob: record.drop_prob,
            parameters: record.model_state_dict,
            classes,
        })
    }

    fn into_record(self) -> CheckpointRecord<B> {
        CheckpointRecord {
            pretrained_model: self.architecture,
            hidden_units: self.hidden_units,
            output_size: self.output_size,
            drop_prob: self.drop_prob,
            model_state_dict: self.parameters,
            class_to_idx: ClassToIdx(self.classes.to_idx),
        }
    }
}

/// Reads a checkpoint, all or nothing.
pub fn load<B: Backend>(path: impl AsRef<Path>, device: &B::Device) -> Result<Checkpoint<B>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PredictError::checkpoint_read(path, "file does not exist"));
    }
    let format = CheckpointFormat::from_path(path).ok_or_else(|| {
        PredictError::checkpoint_read(
            path,
            format!("unrecognized format, expected one of {}", CheckpointFormat::supported()),
        )
    })?;
    let recorder_path = format
        .recorder_path(path)
        .map_err(|reason| PredictError::checkpoint_read(path, reason))?;

    info!("loading {format:?} checkpoint {}", path.display());
    let record: CheckpointRecord<B> = match format {
        CheckpointFormat::Compact => CompactRecorder::new().load(recorder_path, device),
        CheckpointFormat::NamedMpk => NamedMpkFileRecorder::<FullPrecisionSettings>::new().load(recorder_path, device),
        CheckpointFormat::Json => PrettyJsonFileRecorder::<FullPrecisionSettings>::new().load(recorder_path, device),
        CheckpointFormat::Binary => BinFileRecorder::<FullPrecisionSettings>::new().load(recorder_path, device),
    }
    .map_err(|err| PredictError::checkpoint_read(path, err.to_string()))?;

    Checkpoint::from_record(record).map_err(|reason| PredictError::checkpoint_read(path, reason))
}

/// Writes a checkpoint in the format named by the suffix of `path`.
pub fn save<B: Backend>(checkpoint: Checkpoint<B>, path: impl AsRef<Path>) -> Result<()> {
    write_record(checkpoint.into_record(), path.as_ref())
}

fn write_record<B: Backend>(record: CheckpointRecord<B>, path: &Path) -> Result<()> {
    let format = CheckpointFormat::from_path(path).ok_or_else(|| {
        PredictError::checkpoint_write(
            path,
            format!("unrecognized format, expected one of {}", CheckpointFormat::supported()),
        )
    })?;
    let recorder_path = format
        .recorder_path(path)
        .map_err(|reason| PredictError::checkpoint_write(path, reason))?;

    match format {
        CheckpointFormat::Compact => CompactRecorder::new().record(record, recorder_path),
        CheckpointFormat::NamedMpk => NamedMpkFileRecorder::<FullPrecisionSettings>::new().record(record, recorder_path),
        CheckpointFormat::Json => PrettyJsonFileRecorder::<FullPrecisionSettings>::new().record(record, recorder_path),
        CheckpointFormat::Binary => BinFileRecorder::<FullPrecisionSettings>::new().record(record, recorder_path),
    }
    .map_err(|err| PredictError::checkpoint_write(path, err.to_string()))?;
    info!("saved checkpoint {}", path.display());

    Ok(())
}
