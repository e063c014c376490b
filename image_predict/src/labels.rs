use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PredictError, Result};

/// Class identifier to display name, as read from a category names JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NameMapping(BTreeMap<String, String>);

impl NameMapping {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| PredictError::name_mapping_read(path, err.to_string()))?;
        let mapping: NameMapping = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| PredictError::name_mapping_read(path, err.to_string()))?;
        info!("loaded {} category names from {}", mapping.len(), path.display());

        Ok(mapping)
    }

    pub fn get(&self, class: &str) -> Option<&str> {
        self.0.get(class).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NameMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(class, name)| (class.into(), name.into())).collect())
    }
}

/// Display names for `classes`. Without a mapping the identifiers are returned unchanged;
/// with one, every identifier must have an entry.
pub fn resolve<S: AsRef<str>>(classes: &[S], names: Option<&NameMapping>) -> Result<Vec<String>> {
    classes
        .iter()
        .map(|class| {
            let class = class.as_ref();
            match names {
                None => Ok(class.to_string()),
                Some(names) => names
                    .get(class)
                    .map(str::to_string)
                    .ok_or_else(|| PredictError::UnknownClassIdentifier(class.to_string())),
            }
        })
        .collect()
}
