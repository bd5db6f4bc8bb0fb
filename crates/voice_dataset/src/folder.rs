//! Class-per-directory datasets of precomputed `.npy` spectrograms.

use crate::aug::RandomCrop;
use crate::npy;
use crate::types::{DatasetResult, SpeakerDataset, SpeakerSample, VoiceDatasetError};
use std::fs;
use std::path::{Path, PathBuf};

/// Dataset laid out as `<root>/<class>/**/<file>.<ext>`.
///
/// Classes are the sorted names of the first-level directories; files are
/// collected recursively and sorted within each class.
#[derive(Debug, Clone)]
pub struct DatasetFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<(PathBuf, usize)>,
    transform: Option<RandomCrop>,
}

impl DatasetFolder {
    pub fn new(
        root: impl Into<PathBuf>,
        extensions: &[&str],
        transform: Option<RandomCrop>,
    ) -> DatasetResult<Self> {
        let root = root.into();
        let mut classes = Vec::new();
        for entry in fs::read_dir(&root).map_err(|e| VoiceDatasetError::io(&root, e))? {
            let entry = entry.map_err(|e| VoiceDatasetError::io(&root, e))?;
            if entry.path().is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();

        let mut samples = Vec::new();
        for (class_idx, class) in classes.iter().enumerate() {
            let mut files = Vec::new();
            collect_files(&root.join(class), extensions, &mut files)?;
            files.sort();
            samples.extend(files.into_iter().map(|p| (p, class_idx)));
        }
        if samples.is_empty() {
            return Err(VoiceDatasetError::Empty { path: root });
        }
        tracing::debug!(
            root = %root.display(),
            classes = classes.len(),
            samples = samples.len(),
            "indexed dataset folder"
        );
        Ok(Self {
            root,
            classes,
            samples,
            transform,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn path(&self, index: usize) -> &Path {
        &self.samples[index].0
    }
}

fn collect_files(dir: &Path, extensions: &[&str], out: &mut Vec<PathBuf>) -> DatasetResult<()> {
    for entry in fs::read_dir(dir).map_err(|e| VoiceDatasetError::io(dir, e))? {
        let entry = entry.map_err(|e| VoiceDatasetError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, extensions, out)?;
        } else if has_extension(&path, extensions) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    extensions
        .iter()
        .any(|ext| name.ends_with(&ext.to_lowercase()))
}

impl SpeakerDataset for DatasetFolder {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn num_classes(&self) -> usize {
        self.classes.len()
    }

    fn label(&self, index: usize) -> usize {
        self.samples[index].1
    }

    fn get(&self, index: usize) -> DatasetResult<SpeakerSample> {
        let (path, label) = &self.samples[index];
        let array = npy::load(path)?;
        match &self.transform {
            Some(crop) => {
                let cropped = crop.apply(&array, &mut rand::rng())?;
                SpeakerSample::new(cropped.data, cropped.rows, cropped.timesteps, *label)
            }
            None => {
                let [channels, rows, timesteps] = array.dims3()?;
                if channels != 1 {
                    return Err(VoiceDatasetError::Shape(format!(
                        "{} has {channels} channels; a crop transform is required",
                        path.display()
                    )));
                }
                SpeakerSample::new(array.data, rows, timesteps, *label)
            }
        }
    }
}
