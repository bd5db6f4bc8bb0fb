//! Concatenation of datasets whose class spaces are disjoint.

use crate::types::{DatasetResult, SpeakerDataset, SpeakerSample};
use std::sync::Arc;

/// Concatenates datasets, shifting each member's labels past the classes of the
/// members before it so that every speaker keeps a unique class id.
pub struct ClassConcatDataset {
    members: Vec<Arc<dyn SpeakerDataset>>,
    /// Cumulative sample counts (exclusive end of each member).
    sample_ends: Vec<usize>,
    class_offsets: Vec<usize>,
    num_classes: usize,
}

impl ClassConcatDataset {
    pub fn new(members: Vec<Arc<dyn SpeakerDataset>>) -> Self {
        let mut sample_ends = Vec::with_capacity(members.len());
        let mut class_offsets = Vec::with_capacity(members.len());
        let mut samples = 0;
        let mut classes = 0;
        for member in &members {
            class_offsets.push(classes);
            samples += member.len();
            classes += member.num_classes();
            sample_ends.push(samples);
        }
        Self {
            members,
            sample_ends,
            class_offsets,
            num_classes: classes,
        }
    }

    fn locate(&self, index: usize) -> (usize, usize) {
        let member = self.sample_ends.partition_point(|end| *end <= index);
        let start = if member == 0 {
            0
        } else {
            self.sample_ends[member - 1]
        };
        (member, index - start)
    }
}

impl SpeakerDataset for ClassConcatDataset {
    fn len(&self) -> usize {
        self.sample_ends.last().copied().unwrap_or(0)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn label(&self, index: usize) -> usize {
        let (member, local) = self.locate(index);
        self.class_offsets[member] + self.members[member].label(local)
    }

    fn get(&self, index: usize) -> DatasetResult<SpeakerSample> {
        let (member, local) = self.locate(index);
        let mut sample = self.members[member].get(local)?;
        sample.label += self.class_offsets[member];
        Ok(sample)
    }
}
