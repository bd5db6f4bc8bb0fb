//! voicemap umbrella crate: re-export the dataset, model and training crates.

#[cfg(feature = "voice-dataset")]
pub use voice_dataset;

#[cfg(feature = "models")]
pub use models;

#[cfg(feature = "training")]
pub use training;
