use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};
use models::{BaselineClassifier, ClassifierConfig, SpeakerModel};
use training::{
    evaluate_verification, fit, load_classifier, sample_pairs, BatchPreparation, Callback,
    CsvLogger, Evaluate, FitConfig, ModelCheckpoint, ReduceLROnPlateau, VerificationMetrics,
};
use voice_dataset::{DataLoader, DatasetResult, LoaderConfig, SpeakerDataset, SpeakerSample};

type Inner = NdArray<f32>;
type B = Autodiff<Inner>;
type M = BaselineClassifier<B>;

const ROWS: usize = 4;
const STEPS: usize = 32;

/// Speaker `s` is a sine on row `s % ROWS` with a speaker-specific frequency.
struct Tones {
    speakers: usize,
    per_speaker: usize,
}

impl SpeakerDataset for Tones {
    fn len(&self) -> usize {
        self.speakers * self.per_speaker
    }

    fn num_classes(&self) -> usize {
        self.speakers
    }

    fn label(&self, index: usize) -> usize {
        index / self.per_speaker
    }

    fn get(&self, index: usize) -> DatasetResult<SpeakerSample> {
        let label = self.label(index);
        let phase = (index % self.per_speaker) as f32 * 0.3;
        let mut features = vec![0.0f32; ROWS * STEPS];
        let row = label % ROWS;
        for t in 0..STEPS {
            features[row * STEPS + t] = ((t as f32) * 0.2 * (label + 1) as f32 + phase).sin();
        }
        SpeakerSample::new(features, ROWS, STEPS, label)
    }
}

fn loader(data: Arc<dyn SpeakerDataset>, batch_size: usize, seed: u64) -> DataLoader {
    DataLoader::new(
        data,
        LoaderConfig {
            num_workers: 2,
            seed: Some(seed),
            ..LoaderConfig::new(batch_size)
        },
    )
    .expect("loader")
}

#[test]
fn fit_runs_callbacks_and_writes_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoint = dir.path().join("classifier_test=0.1.bin");
    let log = dir.path().join("classifier_test=0.1.csv");
    let device = Default::default();

    let train: Arc<dyn SpeakerDataset> = Arc::new(Tones {
        speakers: 4,
        per_speaker: 6,
    });
    let val: Arc<dyn SpeakerDataset> = Arc::new(Tones {
        speakers: 4,
        per_speaker: 2,
    });
    let unseen: Arc<dyn SpeakerDataset> = Arc::new(Tones {
        speakers: 3,
        per_speaker: 3,
    });

    let config = ClassifierConfig::baseline(ROWS, 4, 4, 1);
    let model = M::init(&config, &device);
    let fit_cfg = FitConfig {
        epochs: 2,
        learning_rate: 0.05,
        momentum: 0.9,
        weight_decay: 1e-4,
    };
    let mut optim = fit_cfg.sgd().init::<B, M>();
    let prepare = BatchPreparation::Cast;
    let mut callbacks: Vec<Box<dyn Callback<B, M>>> = vec![
        Box::new(Evaluate::new(loader(val, 4, 1), prepare)),
        Box::new(VerificationMetrics::new(unseen.clone(), 40, "unseen_", prepare, 4).with_seed(Some(5))),
        Box::new(ReduceLROnPlateau::new("val_loss").with_patience(5).with_min_delta(0.1)),
        Box::new(ModelCheckpoint::new(&checkpoint, "val_loss")),
        Box::new(CsvLogger::new(&log)),
    ];

    let outcome = fit(
        model,
        &mut optim,
        &fit_cfg,
        &loader(train, 4, 0),
        prepare,
        &mut callbacks,
        &device,
    )
    .expect("fit");

    assert_eq!(outcome.history.len(), 2);
    for logs in &outcome.history {
        for key in ["loss", "accuracy", "lr", "val_loss", "val_accuracy", "unseen_eer", "unseen_auc"] {
            let value = logs.get(key).unwrap_or_else(|| panic!("missing {key}"));
            assert!(value.is_finite(), "{key} = {value}");
        }
        assert!((0.0..=1.0).contains(&logs["unseen_eer"]));
        assert!((0.0..=1.0).contains(&logs["accuracy"]));
    }
    assert_eq!(outcome.learning_rate, 0.05);

    let csv = std::fs::read_to_string(&log).expect("csv log");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "epoch,accuracy,loss,lr,unseen_auc,unseen_eer,val_accuracy,val_loss"
    );
    assert!(lines[1].starts_with("1,"));
    assert!(lines[2].starts_with("2,"));

    assert!(checkpoint.exists());
    let restored = load_classifier::<Inner, BaselineClassifier<Inner>>(&checkpoint, &config, &device)
        .expect("load checkpoint");
    let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(9);
    let pairs = sample_pairs(unseen.as_ref(), 30, &mut rng).expect("pairs");
    let scores = evaluate_verification::<Inner, _>(&restored, unseen.as_ref(), &pairs, prepare, 4, &device)
        .expect("scores");
    assert!((0.0..=1.0).contains(&scores.eer));
    assert!((0.0..=1.0).contains(&scores.auc));
}

#[test]
fn empty_training_loader_is_an_error() {
    let device = Default::default();
    let tiny: Arc<dyn SpeakerDataset> = Arc::new(Tones {
        speakers: 2,
        per_speaker: 1,
    });
    let config = ClassifierConfig::baseline(ROWS, 2, 2, 1);
    let fit_cfg = FitConfig {
        epochs: 1,
        learning_rate: 0.1,
        momentum: 0.0,
        weight_decay: 0.0,
    };
    let mut optim = fit_cfg.sgd().init::<B, M>();
    let mut callbacks: Vec<Box<dyn Callback<B, M>>> = Vec::new();
    let result = fit(
        M::init(&config, &device),
        &mut optim,
        &fit_cfg,
        &loader(tiny, 8, 0),
        BatchPreparation::Cast,
        &mut callbacks,
        &device,
    );
    assert!(result.is_err());
}
