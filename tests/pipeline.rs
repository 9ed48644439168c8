//! End-to-end pipeline scenarios with in-memory collaborators.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autolabel::annotation::{Annotation, AnnotationStore, BBox};
use autolabel::backend::{
    Backends, Detection, Detector, DetectorError, EmbedError, ExportError, Exporter,
    FeatureExtractor, FetchError, Fetcher, ModelHandle, SearchError, Searcher, TrainConfig,
};
use autolabel::config::DataDir;
use autolabel::dataset::DatasetDescriptor;
use autolabel::session::{FailureReason, Stage};
use autolabel::{Pipeline, PipelineConfig};

/// Serves a fixed url list; `related:` queries return nothing.
struct StubSearcher {
    urls: Vec<String>,
}

impl Searcher for StubSearcher {
    fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, SearchError> {
        if query.starts_with("related:") {
            return Ok(vec![]);
        }
        Ok(self.urls.iter().take(max_results).cloned().collect())
    }
}

struct EmptySearcher;

impl Searcher for EmptySearcher {
    fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<String>, SearchError> {
        Ok(vec![])
    }
}

/// Like `StubSearcher`, but plain queries take `delay` to answer.
struct SlowSearcher {
    urls: Vec<String>,
    delay: Duration,
}

impl Searcher for SlowSearcher {
    fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, SearchError> {
        if query.starts_with("related:") {
            return Ok(vec![]);
        }
        std::thread::sleep(self.delay);
        Ok(self.urls.iter().take(max_results).cloned().collect())
    }
}

/// Materializes each url as a file whose content is the url itself,
/// deduplicating against files already present like the real fetcher.
struct StubFetcher {
    delay: Duration,
}

impl Fetcher for StubFetcher {
    fn fetch_all(
        &self,
        urls: &[String],
        dest: &Path,
    ) -> Result<Vec<(String, PathBuf)>, FetchError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        fs::create_dir_all(dest)?;
        let mut seen = std::collections::HashSet::new();
        for entry in fs::read_dir(dest)? {
            seen.insert(blake3::hash(&fs::read(entry?.path())?));
        }

        let mut fetched = Vec::new();
        for url in urls {
            let hash = blake3::hash(url.as_bytes());
            if !seen.insert(hash) {
                continue;
            }
            let path = dest.join(format!("{}.jpg", &hash.to_hex()[..16]));
            fs::write(&path, url.as_bytes())?;
            fetched.push((url.clone(), path));
        }
        Ok(fetched)
    }
}

/// Deterministic embedding derived from file content; counts calls.
struct HashExtractor {
    calls: AtomicUsize,
}

impl HashExtractor {
    fn new() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0) })
    }
}

impl FeatureExtractor for HashExtractor {
    fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let data =
            fs::read(path).map_err(|source| EmbedError::Io { path: path.to_path_buf(), source })?;
        let hash = blake3::hash(&data);
        Ok(hash.as_bytes()[..8].iter().map(|&b| b as f32 / 255.0).collect())
    }
}

/// Records how many label files exist at each train call and returns a
/// fixed detection list per inferred image.
struct MockDetector {
    train_label_counts: Mutex<Vec<usize>>,
    detections: Vec<(String, f32)>,
    fail_train: bool,
    train_delay: Option<Duration>,
}

impl MockDetector {
    fn new(detections: Vec<(&str, f32)>) -> Arc<Self> {
        Arc::new(Self {
            train_label_counts: Mutex::new(Vec::new()),
            detections: detections.into_iter().map(|(c, s)| (c.to_string(), s)).collect(),
            fail_train: false,
            train_delay: None,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            train_label_counts: Mutex::new(Vec::new()),
            detections: vec![],
            fail_train: true,
            train_delay: None,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            train_label_counts: Mutex::new(Vec::new()),
            detections: vec![],
            fail_train: false,
            train_delay: Some(delay),
        })
    }
}

impl Detector for MockDetector {
    fn train(
        &self,
        dataset: &DatasetDescriptor,
        config: &TrainConfig,
    ) -> Result<ModelHandle, DetectorError> {
        if let Some(delay) = self.train_delay {
            std::thread::sleep(delay);
        }
        if self.fail_train {
            return Err(DetectorError::Train("mock trainer refused".to_string()));
        }
        let labels = fs::read_dir(&dataset.label_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().map(|x| x == "json") == Some(true))
                    .count()
            })
            .unwrap_or(0);
        self.train_label_counts.lock().unwrap().push(labels);
        fs::create_dir_all(&config.output_dir)
            .map_err(|e| DetectorError::Train(e.to_string()))?;
        Ok(ModelHandle { path: config.output_dir.clone() })
    }

    fn infer(&self, _model: &ModelHandle, _image: &Path) -> Result<Vec<Detection>, DetectorError> {
        Ok(self
            .detections
            .iter()
            .map(|(class_name, score)| Detection {
                class_name: class_name.clone(),
                bbox: BBox::new(0.1, 0.1, 0.5, 0.5).unwrap(),
                score: *score,
            })
            .collect())
    }
}

struct MockExporter {
    fail: bool,
}

impl Exporter for MockExporter {
    fn export(&self, _model: &ModelHandle, dest: &Path) -> Result<PathBuf, ExportError> {
        if self.fail {
            return Err(ExportError::Failed("mock exporter refused".to_string()));
        }
        Ok(dest.to_path_buf())
    }
}

fn urls(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("http://img.test/{i}.jpg")).collect()
}

fn backends(
    searcher: Arc<dyn Searcher>,
    extractor: Arc<dyn FeatureExtractor>,
    detector: Arc<dyn Detector>,
    exporter: Arc<dyn Exporter>,
) -> Backends {
    Backends {
        searcher,
        fetcher: Arc::new(StubFetcher { delay: Duration::ZERO }),
        extractor,
        detector,
        exporter,
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        sample_count: 9,
        search_results: 20,
        pool_size: 30,
        confidence_threshold: 0.5,
        stage_timeout: Duration::from_secs(30),
    }
}

fn manual(image_id: &str, class_name: &str) -> Annotation {
    Annotation::manual(image_id, class_name, BBox::new(0.2, 0.2, 0.8, 0.8).unwrap())
}

#[tokio::test]
async fn bootstrap_from_twenty_candidates() {
    let tmp = tempfile::tempdir().unwrap();
    let detector = MockDetector::new(vec![("cat", 0.8)]);
    let pipeline = Pipeline::open(
        DataDir::from(tmp.path().to_path_buf()),
        backends(
            Arc::new(StubSearcher { urls: urls(20) }),
            HashExtractor::new(),
            detector.clone(),
            Arc::new(MockExporter { fail: false }),
        ),
        config(),
    )
    .await
    .unwrap();

    let session = pipeline.start("cat").await.unwrap();
    assert_eq!(session.stage, Stage::AwaitingManualAnnotation);

    let sampled = pipeline.sampled_images(&session.id).await.unwrap();
    assert_eq!(sampled.len(), 9);

    // two manual annotations for two of the nine sampled images
    let submission = vec![manual(&sampled[0].id, "cat"), manual(&sampled[1].id, "cat")];
    let session = pipeline.submit_annotations(&session.id, submission).await.unwrap();
    assert_eq!(session.stage, Stage::Done);
    assert!(session.failure_reason.is_none());
    assert!(session.model_path.is_some());

    // bootstrap training saw exactly the two manually labeled images;
    // retraining ran once more on the expanded set
    let counts = detector.train_label_counts.lock().unwrap();
    assert_eq!(counts.len(), 2);
    assert_eq!(counts[0], 2);
    assert!(counts[1] > 2);
}

#[tokio::test]
async fn empty_search_fails_before_sampling() {
    let tmp = tempfile::tempdir().unwrap();
    let extractor = HashExtractor::new();
    let pipeline = Pipeline::open(
        DataDir::from(tmp.path().to_path_buf()),
        backends(
            Arc::new(EmptySearcher),
            extractor.clone(),
            MockDetector::new(vec![]),
            Arc::new(MockExporter { fail: false }),
        ),
        config(),
    )
    .await
    .unwrap();

    let session = pipeline.start("unicorn").await.unwrap();
    assert_eq!(session.stage, Stage::Failed);
    assert_eq!(session.failure_reason, Some(FailureReason::NoCandidates));
    // the sampler never ran
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
}

#[rstest::rstest]
#[case::empty_submission(vec![])]
#[case::only_unknown_images(vec![manual("not-a-sampled-image", "cat")])]
#[tokio::test]
async fn unusable_submission_never_trains(#[case] submission: Vec<Annotation>) {
    let tmp = tempfile::tempdir().unwrap();
    let detector = MockDetector::new(vec![]);
    let pipeline = Pipeline::open(
        DataDir::from(tmp.path().to_path_buf()),
        backends(
            Arc::new(StubSearcher { urls: urls(20) }),
            HashExtractor::new(),
            detector.clone(),
            Arc::new(MockExporter { fail: false }),
        ),
        config(),
    )
    .await
    .unwrap();

    let session = pipeline.start("cat").await.unwrap();
    let session = pipeline.submit_annotations(&session.id, submission).await.unwrap();
    assert_eq!(session.stage, Stage::Failed);
    assert_eq!(session.failure_reason, Some(FailureReason::NoAnnotations));
    assert!(detector.train_label_counts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn auto_annotations_filtered_by_threshold() {
    let tmp = tempfile::tempdir().unwrap();
    let data = DataDir::from(tmp.path().to_path_buf());
    let detector = MockDetector::new(vec![("cat", 0.9), ("cat", 0.3)]);
    let pipeline = Pipeline::open(
        data.clone(),
        backends(
            Arc::new(StubSearcher { urls: urls(30) }),
            HashExtractor::new(),
            detector,
            Arc::new(MockExporter { fail: false }),
        ),
        config(),
    )
    .await
    .unwrap();

    let session = pipeline.start("cat").await.unwrap();
    let sampled = pipeline.sampled_images(&session.id).await.unwrap();
    let session = pipeline
        .submit_annotations(&session.id, vec![manual(&sampled[0].id, "cat")])
        .await
        .unwrap();
    assert_eq!(session.stage, Stage::Done);

    // every pool image kept only the 0.9 detection
    let store = AnnotationStore::open(data.annotations_dir(&session.id)).unwrap();
    let sampled_ids: std::collections::HashSet<_> =
        sampled.iter().map(|r| r.id.clone()).collect();
    let mut checked = 0;
    for (image_id, annotation) in store.all() {
        if sampled_ids.contains(image_id) {
            continue;
        }
        assert_eq!(annotation.score(), 0.9);
        assert!(!annotation.is_manual());
        checked += 1;
    }
    assert!(checked > 0, "expected auto annotations on the expanded pool");
    for id in &sampled_ids {
        for annotation in store.get_all(id) {
            assert!(annotation.is_manual() || annotation.score() == 0.9);
        }
    }
}

#[tokio::test]
async fn training_failure_is_terminal() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(
        DataDir::from(tmp.path().to_path_buf()),
        backends(
            Arc::new(StubSearcher { urls: urls(20) }),
            HashExtractor::new(),
            MockDetector::failing(),
            Arc::new(MockExporter { fail: false }),
        ),
        config(),
    )
    .await
    .unwrap();

    let session = pipeline.start("cat").await.unwrap();
    let sampled = pipeline.sampled_images(&session.id).await.unwrap();
    let session = pipeline
        .submit_annotations(&session.id, vec![manual(&sampled[0].id, "cat")])
        .await
        .unwrap();
    assert_eq!(session.stage, Stage::Failed);
    assert_eq!(session.failure_reason, Some(FailureReason::TrainingFailed));
}

#[tokio::test]
async fn stage_timeout_is_distinguishable_from_training_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.stage_timeout = Duration::from_millis(100);
    let pipeline = Pipeline::open(
        DataDir::from(tmp.path().to_path_buf()),
        backends(
            Arc::new(StubSearcher { urls: urls(20) }),
            HashExtractor::new(),
            MockDetector::slow(Duration::from_secs(2)),
            Arc::new(MockExporter { fail: false }),
        ),
        cfg,
    )
    .await
    .unwrap();

    let session = pipeline.start("cat").await.unwrap();
    let sampled = pipeline.sampled_images(&session.id).await.unwrap();
    let session = pipeline
        .submit_annotations(&session.id, vec![manual(&sampled[0].id, "cat")])
        .await
        .unwrap();
    assert_eq!(session.stage, Stage::Failed);
    assert_eq!(session.failure_reason, Some(FailureReason::Timeout));
}

#[tokio::test]
async fn concurrent_submissions_drive_the_flow_once() {
    let tmp = tempfile::tempdir().unwrap();
    let detector = MockDetector::slow(Duration::from_millis(300));
    let pipeline = Arc::new(
        Pipeline::open(
            DataDir::from(tmp.path().to_path_buf()),
            backends(
                Arc::new(StubSearcher { urls: urls(20) }),
                HashExtractor::new(),
                detector.clone(),
                Arc::new(MockExporter { fail: false }),
            ),
            config(),
        )
        .await
        .unwrap(),
    );

    let session = pipeline.start("cat").await.unwrap();
    let sampled = pipeline.sampled_images(&session.id).await.unwrap();
    let submission = vec![manual(&sampled[0].id, "cat")];

    // a client retry lands while the first submission is still training
    let first = tokio::spawn({
        let pipeline = pipeline.clone();
        let id = session.id.clone();
        let submission = submission.clone();
        async move { pipeline.submit_annotations(&id, submission).await }
    });
    let second = tokio::spawn({
        let pipeline = pipeline.clone();
        let id = session.id.clone();
        let submission = submission.clone();
        async move { pipeline.submit_annotations(&id, submission).await }
    });
    let (first, second) = tokio::join!(first, second);
    let results = [first.unwrap(), second.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let winner = results.into_iter().flatten().next().unwrap();
    assert_eq!(winner.stage, Stage::Done);
    // one bootstrap training and one retraining, not two of each
    assert_eq!(detector.train_label_counts.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn stage_budget_covers_every_call_in_a_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.stage_timeout = Duration::from_millis(1500);
    let delay = Duration::from_millis(1000);
    let pipeline = Pipeline::open(
        DataDir::from(tmp.path().to_path_buf()),
        Backends {
            searcher: Arc::new(SlowSearcher { urls: urls(20), delay }),
            fetcher: Arc::new(StubFetcher { delay }),
            extractor: HashExtractor::new(),
            detector: MockDetector::new(vec![("cat", 0.8)]),
            exporter: Arc::new(MockExporter { fail: false }),
        },
        cfg,
    )
    .await
    .unwrap();

    // each call alone fits the budget, so the suspend point is reached
    let session = pipeline.start("cat").await.unwrap();
    assert_eq!(session.stage, Stage::AwaitingManualAnnotation);

    // pool search and pool fetch together overrun the shared stage budget
    let sampled = pipeline.sampled_images(&session.id).await.unwrap();
    let session = pipeline
        .submit_annotations(&session.id, vec![manual(&sampled[0].id, "cat")])
        .await
        .unwrap();
    assert_eq!(session.stage, Stage::Failed);
    assert_eq!(session.failure_reason, Some(FailureReason::Timeout));
}

#[tokio::test]
async fn export_failure_keeps_the_trained_model() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(
        DataDir::from(tmp.path().to_path_buf()),
        backends(
            Arc::new(StubSearcher { urls: urls(20) }),
            HashExtractor::new(),
            MockDetector::new(vec![("cat", 0.8)]),
            Arc::new(MockExporter { fail: true }),
        ),
        config(),
    )
    .await
    .unwrap();

    let session = pipeline.start("cat").await.unwrap();
    let sampled = pipeline.sampled_images(&session.id).await.unwrap();
    let session = pipeline
        .submit_annotations(&session.id, vec![manual(&sampled[0].id, "cat")])
        .await
        .unwrap();
    assert_eq!(session.stage, Stage::Failed);
    assert_eq!(session.failure_reason, Some(FailureReason::ExportFailed));
    assert!(session.model_path.is_some(), "export failure must not invalidate training");
}

#[tokio::test]
async fn sessions_use_disjoint_workspaces() {
    let tmp = tempfile::tempdir().unwrap();
    let data = DataDir::from(tmp.path().to_path_buf());
    let pipeline = Pipeline::open(
        data.clone(),
        backends(
            Arc::new(StubSearcher { urls: urls(20) }),
            HashExtractor::new(),
            MockDetector::new(vec![]),
            Arc::new(MockExporter { fail: false }),
        ),
        config(),
    )
    .await
    .unwrap();

    let a = pipeline.start("cat").await.unwrap();
    let b = pipeline.start("dog").await.unwrap();
    assert_ne!(a.id, b.id);
    assert_ne!(data.images_dir(&a.id), data.images_dir(&b.id));
    // both workspaces hold their own sampled images
    assert_eq!(fs::read_dir(data.images_dir(&a.id)).unwrap().count(), 9);
    assert_eq!(fs::read_dir(data.images_dir(&b.id)).unwrap().count(), 9);
}
