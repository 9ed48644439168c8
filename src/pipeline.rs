use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::task::spawn_blocking;
use tokio::time::{timeout_at, Instant};

use crate::annotation::{Annotation, AnnotationStore};
use crate::backend::{DetectorError, ModelHandle, SearchError, TrainConfig};
use crate::config::{DataDir, PipelineOptions};
use crate::dataset::{DatasetBuilder, DatasetDescriptor};
use crate::db::{crud, Database};
use crate::metrics;
use crate::sampler::DiversitySampler;
use crate::session::{FailureReason, ImageRecord, SessionState, Stage};

pub use crate::backend::Backends;

/// Related-image queries issued per sampled image when widening the pool.
const RELATED_PER_IMAGE: usize = 5;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Images selected for manual annotation.
    pub sample_count: usize,
    /// Candidate pool size fetched from search.
    pub search_results: usize,
    /// Expanded pool size labeled by the bootstrap model.
    pub pool_size: usize,
    /// Auto annotations below this confidence are discarded at ingestion.
    pub confidence_threshold: f32,
    /// Applied to every stage; an elapsed stage fails the session with a
    /// reason distinct from the stage's own failure.
    pub stage_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_count: 9,
            search_results: 20,
            pool_size: 50,
            confidence_threshold: 0.5,
            stage_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&PipelineOptions> for PipelineConfig {
    fn from(opts: &PipelineOptions) -> Self {
        Self {
            sample_count: opts.sample_count,
            search_results: opts.search_results,
            pool_size: opts.pool_size,
            confidence_threshold: opts.confidence_threshold,
            stage_timeout: opts.stage_timeout(),
        }
    }
}

/// Why a blocking stage call did not produce a value.
enum Interrupt {
    Timeout,
    Crashed,
}

impl Interrupt {
    /// Timeouts keep their own reason; a crashed collaborator counts as the
    /// stage's own failure.
    fn reason_or(self, stage_reason: FailureReason) -> FailureReason {
        match self {
            Interrupt::Timeout => FailureReason::Timeout,
            Interrupt::Crashed => stage_reason,
        }
    }
}

/// Drives one session through search, sampling, manual annotation, bootstrap
/// training, auto annotation, expansion, retraining and export.
///
/// The pipeline is single-flow per session: one stage at a time, transitions
/// one-directional, no automatic retry of a failed stage. Concurrent
/// sessions are fine; each gets a disjoint workspace under the data dir.
pub struct Pipeline {
    db: Database,
    data: DataDir,
    backends: Backends,
    config: PipelineConfig,
}

impl Pipeline {
    pub async fn open(data: DataDir, backends: Backends, config: PipelineConfig) -> Result<Self> {
        fs::create_dir_all(data.path())
            .with_context(|| format!("failed to create {}", data.path().display()))?;
        let db = crate::db::init_db(data.database()).await?;
        Ok(Self { db, data, backends, config })
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data
    }

    pub async fn status(&self, id: &str) -> Result<Option<SessionState>> {
        crud::get_session(&self.db, id).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionState>> {
        crud::list_sessions(&self.db).await
    }

    /// Images handed to the human annotator for this session.
    pub async fn sampled_images(&self, id: &str) -> Result<Vec<ImageRecord>> {
        crud::get_images(&self.db, id, true).await
    }

    /// Run a new session up to the manual-annotation suspend point.
    ///
    /// Always returns a session: on a stage failure its stage is `Failed`
    /// with the reason set, otherwise `AwaitingManualAnnotation`.
    pub async fn start(&self, query: &str) -> Result<SessionState> {
        let mut session = SessionState::new(query);
        self.data
            .create_session_dirs(&session.id)
            .context("failed to allocate session workspace")?;
        crud::insert_session(&self.db, &session).await?;
        info!("session {}: started for query {query:?}", session.id);

        let deadline = self.stage_deadline();
        let urls = {
            let searcher = self.backends.searcher.clone();
            let query = query.to_string();
            let max = self.config.search_results;
            match self.run_blocking(deadline, move || searcher.search(&query, max)).await {
                Ok(Ok(urls)) => urls,
                Ok(Err(e)) => {
                    warn!("session {}: search failed: {e}", session.id);
                    return self.fail(session, FailureReason::SearchFailed).await;
                }
                Err(i) => {
                    return self.fail(session, i.reason_or(FailureReason::SearchFailed)).await
                }
            }
        };
        if urls.is_empty() {
            return self.fail(session, FailureReason::NoCandidates).await;
        }

        self.advance(&mut session, Stage::Sampling).await?;
        let deadline = self.stage_deadline();
        let candidates_dir = self.data.candidates_dir(&session.id);
        let fetched = {
            let fetcher = self.backends.fetcher.clone();
            let dest = candidates_dir.clone();
            match self.run_blocking(deadline, move || fetcher.fetch_all(&urls, &dest)).await {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(e)) => {
                    warn!("session {}: candidate acquisition failed: {e}", session.id);
                    return self.fail(session, FailureReason::SearchFailed).await;
                }
                Err(i) => {
                    return self.fail(session, i.reason_or(FailureReason::SearchFailed)).await
                }
            }
        };
        if fetched.is_empty() {
            return self.fail(session, FailureReason::NoCandidates).await;
        }

        let records: Vec<ImageRecord> = fetched
            .into_iter()
            .filter_map(|(url, path)| {
                let id = path.file_stem()?.to_str()?.to_string();
                Some(ImageRecord::new(id, Some(url), path))
            })
            .collect();

        let mut sampled = {
            let sampler = DiversitySampler::new(self.backends.extractor.clone());
            let k = self.config.sample_count;
            match self.run_blocking(deadline, move || sampler.select(records, k)).await {
                Ok(sampled) => sampled,
                Err(i) => {
                    return self.fail(session, i.reason_or(FailureReason::NoCandidates)).await
                }
            }
        };
        if sampled.is_empty() {
            return self.fail(session, FailureReason::NoCandidates).await;
        }
        if sampled.len() < self.config.sample_count {
            // informational shortfall, not an error
            info!(
                "session {}: only {} of {} requested images sampled",
                session.id,
                sampled.len(),
                self.config.sample_count
            );
        }

        // Move the selection into the training image dir and drop the rest
        // of the staging pool.
        let images_dir = self.data.images_dir(&session.id);
        for record in &mut sampled {
            let file_name = record.local_path.file_name().context("image without a file name")?;
            let dest = images_dir.join(file_name);
            fs::rename(&record.local_path, &dest)
                .with_context(|| format!("failed to move {}", record.local_path.display()))?;
            record.local_path = dest;
        }
        if let Err(e) = fs::remove_dir_all(&candidates_dir) {
            warn!("session {}: failed to clear staging dir: {e}", session.id);
        }
        crud::insert_images(&self.db, &session.id, &sampled, true).await?;

        self.advance(&mut session, Stage::AwaitingManualAnnotation).await?;
        info!(
            "session {}: {} images await manual annotation",
            session.id,
            sampled.len()
        );
        Ok(session)
    }

    /// Resume a suspended session with manual annotations and run it to a
    /// terminal stage.
    pub async fn submit_annotations(
        &self,
        id: &str,
        manual: Vec<Annotation>,
    ) -> Result<SessionState> {
        let mut session = crud::get_session(&self.db, id)
            .await?
            .with_context(|| format!("no such session: {id}"))?;
        if session.stage != Stage::AwaitingManualAnnotation {
            bail!("session {id} is in stage {}, not awaiting annotations", session.stage);
        }
        // Exclusive claim of the suspend point. A concurrent submission for
        // the same session loses the swap and errors instead of running the
        // training flow a second time.
        self.claim(&mut session, Stage::AwaitingManualAnnotation, Stage::BootstrapTraining)
            .await?;
        let deadline = self.stage_deadline();
        if manual.is_empty() {
            return self.fail(session, FailureReason::NoAnnotations).await;
        }

        let sampled = crud::get_images(&self.db, id, true).await?;
        let known: HashSet<&str> = sampled.iter().map(|r| r.id.as_str()).collect();
        let mut store = AnnotationStore::open(self.data.annotations_dir(id))?;
        let mut accepted = 0usize;
        for annotation in manual {
            if !known.contains(annotation.image_id.as_str()) {
                warn!("session {id}: ignoring annotation for unknown image {}", annotation.image_id);
                continue;
            }
            // manual submissions always enter as source=manual, score 1.0
            store.put(Annotation::manual(annotation.image_id, annotation.class_name, annotation.bbox));
            accepted += 1;
        }
        if accepted == 0 {
            return self.fail(session, FailureReason::NoAnnotations).await;
        }
        store.save()?;

        let builder =
            DatasetBuilder::new(self.data.images_dir(id), self.data.annotations_dir(id));
        let descriptor = builder.build(&sampled, store.all().filter(|(_, a)| a.is_manual()));
        let dataset_file = descriptor.write_files(&self.data.dataset_dir(id))?;
        let bootstrap = match self
            .train(&descriptor, &dataset_file, self.data.model_dir(id).join("bootstrap"), deadline)
            .await
        {
            Ok(model) => model,
            Err(reason) => return self.fail(session, reason).await,
        };

        self.advance(&mut session, Stage::AutoAnnotating).await?;
        let deadline = self.stage_deadline();
        let pool = match self.acquire_pool(&session, &sampled, deadline).await {
            Ok(pool) => pool,
            Err(reason) => return self.fail(session, reason).await,
        };
        crud::insert_images(&self.db, id, &pool, false).await?;

        let detections = {
            let detector = self.backends.detector.clone();
            let model = bootstrap.clone();
            let targets: Vec<(String, PathBuf)> =
                pool.iter().map(|r| (r.id.clone(), r.local_path.clone())).collect();
            let run = move || -> Result<Vec<(String, Vec<crate::backend::Detection>)>, DetectorError> {
                targets
                    .into_iter()
                    .map(|(id, path)| Ok((id, detector.infer(&model, &path)?)))
                    .collect()
            };
            match self.run_blocking(deadline, run).await {
                Ok(Ok(detections)) => detections,
                Ok(Err(e)) => {
                    warn!("session {id}: inference failed: {e}");
                    return self.fail(session, FailureReason::InferenceFailed).await;
                }
                Err(i) => {
                    return self.fail(session, i.reason_or(FailureReason::InferenceFailed)).await
                }
            }
        };

        let mut kept = 0usize;
        let mut below = 0usize;
        for (image_id, image_detections) in detections {
            // an image with zero surviving detections simply stays unlabeled
            for detection in image_detections {
                if detection.score < self.config.confidence_threshold {
                    metrics::inc_auto_dropped_threshold();
                    below += 1;
                    continue;
                }
                match Annotation::auto(
                    &image_id,
                    detection.class_name,
                    detection.bbox,
                    detection.score,
                ) {
                    Ok(annotation) => {
                        store.put(annotation);
                        kept += 1;
                    }
                    Err(e) => warn!("session {id}: discarding detection on {image_id}: {e}"),
                }
            }
        }
        store.save()?;
        info!(
            "session {id}: kept {kept} auto annotations, dropped {below} below threshold, {} conflicts",
            store.dropped_conflicts()
        );

        self.advance(&mut session, Stage::DatasetExpansion).await?;
        let all_images = crud::get_images(&self.db, id, false).await?;
        let descriptor = builder.build(&all_images, store.all());
        let dataset_file = descriptor.write_files(&self.data.dataset_dir(id))?;

        self.advance(&mut session, Stage::Retraining).await?;
        let final_model = match self
            .train(&descriptor, &dataset_file, self.data.model_dir(id).join("final"), self.stage_deadline())
            .await
        {
            Ok(model) => model,
            Err(reason) => return self.fail(session, reason).await,
        };
        // the trained model is a valid artifact even if export fails below
        session.model_path = Some(final_model.path.clone());
        crud::update_session(&self.db, &session).await?;

        self.advance(&mut session, Stage::Exporting).await?;
        {
            let exporter = self.backends.exporter.clone();
            let model = final_model.clone();
            let dest = self.data.export_dir(id);
            match self.run_blocking(self.stage_deadline(), move || exporter.export(&model, &dest)).await {
                Ok(Ok(path)) => {
                    info!("session {id}: model exported to {}", path.display())
                }
                Ok(Err(e)) => {
                    warn!("session {id}: export failed: {e}");
                    return self.fail(session, FailureReason::ExportFailed).await;
                }
                Err(i) => {
                    return self.fail(session, i.reason_or(FailureReason::ExportFailed)).await
                }
            }
        }

        self.advance(&mut session, Stage::Done).await?;
        Ok(session)
    }

    /// Acquire the expanded pool for auto annotation: a larger re-search of
    /// the session query plus related-image queries for each sampled image,
    /// fetched straight into the training image dir (content dedup skips
    /// anything already there).
    async fn acquire_pool(
        &self,
        session: &SessionState,
        sampled: &[ImageRecord],
        deadline: Instant,
    ) -> Result<Vec<ImageRecord>, FailureReason> {
        let urls = {
            let searcher = self.backends.searcher.clone();
            let query = session.query.clone();
            let pool_size = self.config.pool_size;
            let seeds: Vec<String> = sampled.iter().filter_map(|r| r.source_url.clone()).collect();
            let run = move || -> Result<Vec<String>, SearchError> {
                let mut urls = searcher.search(&query, pool_size)?;
                for seed in &seeds {
                    // widening only; a failed related query is not fatal
                    match searcher.search(&format!("related:{seed}"), RELATED_PER_IMAGE) {
                        Ok(more) => urls.extend(more),
                        Err(e) => warn!("related search for {seed} failed: {e}"),
                    }
                }
                Ok(urls)
            };
            match self.run_blocking(deadline, run).await {
                Ok(Ok(urls)) => urls,
                Ok(Err(e)) => {
                    warn!("session {}: pool search failed: {e}", session.id);
                    return Err(FailureReason::SearchFailed);
                }
                Err(i) => return Err(i.reason_or(FailureReason::SearchFailed)),
            }
        };

        let mut seen = HashSet::new();
        let urls: Vec<String> = urls.into_iter().filter(|u| seen.insert(u.clone())).collect();

        let fetched = {
            let fetcher = self.backends.fetcher.clone();
            let dest = self.data.images_dir(&session.id);
            match self.run_blocking(deadline, move || fetcher.fetch_all(&urls, &dest)).await {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(e)) => {
                    warn!("session {}: pool acquisition failed: {e}", session.id);
                    return Err(FailureReason::SearchFailed);
                }
                Err(i) => return Err(i.reason_or(FailureReason::SearchFailed)),
            }
        };

        Ok(fetched
            .into_iter()
            .filter_map(|(url, path)| {
                let id = path.file_stem()?.to_str()?.to_string();
                Some(ImageRecord::new(id, Some(url), path))
            })
            .collect())
    }

    async fn train(
        &self,
        descriptor: &DatasetDescriptor,
        dataset_file: &Path,
        output_dir: PathBuf,
        deadline: Instant,
    ) -> Result<ModelHandle, FailureReason> {
        let detector = self.backends.detector.clone();
        let descriptor = descriptor.clone();
        let config = TrainConfig { output_dir, dataset_file: dataset_file.to_path_buf() };
        match self.run_blocking(deadline, move || detector.train(&descriptor, &config)).await {
            Ok(Ok(model)) => Ok(model),
            Ok(Err(e)) => {
                warn!("training failed: {e}");
                Err(FailureReason::TrainingFailed)
            }
            Err(i) => Err(i.reason_or(FailureReason::TrainingFailed)),
        }
    }

    /// Deadline for the stage that is about to run. Every collaborator call
    /// of one stage shares it, so a stage with several calls still cannot
    /// outlive one `stage_timeout`.
    fn stage_deadline(&self) -> Instant {
        Instant::now() + self.config.stage_timeout
    }

    /// Run a collaborator call on the blocking pool under the stage deadline.
    async fn run_blocking<T, F>(&self, deadline: Instant, f: F) -> Result<T, Interrupt>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        match timeout_at(deadline, spawn_blocking(f)).await {
            Err(_) => Err(Interrupt::Timeout),
            Ok(Err(e)) => {
                log::error!("stage task crashed: {e}");
                Err(Interrupt::Crashed)
            }
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Compare-and-swap transition out of a suspend point. Errors when
    /// another caller already moved the session out of `from`; the winner
    /// alone proceeds.
    async fn claim(&self, session: &mut SessionState, from: Stage, to: Stage) -> Result<()> {
        let now = Utc::now();
        if !crud::swap_stage(&self.db, &session.id, from, to, now).await? {
            bail!("session {} is no longer in stage {from}", session.id);
        }
        let elapsed = (now - session.updated_at).num_milliseconds() as f64 / 1000.0;
        metrics::observe_stage_duration(from.as_str(), elapsed);
        info!("session {}: {from} -> {to}", session.id);
        session.stage = to;
        session.updated_at = now;
        Ok(())
    }

    async fn advance(&self, session: &mut SessionState, stage: Stage) -> Result<()> {
        let elapsed = (Utc::now() - session.updated_at).num_milliseconds() as f64 / 1000.0;
        metrics::observe_stage_duration(session.stage.as_str(), elapsed);
        info!("session {}: {} -> {stage}", session.id, session.stage);
        session.stage = stage;
        session.touch();
        crud::update_session(&self.db, session).await
    }

    async fn fail(
        &self,
        mut session: SessionState,
        reason: FailureReason,
    ) -> Result<SessionState> {
        let elapsed = (Utc::now() - session.updated_at).num_milliseconds() as f64 / 1000.0;
        metrics::observe_stage_duration(session.stage.as_str(), elapsed);
        warn!("session {}: failed during {}: {reason}", session.id, session.stage);
        session.stage = Stage::Failed;
        session.failure_reason = Some(reason);
        session.touch();
        crud::update_session(&self.db, &session).await?;
        Ok(session)
    }
}
