use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{Config, FailurePolicy};
use crate::error::{truncate, PipelineStageError, ProviderAttempt};
use crate::llm::{Router, TaskType};
use crate::media::{MediaBackend, Slide, SlideRequest};
use crate::scenes::{Scene, SceneSplitter};
use crate::state::{artifact_exists, ArtifactLayout, SceneManifest, SceneStage};

/// A scene that did not make it through cleanly
#[derive(Debug, Clone, Serialize)]
pub struct SceneIssue {
    pub index: usize,
    /// Stage the scene was trying to reach
    pub stage: SceneStage,
    pub cause: String,
    /// Provider history when simplification failed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provider_failures: Vec<ProviderAttempt>,
}

/// Summary of one pipeline run, saved as `run_report.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub document: PathBuf,
    pub video_path: PathBuf,
    pub total_scenes: usize,
    pub assembled_scenes: usize,
    /// Scenes omitted from the video or degraded with fallbacks
    pub skipped: Vec<SceneIssue>,
    /// Scenes served entirely from cached artifacts
    pub resumed_scenes: usize,
    /// Scenes simplified by each provider during this run
    pub providers_used: BTreeMap<String, usize>,
    pub started_at: DateTime<Utc>,
    pub total_time: Duration,
}

impl RunReport {
    /// Scenes missing from the final video
    pub fn omitted_scenes(&self) -> usize {
        self.total_scenes - self.assembled_scenes
    }
}

/// Result of driving one scene through the pipeline
#[derive(Debug, Clone)]
struct SceneOutcome {
    index: usize,
    slide: Option<Slide>,
    issues: Vec<SceneIssue>,
    resumed: bool,
    provider: Option<String>,
}

impl SceneOutcome {
    fn lost(index: usize, cause: impl Into<String>) -> Self {
        Self {
            index,
            slide: None,
            issues: vec![SceneIssue {
                index,
                stage: SceneStage::Assembled,
                cause: cause.into(),
                provider_failures: Vec::new(),
            }],
            resumed: false,
            provider: None,
        }
    }
}

/// A media asset obtained for a scene
struct Asset {
    path: PathBuf,
    reused: bool,
    placeholder: bool,
}

/// Drives a document through extraction, splitting, simplification, media
/// generation and assembly.
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    router: Arc<Router>,
    media: Arc<dyn MediaBackend>,
    layout: ArtifactLayout,
    worker_semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl PipelineOrchestrator {
    pub fn new(config: Config, router: Arc<Router>, media: Arc<dyn MediaBackend>) -> Self {
        let max_concurrent = config.pipeline.max_workers.max(1);
        let layout = ArtifactLayout::new(config.output.base_dir.clone());

        info!(
            "🔧 Initializing pipeline ({} mode, {} workers)",
            if config.pipeline.parallel { "parallel" } else { "sequential" },
            max_concurrent
        );

        Self {
            config: Arc::new(config),
            router,
            media,
            layout,
            worker_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Turn a document into the final video
    pub async fn run(&self, document: &Path) -> Result<RunReport, PipelineStageError> {
        let start_time = Instant::now();
        let started_at = Utc::now();
        let video_path = self.config.output.video_path();

        info!("🚀 Starting pipeline...");
        info!("📄 Document: {}", document.display());
        info!("📂 Output: {}", self.layout.base_dir().display());

        self.layout
            .ensure_dirs()
            .await
            .map_err(|e| PipelineStageError::Write {
                path: self.layout.base_dir().to_path_buf(),
                reason: e.to_string(),
            })?;

        let text = self
            .media
            .extract_text(document)
            .await
            .map_err(|e| PipelineStageError::Extraction {
                path: document.to_path_buf(),
                reason: format!("{:#}", e),
            })?;
        if text.trim().is_empty() {
            return Err(PipelineStageError::Extraction {
                path: document.to_path_buf(),
                reason: "document contains no text".to_string(),
            });
        }

        let scenes = SceneSplitter::new(self.config.pipeline.max_scene_chars).split(&text);
        if scenes.is_empty() {
            return Err(PipelineStageError::NoScenes(document.to_path_buf()));
        }
        info!("✂️ Split document into {} scenes", scenes.len());

        let manifest_path = self.layout.manifest_path();
        let mut manifest = SceneManifest::load(&manifest_path).await;
        // Edited scenes lose their artifacts before the manifest vouches for the new text
        for scene in &scenes {
            if manifest.is_stale(scene.index, &scene.raw_text) {
                info!(scene = scene.index, "♻️ Scene text changed, discarding cached artifacts");
                self.layout
                    .invalidate(scene.index)
                    .await
                    .map_err(|e| PipelineStageError::Write {
                        path: self.layout.base_dir().to_path_buf(),
                        reason: format!("failed to clear artifacts of scene {}: {}", scene.index, e),
                    })?;
            }
            manifest.record(scene.index, &scene.raw_text);
        }
        manifest.truncate(scenes.len());
        if let Err(e) = manifest.save(&manifest_path).await {
            warn!("Failed to save scene manifest: {}", e);
        }

        let total_scenes = scenes.len();
        let outcomes = if self.config.pipeline.parallel {
            self.process_scenes_parallel(scenes).await?
        } else {
            self.process_scenes_sequential(scenes).await?
        };

        let mut report = RunReport {
            document: document.to_path_buf(),
            video_path: video_path.clone(),
            total_scenes,
            assembled_scenes: 0,
            skipped: Vec::new(),
            resumed_scenes: 0,
            providers_used: BTreeMap::new(),
            started_at,
            total_time: Duration::ZERO,
        };

        let mut slides = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            report.skipped.extend(outcome.issues);
            if outcome.resumed {
                report.resumed_scenes += 1;
            }
            if let Some(provider) = outcome.provider {
                *report.providers_used.entry(provider).or_insert(0) += 1;
            }
            if let Some(slide) = outcome.slide {
                slides.push(slide);
            }
        }
        report.assembled_scenes = slides.len();

        if slides.is_empty() {
            report.total_time = start_time.elapsed();
            self.save_report(&report).await;
            return Err(PipelineStageError::NoSlides);
        }

        info!("🎬 Concatenating {} slides...", slides.len());
        self.media
            .concatenate(&slides, &video_path)
            .await
            .map_err(|e| PipelineStageError::Write {
                path: video_path.clone(),
                reason: format!("{:#}", e),
            })?;

        report.total_time = start_time.elapsed();
        self.save_report(&report).await;
        log_summary(&report);

        Ok(report)
    }

    async fn process_scenes_sequential(
        &self,
        scenes: Vec<Scene>,
    ) -> Result<Vec<SceneOutcome>, PipelineStageError> {
        let worker = self.clone_worker_state();
        let total = scenes.len();
        let mut outcomes = Vec::with_capacity(total);

        for scene in scenes {
            info!("🎞️ Processing scene {}/{}", scene.index + 1, total);
            outcomes.push(worker.process_scene(scene).await?);
        }
        Ok(outcomes)
    }

    /// Process scenes concurrently, bounded by the worker semaphore.
    ///
    /// Results arrive in completion order and are slotted back by index.
    async fn process_scenes_parallel(
        &self,
        scenes: Vec<Scene>,
    ) -> Result<Vec<SceneOutcome>, PipelineStageError> {
        let (tx, mut rx) = mpsc::channel(self.max_concurrent);
        let total = scenes.len();
        let mut handles = Vec::with_capacity(total);

        for scene in scenes {
            let worker = self.clone_worker_state();
            let tx = tx.clone();
            let semaphore = Arc::clone(&self.worker_semaphore);

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let index = scene.index;
                info!("🎞️ Processing scene {}/{}", index + 1, total);

                let result = worker.process_scene(scene).await;
                if let Err(e) = tx.send((index, result)).await {
                    error!("Failed to send result for scene {}: {}", index, e);
                }
            }));
        }

        // Drop the original sender to close the channel when all tasks complete
        drop(tx);

        let mut slots: Vec<Option<SceneOutcome>> = vec![None; total];
        while let Some((index, result)) = rx.recv().await {
            match result {
                Ok(outcome) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(e) => {
                    for handle in &handles {
                        handle.abort();
                    }
                    return Err(e);
                }
            }
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    error!(scene = index, "Scene worker exited without a result");
                    SceneOutcome::lost(index, "scene worker exited without a result")
                })
            })
            .collect())
    }

    fn clone_worker_state(&self) -> SceneWorker {
        SceneWorker {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            media: Arc::clone(&self.media),
            layout: self.layout.clone(),
        }
    }

    async fn save_report(&self, report: &RunReport) {
        let path = self.layout.report_path();
        let saved = match serde_json::to_string_pretty(report) {
            Ok(json) => tokio::fs::write(&path, json).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match saved {
            Ok(()) => info!("💾 Run report saved to: {}", path.display()),
            Err(e) => warn!("Failed to save run report {}: {}", path.display(), e),
        }
    }
}

fn log_summary(report: &RunReport) {
    info!(
        "✅ Video ready: {} ({}/{} scenes, {} resumed) in {:.1}s",
        report.video_path.display(),
        report.assembled_scenes,
        report.total_scenes,
        report.resumed_scenes,
        report.total_time.as_secs_f64()
    );
    for (provider, count) in &report.providers_used {
        info!("🤖 {}: {} scenes", provider, count);
    }
    for issue in &report.skipped {
        warn!(
            scene = issue.index,
            stage = ?issue.stage,
            "⚠️ Scene {}: {}",
            issue.index,
            issue.cause
        );
        for attempt in &issue.provider_failures {
            warn!("    {} ({} tries): {}", attempt.provider, attempt.tries, attempt.error);
        }
    }
}

/// Remove whatever a failed generator left at its output path
async fn discard_partial(index: usize, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(scene = index, "Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(scene = index, "Failed to remove partial output {}: {}", path.display(), e),
    }
}

/// Shared, read-only state handed to each scene task
#[derive(Clone)]
struct SceneWorker {
    config: Arc<Config>,
    router: Arc<Router>,
    media: Arc<dyn MediaBackend>,
    layout: ArtifactLayout,
}

impl SceneWorker {
    fn policy(&self) -> FailurePolicy {
        self.config.pipeline.failure_policy
    }

    /// Drive one scene from raw text to an assembled slide.
    ///
    /// Errors are returned only under [`FailurePolicy::Abort`]; otherwise
    /// failures degrade the scene and are recorded as issues.
    async fn process_scene(&self, mut scene: Scene) -> Result<SceneOutcome, PipelineStageError> {
        let index = scene.index;
        let started = Instant::now();
        let mut issues = Vec::new();

        // Simplification
        let mut provider = None;
        let mut raw_fallback = false;
        let cached_text = self.layout.load_simplified(index).await;
        let text_reused = cached_text.is_some();
        match cached_text {
            Some(text) => {
                debug!(scene = index, "Reusing cached simplified text");
                scene.set_simplified(text)?;
            }
            None => {
                let task_type = if self.config.pipeline.detect_task_type {
                    TaskType::detect(&scene.raw_text)
                } else {
                    TaskType::Text
                };
                match self.router.simplify(&scene.raw_text, task_type).await {
                    Ok(result) => {
                        debug!(
                            scene = index,
                            provider = %result.provider_used,
                            "Simplified: {}",
                            truncate(&result.text, 80)
                        );
                        if let Err(e) = self.layout.save_simplified(index, &result.text).await {
                            warn!(scene = index, "Failed to cache simplified text: {}", e);
                        }
                        provider = Some(result.provider_used.key().to_string());
                        scene.set_simplified(result.text)?;
                    }
                    Err(e) => {
                        if self.policy() == FailurePolicy::Abort {
                            return Err(PipelineStageError::Routing { index, source: e });
                        }
                        warn!(
                            scene = index,
                            attempts = e.attempts.len(),
                            "⚠️ Simplification failed, narrating raw text: {}",
                            e
                        );
                        issues.push(SceneIssue {
                            index,
                            stage: SceneStage::Simplified,
                            cause: "all providers failed, raw text used".to_string(),
                            provider_failures: e.attempts,
                        });
                        let raw = scene.raw_text.clone();
                        scene.set_simplified(raw)?;
                        raw_fallback = true;
                    }
                }
            }
        }

        // Image and narration are independent. Media made from raw text is
        // kept out of the reusable names so a later simplified run replaces it.
        let narration = scene.narration().to_string();
        let reusable = !raw_fallback;
        let (image, audio) = tokio::join!(
            self.obtain_image(index, &narration, reusable),
            self.obtain_audio(index, &narration, reusable)
        );

        let mut media_ready = true;
        let image = self.resolve_asset(index, "image", image, &mut issues, &mut media_ready)?;
        let audio = self.resolve_asset(index, "audio", audio, &mut issues, &mut media_ready)?;

        let (image, audio) = match (image, audio) {
            (Some(image), Some(audio)) if media_ready => (image, audio),
            _ => {
                return Ok(SceneOutcome {
                    index,
                    slide: None,
                    issues,
                    resumed: false,
                    provider,
                })
            }
        };

        let placeholder = image.placeholder || audio.placeholder;
        let resumed = text_reused && image.reused && audio.reused;
        scene.set_media(image.path.clone(), audio.path.clone())?;

        // Slide assembly
        let request = SlideRequest {
            index,
            image: image.path,
            audio: audio.path,
            text: narration,
            duration: placeholder.then_some(self.config.pipeline.fallback_slide_seconds),
            output: self.layout.slide_path(index),
            placeholder,
        };

        let slide = match self.media.assemble_slide(&request).await {
            Ok(slide) => {
                scene.mark_assembled()?;
                Some(slide)
            }
            Err(e) => {
                if self.policy() == FailurePolicy::Abort {
                    return Err(PipelineStageError::Scene {
                        index,
                        stage: SceneStage::Assembled,
                        reason: format!("{:#}", e),
                    });
                }
                warn!(scene = index, "❌ Slide assembly failed, scene omitted: {:#}", e);
                issues.push(SceneIssue {
                    index,
                    stage: SceneStage::Assembled,
                    cause: format!("slide assembly failed: {:#}", e),
                    provider_failures: Vec::new(),
                });
                None
            }
        };

        debug!(
            scene = index,
            stage = ?scene.stage(),
            "Scene finished in {:.2}s",
            started.elapsed().as_secs_f64()
        );

        Ok(SceneOutcome {
            index,
            slide,
            issues,
            resumed,
            provider,
        })
    }

    async fn obtain_image(&self, index: usize, text: &str, reusable: bool) -> Result<Asset, String> {
        let path = if reusable {
            self.layout.image_path(index)
        } else {
            self.layout.raw_image_path(index)
        };
        if reusable && artifact_exists(&path).await {
            debug!(scene = index, "Reusing image {}", path.display());
            return Ok(Asset { path, reused: true, placeholder: false });
        }

        match self.media.generate_image(text, index, &path).await {
            Ok(path) => Ok(Asset { path, reused: false, placeholder: false }),
            Err(e) => {
                discard_partial(index, &path).await;
                let cause = format!("image generation failed: {:#}", e);
                if self.policy() == FailurePolicy::Abort {
                    return Err(cause);
                }
                warn!(scene = index, "⚠️ {}, using placeholder", cause);
                let placeholder = self.layout.placeholder_image_path(index);
                self.media
                    .placeholder_image(index, &placeholder)
                    .await
                    .map(|path| Asset { path, reused: false, placeholder: true })
                    .map_err(|pe| format!("{}; placeholder failed: {:#}", cause, pe))
            }
        }
    }

    async fn obtain_audio(&self, index: usize, text: &str, reusable: bool) -> Result<Asset, String> {
        let path = if reusable {
            self.layout.audio_path(index)
        } else {
            self.layout.raw_audio_path(index)
        };
        if reusable && artifact_exists(&path).await {
            debug!(scene = index, "Reusing narration {}", path.display());
            return Ok(Asset { path, reused: true, placeholder: false });
        }

        match self.media.generate_voice(text, index, &path).await {
            Ok(path) => Ok(Asset { path, reused: false, placeholder: false }),
            Err(e) => {
                discard_partial(index, &path).await;
                let cause = format!("voice generation failed: {:#}", e);
                if self.policy() == FailurePolicy::Abort {
                    return Err(cause);
                }
                warn!(scene = index, "⚠️ {}, using silent placeholder", cause);
                let placeholder = self.layout.placeholder_audio_path(index);
                let seconds = self.config.pipeline.fallback_slide_seconds;
                self.media
                    .placeholder_audio(index, seconds, &placeholder)
                    .await
                    .map(|path| Asset { path, reused: false, placeholder: true })
                    .map_err(|pe| format!("{}; placeholder failed: {:#}", cause, pe))
            }
        }
    }

    /// Record placeholder use or failure for one asset; fails only under Abort
    fn resolve_asset(
        &self,
        index: usize,
        kind: &str,
        asset: Result<Asset, String>,
        issues: &mut Vec<SceneIssue>,
        media_ready: &mut bool,
    ) -> Result<Option<Asset>, PipelineStageError> {
        match asset {
            Ok(asset) => {
                if asset.placeholder {
                    issues.push(SceneIssue {
                        index,
                        stage: SceneStage::MediaReady,
                        cause: format!("{} generation failed, placeholder used", kind),
                        provider_failures: Vec::new(),
                    });
                }
                Ok(Some(asset))
            }
            Err(cause) => {
                if self.policy() == FailurePolicy::Abort {
                    return Err(PipelineStageError::Scene {
                        index,
                        stage: SceneStage::MediaReady,
                        reason: cause,
                    });
                }
                warn!(scene = index, "❌ No {} available, scene omitted: {}", kind, cause);
                issues.push(SceneIssue {
                    index,
                    stage: SceneStage::MediaReady,
                    cause,
                    provider_failures: Vec::new(),
                });
                *media_ready = false;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::error::ProviderError;
    use crate::llm::{GenerationOptions, ProviderClient, ProviderKind, ProviderRegistry};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Echoes the prompt's first line, or always fails
    struct EchoClient {
        kind: ProviderKind,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderClient for EchoClient {
        async fn generate(
            &self,
            _prompt: &str,
            model: &str,
            _options: &GenerationOptions,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::BadResponse {
                    provider: self.kind,
                    reason: "model not found".to_string(),
                });
            }
            Ok(format!("simple text from {}", model))
        }

        async fn is_available(&self) -> bool {
            !self.fail
        }

        fn kind(&self) -> ProviderKind {
            self.kind
        }
    }

    /// Writes small files instead of running external tools
    #[derive(Default)]
    struct MockMedia {
        document: String,
        fail_images: HashSet<usize>,
        fail_voices: HashSet<usize>,
        /// Scenes whose voice tool dies after writing part of the file
        truncate_voices: HashSet<usize>,
        fail_assembly: HashSet<usize>,
        /// Per-scene voice delay in ms, to force out-of-order completion
        voice_delays: Vec<u64>,
        image_calls: Mutex<Vec<usize>>,
        voice_calls: Mutex<Vec<usize>>,
        placeholder_calls: AtomicUsize,
        assembled: Mutex<Vec<SlideRequest>>,
        concatenated: Mutex<Vec<usize>>,
    }

    impl MockMedia {
        fn with_document(document: &str) -> Self {
            Self {
                document: document.to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl MediaBackend for MockMedia {
        async fn extract_text(&self, _path: &Path) -> anyhow::Result<String> {
            Ok(self.document.clone())
        }

        async fn generate_image(&self, _text: &str, index: usize, output: &Path) -> anyhow::Result<PathBuf> {
            self.image_calls.lock().unwrap().push(index);
            if self.fail_images.contains(&index) {
                return Err(anyhow!("Stable Diffusion API unreachable"));
            }
            tokio::fs::write(output, b"png").await?;
            Ok(output.to_path_buf())
        }

        async fn generate_voice(&self, _text: &str, index: usize, output: &Path) -> anyhow::Result<PathBuf> {
            if let Some(delay) = self.voice_delays.get(index) {
                tokio::time::sleep(Duration::from_millis(*delay)).await;
            }
            self.voice_calls.lock().unwrap().push(index);
            if self.truncate_voices.contains(&index) {
                tokio::fs::write(output, b"trunc").await?;
                return Err(anyhow!("edge-tts exited with signal 9"));
            }
            if self.fail_voices.contains(&index) {
                return Err(anyhow!("edge-tts exited with 1"));
            }
            tokio::fs::write(output, b"mp3").await?;
            Ok(output.to_path_buf())
        }

        async fn placeholder_image(&self, _index: usize, output: &Path) -> anyhow::Result<PathBuf> {
            self.placeholder_calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(output, b"gray").await?;
            Ok(output.to_path_buf())
        }

        async fn placeholder_audio(&self, _index: usize, _seconds: f64, output: &Path) -> anyhow::Result<PathBuf> {
            self.placeholder_calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(output, b"silence").await?;
            Ok(output.to_path_buf())
        }

        async fn assemble_slide(&self, request: &SlideRequest) -> anyhow::Result<Slide> {
            if self.fail_assembly.contains(&request.index) {
                return Err(anyhow!("ffmpeg exited with 1"));
            }
            self.assembled.lock().unwrap().push(request.clone());
            Ok(Slide {
                index: request.index,
                path: request.output.clone(),
                duration: request.duration.unwrap_or(3.0),
                placeholder: request.placeholder,
            })
        }

        async fn concatenate(&self, slides: &[Slide], _output: &Path) -> anyhow::Result<()> {
            let mut order = self.concatenated.lock().unwrap();
            order.extend(slides.iter().map(|s| s.index));
            Ok(())
        }
    }

    const FIVE_SCENES: &str = "Первая сцена.\n\nВторая сцена.\n\nТретья сцена.\n\nЧетвёртая сцена.\n\nПятая сцена.";

    fn router(fail: bool) -> Arc<Router> {
        let client: Arc<dyn ProviderClient> = Arc::new(EchoClient {
            kind: ProviderKind::Ollama,
            fail,
            calls: AtomicUsize::new(0),
        });
        let config = Config::default();
        let registry = ProviderRegistry::with_clients(
            vec![(config.providers.ollama.clone(), client)],
            vec![ProviderKind::Ollama],
            vec![ProviderKind::Ollama],
        );
        Arc::new(Router::new(Arc::new(registry), config.routing))
    }

    fn orchestrator(config: Config, media: Arc<MockMedia>, fail_llm: bool) -> PipelineOrchestrator {
        let media: Arc<dyn MediaBackend> = media;
        PipelineOrchestrator::new(config, router(fail_llm), media)
    }

    #[tokio::test]
    async fn test_run_produces_ordered_video() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();
        let media = Arc::new(MockMedia::with_document(FIVE_SCENES));
        let pipeline = orchestrator(config, Arc::clone(&media), false);

        let report = pipeline.run(Path::new("doc.txt")).await.unwrap();

        assert_eq!(report.total_scenes, 5);
        assert_eq!(report.assembled_scenes, 5);
        assert!(report.skipped.is_empty());
        assert_eq!(report.providers_used.get("ollama"), Some(&5));
        assert_eq!(*media.concatenated.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(pipeline.layout().report_path().exists());

        let cached = pipeline.layout().load_simplified(2).await.unwrap();
        assert_eq!(cached, "simple text from llama3");
    }

    #[tokio::test]
    async fn test_existing_artifacts_are_reused() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(temp_dir.path());
        layout.ensure_dirs().await.unwrap();
        tokio::fs::write(layout.image_path(3), b"png").await.unwrap();
        tokio::fs::write(layout.audio_path(3), b"mp3").await.unwrap();
        layout.save_simplified(3, "готовый текст").await.unwrap();

        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();
        let media = Arc::new(MockMedia::with_document(FIVE_SCENES));
        let pipeline = orchestrator(config, Arc::clone(&media), false);

        let report = pipeline.run(Path::new("doc.txt")).await.unwrap();

        assert!(!media.image_calls.lock().unwrap().contains(&3));
        assert!(!media.voice_calls.lock().unwrap().contains(&3));
        assert_eq!(media.image_calls.lock().unwrap().len(), 4);
        assert_eq!(report.resumed_scenes, 1);
        assert_eq!(report.assembled_scenes, 5);

        let assembled = media.assembled.lock().unwrap();
        let scene3 = assembled.iter().find(|r| r.index == 3).unwrap();
        assert_eq!(scene3.text, "готовый текст");
    }

    #[tokio::test]
    async fn test_changed_scene_text_invalidates_cache() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();

        let first = Arc::new(MockMedia::with_document(FIVE_SCENES));
        orchestrator(config.clone(), Arc::clone(&first), false)
            .run(Path::new("doc.txt"))
            .await
            .unwrap();

        let edited = FIVE_SCENES.replace("Третья сцена.", "Совсем другая третья сцена.");
        let second = Arc::new(MockMedia::with_document(&edited));
        let report = orchestrator(config, Arc::clone(&second), false)
            .run(Path::new("doc.txt"))
            .await
            .unwrap();

        assert_eq!(*second.image_calls.lock().unwrap(), vec![2]);
        assert_eq!(report.resumed_scenes, 4);
    }

    #[tokio::test]
    async fn test_parallel_keeps_index_order() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .with_parallel(true)
            .with_workers(5)
            .build();
        let media = Arc::new(MockMedia {
            document: FIVE_SCENES.to_string(),
            voice_delays: vec![120, 90, 60, 30, 0],
            ..Default::default()
        });
        let pipeline = orchestrator(config, Arc::clone(&media), false);

        let report = pipeline.run(Path::new("doc.txt")).await.unwrap();

        // Later scenes finish first
        let finished = media.voice_calls.lock().unwrap().clone();
        assert_ne!(finished, vec![0, 1, 2, 3, 4]);
        assert_eq!(*media.concatenated.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(report.assembled_scenes, 5);
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_raw_text() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();
        let media = Arc::new(MockMedia::with_document("Один абзац."));
        let pipeline = orchestrator(config, Arc::clone(&media), true);

        let report = pipeline.run(Path::new("doc.txt")).await.unwrap();

        assert_eq!(report.assembled_scenes, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].stage, SceneStage::Simplified);
        assert_eq!(report.skipped[0].provider_failures.len(), 1);
        assert_eq!(media.assembled.lock().unwrap()[0].text, "Один абзац.");
        // Raw fallback is not cached, so the next run retries simplification
        assert!(pipeline.layout().load_simplified(0).await.is_none());
    }

    #[tokio::test]
    async fn test_llm_failure_aborts_under_abort_policy() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .with_failure_policy(FailurePolicy::Abort)
            .build();
        let media = Arc::new(MockMedia::with_document(FIVE_SCENES));
        let pipeline = orchestrator(config, Arc::clone(&media), true);

        let err = pipeline.run(Path::new("doc.txt")).await.unwrap_err();
        assert!(matches!(err, PipelineStageError::Routing { index: 0, .. }));
        assert!(media.concatenated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_failure_uses_placeholder_and_fixed_duration() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();
        let media = Arc::new(MockMedia {
            document: FIVE_SCENES.to_string(),
            fail_images: HashSet::from([1]),
            ..Default::default()
        });
        let pipeline = orchestrator(config, Arc::clone(&media), false);

        let report = pipeline.run(Path::new("doc.txt")).await.unwrap();

        assert_eq!(report.assembled_scenes, 5);
        assert_eq!(media.placeholder_calls.load(Ordering::SeqCst), 1);

        let assembled = media.assembled.lock().unwrap();
        let scene1 = assembled.iter().find(|r| r.index == 1).unwrap();
        assert!(scene1.placeholder);
        assert_eq!(scene1.duration, Some(5.0));
        assert_eq!(scene1.image, pipeline.layout().placeholder_image_path(1));
        assert!(assembled.iter().filter(|r| r.index != 1).all(|r| r.duration.is_none()));
    }

    #[tokio::test]
    async fn test_assembly_failure_omits_scene() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();
        let media = Arc::new(MockMedia {
            document: FIVE_SCENES.to_string(),
            fail_assembly: HashSet::from([4]),
            ..Default::default()
        });
        let pipeline = orchestrator(config, Arc::clone(&media), false);

        let report = pipeline.run(Path::new("doc.txt")).await.unwrap();

        assert_eq!(report.assembled_scenes, 4);
        assert_eq!(report.omitted_scenes(), 1);
        assert_eq!(*media.concatenated.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_document_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();
        let media = Arc::new(MockMedia::with_document("  \n\n  "));
        let pipeline = orchestrator(config, media, false);

        let err = pipeline.run(Path::new("empty.txt")).await.unwrap_err();
        assert!(matches!(err, PipelineStageError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_no_slides_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();
        let media = Arc::new(MockMedia {
            document: "Одна сцена.".to_string(),
            fail_assembly: HashSet::from([0]),
            ..Default::default()
        });
        let pipeline = orchestrator(config, Arc::clone(&media), false);

        let err = pipeline.run(Path::new("doc.txt")).await.unwrap_err();
        assert!(matches!(err, PipelineStageError::NoSlides));
        assert!(pipeline.layout().report_path().exists());
    }

    #[tokio::test]
    async fn test_edited_scene_is_regenerated_after_interrupted_run() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();

        let first = Arc::new(MockMedia::with_document(FIVE_SCENES));
        orchestrator(config.clone(), first, false)
            .run(Path::new("doc.txt"))
            .await
            .unwrap();

        // The edited run dies on scene 0, before scene 2 is reached
        let edited = FIVE_SCENES.replace("Третья сцена.", "Совсем другая третья сцена.");
        let mut abort_config = config.clone();
        abort_config.pipeline.failure_policy = FailurePolicy::Abort;
        let interrupted = Arc::new(MockMedia {
            document: edited.clone(),
            fail_assembly: HashSet::from([0]),
            ..Default::default()
        });
        assert!(orchestrator(abort_config, Arc::clone(&interrupted), false)
            .run(Path::new("doc.txt"))
            .await
            .is_err());
        assert!(interrupted.image_calls.lock().unwrap().is_empty());

        let resumed = Arc::new(MockMedia::with_document(&edited));
        let report = orchestrator(config, Arc::clone(&resumed), false)
            .run(Path::new("doc.txt"))
            .await
            .unwrap();

        assert_eq!(*resumed.image_calls.lock().unwrap(), vec![2]);
        assert_eq!(*resumed.voice_calls.lock().unwrap(), vec![2]);
        let assembled = resumed.assembled.lock().unwrap();
        let scene2 = assembled.iter().find(|r| r.index == 2).unwrap();
        assert_eq!(scene2.text, "simple text from llama3");
        assert_eq!(report.resumed_scenes, 4);
    }

    #[tokio::test]
    async fn test_partial_audio_is_discarded_on_failure() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();

        let crashing = Arc::new(MockMedia {
            document: "Одна сцена.".to_string(),
            truncate_voices: HashSet::from([0]),
            ..Default::default()
        });
        let pipeline = orchestrator(config.clone(), Arc::clone(&crashing), false);
        let report = pipeline.run(Path::new("doc.txt")).await.unwrap();

        assert_eq!(crashing.placeholder_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.skipped[0].stage, SceneStage::MediaReady);
        assert!(!pipeline.layout().audio_path(0).exists());

        let healthy = Arc::new(MockMedia::with_document("Одна сцена."));
        let report = orchestrator(config, Arc::clone(&healthy), false)
            .run(Path::new("doc.txt"))
            .await
            .unwrap();

        assert_eq!(*healthy.voice_calls.lock().unwrap(), vec![0]);
        assert!(report.skipped.is_empty());
        let assembled = healthy.assembled.lock().unwrap();
        assert_eq!(assembled[0].audio, pipeline.layout().audio_path(0));
        assert!(!assembled[0].placeholder);
    }

    #[tokio::test]
    async fn test_raw_text_media_is_replaced_once_llm_recovers() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();

        let degraded = Arc::new(MockMedia::with_document("Один абзац."));
        let pipeline = orchestrator(config.clone(), Arc::clone(&degraded), true);
        pipeline.run(Path::new("doc.txt")).await.unwrap();
        {
            let assembled = degraded.assembled.lock().unwrap();
            assert_eq!(assembled[0].text, "Один абзац.");
            assert_eq!(assembled[0].audio, pipeline.layout().raw_audio_path(0));
            assert_eq!(assembled[0].image, pipeline.layout().raw_image_path(0));
        }
        assert!(!pipeline.layout().audio_path(0).exists());

        let recovered = Arc::new(MockMedia::with_document("Один абзац."));
        let report = orchestrator(config, Arc::clone(&recovered), false)
            .run(Path::new("doc.txt"))
            .await
            .unwrap();

        assert_eq!(*recovered.image_calls.lock().unwrap(), vec![0]);
        assert_eq!(*recovered.voice_calls.lock().unwrap(), vec![0]);
        assert_eq!(report.resumed_scenes, 0);
        let assembled = recovered.assembled.lock().unwrap();
        assert_eq!(assembled[0].text, "simple text from llama3");
        assert_eq!(assembled[0].audio, pipeline.layout().audio_path(0));
        assert_eq!(assembled[0].image, pipeline.layout().image_path(0));
    }

    #[tokio::test]
    async fn test_parallel_llm_failure_aborts_under_abort_policy() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .with_parallel(true)
            .with_workers(3)
            .with_failure_policy(FailurePolicy::Abort)
            .build();
        let media = Arc::new(MockMedia::with_document(FIVE_SCENES));
        let pipeline = orchestrator(config, Arc::clone(&media), true);

        let err = pipeline.run(Path::new("doc.txt")).await.unwrap_err();
        assert!(matches!(err, PipelineStageError::Routing { .. }));
        assert!(media.concatenated.lock().unwrap().is_empty());
        assert!(!pipeline.layout().report_path().exists());
    }

    #[tokio::test]
    async fn test_image_failure_aborts_under_abort_policy() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .with_failure_policy(FailurePolicy::Abort)
            .build();
        let media = Arc::new(MockMedia {
            document: FIVE_SCENES.to_string(),
            fail_images: HashSet::from([1]),
            ..Default::default()
        });
        let pipeline = orchestrator(config, Arc::clone(&media), false);

        let err = pipeline.run(Path::new("doc.txt")).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineStageError::Scene { index: 1, stage: SceneStage::MediaReady, .. }
        ));
        assert_eq!(media.placeholder_calls.load(Ordering::SeqCst), 0);
        assert!(media.concatenated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_voice_failure_aborts_under_abort_policy() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .with_failure_policy(FailurePolicy::Abort)
            .build();
        let media = Arc::new(MockMedia {
            document: FIVE_SCENES.to_string(),
            fail_voices: HashSet::from([3]),
            ..Default::default()
        });
        let pipeline = orchestrator(config, Arc::clone(&media), false);

        let err = pipeline.run(Path::new("doc.txt")).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineStageError::Scene { index: 3, stage: SceneStage::MediaReady, .. }
        ));
        assert_eq!(media.assembled.lock().unwrap().len(), 3);
        assert!(media.concatenated.lock().unwrap().is_empty());
    }
}
