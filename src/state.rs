use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Per-scene processing stages, filled strictly in this order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SceneStage {
    /// Raw text from the splitter
    Raw,

    /// Narration text available (simplified or raw fallback)
    Simplified,

    /// Image and audio available (real or placeholder)
    MediaReady,

    /// Slide clip rendered
    Assembled,
}

impl SceneStage {
    pub fn next(&self) -> Option<SceneStage> {
        match self {
            SceneStage::Raw => Some(SceneStage::Simplified),
            SceneStage::Simplified => Some(SceneStage::MediaReady),
            SceneStage::MediaReady => Some(SceneStage::Assembled),
            SceneStage::Assembled => None,
        }
    }
}

/// On-disk layout of per-scene artifacts, named by scene index
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    base_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn images_dir(&self) -> PathBuf {
        self.base_dir.join("images")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.base_dir.join("audio")
    }

    pub fn text_dir(&self) -> PathBuf {
        self.base_dir.join("text")
    }

    pub fn slides_dir(&self) -> PathBuf {
        self.base_dir.join("slides")
    }

    pub fn image_path(&self, index: usize) -> PathBuf {
        self.images_dir().join(format!("scene_{:03}.png", index))
    }

    pub fn audio_path(&self, index: usize) -> PathBuf {
        self.audio_dir().join(format!("scene_{:03}.mp3", index))
    }

    pub fn text_path(&self, index: usize) -> PathBuf {
        self.text_dir().join(format!("scene_{:03}.txt", index))
    }

    pub fn slide_path(&self, index: usize) -> PathBuf {
        self.slides_dir().join(format!("scene_{:03}.mp4", index))
    }

    /// Placeholders use their own names so a re-run retries the real asset
    pub fn placeholder_image_path(&self, index: usize) -> PathBuf {
        self.images_dir().join(format!("placeholder_{:03}.png", index))
    }

    pub fn placeholder_audio_path(&self, index: usize) -> PathBuf {
        self.audio_dir().join(format!("placeholder_{:03}.mp3", index))
    }

    /// Media narrated from unsimplified text, never reused
    pub fn raw_image_path(&self, index: usize) -> PathBuf {
        self.images_dir().join(format!("raw_{:03}.png", index))
    }

    pub fn raw_audio_path(&self, index: usize) -> PathBuf {
        self.audio_dir().join(format!("raw_{:03}.mp3", index))
    }

    pub fn report_path(&self) -> PathBuf {
        self.base_dir.join("run_report.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.base_dir.join("scenes.json")
    }

    /// Create the output directory tree
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.base_dir.clone(),
            self.images_dir(),
            self.audio_dir(),
            self.text_dir(),
            self.slides_dir(),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Cached simplified text for a scene, if present and non-empty
    pub async fn load_simplified(&self, index: usize) -> Option<String> {
        match fs::read_to_string(self.text_path(index)).await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }

    pub async fn save_simplified(&self, index: usize, text: &str) -> Result<()> {
        fs::write(self.text_path(index), text).await?;
        Ok(())
    }

    /// Delete every generated artifact of one scene
    pub async fn invalidate(&self, index: usize) -> Result<()> {
        for path in [
            self.text_path(index),
            self.image_path(index),
            self.audio_path(index),
            self.raw_image_path(index),
            self.raw_audio_path(index),
            self.slide_path(index),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("🧹 Invalidated cached artifacts for scene {}", index);
        Ok(())
    }
}

/// True when the file exists and is non-empty
pub async fn artifact_exists(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Fingerprints of the raw text each cached scene was produced from.
///
/// Scenes without an entry are trusted as-is; scenes whose text changed are
/// invalidated before reuse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SceneManifest {
    scenes: BTreeMap<usize, String>,
}

impl SceneManifest {
    pub async fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring unreadable scene manifest {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).await?;
        Ok(())
    }

    /// MD5 of the raw text, stable across builds and toolchains
    pub fn fingerprint(raw_text: &str) -> String {
        format!("{:x}", md5::compute(raw_text.as_bytes()))
    }

    /// Whether cached artifacts for this index came from different text
    pub fn is_stale(&self, index: usize, raw_text: &str) -> bool {
        self.scenes
            .get(&index)
            .map_or(false, |recorded| *recorded != Self::fingerprint(raw_text))
    }

    pub fn record(&mut self, index: usize, raw_text: &str) {
        self.scenes.insert(index, Self::fingerprint(raw_text));
    }

    /// Drop entries beyond the current scene count
    pub fn truncate(&mut self, scene_count: usize) {
        let removed = self.scenes.split_off(&scene_count);
        if !removed.is_empty() {
            info!("📋 Forgot {} scenes no longer in the document", removed.len());
        }
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}
