use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::MediaConfig;
use crate::llm::prompts::illustration_prompt;

/// Words per subtitle line
const SUBTITLE_WORDS_PER_LINE: usize = 7;

const NEGATIVE_PROMPT: &str = "text, watermark, low quality, blurry";

/// A rendered per-scene clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slide {
    pub index: usize,
    pub path: PathBuf,
    /// Clip length in seconds
    pub duration: f64,
    /// Built from a placeholder image or audio track
    pub placeholder: bool,
}

/// Inputs for one slide render
#[derive(Debug, Clone)]
pub struct SlideRequest {
    pub index: usize,
    pub image: PathBuf,
    pub audio: PathBuf,
    pub text: String,
    /// Fixed length; `None` means narration length plus padding
    pub duration: Option<f64>,
    pub output: PathBuf,
    pub placeholder: bool,
}

/// External collaborators of the pipeline: extraction, image and voice
/// generation, and video assembly.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn extract_text(&self, path: &Path) -> Result<String>;

    async fn generate_image(&self, text: &str, index: usize, output: &Path) -> Result<PathBuf>;

    async fn generate_voice(&self, text: &str, index: usize, output: &Path) -> Result<PathBuf>;

    async fn placeholder_image(&self, index: usize, output: &Path) -> Result<PathBuf>;

    async fn placeholder_audio(&self, index: usize, seconds: f64, output: &Path) -> Result<PathBuf>;

    async fn assemble_slide(&self, request: &SlideRequest) -> Result<Slide>;

    async fn concatenate(&self, slides: &[Slide], output: &Path) -> Result<()>;
}

/// [`MediaBackend`] backed by command line tools and the Stable Diffusion
/// WebUI API: `pdftotext`, `pandoc`, `edge-tts`, `ffmpeg` and `ffprobe`.
#[derive(Clone)]
pub struct ExternalTools {
    config: MediaConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    steps: u32,
    cfg_scale: f32,
}

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
}

impl ExternalTools {
    pub fn new(config: MediaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.image_timeout_seconds))
            .build()
            .context("Failed to build HTTP client for image generation")?;
        Ok(Self { config, client })
    }

    fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tool_timeout_seconds)
    }

    /// Narration length from ffprobe
    pub async fn audio_duration(&self, audio: &Path) -> Result<f64> {
        let output = run_tool(
            "ffprobe",
            self.tool_timeout(),
            [
                OsStr::new("-v"),
                OsStr::new("quiet"),
                OsStr::new("-show_entries"),
                OsStr::new("format=duration"),
                OsStr::new("-of"),
                OsStr::new("default=noprint_wrappers=1:nokey=1"),
                audio.as_os_str(),
            ],
        )
        .await?;
        parse_duration(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| anyhow!("ffprobe returned no duration for {}", audio.display()))
    }

    fn slide_filter(&self, subtitle_file: &Path) -> String {
        let (w, h) = (self.config.video_width, self.config.video_height);
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,\
             drawtext=textfile={file}:fontsize={size}:fontcolor=white:\
             box=1:boxcolor=black@0.5:boxborderw=12:\
             x=(w-text_w)/2:y=h-text_h-40",
            file = escape_filter_value(&subtitle_file.to_string_lossy()),
            size = self.config.font_size,
        )
    }
}

#[async_trait]
impl MediaBackend for ExternalTools {
    async fn extract_text(&self, path: &Path) -> Result<String> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        let text = match extension.as_str() {
            "txt" | "md" => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
            "pdf" => {
                let output = run_tool(
                    "pdftotext",
                    self.tool_timeout(),
                    [OsStr::new("-enc"), OsStr::new("UTF-8"), path.as_os_str(), OsStr::new("-")],
                )
                .await?;
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            "docx" | "odt" => {
                let output = run_tool(
                    "pandoc",
                    self.tool_timeout(),
                    [path.as_os_str(), OsStr::new("-t"), OsStr::new("plain"), OsStr::new("--wrap=none")],
                )
                .await?;
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            other => return Err(anyhow!("Unsupported document type: .{}", other)),
        };

        info!("📄 Extracted {} characters from {}", text.chars().count(), path.display());
        Ok(text)
    }

    async fn generate_image(&self, text: &str, index: usize, output: &Path) -> Result<PathBuf> {
        let prompt = illustration_prompt(text);
        let request = Txt2ImgRequest {
            prompt: &prompt,
            negative_prompt: NEGATIVE_PROMPT,
            width: self.config.image_width,
            height: self.config.image_height,
            steps: self.config.image_steps,
            cfg_scale: self.config.cfg_scale,
        };

        debug!(scene = index, "Requesting illustration from {}", self.config.sd_api_base);
        let response = self
            .client
            .post(&self.config.sd_api_base)
            .json(&request)
            .send()
            .await
            .context("Stable Diffusion API unreachable")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Stable Diffusion API returned HTTP {}", status));
        }

        let body: Txt2ImgResponse = response.json().await?;
        let bytes = decode_image(&body)?;
        let partial = partial_path(output);
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, output).await?;

        info!("🖼️ Image for scene {} saved: {}", index, output.display());
        Ok(output.to_path_buf())
    }

    async fn generate_voice(&self, text: &str, index: usize, output: &Path) -> Result<PathBuf> {
        let partial = partial_path(output);
        let result = run_tool(
            "edge-tts",
            self.tool_timeout(),
            [
                OsStr::new("--voice"),
                OsStr::new(&self.config.tts_voice),
                OsStr::new("--text"),
                OsStr::new(text),
                OsStr::new("--write-media"),
                partial.as_os_str(),
            ],
        )
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, output).await?;

        info!("🔊 Narration for scene {} saved: {}", index, output.display());
        Ok(output.to_path_buf())
    }

    async fn placeholder_image(&self, index: usize, output: &Path) -> Result<PathBuf> {
        let source = format!(
            "color=c=0xF0F0F0:s={}x{}",
            self.config.image_width, self.config.image_height
        );
        run_tool(
            "ffmpeg",
            self.tool_timeout(),
            [
                OsStr::new("-y"),
                OsStr::new("-f"),
                OsStr::new("lavfi"),
                OsStr::new("-i"),
                OsStr::new(&source),
                OsStr::new("-frames:v"),
                OsStr::new("1"),
                output.as_os_str(),
            ],
        )
        .await?;

        debug!(scene = index, "Placeholder image written to {}", output.display());
        Ok(output.to_path_buf())
    }

    async fn placeholder_audio(&self, index: usize, seconds: f64, output: &Path) -> Result<PathBuf> {
        let length = format!("{:.2}", seconds);
        run_tool(
            "ffmpeg",
            self.tool_timeout(),
            [
                OsStr::new("-y"),
                OsStr::new("-f"),
                OsStr::new("lavfi"),
                OsStr::new("-i"),
                OsStr::new("anullsrc=r=24000:cl=mono"),
                OsStr::new("-t"),
                OsStr::new(&length),
                OsStr::new("-c:a"),
                OsStr::new("libmp3lame"),
                output.as_os_str(),
            ],
        )
        .await?;

        debug!(scene = index, "Placeholder audio ({}s) written to {}", length, output.display());
        Ok(output.to_path_buf())
    }

    async fn assemble_slide(&self, request: &SlideRequest) -> Result<Slide> {
        let duration = match request.duration {
            Some(seconds) => seconds,
            None => self.audio_duration(&request.audio).await? + self.config.slide_padding_seconds,
        };

        // drawtext reads the caption from a file to avoid filtergraph quoting
        let subtitle_file = request.output.with_extension("srt.txt");
        tokio::fs::write(&subtitle_file, wrap_subtitle(&request.text, SUBTITLE_WORDS_PER_LINE)).await?;

        let filter = self.slide_filter(&subtitle_file);
        let length = format!("{:.3}", duration);
        let fps = self.config.fps.to_string();

        let result = run_tool(
            "ffmpeg",
            self.tool_timeout(),
            [
                OsStr::new("-y"),
                OsStr::new("-loop"),
                OsStr::new("1"),
                OsStr::new("-i"),
                request.image.as_os_str(),
                OsStr::new("-i"),
                request.audio.as_os_str(),
                OsStr::new("-vf"),
                OsStr::new(&filter),
                OsStr::new("-af"),
                OsStr::new("apad"),
                OsStr::new("-t"),
                OsStr::new(&length),
                OsStr::new("-r"),
                OsStr::new(&fps),
                OsStr::new("-c:v"),
                OsStr::new("libx264"),
                OsStr::new("-pix_fmt"),
                OsStr::new("yuv420p"),
                OsStr::new("-c:a"),
                OsStr::new("aac"),
                request.output.as_os_str(),
            ],
        )
        .await;

        let _ = tokio::fs::remove_file(&subtitle_file).await;
        result?;

        info!("🎞️ Slide {} assembled ({:.1}s)", request.index, duration);
        Ok(Slide {
            index: request.index,
            path: request.output.clone(),
            duration,
            placeholder: request.placeholder,
        })
    }

    async fn concatenate(&self, slides: &[Slide], output: &Path) -> Result<()> {
        if slides.is_empty() {
            return Err(anyhow!("No slides to concatenate"));
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let list_path = output.with_extension("concat.txt");
        tokio::fs::write(&list_path, concat_list(slides)).await?;

        let fps = self.config.fps.to_string();
        let result = run_tool(
            "ffmpeg",
            self.tool_timeout(),
            [
                OsStr::new("-y"),
                OsStr::new("-f"),
                OsStr::new("concat"),
                OsStr::new("-safe"),
                OsStr::new("0"),
                OsStr::new("-i"),
                list_path.as_os_str(),
                OsStr::new("-r"),
                OsStr::new(&fps),
                OsStr::new("-c:v"),
                OsStr::new("libx264"),
                OsStr::new("-preset"),
                OsStr::new("medium"),
                OsStr::new("-c:a"),
                OsStr::new("aac"),
                output.as_os_str(),
            ],
        )
        .await;

        let _ = tokio::fs::remove_file(&list_path).await;
        result?;

        let total: f64 = slides.iter().map(|s| s.duration).sum();
        info!("🎬 Video written: {} ({} slides, {:.1}s)", output.display(), slides.len(), total);
        Ok(())
    }
}

/// Sibling path a generator writes to before the result is complete
fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    output.with_file_name(name)
}

/// Run an external tool, failing with its stderr on a non-zero exit.
/// The child is killed if it outlives `limit`.
async fn run_tool<I, S>(program: &str, limit: Duration, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let child = Command::new(program).args(args).kill_on_drop(true).output();
    let output = tokio::time::timeout(limit, child)
        .await
        .map_err(|_| anyhow!("{} timed out after {}s", program, limit.as_secs_f64()))?
        .with_context(|| format!("Failed to launch {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        return Err(anyhow!(
            "{} exited with {}: {}",
            program,
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        ));
    }
    Ok(output)
}

fn decode_image(body: &Txt2ImgResponse) -> Result<Vec<u8>> {
    let encoded = body
        .images
        .first()
        .ok_or_else(|| anyhow!("Stable Diffusion API returned no images"))?;
    // Some WebUI builds prefix a data URL header
    let payload = encoded.split_once(',').map_or(encoded.as_str(), |(_, data)| data);
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("Invalid base64 image payload")
}

/// Break caption text into lines of at most `words_per_line` words
pub fn wrap_subtitle(text: &str, words_per_line: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(words_per_line.max(1))
        .map(|line| line.join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | ':' | '\'' | ',' | ';' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn concat_list(slides: &[Slide]) -> String {
    slides
        .iter()
        .map(|slide| {
            let path = slide.path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", path)
        })
        .collect()
}

fn parse_duration(raw: &str) -> Option<f64> {
    raw.lines()
        .find_map(|line| line.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}
