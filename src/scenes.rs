use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::SceneError;
use crate::state::SceneStage;

/// One semantic block of the source document, becoming one slide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub index: usize,
    pub raw_text: String,
    simplified_text: Option<String>,
    image_path: Option<PathBuf>,
    audio_path: Option<PathBuf>,
    stage: SceneStage,
}

impl Scene {
    pub fn new(index: usize, raw_text: impl Into<String>) -> Self {
        Self {
            index,
            raw_text: raw_text.into(),
            simplified_text: None,
            image_path: None,
            audio_path: None,
            stage: SceneStage::Raw,
        }
    }

    pub fn stage(&self) -> SceneStage {
        self.stage
    }

    pub fn simplified_text(&self) -> Option<&str> {
        self.simplified_text.as_deref()
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.image_path.as_deref()
    }

    pub fn audio_path(&self) -> Option<&Path> {
        self.audio_path.as_deref()
    }

    /// Text to narrate and caption: simplified if available, raw otherwise
    pub fn narration(&self) -> &str {
        self.simplified_text.as_deref().unwrap_or(&self.raw_text)
    }

    fn advance(&mut self, to: SceneStage) -> Result<(), SceneError> {
        if self.stage.next() != Some(to) {
            return Err(SceneError {
                index: self.index,
                current: self.stage,
                attempted: to,
            });
        }
        self.stage = to;
        Ok(())
    }

    pub fn set_simplified(&mut self, text: impl Into<String>) -> Result<(), SceneError> {
        self.advance(SceneStage::Simplified)?;
        self.simplified_text = Some(text.into());
        Ok(())
    }

    /// Image and audio land together once both generators have finished
    pub fn set_media(&mut self, image: PathBuf, audio: PathBuf) -> Result<(), SceneError> {
        self.advance(SceneStage::MediaReady)?;
        self.image_path = Some(image);
        self.audio_path = Some(audio);
        Ok(())
    }

    pub fn mark_assembled(&mut self) -> Result<(), SceneError> {
        self.advance(SceneStage::Assembled)
    }
}

fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("static regex"))
}

/// Splits document text into scenes of bounded length.
///
/// Paragraphs (blank-line separated) are the primary boundary. Paragraphs
/// longer than `max_chars` are packed sentence by sentence; only a single
/// sentence longer than the limit is cut at whitespace, and a single word
/// longer than the limit is cut at a character boundary.
#[derive(Debug, Clone)]
pub struct SceneSplitter {
    max_chars: usize,
}

impl SceneSplitter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn split(&self, text: &str) -> Vec<Scene> {
        self.split_text(text)
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| Scene::new(index, chunk))
            .collect()
    }

    /// Scene texts without wrapping them in [`Scene`]
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let normalized = text.replace("\r\n", "\n");
        let mut chunks = Vec::new();

        for paragraph in paragraph_break().split(&normalized) {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if char_len(paragraph) <= self.max_chars {
                chunks.push(paragraph.to_string());
            } else {
                self.pack(split_sentences(paragraph), &mut chunks);
            }
        }

        chunks
    }

    /// Greedily join pieces with spaces while staying within the limit
    fn pack(&self, pieces: Vec<&str>, chunks: &mut Vec<String>) {
        let mut current = String::new();
        let mut current_len = 0;

        for piece in pieces {
            let piece_len = char_len(piece);
            if piece_len > self.max_chars {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                self.pack_oversized(piece, chunks);
                continue;
            }

            let joined_len = if current.is_empty() {
                piece_len
            } else {
                current_len + 1 + piece_len
            };

            if joined_len > self.max_chars {
                chunks.push(std::mem::take(&mut current));
                current.push_str(piece);
                current_len = piece_len;
            } else {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(piece);
                current_len = joined_len;
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }
    }

    /// A sentence that alone exceeds the limit: cut at whitespace, then hard
    fn pack_oversized(&self, sentence: &str, chunks: &mut Vec<String>) {
        let mut words = Vec::new();
        for word in sentence.split_whitespace() {
            if char_len(word) > self.max_chars {
                words.extend(hard_split(word, self.max_chars));
            } else {
                words.push(word);
            }
        }
        self.pack(words, chunks);
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Sentence boundaries: terminal punctuation followed by whitespace
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = paragraph.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?' | '…') {
            continue;
        }
        let end = idx + ch.len_utf8();
        match chars.peek() {
            Some((_, next)) if next.is_whitespace() => {
                let sentence = paragraph[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
            _ => {}
        }
    }

    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn hard_split(word: &str, max_chars: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in word.char_indices() {
        if count == max_chars {
            parts.push(&word[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < word.len() {
        parts.push(&word[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = "Первый абзац. Он короткий.\n\n\
        Второй абзац намного длиннее. В нём несколько предложений! \
        Каждое предложение должно остаться целым? Да, именно так.\n   \n\
        Третий.";

    #[test]
    fn test_paragraphs_become_scenes() {
        let splitter = SceneSplitter::new(1000);
        let scenes = splitter.split(DOCUMENT);

        assert_eq!(scenes.len(), 3);
        assert_eq!(scenes[0].raw_text, "Первый абзац. Он короткий.");
        assert_eq!(scenes[2].raw_text, "Третий.");
        for (i, scene) in scenes.iter().enumerate() {
            assert_eq!(scene.index, i);
            assert_eq!(scene.stage(), SceneStage::Raw);
        }
    }

    #[test]
    fn test_long_paragraph_splits_at_sentences() {
        let splitter = SceneSplitter::new(60);
        let chunks = splitter.split_text(DOCUMENT);

        assert!(chunks.iter().all(|c| c.chars().count() <= 60));
        assert!(chunks.contains(&"Второй абзац намного длиннее. В нём несколько предложений!".to_string()));
        assert!(chunks.contains(&"Каждое предложение должно остаться целым? Да, именно так.".to_string()));
    }

    #[test]
    fn test_oversized_sentence_and_word() {
        let splitter = SceneSplitter::new(10);
        let chunks = splitter.split_text("alpha beta gamma delta\n\nsupercalifragilistic");

        assert!(chunks.iter().all(|c| c.chars().count() <= 10), "{:?}", chunks);
        assert_eq!(chunks[0], "alpha beta");
        assert!(chunks.contains(&"supercalif".to_string()));
        assert!(chunks.contains(&"ragilistic".to_string()));
    }

    #[test]
    fn test_split_is_idempotent() {
        let splitter = SceneSplitter::new(45);
        let first = splitter.split_text(DOCUMENT);
        let second = splitter.split_text(DOCUMENT);
        assert_eq!(first, second);

        // Every produced scene is already a fixed point of the splitter
        for chunk in &first {
            assert_eq!(splitter.split_text(chunk), vec![chunk.clone()]);
        }
    }

    #[test]
    fn test_blank_and_windows_input() {
        let splitter = SceneSplitter::new(100);
        assert!(splitter.split("   \n\n  \n").is_empty());
        assert_eq!(splitter.split_text("a\r\n\r\nb"), vec!["a", "b"]);
    }

    #[test]
    fn test_hard_split_multibyte() {
        assert_eq!(hard_split("абвгд", 2), vec!["аб", "вг", "д"]);
    }

    #[test]
    fn test_scene_stage_order_enforced() {
        let mut scene = Scene::new(4, "raw");
        assert_eq!(scene.narration(), "raw");

        let err = scene
            .set_media(PathBuf::from("i.png"), PathBuf::from("a.mp3"))
            .unwrap_err();
        assert_eq!(err.current, SceneStage::Raw);
        assert!(scene.mark_assembled().is_err());

        scene.set_simplified("simple").unwrap();
        assert_eq!(scene.narration(), "simple");
        assert!(scene.set_simplified("again").is_err());

        scene.set_media(PathBuf::from("i.png"), PathBuf::from("a.mp3")).unwrap();
        scene.mark_assembled().unwrap();
        assert_eq!(scene.stage(), SceneStage::Assembled);
        assert_eq!(scene.image_path(), Some(Path::new("i.png")));
    }
}
