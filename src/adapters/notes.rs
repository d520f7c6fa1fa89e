use crate::error::CollaboratorError;
use crate::pipeline::Generator;

/// Minimal generator: tidies a raw transcript into markdown paragraphs.
///
/// Model-backed summarisation plugs in through the same [`Generator`] trait.
#[derive(Debug, Clone)]
pub struct TranscriptNotes {
    /// Sentences per paragraph.
    pub paragraph_len: usize,
}

impl Default for TranscriptNotes {
    fn default() -> Self {
        Self { paragraph_len: 5 }
    }
}

impl TranscriptNotes {
    /// Renders `content` as a markdown notes document.
    pub fn render(&self, content: &str) -> Result<String, CollaboratorError> {
        let text = content.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return Err(CollaboratorError::Invalid("transcript is empty".into()));
        }

        let mut sentences = Vec::new();
        let mut current = String::new();
        for word in text.split(' ') {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            if word.ends_with(['.', '?', '!']) {
                sentences.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            sentences.push(current);
        }

        let paragraphs: Vec<String> = sentences
            .chunks(self.paragraph_len.max(1))
            .map(|chunk| chunk.join(" "))
            .collect();
        Ok(format!("# Transcript notes\n\n{}\n", paragraphs.join("\n\n")))
    }
}

impl Generator for TranscriptNotes {
    async fn generate(&self, content: &str) -> Result<String, CollaboratorError> {
        self.render(content)
    }
}
