// Chat templates for GGUF models
//
// The llama.cpp backend renders conversations itself, one template per model
// family. Unknown families fall back to ChatML.

use model_worker::protocol::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// Gemma 3 has no system role; system text goes in a user turn
    Gemma3,
    ChatMl,
}

impl ChatTemplate {
    /// Pick the template from a model id or file name
    pub fn for_model(model_id: &str) -> Self {
        if model_id.to_lowercase().contains("gemma") {
            Self::Gemma3
        } else {
            Self::ChatMl
        }
    }

    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut prompt = String::new();
        for message in messages {
            match self {
                Self::Gemma3 => {
                    let role = if message.role == "assistant" { "model" } else { "user" };
                    prompt.push_str(&format!(
                        "<start_of_turn>{}\n{}<end_of_turn>\n",
                        role, message.content
                    ));
                }
                Self::ChatMl => {
                    prompt.push_str(&format!(
                        "<|im_start|>{}\n{}<|im_end|>\n",
                        message.role, message.content
                    ));
                }
            }
        }
        if add_generation_prompt {
            prompt.push_str(match self {
                Self::Gemma3 => "<start_of_turn>model\n",
                Self::ChatMl => "<|im_start|>assistant\n",
            });
        }
        prompt
    }

    /// Markers that end a turn when the model emits them as plain text
    pub fn stop_sequences(&self) -> &'static [&'static str] {
        match self {
            Self::Gemma3 => &["<end_of_turn>"],
            Self::ChatMl => &["<|im_end|>"],
        }
    }
}

/// Scans generated text for stop markers. Text that could still turn into a
/// marker is held back until the next piece settles it.
#[derive(Debug)]
pub struct StopScanner {
    stops: &'static [&'static str],
    text: String,
    released: usize,
}

impl StopScanner {
    pub fn new(stops: &'static [&'static str]) -> Self {
        Self {
            stops,
            text: String::new(),
            released: 0,
        }
    }

    /// Append one decoded piece. Returns the text that is now safe to stream
    /// and whether a stop marker ended the output; the marker itself is cut.
    pub fn push(&mut self, piece: &str) -> (String, bool) {
        self.text.push_str(piece);
        let found = self.stops.iter().filter_map(|s| self.text.find(s)).min();
        if let Some(pos) = found {
            self.text.truncate(pos);
            return (self.release(pos), true);
        }
        let end = self.text.len() - self.held_back();
        (self.release(end), false)
    }

    /// Release whatever was held back once generation ends without a marker
    pub fn finish(&mut self) -> String {
        self.release(self.text.len())
    }

    /// Output so far, without any stop marker
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length of the longest tail of the text that starts a stop marker
    fn held_back(&self) -> usize {
        self.stops
            .iter()
            .flat_map(|stop| {
                (1..stop.len())
                    .filter(|&k| stop.is_char_boundary(k) && self.text.ends_with(&stop[..k]))
            })
            .max()
            .unwrap_or(0)
    }

    fn release(&mut self, end: usize) -> String {
        if end <= self.released {
            return String::new();
        }
        let ready = self.text[self.released..end].to_string();
        self.released = end;
        ready
    }
}

/// Conversation asking a chat model for a summary of `text`
pub fn summary_messages(text: &str, min_words: usize, max_words: usize) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new(
            "system",
            format!(
                "You summarize text. Reply with the summary only, between {} and {} words, \
                 in the language of the text.",
                min_words, max_words
            ),
        ),
        ChatMessage::new("user", text),
    ]
}
