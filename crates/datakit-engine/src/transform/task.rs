use datakit_types::episode::{Episode, LANGUAGE_PREFIX};

use super::{ParamReader, Params, Transform, TransformContext, TransformError};

pub const TASK_TEXT: &str = "task_text";

const METADATA_KEYS: [&str; 4] = ["task", "instruction", "task_text", "language_instruction"];

/// Collapse runs of whitespace and trim.
#[must_use]
pub fn normalize_task_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves the episode's task text.
///
/// Sources in priority order: the episode's own `task_text`, the first
/// language observation on step 0, then the `task`/`instruction`
/// metadata keys, then `default_text`.
#[derive(Debug, Clone)]
pub struct TaskText {
    default_text: String,
    allow_empty: bool,
    language_key: Option<String>,
}

impl TaskText {
    /// # Errors
    ///
    /// Rejects unknown or mistyped parameters.
    pub fn build(params: &Params) -> Result<Box<dyn Transform>, TransformError> {
        let reader = ParamReader::new(TASK_TEXT, params, &["default_text", "allow_empty", "language_key"])?;
        Ok(Box::new(Self {
            default_text: reader.string("default_text")?.unwrap_or_default(),
            allow_empty: reader.boolean("allow_empty", false)?,
            language_key: reader.string("language_key")?,
        }))
    }

    fn extract(&self, episode: &Episode) -> Option<String> {
        if !episode.task_text.trim().is_empty() {
            return Some(episode.task_text.clone());
        }
        if let Some(first) = episode.steps.first() {
            let language = match &self.language_key {
                Some(key) => first.observation.get(key),
                None => first
                    .observation
                    .iter()
                    .find(|(key, _)| key.starts_with(LANGUAGE_PREFIX) || *key == "observation.language")
                    .map(|(_, value)| value),
            };
            if let Some(text) = language.and_then(|t| t.as_text()).filter(|t| !t.trim().is_empty()) {
                return Some(text.to_string());
            }
        }
        METADATA_KEYS
            .iter()
            .find_map(|key| episode.metadata_str(key).filter(|t| !t.trim().is_empty()))
            .map(str::to_string)
    }
}

impl Transform for TaskText {
    fn name(&self) -> &'static str {
        TASK_TEXT
    }

    fn apply(&self, mut episode: Episode, _ctx: &TransformContext<'_>) -> Result<Episode, TransformError> {
        let mut text = self
            .extract(&episode)
            .map(|raw| normalize_task_text(&raw))
            .unwrap_or_default();
        if text.is_empty() {
            text = normalize_task_text(&self.default_text);
        }
        if text.is_empty() && !self.allow_empty {
            return Err(TransformError::EmptyTaskText);
        }
        episode.task_text = text;
        Ok(episode)
    }
}
