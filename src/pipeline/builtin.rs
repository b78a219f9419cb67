//! Stages shipped with the worker: input validation and post-processing.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::ValidationSettings;
use crate::core::Message;
use crate::error::{Error, Result};

use super::strategy::{ProcessingContext, Strategy, StrategyResult};

const FORBIDDEN_PATTERNS: [&str; 3] = [
    r"<script[^>]*>.*?</script>",
    r"javascript:",
    r"data:text/html",
];

const MIN_SPEED: f64 = 0.5;
const MAX_SPEED: f64 = 2.0;

/// Checks a speech request before any expensive stage sees it.
///
/// Runs first (order 10) and aborts the chain when the request is unusable.
pub struct ValidationStrategy {
    min_text_length: usize,
    max_text_length: usize,
    languages: Vec<String>,
    forbidden: Vec<(&'static str, Regex)>,
}

impl ValidationStrategy {
    pub const NAME: &'static str = "validation";

    pub fn new(settings: &ValidationSettings) -> Result<Self> {
        let forbidden = FORBIDDEN_PATTERNS
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (*pattern, re))
                    .map_err(|e| Error::Config(format!("Bad validation pattern {}: {}", pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            min_text_length: settings.min_text_length,
            max_text_length: settings.max_text_length,
            languages: settings.languages.clone(),
            forbidden,
        })
    }

    fn check_structure(message: &Message) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(data) = message.payload.as_object() else {
            errors.push("Field 'data' must be an object".to_string());
            return errors;
        };
        match data.get("speechDto") {
            None => errors.push("Missing required field: data.speechDto".to_string()),
            Some(Value::Object(dto)) => {
                if !dto.contains_key("original_text") {
                    errors.push("Missing required field: data.speechDto.original_text".to_string());
                }
            }
            Some(_) => errors.push("Field 'data.speechDto' must be an object".to_string()),
        }
        errors
    }

    fn check_text(&self, text: &str, errors: &mut Vec<String>) {
        if text.is_empty() {
            errors.push("Text is empty".to_string());
            return;
        }
        let length = text.chars().count();
        if length < self.min_text_length {
            errors.push(format!("Text too short: {} < {}", length, self.min_text_length));
        }
        if length > self.max_text_length {
            errors.push(format!("Text too long: {} > {}", length, self.max_text_length));
        }
        if text.trim().is_empty() {
            errors.push("Text contains only whitespace".to_string());
        }
        for (pattern, re) in &self.forbidden {
            if re.is_match(text) {
                errors.push(format!("Text contains forbidden pattern: {}", pattern));
            }
        }
    }

    fn check_speed(speed: Option<&Value>, errors: &mut Vec<String>) {
        let speed = match speed {
            None | Some(Value::Null) => return,
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match speed {
            Some(speed) if (MIN_SPEED..=MAX_SPEED).contains(&speed) => {}
            Some(speed) => errors.push(format!(
                "Speed out of range: {} (must be {}-{})",
                speed, MIN_SPEED, MAX_SPEED
            )),
            None => errors.push("Speed must be a number".to_string()),
        }
    }

    fn failure(message: &Message, errors: Vec<String>) -> StrategyResult {
        tracing::warn!(
            message_id = %message.id,
            errors = errors.len(),
            "Message failed validation: {}",
            errors.join("; ")
        );
        StrategyResult::fatal(format!("Validation failed with {} errors", errors.len()))
            .with_data("message", "Validation failed")
            .with_data("error_count", errors.len())
            .with_data("errors", errors)
    }
}

#[async_trait]
impl Strategy for ValidationStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> i32 {
        10
    }

    fn can_handle(&self, _message: &Message) -> bool {
        true
    }

    async fn execute(&self, message: &Message, context: &mut ProcessingContext) -> StrategyResult {
        let started = Instant::now();

        let structure = Self::check_structure(message);
        if !structure.is_empty() {
            return Self::failure(message, structure);
        }

        let mut errors = Vec::new();
        let text = message.payload_str("/speechDto/original_text").unwrap_or_default();
        self.check_text(text, &mut errors);

        let language = message.payload_str("/speechDto/language").unwrap_or("en");
        if !self.languages.iter().any(|l| l == language) {
            errors.push(format!(
                "Unsupported language: {}. Supported: {}",
                language,
                self.languages.join(", ")
            ));
        }

        let user = message
            .payload_at("/speechDto/user_uuid")
            .or_else(|| message.payload_at("/speechDto/userId"));
        if matches!(user, Some(v) if !v.is_string() && !v.is_null()) {
            errors.push("user_id must be a string".to_string());
        }
        Self::check_speed(message.payload_at("/speechDto/speed"), &mut errors);

        if !errors.is_empty() {
            return Self::failure(message, errors);
        }

        let length = text.chars().count();
        let word_count = text.split_whitespace().count();
        context
            .scope(Self::NAME)
            .set("passed", true)
            .set("elapsed_ms", started.elapsed().as_secs_f64() * 1000.0)
            .set("length", length)
            .set("word_count", word_count)
            .set("language", language);

        tracing::info!(message_id = %message.id, "Message passed validation");
        StrategyResult::ok()
            .with_data("message", "Validation passed")
            .with_data("text_length", length)
            .with_data("language", language)
    }
}

/// Records a per-message summary once the main stages have run.
///
/// Non-critical: a failure here is logged but does not fail the message.
#[derive(Default)]
pub struct PostProcessingStrategy {
    processed: AtomicU64,
    with_audio: AtomicU64,
    characters: AtomicU64,
}

impl PostProcessingStrategy {
    pub const NAME: &'static str = "post_processing";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Strategy for PostProcessingStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> i32 {
        200
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn can_handle(&self, _message: &Message) -> bool {
        true
    }

    async fn execute(&self, message: &Message, context: &mut ProcessingContext) -> StrategyResult {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let length = context.get_i64("validation.length").unwrap_or(0);
        self.characters.fetch_add(length.max(0) as u64, Ordering::Relaxed);

        let audio_generated = context.get_bool("speech.audio_generated").unwrap_or(false);
        if audio_generated {
            self.with_audio.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::info!(message_id = %message.id, "No audio generated for message");
        }

        let stages: Vec<String> = context
            .keys()
            .filter_map(|key| key.split_once('.').map(|(ns, _)| ns.to_string()))
            .fold(Vec::new(), |mut acc, ns| {
                if !acc.contains(&ns) {
                    acc.push(ns);
                }
                acc
            });

        let summary = json!({
            "message_id": message.id,
            "event_type": message.event_type,
            "retry_count": message.retry_count,
            "characters": length,
            "audio_generated": audio_generated,
            "stages": stages,
        });
        context
            .scope(Self::NAME)
            .set("summary", summary.clone())
            .set("completed", true);

        StrategyResult::ok()
            .with_data("message", "Post-processing completed")
            .with_data("summary", summary)
    }

    async fn teardown(&self) -> Result<()> {
        tracing::info!(
            processed = self.processed.load(Ordering::Relaxed),
            with_audio = self.with_audio.load(Ordering::Relaxed),
            characters = self.characters.load(Ordering::Relaxed),
            "Post-processing totals"
        );
        Ok(())
    }
}
