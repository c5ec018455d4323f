//! Application-level configuration loading: the question bank and the sync timings.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

use crate::sync::{FeedRetryPolicy, ReconcilerSettings};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/quiz.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LIVE_QUIZ_CONFIG_PATH";

/// One entry of the question bank.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Question {
    /// Text shown to participants.
    pub prompt: String,
    /// Answer options, addressed by index.
    pub options: Vec<String>,
    /// Index of the correct option.
    pub correct_option: u32,
    /// Seconds granted to answer.
    pub time_limit_secs: u64,
}

impl Question {
    fn new(prompt: &str, options: [&str; 4], correct_option: u32, time_limit_secs: u64) -> Self {
        Self {
            prompt: prompt.into(),
            options: options.iter().map(|option| (*option).to_owned()).collect(),
            correct_option,
            time_limit_secs,
        }
    }

    /// Time granted to answer.
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    /// Number of options a submission may pick from.
    pub fn option_count(&self) -> u32 {
        u32::try_from(self.options.len()).unwrap_or(u32::MAX)
    }

    fn is_consistent(&self) -> bool {
        self.correct_option < self.option_count() && self.time_limit_secs > 0
    }
}

/// Timing knobs of the sync engine and the per-question agents.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Time a change feed gets to go live before polling becomes authoritative.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub grace_period_ms: Duration,
    /// Poll interval of the session record.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub session_poll_ms: Duration,
    /// Poll interval of the participant roster.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub participants_poll_ms: Duration,
    /// Poll interval of the answer set of the running question.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub answers_poll_ms: Duration,
    /// Local countdown refresh.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timer_tick_ms: Duration,
    /// Remaining time at or below which a participant auto-submits.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub auto_submit_threshold_ms: Duration,
    /// Upper bound of the scoring work that precedes a host transition.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub transition_timeout_ms: Duration,
}

impl SyncSettings {
    /// Reconciler settings for a topic polled every `poll_interval`.
    pub fn reconciler(&self, poll_interval: Duration) -> ReconcilerSettings {
        ReconcilerSettings {
            grace_period: self.grace_period_ms,
            poll_interval,
            retry: FeedRetryPolicy::default(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: Duration::from_millis(2_000),
            session_poll_ms: Duration::from_millis(1_000),
            participants_poll_ms: Duration::from_millis(2_000),
            answers_poll_ms: Duration::from_millis(1_000),
            timer_tick_ms: Duration::from_millis(100),
            auto_submit_threshold_ms: Duration::from_millis(100),
            transition_timeout_ms: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct QuizConfig {
    questions: Vec<Question>,
    sync: SyncSettings,
    auto_advance_on_deadline: bool,
}

impl QuizConfig {
    /// Load the configuration from disk, falling back to the built-in question bank.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        questions = config.questions.len(),
                        auto_advance = config.auto_advance_on_deadline,
                        "loaded quiz config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a JSON document. Missing sections take their defaults.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(contents)?;
        Self::try_from(raw)
    }

    /// Override the question bank.
    pub fn with_questions(mut self, questions: Vec<Question>) -> Self {
        self.questions = questions;
        self
    }

    /// Override the sync timings.
    pub fn with_sync(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    /// Toggle the host deadline auto-advance.
    pub fn with_auto_advance(mut self, enabled: bool) -> Self {
        self.auto_advance_on_deadline = enabled;
        self
    }

    /// The question bank in play order.
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// Question at `index`, if the bank has one.
    pub fn question(&self, index: u32) -> Option<&Question> {
        self.questions.get(usize::try_from(index).ok()?)
    }

    /// Size of the bank.
    pub fn question_count(&self) -> u32 {
        u32::try_from(self.questions.len()).unwrap_or(u32::MAX)
    }

    /// Sync timings.
    pub fn sync(&self) -> &SyncSettings {
        &self.sync
    }

    /// Whether the host agent advances on its own when a deadline elapses.
    pub fn auto_advance_on_deadline(&self) -> bool {
        self.auto_advance_on_deadline
    }
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            questions: default_questions(),
            sync: SyncSettings::default(),
            auto_advance_on_deadline: false,
        }
    }
}

/// Raised when a configuration document is unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid JSON for [`RawConfig`].
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A question is internally inconsistent.
    #[error("question {index} is invalid: correct option out of range or zero time limit")]
    InvalidQuestion {
        /// Position of the question in the bank.
        index: usize,
    },
}

#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde(default)]
    questions: Option<Vec<Question>>,
    #[serde(default)]
    sync: SyncSettings,
    #[serde(default)]
    auto_advance_on_deadline: bool,
}

impl TryFrom<RawConfig> for QuizConfig {
    type Error = ConfigError;

    fn try_from(value: RawConfig) -> Result<Self, Self::Error> {
        let questions = match value.questions {
            Some(questions) if !questions.is_empty() => questions,
            _ => default_questions(),
        };
        if let Some(index) = questions.iter().position(|question| !question.is_consistent()) {
            return Err(ConfigError::InvalidQuestion { index });
        }

        Ok(Self {
            questions,
            sync: value.sync,
            auto_advance_on_deadline: value.auto_advance_on_deadline,
        })
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Built-in question bank shipped with the binary.
pub fn default_questions() -> Vec<Question> {
    vec![
        Question::new(
            "What is the capital of France?",
            ["London", "Berlin", "Paris", "Madrid"],
            2,
            30,
        ),
        Question::new(
            "Which planet is known as the Red Planet?",
            ["Venus", "Mars", "Jupiter", "Saturn"],
            1,
            30,
        ),
        Question::new("What is 2 + 2?", ["3", "4", "5", "6"], 1, 15),
        Question::new(
            "Who wrote 'Romeo and Juliet'?",
            [
                "Charles Dickens",
                "William Shakespeare",
                "Jane Austen",
                "Mark Twain",
            ],
            1,
            30,
        ),
        Question::new(
            "What is the largest ocean on Earth?",
            ["Atlantic", "Indian", "Arctic", "Pacific"],
            3,
            30,
        ),
        Question::new(
            "In which year did World War II end?",
            ["1943", "1944", "1945", "1946"],
            2,
            30,
        ),
        Question::new(
            "What is the chemical symbol for gold?",
            ["Go", "Gd", "Au", "Ag"],
            2,
            20,
        ),
        Question::new(
            "Which programming language runs natively in web browsers?",
            ["Python", "Java", "JavaScript", "C++"],
            2,
            20,
        ),
        Question::new(
            "What is the speed of light?",
            ["300,000 km/s", "150,000 km/s", "500,000 km/s", "1,000,000 km/s"],
            0,
            30,
        ),
        Question::new(
            "What is the tallest mountain in the world?",
            ["K2", "Kangchenjunga", "Mount Everest", "Lhotse"],
            2,
            30,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bank_is_consistent() {
        let config = QuizConfig::default();
        assert_eq!(config.question_count(), 10);
        assert!(config.questions().iter().all(Question::is_consistent));
        assert_eq!(config.question(2).map(Question::time_limit), Some(Duration::from_secs(15)));
        assert!(config.question(10).is_none());
        assert!(!config.auto_advance_on_deadline());
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config = QuizConfig::from_json(
            r#"{ "sync": { "grace_period_ms": 500 }, "auto_advance_on_deadline": true }"#,
        )
        .unwrap();

        assert_eq!(config.sync().grace_period_ms, Duration::from_millis(500));
        assert_eq!(config.sync().answers_poll_ms, Duration::from_millis(1_000));
        assert_eq!(config.question_count(), 10);
        assert!(config.auto_advance_on_deadline());
    }

    #[test]
    fn custom_bank_replaces_defaults() {
        let config = QuizConfig::from_json(
            r#"{ "questions": [
                { "prompt": "Pick B", "options": ["A", "B"], "correct_option": 1, "time_limit_secs": 5 }
            ] }"#,
        )
        .unwrap();

        assert_eq!(config.question_count(), 1);
        assert_eq!(config.question(0).unwrap().option_count(), 2);
    }

    #[test]
    fn inconsistent_question_is_rejected() {
        let err = QuizConfig::from_json(
            r#"{ "questions": [
                { "prompt": "Broken", "options": ["A"], "correct_option": 3, "time_limit_secs": 5 }
            ] }"#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidQuestion { index: 0 }));
    }
}
