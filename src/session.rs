//! Realtime assistant session configuration served to the browser client.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::{ToolDefinition, ToolName};

const INSTRUCTIONS: &str = "You are a friendly voice assistant that answers questions about two \
financial documents. Use fetch_pdf_document for the consolidated financial statements and \
handle_amazon_query_tool for the quarterly earnings release. After a tool result arrives, answer \
the user's original question concisely from that result, in both text and audio, without waiting \
for further input.";

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    /// Detector kind, `server_vad`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Activation threshold in `0.0..=1.0`.
    pub threshold: f64,
    /// Audio kept before detected speech.
    pub prefix_padding_ms: u32,
    /// Silence that ends a turn.
    pub silence_duration_ms: u32,
    /// Whether the service answers automatically at the end of a turn.
    pub create_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 350,
            create_response: true,
        }
    }
}

/// Session update sent by the client once the realtime channel is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    /// System instructions.
    pub instructions: String,
    /// Turn detection settings.
    pub turn_detection: TurnDetection,
    /// Functions the assistant may call.
    pub tools: Vec<ToolDefinition>,
    /// Tool selection policy.
    pub tool_choice: String,
    /// Speech-to-text model for input transcripts.
    pub transcription_model: String,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            instructions: INSTRUCTIONS.to_string(),
            turn_detection: TurnDetection::default(),
            tools: ToolName::ALL.iter().map(ToolName::definition).collect(),
            tool_choice: "auto".to_string(),
            transcription_model: "whisper-1".to_string(),
        }
    }
}

/// Failures loading a configuration override.
#[derive(Debug, Error)]
pub enum SessionConfigError {
    /// The file could not be read.
    #[error("failed to read session configuration `{path}`: {source}")]
    Io {
        /// Override path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a valid configuration.
    #[error("invalid session configuration `{path}`: {reason}")]
    Invalid {
        /// Override path.
        path: String,
        /// Parse or validation failure.
        reason: String,
    },
}

impl SessionConfiguration {
    /// Loads an override from a JSON file and validates it.
    pub fn from_file(path: &Path) -> Result<Self, SessionConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| SessionConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| SessionConfigError::Invalid {
            path: display.clone(),
            reason: err.to_string(),
        })?;
        config.validate().map_err(|reason| SessionConfigError::Invalid {
            path: display,
            reason,
        })?;
        Ok(config)
    }

    /// Every advertised tool must be one this server can dispatch.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(unknown) = self
            .tools
            .iter()
            .find(|tool| ToolName::from_name(&tool.name).is_none())
        {
            return Err(format!("tool `{}` is not supported by this server", unknown.name));
        }
        if !(0.0..=1.0).contains(&self.turn_detection.threshold) {
            return Err(format!(
                "turn detection threshold {} is outside 0..=1",
                self.turn_detection.threshold
            ));
        }
        Ok(())
    }
}
