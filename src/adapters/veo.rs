//! AI clip generator over a configured external command.
//!
//! The command is invoked as `<command> <dest>` with the prompt JSON on
//! stdin and must leave a clip at `dest`. When no command is configured,
//! generation is reported unavailable and the cutaway manifest degrades.

use async_trait::async_trait;
use camino::Utf8Path;
use std::sync::Arc;

use super::run_command;
use crate::artifact::AssetPrompt;
use crate::caps::{AssetGenerator, MediaInfo, MediaProcessor};
use crate::error::{CapError, ToolKind};

pub struct CommandGenerator {
    command: Option<String>,
    prober: Arc<dyn MediaProcessor>,
}

impl CommandGenerator {
    #[must_use]
    pub fn new(command: Option<String>, prober: Arc<dyn MediaProcessor>) -> Self {
        Self { command, prober }
    }
}

#[async_trait]
impl AssetGenerator for CommandGenerator {
    async fn generate(
        &self,
        prompt: &AssetPrompt,
        destination: &Utf8Path,
    ) -> Result<MediaInfo, CapError> {
        let Some(command) = &self.command else {
            return Err(CapError::tool(
                "generator",
                ToolKind::CapabilityUnavailable,
                "no asset generator command configured",
            ));
        };

        let payload = serde_json::to_string(prompt)
            .map_err(|e| CapError::parse("generator", e.to_string()))?;
        let output = run_command(
            "generator",
            command,
            &[destination.to_string()],
            Some(&payload),
        )
        .await?;
        if !output.success() {
            let tail = output.stderr_tail();
            // Generation services signal exhaustion with 429-style text.
            if tail.contains("quota") || tail.contains("exhausted") || tail.contains("429") {
                return Err(CapError::resource("generator", tail.to_string()));
            }
            return Err(CapError::transient(
                "generator",
                format!("generator exited {}: {tail}", output.status_code),
            ));
        }
        if !destination.exists() {
            return Err(CapError::transient(
                "generator",
                "generator reported success but produced no file",
            ));
        }
        self.prober.probe(destination).await
    }
}
