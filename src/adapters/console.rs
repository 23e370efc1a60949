//! Console messenger for local CLI runs.
//!
//! Daemon deployments plug in a chat-backed messenger instead; the core
//! only sees the `Messenger` trait either way.

use async_trait::async_trait;
use camino::Utf8Path;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::caps::Messenger;
use crate::error::CapError;

pub struct ConsoleMessenger;

#[async_trait]
impl Messenger for ConsoleMessenger {
    async fn ask(&self, question: &str) -> Result<String, CapError> {
        println!("? {question}");
        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| CapError::transient("messenger", format!("stdin read failed: {e}")))?;
        Ok(line.trim().to_string())
    }

    async fn notify(&self, message: &str) -> Result<(), CapError> {
        println!("{message}");
        Ok(())
    }

    async fn send_file(&self, path: &Utf8Path, caption: &str) -> Result<(), CapError> {
        if !path.exists() {
            return Err(CapError::fatal(
                "messenger",
                format!("deliverable does not exist: {path}"),
            ));
        }
        println!("{caption}\n-> {path}");
        Ok(())
    }
}
