//! Structured logging for the daemon and CLI.

use std::io::IsTerminal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Whether colored output should be used: stdout is a TTY and NO_COLOR unset.
fn use_color() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Initialize the tracing subscriber.
///
/// Compact single-line format by default; `verbose` switches to a structured
/// format with targets and span close events. `RUST_LOG` wins when set.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("reelsmith=debug,info")
            } else {
                EnvFilter::try_new("reelsmith=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = fmt::layer()
        .with_ansi(use_color())
        .with_target(verbose)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()?;
    Ok(())
}

/// Span wrapping one stage execution, carrying the run and attempt fields.
#[must_use]
pub fn stage_span(run_id: &crate::types::RunId, stage: crate::stage::Stage, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "stage",
        run_id = %run_id,
        stage = %stage,
        attempt = attempt,
    )
}
