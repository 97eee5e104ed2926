use tracing_subscriber::{fmt, EnvFilter};

use crate::{Error, Result};

/// Initialize logging/tracing for the bot.
///
/// `RUST_LOG` overrides the default filter. With `json = true` every event is
/// emitted as one JSON object per line.
pub fn init(service_name: &str, debug: bool, json: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };

    // Default: `level` for our crates, info for everything else.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let crate_name = service_name.replace('-', "_");
        EnvFilter::new(format!(
            "info,fnb={level},fnb_core={level},fnb_telegram={level},fnb_openai={level},{crate_name}={level}"
        ))
    });

    let builder = fmt().with_env_filter(filter).with_target(false);
    let res = if json {
        builder.json().try_init()
    } else {
        builder.with_ansi(true).try_init()
    };

    res.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
