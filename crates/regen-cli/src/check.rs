//! `regen check`: validate settings.

use std::path::Path;

use regen_core::settings::{self, ResolvedSettings, SettingsWarning};
use serde::Serialize;

#[derive(Serialize)]
struct CheckOutput<'a> {
    settings: &'a ResolvedSettings,
    warnings: &'a [SettingsWarning],
}

/// Load and validate settings, logging every adjustment.
///
/// Without a file the defaults are validated.
pub fn load(config: Option<&Path>) -> anyhow::Result<(ResolvedSettings, Vec<SettingsWarning>)> {
    let raw = match config {
        Some(path) => settings::load_raw(path)?,
        None => settings::RawSettings::default(),
    };
    let (resolved, warnings) = settings::validate(raw)?;

    for warning in &warnings {
        if warning.adjusted {
            tracing::warn!(field = warning.field, "{}", warning.message);
        } else {
            tracing::info!(field = warning.field, "{}", warning.message);
        }
    }
    Ok((resolved, warnings))
}

pub fn execute(config: Option<&Path>) -> anyhow::Result<()> {
    let (settings, warnings) = load(config)?;
    let output = CheckOutput {
        settings: &settings,
        warnings: &warnings,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
