//! User preferences storage
//!
//! Handles saving and loading user preferences to a JSON file
//! in the platform config directory. Preferences are read once at startup;
//! changes take effect on the next run because session parameters freeze at
//! the first connect.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

/// Default conversation language (BCP 47)
pub(crate) const DEFAULT_LANGUAGE: &str = "en-US";

/// User preferences
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Preferences {
    /// Conversation language code (e.g. "en-US", "es-ES")
    /// Defaults to "en-US" if not set
    pub language_code: Option<String>,
    /// Show tool call/result traffic in the transcript
    pub dev_mode: Option<bool>,
}

/// Get the preferences file path
fn preferences_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("Parley").join("preferences.json"))
}

/// Load preferences from disk
///
/// Returns default preferences if the file doesn't exist or can't be read
pub(crate) fn load_preferences() -> Preferences {
    let Some(path) = preferences_path() else {
        return Preferences::default();
    };

    if !path.exists() {
        return Preferences::default();
    }

    match fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(prefs) => prefs,
            Err(e) => {
                error!("Failed to parse preferences: {}", e);
                Preferences::default()
            }
        },
        Err(e) => {
            error!("Failed to read preferences file: {}", e);
            Preferences::default()
        }
    }
}

/// Save preferences to disk
pub(crate) fn save_preferences(prefs: &Preferences) -> Result<(), PreferencesError> {
    let path = preferences_path().ok_or(PreferencesError::NoConfigDir)?;

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            info!("Created preferences directory: {:?}", parent);
        }
    }

    let json = serde_json::to_string_pretty(prefs)?;
    fs::write(&path, json)?;
    info!("Saved preferences to: {:?}", path);

    Ok(())
}

/// Get the conversation language code
/// Returns "en-US" if not set
pub(crate) fn get_language_code() -> String {
    load_preferences()
        .language_code
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
}

/// Set the conversation language code
pub(crate) fn set_language_code(code: &str) -> Result<(), PreferencesError> {
    let mut prefs = load_preferences();
    prefs.language_code = Some(code.to_string());
    save_preferences(&prefs)
}

/// Whether dev mode is enabled
pub(crate) fn get_dev_mode() -> bool {
    load_preferences().dev_mode.unwrap_or(false)
}

/// Enable or disable dev mode
pub(crate) fn set_dev_mode(enabled: bool) -> Result<(), PreferencesError> {
    let mut prefs = load_preferences();
    prefs.dev_mode = Some(enabled);
    save_preferences(&prefs)
}

/// Preferences-related errors
#[derive(Debug, thiserror::Error)]
pub enum PreferencesError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
