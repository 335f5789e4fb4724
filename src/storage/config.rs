use std::path::{Path, PathBuf};

use crate::models::settings::EngineSettings;

const STORE_PATH: &str = "settings.json";

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STORE_PATH)
}

pub fn load_settings(path: &Path) -> EngineSettings {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!("[store] no settings at {}: {}", path.display(), e);
            return EngineSettings::default();
        }
    };

    match serde_json::from_str::<EngineSettings>(&raw) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("[store] invalid settings in {}: {}", path.display(), e);
            EngineSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &EngineSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let val = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, val)?;
    Ok(())
}
