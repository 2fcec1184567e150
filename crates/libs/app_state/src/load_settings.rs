use crate::{AppSettings, RawSettings, SettingsError};
use config::{Config, File};
use std::path::Path;

/// Loads settings from a configuration file, with optional dotenv loading
/// so APP__ environment variables can override file values (secrets in
/// particular).
pub fn load_settings_from_path(
    path: &Path,
    env_path: Option<&Path>,
) -> Result<AppSettings, SettingsError> {
    if let Some(env_path) = env_path {
        dotenv::from_path(env_path).ok();
    }

    let builder = {
        let mut builder = Config::builder().add_source(File::from(path));
        if env_path.is_some() {
            builder = builder.add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );
        }
        builder
    };

    let raw_settings = builder.build()?.try_deserialize::<RawSettings>()?;
    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
    AppSettings::from_raw(raw_settings, config_dir)
}

pub fn load_app_settings() -> Result<AppSettings, SettingsError> {
    load_settings_from_path(Path::new("config/settings.toml"), Some(Path::new(".env")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_and_validates_a_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            r#"
[camera]
id = "cam1"

[api]
url = "https://backend.example.com/"
username = "agent"
timeout_seconds = 30

[secrets]
api_key = "hunter2"
"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path, None).unwrap();
        assert_eq!(settings.camera.id, "cam1");
        // trailing slash is stripped so URL joining stays predictable
        assert_eq!(settings.api.url, "https://backend.example.com");
        assert_eq!(settings.api.timeout.as_secs(), 30);
        assert_eq!(settings.ingest.history_folder, dir.path().join("history"));
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            r#"
[api]
url = "https://backend.example.com"
username = "agent"

[secrets]
api_key = "hunter2"
"#,
        )
        .unwrap();

        assert!(load_settings_from_path(&path, None).is_err());
    }
}
