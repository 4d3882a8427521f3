//! Load the `[env]` table from `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::LoadError;

fn config_file_path(app_name: &str) -> Result<Option<PathBuf>, LoadError> {
    let base = dirs::config_dir()
        .ok_or_else(|| LoadError::ConfigDir("no config directory for this platform".into()))?;
    let path = base.join(app_name).join("config.toml");
    Ok(path.is_file().then_some(path))
}

#[derive(serde::Deserialize, Default)]
struct ConfigToml {
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Key-value pairs from the `[env]` section. Missing file or missing section
/// is an empty map.
pub fn load_env_map(app_name: &str) -> Result<BTreeMap<String, String>, LoadError> {
    let Some(path) = config_file_path(app_name)? else {
        return Ok(BTreeMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let parsed: ConfigToml = toml::from_str(&content)?;
    Ok(parsed.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{env_lock, with_xdg_config_home};

    #[test]
    fn missing_config_is_empty_map() {
        let _guard = env_lock();
        let map = load_env_map("weft-xdg-test-nonexistent-73912").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn reads_env_table() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("weft-xdg-read");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nFOO = \"from_toml\"\nBAR = \"baz\"\n",
        )
        .unwrap();

        let map = with_xdg_config_home(dir.path(), || load_env_map("weft-xdg-read")).unwrap();
        assert_eq!(map.get("FOO").map(String::as_str), Some("from_toml"));
        assert_eq!(map.get("BAR").map(String::as_str), Some("baz"));
    }

    #[test]
    fn missing_env_section_is_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("weft-xdg-noenv");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "[other]\nkey = \"ignored\"\n").unwrap();

        let map = with_xdg_config_home(dir.path(), || load_env_map("weft-xdg-noenv")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("weft-xdg-bad");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "not valid toml [[[\n").unwrap();

        let result = with_xdg_config_home(dir.path(), || load_env_map("weft-xdg-bad"));
        assert!(matches!(result, Err(LoadError::XdgParse(_))));
    }
}
