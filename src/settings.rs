use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::{env, fs};

use anyhow::{Context, Result};
use egui::{Pos2, Rect, Vec2};
use serde::{Deserialize, Serialize};

use crate::grid::Screen;
use crate::viewer::ViewerOptions;

const APP_DIR: &str = "prior-viewer";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorLoadingSettings {
    pub enabled: bool,
    /// Skip priors whose availability is offline or nearline.
    pub online_only: bool,
}

impl Default for PriorLoadingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            online_only: true,
        }
    }
}

/// One monitor in the virtual desktop, in desktop coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenSettings {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// `[x, y, width, height]` of the area not covered by task bars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_area: Option<[f32; 4]>,
}

impl ScreenSettings {
    pub fn to_screen(&self) -> Screen {
        let bounds = rect(self.x, self.y, self.width, self.height);
        match self.working_area {
            Some([x, y, width, height]) => Screen::with_working_area(bounds, rect(x, y, width, height)),
            None => Screen::new(bounds),
        }
    }
}

fn rect(x: f32, y: f32, width: f32, height: f32) -> Rect {
    Rect::from_min_size(Pos2::new(x, y), Vec2::new(width, height))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerSettings {
    pub prior_loading: PriorLoadingSettings,
    pub allow_empty_viewer: bool,
    pub report_duplicate_priors: bool,
    pub placeholders_for_failed_priors: bool,
    pub screens: Vec<ScreenSettings>,
}

impl ViewerSettings {
    /// Reads the settings file, falling back to defaults when it is missing
    /// or unreadable. `PRIOR_VIEWER_ONLINE_ONLY` overrides the file.
    pub fn load() -> Self {
        let mut settings = settings_file_path()
            .filter(|path| path.exists())
            .and_then(|path| match Self::load_from(&path) {
                Ok(settings) => Some(settings),
                Err(err) => {
                    log::warn!("Ignoring settings: {err:#}");
                    None
                }
            })
            .unwrap_or_default();

        if let Some(online_only) = online_only_override() {
            settings.prior_loading.online_only = online_only;
        }
        settings
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Could not parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn viewer_options(&self) -> ViewerOptions {
        ViewerOptions {
            load_priors: self.prior_loading.enabled,
            online_only_priors: self.prior_loading.online_only,
            allow_empty_viewer: self.allow_empty_viewer,
            report_duplicate_priors: self.report_duplicate_priors,
            placeholders_for_failed_priors: self.placeholders_for_failed_priors,
        }
    }

    /// Configured monitors; empty means the window itself is the only screen.
    pub fn screens(&self) -> Vec<Screen> {
        self.screens.iter().map(ScreenSettings::to_screen).collect()
    }
}

pub fn settings_file_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        return env::var_os("APPDATA")
            .map(PathBuf::from)
            .map(|base| base.join(APP_DIR).join(SETTINGS_FILE));
    }

    #[cfg(target_os = "macos")]
    {
        return env::var_os("HOME").map(PathBuf::from).map(|home| {
            home.join("Library")
                .join("Application Support")
                .join(APP_DIR)
                .join(SETTINGS_FILE)
        });
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join(APP_DIR).join(SETTINGS_FILE));
        }
        env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".config").join(APP_DIR).join(SETTINGS_FILE))
    }
}

fn online_only_override() -> Option<bool> {
    static CONFIG: OnceLock<Option<bool>> = OnceLock::new();

    *CONFIG.get_or_init(|| parse_flag(&env::var("PRIOR_VIEWER_ONLINE_ONLY").ok()?))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = ViewerSettings::parse("").expect("empty settings parse");
        assert_eq!(settings, ViewerSettings::default());

        let options = settings.viewer_options();
        assert!(options.load_priors);
        assert!(options.online_only_priors);
        assert!(!options.allow_empty_viewer);
        assert!(!options.placeholders_for_failed_priors);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let settings = ViewerSettings::parse(
            "placeholders_for_failed_priors = true\n\n[prior_loading]\nonline_only = false\n",
        )
        .expect("settings parse");
        assert!(settings.prior_loading.enabled);
        assert!(!settings.prior_loading.online_only);
        assert!(settings.viewer_options().placeholders_for_failed_priors);
    }

    #[test]
    fn screens_convert_to_desktop_rects() {
        let settings = ViewerSettings::parse(
            r#"
[[screens]]
x = 0.0
y = 0.0
width = 1920.0
height = 1080.0
working_area = [0.0, 0.0, 1920.0, 1040.0]

[[screens]]
x = 1920.0
y = 0.0
width = 1920.0
height = 1080.0
"#,
        )
        .expect("settings parse");

        let screens = settings.screens();
        assert_eq!(screens.len(), 2);
        assert_eq!(screens[0].working_area.height(), 1040.0);
        assert_eq!(screens[1].bounds.min.x, 1920.0);
        assert_eq!(screens[1].working_area, screens[1].bounds);
    }

    #[test]
    fn serialized_settings_load_back_unchanged() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(SETTINGS_FILE);
        let settings = ViewerSettings {
            allow_empty_viewer: true,
            report_duplicate_priors: true,
            screens: vec![ScreenSettings {
                x: 0.0,
                y: 0.0,
                width: 800.0,
                height: 600.0,
                working_area: None,
            }],
            ..ViewerSettings::default()
        };

        let text = toml::to_string_pretty(&settings).expect("settings serialize");
        fs::write(&path, text).expect("settings write");
        let loaded = ViewerSettings::load_from(&path).expect("settings load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn unknown_value_types_are_errors() {
        assert!(ViewerSettings::parse("allow_empty_viewer = \"sometimes\"").is_err());
    }

    #[test]
    fn flag_values() {
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
