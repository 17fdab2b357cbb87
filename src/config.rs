use serde::{Deserialize, Serialize};

/// Archive path of the serialized configuration inside a produced package.
/// The generated package's runtime reads it from here; the path is part of
/// the template contract and must not change between pipeline versions.
pub const CONFIG_ASSET_PATH: &str = "assets/shell/config.json";

/// Per-app customization, authored by the UI and consumed read-only by the
/// build pipeline. Serialized verbatim into the output archive at
/// [`CONFIG_ASSET_PATH`].
///
/// Every group carries `#[serde(default)]` so that an omitted section falls
/// back to its defaults instead of failing the whole document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Display name shown under the launcher icon.
    pub label: String,
    /// New application identifier for the produced package.
    pub application_id: String,
    /// What the shell hosts once launched.
    pub content: ContentSource,
    #[serde(default)]
    pub activation: ActivationRules,
    #[serde(default)]
    pub ad_block: AdBlockRules,
    #[serde(default)]
    pub announcement: Option<Announcement>,
    #[serde(default)]
    pub web: WebFeatures,
    #[serde(default)]
    pub splash: SplashParams,
    #[serde(default)]
    pub playlist: Playlist,
    /// Number of launcher icons the installed package presents. `0` and `1`
    /// both mean the single regular icon; every count above one adds
    /// launcher aliases.
    #[serde(default)]
    pub disguise_icon_count: u32,
    /// Extension-module payloads bundled into the package, by file name.
    #[serde(default)]
    pub modules: Vec<ModuleRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    /// Remote site loaded over the network.
    Url { url: String },
    /// Embedded HTML tree; `entry` is the document opened first, relative to
    /// the embedded site root.
    Site { entry: String },
    /// A single embedded media file played full screen.
    Media { file: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivationRules {
    #[serde(default)]
    pub required: bool,
    /// Accepted activation codes. Empty with `required` set means the app
    /// stays locked until a code arrives through an announcement update.
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub lock_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdBlockRules {
    #[serde(default)]
    pub enabled: bool,
    /// Host patterns blocked by the WebView request interceptor.
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub show_once: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebFeatures {
    #[serde(default = "default_true")]
    pub javascript: bool,
    #[serde(default = "default_true")]
    pub dom_storage: bool,
    #[serde(default)]
    pub file_access: bool,
    #[serde(default)]
    pub force_dark: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for WebFeatures {
    fn default() -> Self {
        Self {
            javascript: true,
            dom_storage: true,
            file_access: false,
            force_dark: false,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplashParams {
    #[serde(default = "default_splash_ms")]
    pub duration_ms: u32,
    #[serde(default)]
    pub skippable: bool,
    #[serde(default)]
    pub fit: SplashFit,
}

impl Default for SplashParams {
    fn default() -> Self {
        Self {
            duration_ms: default_splash_ms(),
            skippable: false,
            fit: SplashFit::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplashFit {
    #[default]
    Contain,
    Cover,
    Stretch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(default)]
    pub autoplay: bool,
    #[serde(default)]
    pub loop_all: bool,
    /// Track titles, in playback order. The audio payloads themselves are
    /// embedded by index; see the asset path convention.
    #[serde(default)]
    pub titles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub name: String,
}

fn default_true() -> bool {
    true
}

fn default_splash_ms() -> u32 {
    1500
}

impl ShellConfig {
    /// Serializes the configuration to the JSON document embedded in the
    /// output archive. Pretty-printed so the document stays inspectable when
    /// pulled back out of a package.
    pub fn to_asset_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
