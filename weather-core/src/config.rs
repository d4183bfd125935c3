use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub mod de;
pub mod overlay;

/// Unprefixed variable selecting the optional mode document.
pub const ENV_MODE: &str = "ENV_MODE";

/// Prefix of environment overrides, e.g. `APP_HTTP__PORT=7070`.
pub const ENV_PREFIX: &str = "APP_";

pub const DEFAULT_CONFIG_DIR: &str = "config";

const BASE_STEM: &str = "default";

/// Top-level configuration, resolved once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment tag such as "dev" or "prod". Falls back to the mode selector.
    #[serde(deserialize_with = "de::lenient_string")]
    pub env: String,

    pub http: HttpConfig,

    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(deserialize_with = "de::lenient_string")]
    pub host: String,

    #[serde(deserialize_with = "de::lenient_parse")]
    pub port: u16,
}

/// Options consumed by [`crate::logger::Logger`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// debug | info | warn | error, anything else means info.
    #[serde(deserialize_with = "de::lenient_string")]
    pub level: String,

    /// text | json, anything else means json.
    #[serde(deserialize_with = "de::lenient_string")]
    pub format: String,

    #[serde(deserialize_with = "de::lenient_bool")]
    pub add_source: bool,
}

impl Config {
    /// Resolve from `./config` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::from_env(DEFAULT_CONFIG_DIR).load()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}/default.{{yaml,yml,toml}}", .dir.display())]
    NotFound { dir: PathBuf },

    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    #[error("invalid environment override {key}: {reason}")]
    EnvOverlay { key: String, reason: String },

    #[error("failed to decode configuration")]
    Decode(#[source] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("expected a mapping at the top level")]
    NotAMapping,
}

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Toml,
}

/// Lookup order for `<stem>.<ext>`.
const EXTENSIONS: &[(&str, Format)] =
    &[("yaml", Format::Yaml), ("yml", Format::Yaml), ("toml", Format::Toml)];

/// An optional layer left out of resolution, with the reason.
#[derive(Debug)]
pub struct SkippedLayer {
    pub path: PathBuf,
    pub error: ConfigError,
}

/// Outcome of [`ConfigLoader::resolve`].
#[derive(Debug)]
pub struct Resolution {
    pub config: Config,

    /// Mode documents that existed but could not be used.
    pub skipped: Vec<SkippedLayer>,
}

/// Layers the base document, the optional mode document and `APP_*`
/// environment overrides into one [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    dir: PathBuf,
    mode: Option<String>,
    /// `ENV_MODE` value that is not valid UTF-8.
    rejected_mode: Option<OsString>,
    vars: Vec<(OsString, OsString)>,
}

impl ConfigLoader {
    /// Loader over `dir` with no mode and no environment overrides.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), mode: None, rejected_mode: None, vars: Vec::new() }
    }

    /// Take the mode from `ENV_MODE` and overrides from the `APP_*` entries of `vars`.
    pub fn from_vars<I, K, V>(dir: impl Into<PathBuf>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut loader = Self::new(dir).with_vars(vars);
        let mode = loader
            .vars
            .iter()
            .find(|(name, _)| name.to_str() == Some(ENV_MODE))
            .map(|(_, value)| value.clone());

        match mode {
            Some(mode) => match mode.into_string() {
                Ok(mode) => loader.with_mode(mode),
                Err(raw) => {
                    loader.rejected_mode = Some(raw);
                    loader
                }
            },
            None => loader,
        }
    }

    /// Loader over `dir` driven by the process environment.
    pub fn from_env(dir: impl Into<PathBuf>) -> Self {
        Self::from_vars(dir, std::env::vars_os())
    }

    /// Blank modes count as unset.
    pub fn with_mode(mut self, mode: impl AsRef<str>) -> Self {
        let mode = mode.as_ref().trim();
        self.mode = (!mode.is_empty()).then(|| mode.to_owned());
        self.rejected_mode = None;
        self
    }

    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.vars = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }

    /// Merge every layer and decode the result.
    pub fn load(&self) -> Result<Config, ConfigError> {
        self.resolve().map(|resolution| resolution.config)
    }

    /// Like [`ConfigLoader::load`], also returning the optional layers that were skipped.
    pub fn resolve(&self) -> Result<Resolution, ConfigError> {
        if let Some(raw) = &self.rejected_mode {
            return Err(ConfigError::EnvOverlay {
                key: ENV_MODE.to_owned(),
                reason: format!("value {raw:?} is not valid UTF-8"),
            });
        }

        let mut tree = self.base_layer()?;
        let mut skipped = Vec::new();

        if let Some(mode) = self.mode.as_deref() {
            match self.mode_layer(mode) {
                Ok(Some(layer)) => overlay::merge(&mut tree, layer),
                Ok(None) => {}
                Err(layer) => skipped.push(layer),
            }
        }

        overlay::merge(&mut tree, overlay::env_overlay(&self.vars, ENV_PREFIX)?);

        let mut config: Config = serde_yaml::from_value(tree).map_err(ConfigError::Decode)?;

        if config.env.is_empty()
            && let Some(mode) = &self.mode
        {
            config.env = mode.clone();
        }

        Ok(Resolution { config, skipped })
    }

    fn base_layer(&self) -> Result<Value, ConfigError> {
        let (path, format) = locate(&self.dir, BASE_STEM)
            .ok_or_else(|| ConfigError::NotFound { dir: self.dir.clone() })?;

        let tree = read_document(&path, format)?;
        debug!(path = %path.display(), "loaded base config");
        Ok(tree)
    }

    /// A missing mode document is `Ok(None)`; a broken one is handed back as skipped.
    fn mode_layer(&self, mode: &str) -> Result<Option<Value>, SkippedLayer> {
        let Some((path, format)) = locate(&self.dir, mode) else {
            debug!(mode, dir = %self.dir.display(), "no config file for mode");
            return Ok(None);
        };

        match read_document(&path, format) {
            Ok(tree) => {
                debug!(mode, path = %path.display(), "loaded mode config");
                Ok(Some(tree))
            }
            Err(error) => {
                warn!(mode, path = %path.display(), error = %error, "ignoring unreadable mode config");
                Err(SkippedLayer { path, error })
            }
        }
    }
}

fn locate(dir: &Path, stem: &str) -> Option<(PathBuf, Format)> {
    EXTENSIONS.iter().find_map(|(ext, format)| {
        let path = dir.join(format!("{stem}.{ext}"));
        path.is_file().then_some((path, *format))
    })
}

fn read_document(path: &Path, format: Format) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

    parse_document(&contents, format)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

/// Parse a document into the shared tree form. An empty document is an empty mapping.
pub fn parse_document(contents: &str, format: Format) -> Result<Value, FormatError> {
    let tree = match format {
        Format::Yaml => serde_yaml::from_str(contents)?,
        Format::Toml => {
            let table: toml::Table = toml::from_str(contents)?;
            serde_yaml::to_value(table)?
        }
    };

    match tree {
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(tree),
        _ => Err(FormatError::NotAMapping),
    }
}
