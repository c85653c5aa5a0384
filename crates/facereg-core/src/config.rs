use crate::backend::{open_backend, BackendKind};
use crate::matcher::{EuclideanMatcher, DEFAULT_TOLERANCE};
use crate::provider::SidecarProvider;
use crate::render::{
    LabelFont, OutlineRenderer, RenderError, ThumbnailWriter, DEFAULT_LABEL_SIZE, DEFAULT_OUTLINE_WIDTH,
};
use crate::session::RecognitionSession;
use crate::store::{IdentityStore, Store, StoreError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Engine configuration.
///
/// Resolved from built-in defaults, then an optional TOML file named by
/// `FACEREG_CONFIG`, then `FACEREG_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Durable backend for the identity store.
    pub store_backend: BackendKind,
    /// Location of the identity store.
    pub store_path: PathBuf,
    /// Maximum Euclidean distance accepted as the same identity (inclusive).
    pub tolerance: f32,
    /// Directory for annotated output images.
    pub output_dir: PathBuf,
    /// Directory for enrollment thumbnails; `None` disables them.
    pub thumbnail_dir: Option<PathBuf>,
    /// Stroke width of the face outlines, in pixels.
    pub outline_width: u32,
    /// TrueType/OpenType font for names on annotated images; `None` draws
    /// outlines only.
    pub label_font: Option<PathBuf>,
}

/// Optional overrides read from the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    store_backend: Option<BackendKind>,
    store_path: Option<PathBuf>,
    tolerance: Option<f32>,
    output_dir: Option<PathBuf>,
    thumbnail_dir: Option<PathBuf>,
    outline_width: Option<u32>,
    label_font: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` for environment variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match lookup("FACEREG_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let store_backend = env_parse(&lookup, "FACEREG_STORE_BACKEND")
            .or(file.store_backend)
            .unwrap_or(BackendKind::Sqlite);

        let store_path = lookup("FACEREG_STORE_PATH")
            .map(PathBuf::from)
            .or(file.store_path)
            .unwrap_or_else(|| data_dir(&lookup).join(store_backend.default_file_name()));

        let tolerance = env_parse::<f32, _>(&lookup, "FACEREG_TOLERANCE")
            .or(file.tolerance)
            .filter(|t| {
                let ok = t.is_finite() && *t >= 0.0;
                if !ok {
                    tracing::warn!(tolerance = t, "ignoring invalid tolerance");
                }
                ok
            })
            .unwrap_or(DEFAULT_TOLERANCE);

        Ok(Self {
            store_backend,
            store_path,
            tolerance,
            output_dir: lookup("FACEREG_OUTPUT_DIR")
                .map(PathBuf::from)
                .or(file.output_dir)
                .unwrap_or_else(|| PathBuf::from("output")),
            thumbnail_dir: lookup("FACEREG_THUMBNAIL_DIR")
                .map(PathBuf::from)
                .or(file.thumbnail_dir),
            outline_width: env_parse(&lookup, "FACEREG_OUTLINE_WIDTH")
                .or(file.outline_width)
                .unwrap_or(DEFAULT_OUTLINE_WIDTH),
            label_font: lookup("FACEREG_LABEL_FONT")
                .map(PathBuf::from)
                .or(file.label_font),
        })
    }
}

impl Config {
    /// Open the configured identity store. Load failures are fatal to the caller.
    pub fn open_store(&self) -> Result<Store, StoreError> {
        IdentityStore::load(open_backend(self.store_backend, &self.store_path)?)
    }

    /// Build a recognition session wired to the sidecar provider, the outline
    /// renderer and, when configured, the label font and thumbnail writer.
    pub fn build_session(&self) -> Result<RecognitionSession<EuclideanMatcher>, RenderError> {
        let mut renderer = OutlineRenderer::new(&self.output_dir, self.outline_width);
        if let Some(path) = &self.label_font {
            renderer = renderer.with_font(LabelFont::open(path, DEFAULT_LABEL_SIZE)?);
        }
        let mut session =
            RecognitionSession::new(EuclideanMatcher::new(self.tolerance), Box::new(SidecarProvider))
                .with_renderer(Box::new(renderer));
        if let Some(dir) = &self.thumbnail_dir {
            session = session.with_thumbnails(Box::new(ThumbnailWriter::open(dir)?));
        }
        Ok(session)
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn data_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facereg")
}

fn env_parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}
