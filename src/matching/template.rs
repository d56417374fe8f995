//! Template assets: one PNG per (region folder, logical name), decoded once.

use super::{MatchError, MatchResult};
use image::GrayImage;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Identifies a template asset. The same UI element has different art per game
/// server, so the region folder is part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    pub name: String,
    pub folder: String,
}

impl TemplateKey {
    pub fn new(name: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder: folder.into(),
        }
    }

    /// `<root>/<folder>/<name>.png`. Names may carry a sub-directory (`legend/XP_1`).
    pub fn path_under(&self, root: &Path) -> PathBuf {
        root.join(&self.folder).join(format!("{}.png", self.name))
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder, self.name)
    }
}

/// Decoded templates keyed by path. Shared between clones.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
    cache: Arc<Mutex<HashMap<PathBuf, Arc<GrayImage>>>>,
}

impl TemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load (or fetch from cache) the grayscale template for `key`.
    pub fn get(&self, key: &TemplateKey) -> MatchResult<Arc<GrayImage>> {
        let path = key.path_under(&self.root);
        if let Some(hit) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&path) {
            return Ok(Arc::clone(hit));
        }

        if !path.is_file() {
            return Err(MatchError::MissingAsset {
                key: key.to_string(),
                path,
            });
        }
        let decoded = image::open(&path).map_err(|source| MatchError::UndecodableAsset {
            path: path.clone(),
            source,
        })?;
        let gray = Arc::new(decoded.to_luma8());
        log::debug!("Loaded template {key} ({}x{})", gray.width(), gray.height());

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, Arc::clone(&gray));
        Ok(gray)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
