// Template matching - locate known reference images in captured frames.

pub mod matcher;
pub mod region;
pub mod template;


pub use matcher::{Match, Matcher, TemplateMatcher, Threshold, match_gray};
pub use region::SearchRegion;
pub use template::{TemplateKey, TemplateStore};

use std::path::PathBuf;
use thiserror::Error;

pub type MatchResult<T> = Result<T, MatchError>;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Template '{key}' not found at {path:?}")]
    MissingAsset { key: String, path: PathBuf },

    #[error("Template {path:?} could not be decoded: {source}")]
    UndecodableAsset {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Template is empty")]
    EmptyTemplate,

    #[error("Template {template:?} is larger than the frame {frame:?}")]
    TemplateLargerThanFrame { template: (u32, u32), frame: (u32, u32) },

    #[error("Search region {region:?} lies outside the {frame:?} frame")]
    RegionOutsideFrame {
        region: SearchRegion,
        frame: (u32, u32),
    },
}

impl MatchError {
    /// Asset problems do not go away by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MatchError::MissingAsset { .. }
                | MatchError::UndecodableAsset { .. }
                | MatchError::EmptyTemplate
        )
    }
}
