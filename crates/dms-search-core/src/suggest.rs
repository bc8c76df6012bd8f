//! Prefix suggestions drawn from indexed text.
//!
//! The suggestion structure is a sorted, de-duplicated term list persisted
//! as JSON. It is rebuilt wholesale: written to a temporary file next to the
//! target and renamed into place, so readers never see a partial file.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SearchError, SearchResult};
use crate::index::SearchIndex;
use crate::projection::fields;

const FORMAT_VERSION: u32 = 1;
const SCAN_PAGE: u64 = 500;
const MIN_TERM_CHARS: usize = 3;

#[derive(Debug, Serialize, Deserialize)]
struct SuggestFile {
    version: u32,
    built_at: String,
    terms: Vec<String>,
}

pub struct SuggestionIndex {
    path: PathBuf,
}

impl SuggestionIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild from every stored document text and mail body. Returns the
    /// number of distinct terms written.
    pub async fn build(&self, index: &dyn SearchIndex) -> SearchResult<usize> {
        let mut terms = BTreeSet::new();

        for field in [fields::TEXT, fields::CONTENT] {
            let mut offset = 0u64;
            loop {
                let values = index.field_values(field, offset, SCAN_PAGE).await?;
                if values.is_empty() {
                    break;
                }
                offset += values.len() as u64;
                for value in &values {
                    for token in value.split_whitespace() {
                        if token.chars().count() >= MIN_TERM_CHARS {
                            terms.insert(token.to_lowercase());
                        }
                    }
                }
            }
        }

        let count = terms.len();
        self.write(terms.into_iter().collect())?;
        info!(path = %self.path.display(), terms = count, "suggestion index rebuilt");
        Ok(count)
    }

    fn write(&self, terms: Vec<String>) -> SearchResult<()> {
        let io = |e: std::io::Error| SearchError::IndexIo(format!("{}: {}", self.path.display(), e));

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(io)?;
            }
        }

        let file = SuggestFile {
            version: FORMAT_VERSION,
            built_at: chrono::Utc::now().to_rfc3339(),
            terms,
        };
        let body = serde_json::to_vec(&file).map_err(|e| SearchError::IndexIo(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, body).map_err(io)?;
        fs::rename(&tmp, &self.path).map_err(io)?;
        Ok(())
    }

    fn load(&self) -> Option<Vec<String>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no suggestion index");
                return None;
            }
        };
        match serde_json::from_slice::<SuggestFile>(&raw) {
            Ok(file) if file.version == FORMAT_VERSION => Some(file.terms),
            Ok(file) => {
                warn!(path = %self.path.display(), version = file.version, "unsupported suggestion index version");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt suggestion index");
                None
            }
        }
    }

    /// Up to `max` stored terms starting with `prefix`, in lexical order.
    /// An absent or unreadable structure yields no suggestions.
    pub fn suggest(&self, prefix: &str, max: usize) -> Vec<String> {
        let Some(terms) = self.load() else {
            return Vec::new();
        };
        let prefix = prefix.to_lowercase();
        let start = terms.partition_point(|t| t.as_str() < prefix.as_str());
        terms[start..]
            .iter()
            .take_while(|t| t.starts_with(&prefix))
            .take(max)
            .cloned()
            .collect()
    }
}
