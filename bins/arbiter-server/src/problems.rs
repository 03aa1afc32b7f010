/// Problem Data Cache
///
/// **Layout:**
/// `<cache_dir>/<problem_id>-problem/` holds the test pairs plus a
/// `meta.json` listing per-language limits:
/// `[{"language": "python", "time_limit_ms": 2000, "memory_limit_mb": 256}]`
///
/// **Cache Miss:**
/// With a problem API configured, `GET <api>/<problem_id>/package` with an
/// `X-Admin-Token` header returns a zip that is unpacked into a staging
/// directory and renamed into place, so a half-written bundle is never
/// visible. Without an API a miss is simply NotFound.
use arbiter_common::types::{Language, LanguageLimits};
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use zip::ZipArchive;

pub const META_FILE: &str = "meta.json";
const PROBLEM_DIR_SUFFIX: &str = "-problem";

#[derive(Debug, thiserror::Error)]
pub enum ProblemError {
    #[error("invalid problem id: {0:?}")]
    InvalidId(String),

    #[error("problem {0} not found")]
    NotFound(String),

    #[error("problem {id} has a corrupted meta.json: {source}")]
    CorruptMetadata {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to download problem {id}: {source}")]
    Download {
        id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid problem package: {0}")]
    Package(String),

    #[error("problem cache I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<zip::result::ZipError> for ProblemError {
    fn from(e: zip::result::ZipError) -> Self {
        ProblemError::Package(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ProblemData {
    pub limits: Vec<LanguageLimits>,
    pub bundle_dir: PathBuf,
}

impl ProblemData {
    /// Limits declared for `language`, tolerant of token aliases
    pub fn limits_for(&self, language: Language) -> Option<&LanguageLimits> {
        self.limits
            .iter()
            .find(|limit| limit.language.parse::<Language>().ok() == Some(language))
    }
}

#[derive(Debug, Clone)]
pub struct ProblemSource {
    pub api_url: String,
    pub api_key: Option<String>,
}

pub struct ProblemCache {
    cache_dir: PathBuf,
    source: Option<ProblemSource>,
    client: reqwest::Client,
    // One download at a time, so two submissions for the same cold
    // problem do not both fetch it
    download_lock: Mutex<()>,
}

impl ProblemCache {
    pub fn new(cache_dir: PathBuf, source: Option<ProblemSource>) -> io::Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        Ok(ProblemCache {
            cache_dir,
            source,
            client: reqwest::Client::new(),
            download_lock: Mutex::new(()),
        })
    }

    fn problem_dir(&self, problem_id: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}{}", problem_id, PROBLEM_DIR_SUFFIX))
    }

    #[instrument(skip(self))]
    pub async fn get_problem_data(&self, problem_id: &str) -> Result<ProblemData, ProblemError> {
        validate_id(problem_id)?;
        let dir = self.problem_dir(problem_id);

        if !dir.join(META_FILE).is_file() {
            let Some(source) = &self.source else {
                return Err(ProblemError::NotFound(problem_id.to_string()));
            };

            let _guard = self.download_lock.lock().await;
            // Another submission may have fetched it while we waited
            if !dir.join(META_FILE).is_file() {
                self.download(source, problem_id, &dir).await?;
            }
        }

        let raw = tokio::fs::read(dir.join(META_FILE)).await?;
        let limits: Vec<LanguageLimits> =
            serde_json::from_slice(&raw).map_err(|source| ProblemError::CorruptMetadata {
                id: problem_id.to_string(),
                source,
            })?;

        debug!(languages = limits.len(), bundle = %dir.display(), "Problem data loaded");

        Ok(ProblemData {
            limits,
            bundle_dir: dir,
        })
    }

    async fn download(
        &self,
        source: &ProblemSource,
        problem_id: &str,
        dest: &Path,
    ) -> Result<(), ProblemError> {
        let url = format!("{}/{}/package", source.api_url.trim_end_matches('/'), problem_id);
        info!(url = %url, "Problem not cached, downloading");

        let mut request = self.client.get(&url);
        if let Some(key) = &source.api_key {
            request = request.header("X-Admin-Token", key);
        }

        let download_err = |source| ProblemError::Download {
            id: problem_id.to_string(),
            source,
        };

        let response = request.send().await.map_err(download_err)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProblemError::NotFound(problem_id.to_string()));
        }
        let bytes = response
            .error_for_status()
            .map_err(download_err)?
            .bytes()
            .await
            .map_err(download_err)?;

        let cache_dir = self.cache_dir.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || install_package(Cursor::new(bytes), &cache_dir, &dest))
            .await
            .map_err(|e| ProblemError::Package(format!("extraction task failed: {}", e)))??;

        info!(problem_id = %problem_id, "Problem package installed");
        Ok(())
    }
}

/// Ids become directory names, keep them to a safe alphabet
fn validate_id(problem_id: &str) -> Result<(), ProblemError> {
    let valid = !problem_id.is_empty()
        && problem_id.len() <= 128
        && problem_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ProblemError::InvalidId(problem_id.to_string()))
    }
}

/// Unpack into a staging directory next to `dest`, then rename into place
fn install_package<R: Read + Seek>(
    reader: R,
    cache_dir: &Path,
    dest: &Path,
) -> Result<(), ProblemError> {
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(cache_dir)?;

    extract_zip(reader, staging.path())?;

    if !staging.path().join(META_FILE).is_file() {
        return Err(ProblemError::Package(format!("package has no {}", META_FILE)));
    }

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    // The emptied TempDir has nothing left to remove on drop
    fs::rename(staging.path(), dest)?;
    Ok(())
}

fn extract_zip<R: Read + Seek>(reader: R, dest: &Path) -> Result<(), ProblemError> {
    let mut archive = ZipArchive::new(reader)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        let Some(relative) = file.enclosed_name() else {
            return Err(ProblemError::Package(format!(
                "illegal file path: {}",
                file.name()
            )));
        };
        let outpath = dest.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        io::copy(&mut file, &mut outfile)?;
    }

    Ok(())
}
