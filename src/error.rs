use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("no folder named {0:?} under the storage root")]
    UnknownFolder(String),
    #[error("source folder missing: {0:?}")]
    MissingSource(PathBuf),
    #[error("target root not configured or missing: {0:?}")]
    MissingTargetRoot(PathBuf),
    #[error("nothing to deploy from {0:?} after filtering")]
    NothingToDeploy(PathBuf),
    #[error("target occupied and conflict policy is skip: {0:?}")]
    ConflictSkipped(PathBuf),
    #[error("symlink failed: {source_path:?} -> {dest:?} ({err})")]
    SymlinkUnsupported {
        source_path: PathBuf,
        dest: PathBuf,
        err: io::Error,
    },
    #[error("{action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("walk source tree: {0}")]
    Walk(#[from] walkdir::Error),
}

impl DeployError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        DeployError::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            DeployError::Io { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            DeployError::SymlinkUnsupported { err, .. } => {
                err.kind() == io::ErrorKind::PermissionDenied
            }
            DeployError::Walk(err) => err
                .io_error()
                .map(|io| io.kind() == io::ErrorKind::PermissionDenied)
                .unwrap_or(false),
            _ => false,
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

pub(crate) trait IoContext<T> {
    fn at(self, action: &'static str, path: &std::path::Path) -> DeployResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, action: &'static str, path: &std::path::Path) -> DeployResult<T> {
        self.map_err(|err| DeployError::io(action, path, err))
    }
}
