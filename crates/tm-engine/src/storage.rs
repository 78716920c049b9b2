//! Binary storage for job files.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tm_core::{Error, FileRef, Result, SessionId};
use tokio::io::AsyncWriteExt;

/// Which half of a session a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    Input,
    Output,
}

impl StorageScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage collaborator used by submission and workers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist `data` under the session and return a reference to it.
    async fn store(
        &self,
        session: SessionId,
        scope: StorageScope,
        name: &str,
        data: Bytes,
    ) -> Result<FileRef>;

    async fn fetch(&self, file: &FileRef) -> Result<Bytes>;

    /// Remove every file of the session in `scope`. Purging something
    /// already gone succeeds.
    async fn purge(&self, session: SessionId, scope: StorageScope) -> Result<()>;
}

/// Filesystem storage laid out as `root/<session>/<scope>/<name>`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, session: SessionId, scope: StorageScope) -> PathBuf {
        self.root.join(session.to_string()).join(scope.as_str())
    }

    /// Resolve a locator, refusing anything that would escape the root.
    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let relative = Path::new(locator);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean || locator.is_empty() {
            return Err(Error::storage(format!("invalid locator: {locator}")));
        }
        Ok(self.root.join(relative))
    }
}

/// Keep only the final path component, and something non-empty.
fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| "file".into())
}

#[async_trait]
impl Storage for LocalStorage {
    async fn store(
        &self,
        session: SessionId,
        scope: StorageScope,
        name: &str,
        data: Bytes,
    ) -> Result<FileRef> {
        let dir = self.scope_dir(session, scope);
        tokio::fs::create_dir_all(&dir).await?;

        let base = safe_file_name(name);
        let (stem, ext) = match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (base.clone(), String::new()),
        };

        // Two uploads may share a name; never overwrite.
        let mut candidate = base.clone();
        let mut n = 1;
        let mut file = loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dir.join(&candidate))
                .await
            {
                Ok(file) => break file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    candidate = format!("{stem}-{n}{ext}");
                    n += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        file.write_all(&data).await?;
        file.flush().await?;

        Ok(FileRef {
            locator: format!("{session}/{scope}/{candidate}"),
            name: base,
            size: data.len() as u64,
        })
    }

    async fn fetch(&self, file: &FileRef) -> Result<Bytes> {
        let path = self.resolve(&file.locator)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("file", &file.locator))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn purge(&self, session: SessionId, scope: StorageScope) -> Result<()> {
        let dir = self.scope_dir(session, scope);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop the session directory once both scopes are gone.
        let _ = tokio::fs::remove_dir(self.root.join(session.to_string())).await;
        tracing::debug!(session = %session, scope = %scope, "Purged session files");
        Ok(())
    }
}
