use crate::artifact::Artifact;
use crate::error::{JobError, Result};
use crate::workspace::Workspace;
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;

/// A successfully signed package, still living inside its job's
/// workspace. The workspace is torn down when this (or the stream made
/// from it) is dropped, so delivery can never leak a directory no matter
/// how far the caller reads.
pub struct SignedPackage {
    artifact: Artifact,
    workspace: Workspace,
}

impl SignedPackage {
    pub(crate) fn new(artifact: Artifact, workspace: Workspace) -> Self {
        Self {
            artifact,
            workspace,
        }
    }

    pub fn len(&self) -> u64 {
        self.artifact.len
    }

    pub fn is_empty(&self) -> bool {
        self.artifact.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.artifact.path
    }

    /// Open the output artifact for chunked reading. The returned stream
    /// keeps the workspace alive until it is dropped.
    pub async fn into_stream(self) -> Result<PackageStream> {
        let file = tokio::fs::File::open(&self.artifact.path)
            .await
            .map_err(|err| {
                JobError::ResourceExhausted(format!("cannot open signed package: {}", err))
            })?;
        Ok(PackageStream {
            inner: ReaderStream::new(file),
            _workspace: self.workspace,
        })
    }
}

pub struct PackageStream {
    inner: ReaderStream<tokio::fs::File>,
    _workspace: Workspace,
}

impl Stream for PackageStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
