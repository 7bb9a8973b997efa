//! Streaming fetch/extract pipeline.
//!
//! A tarball is read from the network exactly once: every raw byte is fed
//! simultaneously to a SHA-256 hasher and to the gzip decompressor (the
//! digest tee), the tar stream is unpacked into a scratch directory, and the
//! scratch is promoted into the content-addressed store under the finished
//! hash. Memory stays bounded by the channel between the network task and
//! the blocking extract task plus one recycled copy buffer.

use crate::error::{EngineError, Result};
use crate::registry::RegistryClient;
use crate::store::Store;
use bytes::Bytes;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender};
use tar::Archive;
use tracing::debug;

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

/// Capacity of the chunk channel between the network and extract tasks.
const CHUNK_CHANNEL_CAPACITY: usize = 16;

/// Size of the recycled file-copy buffer.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A tarball fetched, extracted, and promoted into the store.
#[derive(Debug, Clone)]
pub struct FetchedPackage {
    /// Lowercase hex SHA-256 of the raw tarball bytes.
    pub hash: String,
    /// Canonical store path of the extracted package.
    pub cas_path: PathBuf,
}

/// Download a tarball and materialize it in the store.
///
/// # Errors
/// - `DOWNLOAD_FAILED` on transport errors or oversized bodies.
/// - `EXTRACT_FAILED` on gzip/tar errors, path escapes, or write errors.
pub async fn fetch_package(
    client: &RegistryClient,
    store: &Store,
    url: &str,
) -> Result<FetchedPackage> {
    let mut response = client.stream_tarball(url).await?;

    let scratch = tempfile::Builder::new()
        .prefix(".scratch-")
        .tempdir_in(store.scratch_base()?)
        .map_err(|e| EngineError::extract_failed(format!("failed to create scratch dir: {e}")))?;
    let package_dir = scratch.path().join("package");

    let (tx, rx) = std::sync::mpsc::sync_channel::<io::Result<Bytes>>(CHUNK_CHANNEL_CAPACITY);

    let extract_dir = package_dir.clone();
    let extractor =
        tokio::task::spawn_blocking(move || extract_tgz_stream(ChunkReader::new(rx), &extract_dir));

    let download_error = pump_response(&mut response, &tx, url).await;
    drop(tx);

    let extract_result = extractor
        .await
        .map_err(|e| EngineError::extract_failed(format!("extract task failed: {e}")))?;

    // A broken download usually surfaces as a gzip/tar error in the
    // extractor; report the root cause instead.
    if let Some(err) = download_error {
        return Err(err);
    }
    let hash = extract_result?;

    let cas_path = store.promote(&package_dir, &hash)?;
    debug!(%url, %hash, "tarball extracted into store");

    Ok(FetchedPackage { hash, cas_path })
}

/// Forward response chunks into the extract channel, returning the download
/// error if the transport fails mid-stream.
async fn pump_response(
    response: &mut reqwest::Response,
    tx: &SyncSender<io::Result<Bytes>>,
    url: &str,
) -> Option<EngineError> {
    let mut total: u64 = 0;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                total += chunk.len() as u64;
                if total > MAX_TARBALL_SIZE {
                    let _ = tx.send(Err(io::Error::other("tarball size limit exceeded")));
                    return Some(EngineError::download_failed(format!(
                        "tarball too large: more than {MAX_TARBALL_SIZE} bytes from '{url}'"
                    )));
                }
                if tx.send(Ok(chunk)).is_err() {
                    // Extractor bailed; its error is reported by the caller.
                    return None;
                }
            }
            Ok(None) => return None,
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.to_string())));
                return Some(EngineError::download_failed(format!(
                    "failed to read tarball from '{url}': {e}"
                )));
            }
        }
    }
}

/// Blocking reader over the chunk channel.
struct ChunkReader {
    rx: Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChunkReader {
    fn new(rx: Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => self.current = chunk,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current = self.current.slice(n..);
        Ok(n)
    }
}

/// Reader that feeds every byte it yields into a SHA-256 hasher.
struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> DigestReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Consume any bytes the decompressor left unread, then return the
    /// digest of everything that passed through.
    fn drain_and_finalize(mut self) -> io::Result<String> {
        let mut buf = [0u8; 8192];
        loop {
            let n = self.inner.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buf[..n]);
        }
        Ok(hex::encode(self.hasher.finalize()))
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Decompress and unpack a gzipped tar stream into `dest`, returning the
/// hex SHA-256 of the raw (compressed) byte stream.
///
/// Only regular files and directories are materialized; symlinks, devices,
/// and other entry types are skipped. Entry paths are sanitized by
/// [`clean_tar_path`].
pub fn extract_tgz_stream<R: Read>(reader: R, dest: &Path) -> Result<String> {
    fs::create_dir_all(dest)
        .map_err(|e| EngineError::extract_failed(format!("failed to create destination: {e}")))?;

    let digest_reader = DigestReader::new(reader);
    let mut archive = Archive::new(GzDecoder::new(digest_reader));
    let mut copy_buf = vec![0u8; COPY_BUFFER_SIZE];

    {
        let entries = archive
            .entries()
            .map_err(|e| EngineError::extract_failed(format!("failed to read tarball: {e}")))?;

        for entry in entries {
            let mut entry = entry
                .map_err(|e| EngineError::extract_failed(format!("failed to read entry: {e}")))?;

            let raw_path = entry
                .path()
                .map_err(|e| EngineError::extract_failed(format!("failed to read entry path: {e}")))?
                .to_string_lossy()
                .into_owned();

            let Some(clean) = clean_tar_path(&raw_path)? else {
                continue;
            };
            let target = dest.join(&clean);

            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                fs::create_dir_all(&target).map_err(|e| {
                    EngineError::extract_failed(format!("failed to create dir '{clean}': {e}"))
                })?;
            } else if entry_type.is_file() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        EngineError::extract_failed(format!(
                            "failed to create parent of '{clean}': {e}"
                        ))
                    })?;
                }
                write_entry(&mut entry, &target, &mut copy_buf).map_err(|e| {
                    EngineError::extract_failed(format!("failed to write '{clean}': {e}"))
                })?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(mode) = entry.header().mode() {
                        let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
                    }
                }
            }
            // Symlinks, hardlinks, devices, fifos: skipped.
        }
    }

    // Drain trailing bytes (tar padding, gzip trailer) so the hash covers
    // the entire raw stream.
    archive
        .into_inner()
        .into_inner()
        .drain_and_finalize()
        .map_err(|e| EngineError::extract_failed(format!("failed to drain stream: {e}")))
}

fn write_entry<R: Read>(entry: &mut R, target: &Path, copy_buf: &mut [u8]) -> io::Result<()> {
    let mut file = File::create(target)?;
    loop {
        let n = entry.read(copy_buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&copy_buf[..n])?;
    }
    Ok(())
}

/// Sanitize a tar entry path.
///
/// Strips a leading `./` and any leading `/`, then strips a `package/`
/// first component (the conventional npm wrapper). Other leading components
/// are preserved. Returns `None` for entries with nothing left to write and
/// an error for paths that would escape the destination.
pub fn clean_tar_path(raw: &str) -> Result<Option<String>> {
    let mut path = raw;
    if let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path = path.trim_start_matches('/');

    if let Some(rest) = path.strip_prefix("package/") {
        path = rest;
    } else if path == "package" {
        return Ok(None);
    }

    if path.is_empty() {
        return Ok(None);
    }

    for component in path.split('/') {
        if component == ".." {
            return Err(EngineError::extract_failed(format!(
                "tarball entry escapes destination: {raw}"
            )));
        }
    }

    Ok(Some(path.trim_end_matches('/').to_string()))
}
