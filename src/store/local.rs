//! LocalObjectStore: an object store with native multipart support backed
//! by local disk.
//!
//! Objects live sharded beneath `base_path/objects/{shard}/{shard}/{key}`
//! with a `.meta` JSON sidecar. Multipart sessions stage their parts under
//! `base_path/.multipart/{upload_id}/{part}.part`; the last write of a part
//! number wins. Single-shot objects land in `base_path/.incoming` and only
//! move under their key once the upload session accepts them. Every write goes to a temp file, is fsynced and then renamed
//! into place, so readers never observe a partial object.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Capability, ObjectStore, PartToken, SignedUrl, StoreError, StoreOp, StoreResult,
    StoredObject, UrlSigner,
};

const MAX_OBJECT_KEY_LEN: usize = 1024;
const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = ".multipart";
const INCOMING_DIR: &str = ".incoming";
const MANIFEST_FILE: &str = "upload.json";
const COPY_BUFFER_LEN: usize = 256 * 1024;

/// Bookkeeping written when a multipart session is created.
#[derive(Serialize, Deserialize, Debug)]
struct StagedUpload {
    key: String,
    content_type: String,
}

/// Result of streaming bytes into a file.
struct WriteSummary {
    size_bytes: u64,
    md5: md5::Digest,
    sha256: String,
}

/// A single-shot object written to disk but not yet visible under its key.
#[derive(Debug)]
pub struct StagedObject {
    pub object: StoredObject,
    path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Root directory for objects and staged parts.
    base_path: PathBuf,

    signer: UrlSigner,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            base_path: base_path.into(),
            signer,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Check a capability presented to one of the store endpoints.
    pub fn verify(&self, cap: &Capability<'_>, signature: &str) -> StoreResult<()> {
        self.signer.verify(cap, signature, Utc::now().timestamp())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or `.`, or contain `..`.
    fn ensure_key_safe(key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StoreError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.starts_with('.') || key.contains("..") {
            return Err(StoreError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Two-level shard identifiers: first two bytes of MD5(key) as hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.join(OBJECTS_DIR);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn meta_path(object_path: &Path) -> PathBuf {
        let mut name = object_path.as_os_str().to_owned();
        name.push(".meta");
        PathBuf::from(name)
    }

    /// Staging directory for a multipart session. Upload ids are UUIDs, which
    /// keeps them safe to use as a path component.
    fn staging_dir(&self, upload_id: &str) -> StoreResult<PathBuf> {
        let id = Uuid::parse_str(upload_id)
            .map_err(|_| StoreError::UploadNotFound(upload_id.to_string()))?;
        Ok(self.base_path.join(STAGING_DIR).join(id.to_string()))
    }

    fn part_path(staging: &Path, part_number: u32) -> PathBuf {
        staging.join(format!("{}.part", part_number))
    }

    async fn read_manifest(&self, staging: &Path, upload_id: &str) -> StoreResult<StagedUpload> {
        match fs::read(staging.join(MANIFEST_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::UploadNotFound(upload_id.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Stream one part of a multipart session to disk and return its
    /// completion token (MD5 hex of the part).
    pub async fn put_part_stream<S>(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        stream: S,
    ) -> StoreResult<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        Self::ensure_key_safe(key)?;
        let staging = self.staging_dir(upload_id)?;
        let manifest = self.read_manifest(&staging, upload_id).await?;
        if manifest.key != key {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        }

        let summary = write_stream_atomically(&Self::part_path(&staging, part_number), stream).await?;
        let etag = format!("{:x}", summary.md5);
        debug!(
            object_key = key,
            upload_id,
            part_number,
            size_bytes = summary.size_bytes,
            "stored part"
        );
        Ok(etag)
    }

    /// Stream a whole object to disk and publish it immediately.
    pub async fn put_object_stream<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StoreResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let staged = self.stage_object_stream(key, content_type, stream).await?;
        self.publish_staged(&staged).await?;
        Ok(staged.object)
    }

    /// Stream a whole object into the incoming area without publishing it.
    /// The returned metadata (size, ETag, SHA-256) describes the staged bytes.
    pub async fn stage_object_stream<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StoreResult<StagedObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        Self::ensure_key_safe(key)?;
        let path = self
            .base_path
            .join(INCOMING_DIR)
            .join(Uuid::new_v4().to_string());
        let summary = write_stream_atomically(&path, stream).await?;
        let object = StoredObject {
            key: key.to_string(),
            size_bytes: summary.size_bytes,
            etag: format!("{:x}", summary.md5),
            checksum_sha256: summary.sha256,
            content_type,
            last_modified: Utc::now(),
        };
        debug!(object_key = key, size_bytes = object.size_bytes, "staged object");
        Ok(StagedObject { object, path })
    }

    /// Move staged bytes to their key and write the metadata sidecar.
    pub async fn publish_staged(&self, staged: &StagedObject) -> StoreResult<()> {
        let file_path = self.object_path(&staged.object.key);
        fs::create_dir_all(parent_dir(&file_path)?).await?;
        rename_into_place(&staged.path, &file_path).await?;
        if let Err(err) = self.write_meta(&file_path, &staged.object).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }
        info!(
            object_key = %staged.object.key,
            size_bytes = staged.object.size_bytes,
            "stored object"
        );
        Ok(())
    }

    /// Drop staged bytes that will never be published. A no-op once they
    /// have been.
    pub async fn discard_staged(&self, staged: &StagedObject) {
        match fs::remove_file(&staged.path).await {
            Ok(()) => debug!(object_key = %staged.object.key, "discarded staged object"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove {}: {}", staged.path.display(), err),
        }
    }

    /// Fetch an object for reading: metadata plus an open file handle.
    pub async fn open_object(&self, key: &str) -> StoreResult<(StoredObject, File)> {
        let meta = self
            .head_object(key)
            .await?
            .ok_or_else(|| StoreError::ObjectNotFound(key.to_string()))?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::ObjectNotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok((meta, file))
    }

    async fn write_meta(&self, object_path: &Path, object: &StoredObject) -> StoreResult<()> {
        let meta_path = Self::meta_path(object_path);
        let tmp = meta_path.with_extension(format!("meta-{}", Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec(object)?).await?;
        fs::rename(&tmp, &meta_path).await?;
        Ok(())
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn create_multipart(&self, key: &str, content_type: &str) -> StoreResult<String> {
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().to_string();
        let staging = self.staging_dir(&upload_id)?;
        fs::create_dir_all(&staging).await?;

        let manifest = StagedUpload {
            key: key.to_string(),
            content_type: content_type.to_string(),
        };
        fs::write(staging.join(MANIFEST_FILE), serde_json::to_vec(&manifest)?).await?;
        debug!(object_key = key, upload_id = %upload_id, "created multipart upload");
        Ok(upload_id)
    }

    fn sign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> StoreResult<SignedUrl> {
        Self::ensure_key_safe(key)?;
        self.signer.url(&Capability {
            op: StoreOp::Part,
            key,
            upload_id: Some(upload_id),
            part_number: Some(part_number),
            expires: UrlSigner::expiry_after(ttl),
        })
    }

    fn sign_put(&self, key: &str, ttl: Duration) -> StoreResult<SignedUrl> {
        Self::ensure_key_safe(key)?;
        self.signer.url(&Capability {
            op: StoreOp::Object,
            key,
            upload_id: None,
            part_number: None,
            expires: UrlSigner::expiry_after(ttl),
        })
    }

    fn sign_get(&self, key: &str, ttl: Duration) -> StoreResult<SignedUrl> {
        Self::ensure_key_safe(key)?;
        self.signer.url(&Capability {
            op: StoreOp::Read,
            key,
            upload_id: None,
            part_number: None,
            expires: UrlSigner::expiry_after(ttl),
        })
    }

    async fn finalize_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartToken],
        expected_checksum: Option<&str>,
    ) -> StoreResult<StoredObject> {
        Self::ensure_key_safe(key)?;
        if parts.is_empty()
            || parts
                .windows(2)
                .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(StoreError::InvalidPartOrder);
        }

        let staging = self.staging_dir(upload_id)?;
        let manifest = self.read_manifest(&staging, upload_id).await?;
        if manifest.key != key {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        }

        let file_path = self.object_path(key);
        let parent = parent_dir(&file_path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let assembled = assemble_parts(&staging, parts, &tmp_path).await;
        let (size_bytes, sha256, part_digests) = match assembled {
            Ok(result) => result,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Some(expected) = expected_checksum {
            if expected != sha256 {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: sha256,
                });
            }
        }

        rename_into_place(&tmp_path, &file_path).await?;

        let object = StoredObject {
            key: key.to_string(),
            size_bytes,
            etag: format!("{:x}-{}", md5::compute(&part_digests), parts.len()),
            checksum_sha256: sha256,
            content_type: Some(manifest.content_type),
            last_modified: Utc::now(),
        };
        if let Err(err) = self.write_meta(&file_path, &object).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        if let Err(err) = fs::remove_dir_all(&staging).await {
            debug!("failed to remove staging dir {}: {}", staging.display(), err);
        }
        info!(
            object_key = key,
            upload_id,
            parts = parts.len(),
            size_bytes,
            "finalized multipart upload"
        );
        Ok(object)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        let staging = self.staging_dir(upload_id)?;
        match fs::remove_dir_all(&staging).await {
            Ok(_) => {
                info!(object_key = key, upload_id, "aborted multipart upload");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn head_object(&self, key: &str) -> StoreResult<Option<StoredObject>> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let meta = match fs::read(Self::meta_path(&file_path)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err)),
        };
        if !fs::try_exists(&file_path).await? {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&meta)?))
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        for path in [Self::meta_path(&file_path), file_path.clone()] {
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::Io(err)),
            }
        }
        if let Some(parent) = file_path.parent() {
            let root = self.base_path.join(OBJECTS_DIR);
            self.prune_empty_dirs(parent, &root).await;
        }
        Ok(())
    }
}

fn parent_dir(path: &Path) -> StoreResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        StoreError::Io(io::Error::new(
            ErrorKind::Other,
            "object path missing parent directory",
        ))
    })
}

/// Write `stream` to a temp file next to `dest`, fsync, then rename over
/// `dest`. The temp file is removed on any error.
async fn write_stream_atomically<S>(dest: &Path, stream: S) -> StoreResult<WriteSummary>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let parent = parent_dir(dest)?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = File::create(&tmp_path).await?;

    let mut size_bytes: u64 = 0;
    let mut md5_ctx = md5::Context::new();
    let mut sha = Sha256::new();
    pin_mut!(stream);
    while let Some(chunk_res) = stream.next().await {
        let chunk = match chunk_res {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };
        size_bytes += chunk.len() as u64;
        md5_ctx.consume(&chunk);
        sha.update(&chunk);
        if let Err(err) = file.write_all(&chunk).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
    }
    if let Err(err) = file.flush().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StoreError::Io(err));
    }
    if let Err(err) = file.sync_all().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StoreError::Io(err));
    }
    drop(file);

    rename_into_place(&tmp_path, dest).await?;

    Ok(WriteSummary {
        size_bytes,
        md5: md5_ctx.compute(),
        sha256: general_purpose::STANDARD.encode(sha.finalize()),
    })
}

async fn rename_into_place(tmp_path: &Path, dest: &Path) -> StoreResult<()> {
    if let Err(err) = fs::rename(tmp_path, dest).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(dest).await?;
            fs::rename(tmp_path, dest).await?;
        } else {
            let _ = fs::remove_file(tmp_path).await;
            return Err(StoreError::Io(err));
        }
    }
    Ok(())
}

/// Concatenate staged parts into `tmp_path`, checking each part's MD5
/// against the token the client submitted. Returns the total size, the
/// base64 SHA-256 of the assembled object and the concatenated raw part
/// digests.
async fn assemble_parts(
    staging: &Path,
    parts: &[PartToken],
    tmp_path: &Path,
) -> StoreResult<(u64, String, Vec<u8>)> {
    let mut out = File::create(tmp_path).await?;
    let mut sha = Sha256::new();
    let mut size_bytes: u64 = 0;
    let mut part_digests = Vec::with_capacity(parts.len() * 16);
    let mut buf = vec![0u8; COPY_BUFFER_LEN];

    for part in parts {
        let path = LocalObjectStore::part_path(staging, part.part_number);
        let mut input = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::PartNotFound(part.part_number));
            }
            Err(err) => return Err(StoreError::Io(err)),
        };

        let mut part_md5 = md5::Context::new();
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            part_md5.consume(&buf[..n]);
            sha.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size_bytes += n as u64;
        }

        let digest = part_md5.compute();
        if format!("{:x}", digest) != part.etag {
            return Err(StoreError::PartMismatch(part.part_number));
        }
        part_digests.extend_from_slice(&digest.0);
    }

    out.flush().await?;
    out.sync_all().await?;

    Ok((
        size_bytes,
        general_purpose::STANDARD.encode(sha.finalize()),
        part_digests,
    ))
}
