//! Shared-scratch transfer: the zip archive at `{bucket}/{job_id}/data.zip`
//! is the only channel stages pass data through.
//!
//! Grounded on the original `save_context`/`load_context`/`save_data`/
//! `load_data` helpers: a per-job temp directory holds `job/input/`,
//! `job/output/`, and a `job/context` JSON file; `save_data` zips that
//! directory and uploads it, `load_data` downloads and extracts it,
//! idempotently skipping the download if the directory already has content.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use sdcloud_config::Settings;
use sdcloud_core::{Error, JobId, Result};
use tracing::{debug, info};
use url::Url;

const CONTEXT_FILE: &str = "job/context";

/// Pick a concrete [`ObjectStore`] backend from settings, the same way the
/// teacher's `ExecutorType::from_env()` picks Docker vs. Kubernetes: a local
/// filesystem store under `TMP_DIR` in dev, a cloud backend resolved from
/// `SD_DATA_STORAGE_BUCKET_NAME` everywhere else.
pub fn build_store(settings: &Settings) -> Result<Arc<dyn ObjectStore>> {
    if settings.env.is_dev() {
        let root = PathBuf::from(&settings.tmp_dir).join("sdcloud-blob-store");
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Internal(format!("creating local blob root: {e}")))?;
        let store = LocalFileSystem::new_with_prefix(&root)
            .map_err(|e| Error::Internal(format!("opening local blob store: {e}")))?;
        return Ok(Arc::new(store));
    }

    let url = Url::parse(&format!("gs://{}", settings.data_storage_bucket))
        .map_err(|e| Error::Internal(format!("parsing bucket url: {e}")))?;
    let (store, _path) = object_store::parse_url(&url)
        .map_err(|e| Error::Internal(format!("building object store for {url}: {e}")))?;
    Ok(Arc::from(store))
}

/// Build the URL the packaged output archive is reachable at once a job's
/// `cpu.cleanup` stage... actually once it *succeeds* (cleanup deletes the
/// archive afterwards, so callers must fetch before the reaper or a
/// subsequent cleanup removes it). A simplification of the original's
/// `blob.make_public()` + `blob.public_url`: this assumes `base` already
/// points at a publicly readable bucket endpoint rather than performing a
/// per-object ACL change, since `object_store` has no portable "make public"
/// operation across backends.
pub fn public_download_url(base: &str, job_id: JobId) -> Result<Url> {
    let base = base.trim_end_matches('/');
    Url::parse(&format!("{base}/{job_id}/data.zip"))
        .map_err(|e| Error::Internal(format!("building download url: {e}")))
}

/// Create (if needed) and return the per-job scratch directory under
/// `tmp_root`.
pub fn get_tmp_dir(tmp_root: &Path, job_id: JobId) -> Result<PathBuf> {
    let dir = tmp_root.join(job_id.to_string());
    for sub in ["job/input", "job/output"] {
        std::fs::create_dir_all(dir.join(sub))
            .map_err(|e| Error::Internal(format!("creating {sub}: {e}")))?;
    }
    Ok(dir)
}

/// Write the stage context as JSON to `job/context` inside the job's scratch
/// directory.
pub fn save_context(job_dir: &Path, context: &serde_json::Value) -> Result<()> {
    let path = job_dir.join(CONTEXT_FILE);
    let bytes = serde_json::to_vec_pretty(context)
        .map_err(|e| Error::Internal(format!("serializing context: {e}")))?;
    std::fs::write(&path, bytes).map_err(|e| Error::Internal(format!("writing context: {e}")))?;
    Ok(())
}

/// Read the stage context back from `job/context`.
pub fn load_context(job_dir: &Path) -> Result<serde_json::Value> {
    let path = job_dir.join(CONTEXT_FILE);
    let bytes =
        std::fs::read(&path).map_err(|e| Error::Internal(format!("reading context: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Internal(format!("parsing context: {e}")))
}

fn object_key(job_id: JobId) -> ObjectPath {
    ObjectPath::from(format!("{job_id}/data.zip"))
}

/// Zip the job's scratch directory and upload it as `{job_id}/data.zip`.
pub async fn save_data(
    store: &Arc<dyn ObjectStore>,
    job_id: JobId,
    job_dir: &Path,
) -> Result<()> {
    let zip_bytes = zip_directory(job_dir)?;
    let key = object_key(job_id);
    info!(%job_id, bytes = zip_bytes.len(), "uploading shared archive");
    store
        .put(&key, zip_bytes.into())
        .await
        .map_err(|e| Error::Internal(format!("uploading archive: {e}")))?;
    Ok(())
}

/// Download and extract `{job_id}/data.zip` into the job's scratch
/// directory, unless it already has content (idempotent under retry).
pub async fn load_data(
    store: &Arc<dyn ObjectStore>,
    job_id: JobId,
    job_dir: &Path,
) -> Result<()> {
    if dir_has_content(&job_dir.join("job")) {
        debug!(%job_id, "scratch directory already populated, skipping download");
        return Ok(());
    }

    let key = object_key(job_id);
    let result = store
        .get(&key)
        .await
        .map_err(|e| Error::Internal(format!("downloading archive: {e}")))?;
    let bytes = result
        .bytes()
        .await
        .map_err(|e| Error::Internal(format!("reading archive body: {e}")))?;
    unzip_into(&bytes, job_dir)?;
    Ok(())
}

/// Delete the shared archive for a job. Used by the `cleanup` stage once the
/// pipeline has produced its final output.
pub async fn delete_data(store: &Arc<dyn ObjectStore>, job_id: JobId) -> Result<()> {
    let key = object_key(job_id);
    match store.delete(&key).await {
        Ok(()) => Ok(()),
        Err(object_store::Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(Error::Internal(format!("deleting archive: {e}"))),
    }
}

/// True if any *file* exists anywhere under `dir`. `get_tmp_dir` always
/// pre-creates the empty `job/input` and `job/output` subdirectories, so a
/// shallow "has any entry" check would see those empty directories and
/// report content that isn't there; this walks the whole tree looking for
/// an actual file before treating the scratch directory as already
/// populated.
fn dir_has_content(dir: &Path) -> bool {
    match walk(dir) {
        Ok(entries) => entries.iter().any(|p| p.is_file()),
        Err(_) => false,
    }
}

fn zip_directory(job_dir: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut buf);
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let job_root = job_dir.join("job");
        for entry in walk(&job_root)? {
            let rel = entry
                .strip_prefix(job_dir)
                .map_err(|e| Error::Internal(format!("relative path: {e}")))?;
            let name = rel.to_string_lossy().replace('\\', "/");
            if entry.is_dir() {
                writer
                    .add_directory(format!("{name}/"), options)
                    .map_err(|e| Error::Internal(format!("zip dir: {e}")))?;
            } else {
                writer
                    .start_file(name, options)
                    .map_err(|e| Error::Internal(format!("zip start_file: {e}")))?;
                let mut f = std::fs::File::open(&entry)
                    .map_err(|e| Error::Internal(format!("open {entry:?}: {e}")))?;
                let mut contents = Vec::new();
                f.read_to_end(&mut contents)
                    .map_err(|e| Error::Internal(format!("read {entry:?}: {e}")))?;
                writer
                    .write_all(&contents)
                    .map_err(|e| Error::Internal(format!("zip write: {e}")))?;
            }
        }
        writer
            .finish()
            .map_err(|e| Error::Internal(format!("zip finish: {e}")))?;
    }
    Ok(buf)
}

fn walk(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::Internal(format!("reading dir {dir:?}: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Internal(format!("dir entry: {e}")))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            out.push(path);
        }
    }
    Ok(out)
}

fn unzip_into(bytes: &[u8], job_dir: &Path) -> Result<()> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(cursor).map_err(|e| Error::Internal(format!("open zip: {e}")))?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::Internal(format!("zip entry {i}: {e}")))?;
        let outpath = match file.enclosed_name() {
            Some(path) => job_dir.join(path),
            None => continue,
        };
        if file.is_dir() {
            std::fs::create_dir_all(&outpath)
                .map_err(|e| Error::Internal(format!("mkdir {outpath:?}: {e}")))?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Internal(format!("mkdir {parent:?}: {e}")))?;
            }
            let mut out = std::fs::File::create(&outpath)
                .map_err(|e| Error::Internal(format!("create {outpath:?}: {e}")))?;
            std::io::copy(&mut file, &mut out)
                .map_err(|e| Error::Internal(format!("extract {outpath:?}: {e}")))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> Arc<dyn ObjectStore> {
        Arc::new(InMemory::new())
    }

    #[test]
    fn context_roundtrips_through_the_job_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        let job_dir = get_tmp_dir(tmp.path(), job_id).unwrap();
        let context = serde_json::json!({"prior_renders_path": "01_priors"});
        save_context(&job_dir, &context).unwrap();
        let loaded = load_context(&job_dir).unwrap();
        assert_eq!(loaded, context);
    }

    #[tokio::test]
    async fn save_then_load_data_roundtrips_input_files() {
        let store = store();
        let tmp = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        let job_dir = get_tmp_dir(tmp.path(), job_id).unwrap();
        std::fs::write(job_dir.join("job/input/input_mesh.obj"), b"v 0 0 0").unwrap();

        save_data(&store, job_id, &job_dir).await.unwrap();

        let tmp2 = tempfile::tempdir().unwrap();
        let job_dir2 = get_tmp_dir(tmp2.path(), job_id).unwrap();
        std::fs::remove_dir_all(job_dir2.join("job/input")).unwrap();
        load_data(&store, job_id, &job_dir2).await.unwrap();

        let restored = std::fs::read(job_dir2.join("job/input/input_mesh.obj")).unwrap();
        assert_eq!(restored, b"v 0 0 0");
    }

    #[tokio::test]
    async fn load_data_is_a_noop_when_scratch_already_populated() {
        let store = store();
        let job_id = JobId::new();
        let tmp = tempfile::tempdir().unwrap();
        let job_dir = get_tmp_dir(tmp.path(), job_id).unwrap();
        std::fs::write(job_dir.join("job/input/marker"), b"already here").unwrap();

        // No archive has ever been uploaded for this job id; if load_data
        // tried to download it would error. It must not try.
        load_data(&store, job_id, &job_dir).await.unwrap();
    }
}
