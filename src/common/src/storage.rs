use anyhow::Result;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{
    ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path,
};
use std::sync::Arc;
use url::Url;

/// Object storage rooted at a table base path.
///
/// All object paths handed to this type are relative to the table base
/// (partition paths, meta-folder paths). The original DSN path is kept so
/// that payloads which must record absolute locations (version-1 clean
/// payloads, bootstrap source files) can be rendered consistently.
#[derive(Clone)]
pub struct TableStorage {
    store: Arc<dyn ObjectStore>,
    base_path: String,
}

impl TableStorage {
    pub fn new(dsn: &str) -> Result<Self> {
        Ok(Self {
            store: create_object_store_from_dsn(dsn)?,
            base_path: storage_dsn_to_path(dsn)?,
        })
    }

    /// The table base path in display form, used when joining absolute paths
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        self.store.put(&Path::from(path), bytes.into()).await?;
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Bytes> {
        Ok(self.store.get(&Path::from(path)).await?.bytes().await?)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(&Path::from(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a single object. Deleting an already-absent object is a
    /// success: retries of a clean plan re-attempt deletes whose effect was
    /// already observed.
    pub async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&Path::from(path)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// File names directly under `prefix` (no recursion)
    pub async fn list_dir(&self, prefix: &str) -> Result<Vec<String>> {
        let result = self
            .store
            .list_with_delimiter(Some(&Path::from(prefix)))
            .await?;
        let mut names: Vec<String> = result
            .objects
            .iter()
            .filter_map(|meta| meta.location.filename().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// All object paths under `prefix` (recursive), relative to the base
    pub async fn list_recursive(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let prefix = prefix.map(Path::from);
        let metas: Vec<_> = self.store.list(prefix.as_ref()).try_collect().await?;
        let mut paths: Vec<String> = metas
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        paths.sort();
        Ok(paths)
    }
}

/// Extract the filesystem path from a storage DSN
/// Returns the path component without the URL scheme for file:// URLs,
/// or the original DSN for other schemes
pub fn storage_dsn_to_path(dsn: &str) -> Result<String> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/table"
                ));
            }
            // Remove leading slash for relative paths like /.data/basindb -> .data/basindb
            // Keep leading slash for absolute paths like /tmp/table -> /tmp/table
            let path = if path.starts_with("/.") {
                &path[1..]
            } else {
                path
            };
            Ok(path.to_string())
        }
        "memory" => Ok("memory://".to_string()),
        "s3" => Ok(dsn.to_string()), // Keep S3 URLs as-is
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Create an object store from a DSN string
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/table"
                ));
            }
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let builder = create_s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Create an S3 builder from a DSN
/// DSN format: s3://[access_key:secret_key@]host[:port]/bucket
fn create_s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let port = dsn.port();
    let bucket = dsn.path().trim_start_matches('/');

    if bucket.is_empty() {
        return Err(anyhow::anyhow!(
            "S3 DSN must specify a bucket: s3://host/bucket"
        ));
    }

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region("us-east-1"); // Default region

    let access_key = dsn.username();
    let secret_key = dsn.password().unwrap_or("");

    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
    }

    // S3-compatible endpoints (MinIO etc) need an explicit endpoint and
    // path-style requests
    if !host.contains("amazonaws.com") {
        let scheme = if port == Some(443) { "https" } else { "http" };
        let endpoint = match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let storage = TableStorage::new("memory://").unwrap();
        storage
            .put("2020/03/15/data.parquet", b"abc".to_vec())
            .await
            .unwrap();

        assert!(storage.exists("2020/03/15/data.parquet").await.unwrap());
        let bytes = storage.get("2020/03/15/data.parquet").await.unwrap();
        assert_eq!(bytes.as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_delete_absent_is_success() {
        let storage = TableStorage::new("memory://").unwrap();
        storage.delete("2020/03/15/missing.parquet").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_dir_is_not_recursive() {
        let storage = TableStorage::new("memory://").unwrap();
        storage.put(".basin/001.commit", vec![]).await.unwrap();
        storage
            .put(".basin/.temp/001/marker", vec![])
            .await
            .unwrap();

        let names = storage.list_dir(".basin").await.unwrap();
        assert_eq!(names, vec!["001.commit".to_string()]);
    }

    #[tokio::test]
    async fn test_filesystem_storage() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let dsn = format!("file://{}", temp_dir.path().display());
        let storage = TableStorage::new(&dsn).unwrap();

        storage.put("p1/f1.parquet", vec![1]).await.unwrap();
        assert!(storage.exists("p1/f1.parquet").await.unwrap());
        storage.delete("p1/f1.parquet").await.unwrap();
        assert!(!storage.exists("p1/f1.parquet").await.unwrap());
    }

    #[test]
    fn test_invalid_dsn() {
        let result = TableStorage::new("not-a-url");
        assert!(result.is_err());
    }

    #[test]
    fn test_unsupported_scheme() {
        let result = create_object_store_from_dsn("gcs://bucket/prefix");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unsupported storage scheme")
        );
    }

    #[test]
    fn test_storage_dsn_to_path() {
        assert_eq!(
            storage_dsn_to_path("file:///.data/basindb").unwrap(),
            ".data/basindb"
        );
        assert_eq!(storage_dsn_to_path("file:///tmp/table").unwrap(), "/tmp/table");
        assert_eq!(storage_dsn_to_path("memory://").unwrap(), "memory://");
    }
}
