//! Inbound side of the fragment protocol

use super::protocol::{ErrorCode, FragmentRequest, FragmentResponse};
use crate::metadata::{Fragment, MetadataStore};
use crate::storage::{FragmentKey, FragmentStore, StorageError};
use crate::Result;

use std::sync::Arc;
use tokio::sync::watch;

/// Answers fragment requests against this node's shard directory
pub struct FragmentService {
    name: String,
    fragments: Arc<FragmentStore>,
    store: Arc<MetadataStore>,
    shutdown: watch::Sender<bool>,
}

impl FragmentService {
    pub fn new(name: impl Into<String>, fragments: Arc<FragmentStore>, store: Arc<MetadataStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            fragments,
            store,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fragments(&self) -> &Arc<FragmentStore> {
        &self.fragments
    }

    /// Flips to `true` once a shutdown was requested
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn handle(&self, request: FragmentRequest) -> FragmentResponse {
        let kind = request.kind();
        let response = match request {
            FragmentRequest::Store { key, data } => match self.fragments.write(&key, &data).await {
                Ok(path) => FragmentResponse::Stored { path },
                Err(e) => storage_error(e),
            },
            FragmentRequest::Fetch { path, range } => match self.fragments.read(&path, range).await {
                Ok(data) => FragmentResponse::Data { data },
                Err(e) => storage_error(e),
            },
            FragmentRequest::Delete { path } => match self.fragments.delete(&path).await {
                Ok(existed) => FragmentResponse::Deleted { existed },
                Err(e) => storage_error(e),
            },
            FragmentRequest::Ping => FragmentResponse::Pong {
                server: self.name.clone(),
                free_space: self.fragments.free_space(),
            },
            FragmentRequest::Missing => match self.missing_fragments().await {
                Ok(fragments) => FragmentResponse::Missing { fragments },
                Err(e) => internal(e.to_string()),
            },
            FragmentRequest::Orphaned => match self.orphaned_paths().await {
                Ok(paths) => FragmentResponse::Orphaned { paths },
                Err(e) => internal(e.to_string()),
            },
            FragmentRequest::Shutdown => {
                tracing::info!("Shutdown requested for {}", self.name);
                self.request_shutdown();
                FragmentResponse::ShuttingDown
            }
        };

        if let FragmentResponse::Error { code, message } = &response {
            tracing::debug!("{} request on {} failed ({:?}): {}", kind, self.name, code, message);
        }
        response
    }

    /// Fragment rows assigned here whose shard file is absent
    pub async fn missing_fragments(&self) -> Result<Vec<FragmentKey>> {
        let mut missing = Vec::new();
        for fragment in self.store.fragments_on_server(&self.name)? {
            if !self.fragments.exists(&fragment.path).await {
                missing.push(fragment.fragment_key());
            }
        }
        Ok(missing)
    }

    /// Shard files here that no fragment row points at
    pub async fn orphaned_paths(&self) -> Result<Vec<String>> {
        let mut orphaned = Vec::new();
        for shard in self.fragments.list().await? {
            let referenced = match &shard.key {
                Some(key) => self
                    .store
                    .get::<Fragment>(&Fragment::key_for(&key.data_id, key.version_no, key.frag_id))?
                    .map(|row| row.server == self.name && row.path == shard.path)
                    .unwrap_or(false),
                None => false,
            };
            if !referenced {
                orphaned.push(shard.path);
            }
        }
        Ok(orphaned)
    }
}

fn internal(message: String) -> FragmentResponse {
    FragmentResponse::Error {
        code: ErrorCode::InternalError,
        message,
    }
}

fn storage_error(error: StorageError) -> FragmentResponse {
    let code = match &error {
        StorageError::FileNotFound(_) => ErrorCode::NotFound,
        StorageError::InsufficientSpace { .. } => ErrorCode::InsufficientSpace,
        StorageError::InvalidPath(_) => ErrorCode::InvalidRequest,
        _ => ErrorCode::InternalError,
    };
    FragmentResponse::Error {
        code,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FragmentStatus;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> FragmentService {
        let fragments = Arc::new(FragmentStore::open(dir.path(), 1 << 20).await.unwrap());
        let store = Arc::new(MetadataStore::temporary().unwrap());
        FragmentService::new("s1", fragments, store)
    }

    #[tokio::test]
    async fn test_store_fetch_delete() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let key = FragmentKey::new("feed", 1, 2);

        let path = match service
            .handle(FragmentRequest::Store {
                key,
                data: b"shard".to_vec(),
            })
            .await
        {
            FragmentResponse::Stored { path } => path,
            other => panic!("unexpected {:?}", other),
        };

        match service.handle(FragmentRequest::Fetch { path: path.clone(), range: None }).await {
            FragmentResponse::Data { data } => assert_eq!(data, b"shard"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            service.handle(FragmentRequest::Delete { path: path.clone() }).await,
            FragmentResponse::Deleted { existed: true }
        ));
        assert!(matches!(
            service.handle(FragmentRequest::Fetch { path, range: None }).await,
            FragmentResponse::Error { code: ErrorCode::NotFound, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_and_orphaned_scans() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        // one referenced shard, one unreferenced
        let kept = FragmentKey::new("aa11", 1, 0);
        let kept_path = service.fragments().write(&kept, b"x").await.unwrap();
        let stray_path = service
            .fragments()
            .write(&FragmentKey::new("bb22", 1, 0), b"y")
            .await
            .unwrap();

        let row = |frag_id: u32, path: &str| Fragment {
            data_id: "aa11".into(),
            version_no: 1,
            frag_id,
            server: "s1".into(),
            path: path.into(),
            last_checked: None,
            total_shards: 2,
            status: FragmentStatus::Good,
        };
        let absent = FragmentKey::new("aa11", 1, 1);
        service
            .store
            .transaction(|txn| {
                txn.put(&row(0, &kept_path))?;
                txn.put(&row(1, &absent.relative_path()))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(service.missing_fragments().await.unwrap(), vec![absent]);
        assert_eq!(service.orphaned_paths().await.unwrap(), vec![stray_path]);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let mut signal = service.shutdown_signal();

        assert!(matches!(
            service.handle(FragmentRequest::Shutdown).await,
            FragmentResponse::ShuttingDown
        ));
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }
}
