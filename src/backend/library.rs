//! Vendor native library backend.
//!
//! Several instruments ship only a vendor DLL/shared object. The crate does not bind any
//! particular vendor ABI; instead a driver injects a [`NativeLibrary`] shim that knows how to
//! load the library at a path and exchange request/reply buffers with it. The backend owns
//! the resulting [`NativeSession`] and releases it on close.

use super::{Backend, BackendKind};
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// An open session with a vendor library.
pub trait NativeSession: Send {
    /// Exchange one request for one reply. Write-only calls return an empty reply.
    fn call(&mut self, request: &[u8]) -> DeviceResult<Vec<u8>>;

    /// Release vendor resources.
    fn close(&mut self) {}
}

/// Loader for one vendor library ABI.
pub trait NativeLibrary: Send + Sync + fmt::Debug {
    /// Load the library at `path` and open a session.
    fn open(&self, path: &Path) -> DeviceResult<Box<dyn NativeSession>>;
}

/// Native library connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryParams {
    /// Path to the vendor library file
    pub library: PathBuf,
    /// ABI shim supplied by the driver; never serialized
    #[serde(skip)]
    pub shim: Option<Arc<dyn NativeLibrary>>,
}

impl LibraryParams {
    /// Parameters for a library path and shim.
    pub fn new(library: impl Into<PathBuf>, shim: Arc<dyn NativeLibrary>) -> Self {
        Self {
            library: library.into(),
            shim: Some(shim),
        }
    }

    /// The library must exist and a shim must be attached.
    pub fn validate(&self) -> DeviceResult<()> {
        let resource = self.library.display().to_string();
        if self.shim.is_none() {
            return Err(DeviceError::connection(
                resource,
                "no native library shim attached",
            ));
        }
        if !self.library.is_file() {
            return Err(DeviceError::connection(resource, "library file not found"));
        }
        Ok(())
    }
}

/// Backend calling into a vendor library.
pub struct LibraryBackend {
    params: LibraryParams,
    resource: String,
    session: Option<Box<dyn NativeSession>>,
    pending: Option<Vec<u8>>,
}

impl LibraryBackend {
    /// Unopened backend.
    pub fn new(params: LibraryParams) -> Self {
        let resource = params.library.display().to_string();
        Self {
            params,
            resource,
            session: None,
            pending: None,
        }
    }

    fn session(&mut self) -> DeviceResult<&mut Box<dyn NativeSession>> {
        self.session
            .as_mut()
            .ok_or_else(|| DeviceError::command("native library session is not open"))
    }
}

#[async_trait]
impl Backend for LibraryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Library
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    async fn open(&mut self) -> DeviceResult<()> {
        if self.session.is_some() {
            return Ok(());
        }
        self.params.validate()?;
        let Some(shim) = self.params.shim.clone() else {
            return Err(DeviceError::connection(&self.resource, "no shim"));
        };
        let session = shim
            .open(&self.params.library)
            .map_err(|e| DeviceError::connection(&self.resource, e.to_string()))?;
        self.session = Some(session);
        info!(library = %self.resource, "native library session opened");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            self.pending = None;
            debug!(library = %self.resource, "native library session closed");
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    async fn write(&mut self, command: &[u8]) -> DeviceResult<()> {
        let reply = self.session()?.call(command)?;
        self.pending = (!reply.is_empty()).then_some(reply);
        Ok(())
    }

    async fn read(&mut self) -> DeviceResult<Vec<u8>> {
        self.session()?;
        self.pending
            .take()
            .ok_or_else(|| DeviceError::command("no reply pending from native library"))
    }

    async fn query(&mut self, command: &[u8]) -> DeviceResult<Vec<u8>> {
        self.pending = None;
        self.session()?.call(command)
    }

    async fn clear(&mut self) -> DeviceResult<()> {
        self.pending = None;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct EchoLibrary {
        opened: Mutex<Vec<PathBuf>>,
    }

    struct EchoSession;

    impl NativeSession for EchoSession {
        fn call(&mut self, request: &[u8]) -> DeviceResult<Vec<u8>> {
            let mut reply = b"ack:".to_vec();
            reply.extend_from_slice(request);
            Ok(reply)
        }
    }

    impl NativeLibrary for EchoLibrary {
        fn open(&self, path: &Path) -> DeviceResult<Box<dyn NativeSession>> {
            self.opened.lock().push(path.to_path_buf());
            Ok(Box::new(EchoSession))
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let shim = Arc::new(EchoLibrary::default());
        let mut backend = LibraryBackend::new(LibraryParams::new(file.path(), shim.clone()));

        backend.open().await.unwrap();
        assert_eq!(shim.opened.lock().len(), 1);
        assert_eq!(backend.query(b"ATT?").await.unwrap(), b"ack:ATT?");

        backend.write(b"SETATT=3").await.unwrap();
        assert_eq!(backend.read().await.unwrap(), b"ack:SETATT=3");
        assert!(backend.read().await.is_err());

        backend.close().await;
        backend.close().await;
        assert!(!backend.is_open());
    }

    #[test]
    fn test_missing_library_or_shim() {
        let shim: Arc<dyn NativeLibrary> = Arc::new(EchoLibrary::default());
        assert!(LibraryParams::new("/no/such/vendor.so", shim).validate().is_err());
        let detached = LibraryParams {
            library: PathBuf::from("vendor.dll"),
            shim: None,
        };
        assert!(matches!(detached.validate(), Err(DeviceError::Connection { .. })));
    }
}
