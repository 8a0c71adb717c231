use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Listening socket at a well-known path; the path is removed on drop
#[derive(Debug)]
pub struct ClientListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ClientListener {
    /// Bind `path`, replacing a stale socket file from an earlier run
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)?;
        log::info!("listening on {}", path.display());

        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the single consumer connects
    pub fn accept_one(&self) -> Result<UnixStream> {
        let (stream, _) = self.listener.accept()?;
        log::info!("consumer connected on {}", self.path.display());
        Ok(stream)
    }
}

impl Drop for ClientListener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("removing {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_client_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("producer.sock");

        let listener = ClientListener::bind(&path).unwrap();
        assert!(path.exists());

        let client = UnixStream::connect(&path).unwrap();
        let server = listener.accept_one().unwrap();
        assert_eq!(
            server.peer_addr().unwrap().as_pathname(),
            client.local_addr().unwrap().as_pathname()
        );

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("producer.sock");
        fs::write(&path, b"stale").unwrap();

        let listener = ClientListener::bind(&path).unwrap();
        assert!(UnixStream::connect(listener.path()).is_ok());
    }
}
