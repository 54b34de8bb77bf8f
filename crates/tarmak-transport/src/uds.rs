use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Credentials of the process on the other end of an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

/// What to do with a file already present at the bind path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StalePolicy {
    /// Leave it alone; binding fails with `AddrInUse`.
    Keep,
    /// Remove it if it is a socket left behind by a previous run.
    ReplaceSocket,
}

/// Listening Unix domain socket bound to a filesystem path.
///
/// The socket file is chmod'ed on creation and removed again on drop, unless
/// something else has replaced it in the meantime.
pub struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    /// Whether the path should be removed on drop.
    cleanup_on_drop: bool,
}

impl UnixSocketListener {
    /// Permission mode for created socket paths.
    pub const SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(target_os = "macos")]
    const MAX_PATH_LEN: usize = 104;
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen at `path`.
    ///
    /// Fails if anything already exists at `path`, including a socket that
    /// another process may still be serving.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_inner(path.as_ref(), StalePolicy::Keep)
    }

    /// Bind and listen at `path`, removing a stale socket file first.
    ///
    /// A missing file is fine. A file that is not a socket is never removed
    /// and makes the bind fail.
    pub fn bind_replacing_stale(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_inner(path.as_ref(), StalePolicy::ReplaceSocket)
    }

    fn bind_inner(path: &Path, stale: StalePolicy) -> Result<Self> {
        let path = path.to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        if stale == StalePolicy::ReplaceSocket {
            remove_stale_socket(&path)?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;

        let mode = std::fs::Permissions::from_mode(Self::SOCKET_MODE);
        std::fs::set_permissions(&path, mode).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;
        let created_metadata =
            std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
        let created_inode = Some((created_metadata.dev(), created_metadata.ino()));

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode,
            cleanup_on_drop: true,
        })
    }

    /// Accept the next connection.
    ///
    /// Peer credentials are reported where the platform exposes them.
    pub async fn accept(&self) -> Result<(UnixStream, Option<PeerCredentials>)> {
        let (stream, _addr) = self.listener.accept().await.map_err(TransportError::Accept)?;
        let creds = stream.peer_cred().ok().map(|cred| PeerCredentials {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        });
        debug!(path = ?self.path, ?creds, "accepted connection");
        Ok((stream, creds))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the socket file around after this listener is dropped.
    pub fn keep_on_drop(mut self) -> Self {
        self.cleanup_on_drop = false;
        self
    }
}

impl std::fmt::Debug for UnixSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixSocketListener")
            .field("path", &self.path)
            .finish()
    }
}

/// Connect to a listening Unix domain socket (single attempt).
pub async fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
    debug!(?path, "connected to unix domain socket");
    Ok(stream)
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(TransportError::Bind {
                path: path.to_path_buf(),
                source: err,
            })
        }
    };

    if !metadata.file_type().is_socket() {
        return Err(TransportError::Bind {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "existing path is not a unix socket",
            ),
        });
    }

    debug!(?path, "removing stale socket");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TransportError::Bind {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Some((expected_dev, expected_ino)) = self.created_inode {
                if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                    if metadata.file_type().is_socket()
                        && metadata.dev() == expected_dev
                        && metadata.ino() == expected_ino
                    {
                        debug!(path = ?self.path, "cleaning up socket file");
                        let _ = std::fs::remove_file(&self.path);
                    } else {
                        debug!(
                            path = ?self.path,
                            "socket path identity changed; skipping cleanup"
                        );
                    }
                }
            }
        }
    }
}
