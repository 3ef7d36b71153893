//! Control channel transport
//!
//! The control channel is a Unix Domain Socket whose path is derived from the
//! interface name. Messages are `key=value` lines terminated by a blank line.
//! The listener checks peer credentials on every accepted connection.

use crate::error::ProtocolError;
use crate::messages::{ControlRequest, ControlResponse};
use std::collections::HashSet;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{timeout, Duration};

/// Longest accepted line, in bytes, including the newline.
pub const MAX_LINE_LEN: u64 = 4096;

/// Most lines accepted in a single message.
pub const MAX_MESSAGE_LINES: usize = 8192;

/// Timeout applied to every line read and every write.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for control channel transport operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Error type for control channel transport operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer is not allowed to use the control channel
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Binding or connecting failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Message text violates the line grammar
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Message exceeds transport limits or is not UTF-8
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Peer closed the connection in the middle of a message
    #[error("Connection closed by peer")]
    Closed,
}

/// Control socket path for `interface_name` under `runtime_dir`.
pub fn socket_path(runtime_dir: &Path, interface_name: &str) -> PathBuf {
    runtime_dir.join(format!("{interface_name}.sock"))
}

/// UID and GID of the process on the other end of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
}

/// Authentication configuration for the control socket listener
#[derive(Debug, Clone)]
pub struct AuthConfig {
    allowed_uids: HashSet<u32>,
    allowed_gids: HashSet<u32>,
    allow_root: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut allowed_uids = HashSet::new();
        let mut allowed_gids = HashSet::new();

        // The user who started the service through sudo
        if let Some(uid) = env_id("SUDO_UID") {
            allowed_uids.insert(uid);
        }
        if let Some(gid) = env_id("SUDO_GID") {
            allowed_gids.insert(gid);
        }

        Self {
            allowed_uids,
            allowed_gids,
            allow_root: true,
        }
    }
}

fn env_id(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

impl AuthConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a specific UID
    pub fn allow_uid(mut self, uid: u32) -> Self {
        self.allowed_uids.insert(uid);
        self
    }

    /// Allow a specific GID
    pub fn allow_gid(mut self, gid: u32) -> Self {
        self.allowed_gids.insert(gid);
        self
    }

    /// Set whether root (UID 0) is always allowed
    pub fn allow_root(mut self, allow: bool) -> Self {
        self.allow_root = allow;
        self
    }

    pub fn is_allowed(&self, creds: &PeerCredentials) -> bool {
        (self.allow_root && creds.uid == 0)
            || self.allowed_uids.contains(&creds.uid)
            || self.allowed_gids.contains(&creds.gid)
    }
}

/// Listener for the per-interface control socket
pub struct UapiListener {
    listener: UnixListener,
    socket_path: PathBuf,
    auth_config: AuthConfig,
}

impl UapiListener {
    /// Bind the control socket, replacing a stale socket file left behind by
    /// an earlier run.
    pub async fn bind_with_auth<P: AsRef<Path>>(
        path: P,
        auth_config: AuthConfig,
    ) -> IpcResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IpcError::Connection(format!(
                    "Failed to create socket directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                IpcError::Connection(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| IpcError::Connection(format!("Failed to bind to socket: {}", e)))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(path)
                .map_err(|e| IpcError::Connection(format!("Failed to get socket metadata: {}", e)))?
                .permissions();
            permissions.set_mode(0o660);
            std::fs::set_permissions(path, permissions).map_err(|e| {
                IpcError::Connection(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
            auth_config,
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept a connection. An unauthorized peer yields
    /// [`IpcError::Authentication`]; the listener stays usable.
    pub async fn accept(&self) -> IpcResult<UapiConnection> {
        let (stream, _) = self.listener.accept().await?;

        let peer_cred = peer_credentials(&stream).map_err(|e| {
            IpcError::Authentication(format!("Failed to get peer credentials: {}", e))
        })?;

        if !self.auth_config.is_allowed(&peer_cred) {
            return Err(IpcError::Authentication(format!(
                "Connection from unauthorized user: UID={}, GID={}",
                peer_cred.uid, peer_cred.gid
            )));
        }

        Ok(UapiConnection {
            stream: BufReader::new(stream),
            peer_cred,
        })
    }
}

impl Drop for UapiListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            log::debug!(
                "Failed to remove control socket {}: {}",
                self.socket_path.display(),
                e
            );
        }
    }
}

#[cfg(target_os = "linux")]
fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    let creds = nix::sys::socket::getsockopt(
        stream.as_raw_fd(),
        nix::sys::socket::sockopt::PeerCredentials,
    )
    .map_err(io::Error::other)?;

    Ok(PeerCredentials {
        uid: creds.uid(),
        gid: creds.gid(),
    })
}

#[cfg(target_os = "macos")]
fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    let raw_fd = stream.as_raw_fd();

    let xucred = unsafe {
        let mut xucred = std::mem::MaybeUninit::<libc::xucred>::uninit();
        let mut xucred_size = std::mem::size_of::<libc::xucred>() as libc::socklen_t;

        let ret = libc::getsockopt(
            raw_fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERCRED,
            xucred.as_mut_ptr() as *mut libc::c_void,
            &mut xucred_size,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        xucred.assume_init()
    };

    Ok(PeerCredentials {
        uid: xucred.cr_uid,
        gid: if xucred.cr_ngroups > 0 {
            xucred.cr_groups[0]
        } else {
            0
        },
    })
}

/// Server side of one accepted control connection
pub struct UapiConnection {
    stream: BufReader<UnixStream>,
    peer_cred: PeerCredentials,
}

impl UapiConnection {
    pub fn peer_credentials(&self) -> PeerCredentials {
        self.peer_cred
    }

    pub fn peer_uid(&self) -> u32 {
        self.peer_cred.uid
    }

    pub fn peer_gid(&self) -> u32 {
        self.peer_cred.gid
    }

    /// Read the lines of the next request. `None` means the peer closed the
    /// connection between requests.
    pub async fn read_request(&mut self) -> IpcResult<Option<Vec<String>>> {
        read_message(&mut self.stream).await
    }

    pub async fn send_response(&mut self, response: &ControlResponse) -> IpcResult<()> {
        write_all(self.stream.get_mut(), response.encode().as_bytes()).await
    }

    pub async fn close(&mut self) -> IpcResult<()> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

/// Client side of the control channel
pub struct UapiClient {
    stream: BufReader<UnixStream>,
}

impl UapiClient {
    pub async fn connect<P: AsRef<Path>>(path: P) -> IpcResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await.map_err(|e| {
            IpcError::Connection(format!(
                "Failed to connect to {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and wait for its response.
    pub async fn request(&mut self, request: &ControlRequest) -> IpcResult<ControlResponse> {
        self.request_raw(&request.encode()).await
    }

    /// Send already encoded request text and wait for the response.
    pub async fn request_raw(&mut self, text: &str) -> IpcResult<ControlResponse> {
        write_all(self.stream.get_mut(), text.as_bytes()).await?;
        let lines = read_message(&mut self.stream)
            .await?
            .ok_or(IpcError::Closed)?;
        Ok(ControlResponse::parse(&lines)?)
    }

    pub async fn close(&mut self) -> IpcResult<()> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

async fn write_all(stream: &mut UnixStream, data: &[u8]) -> IpcResult<()> {
    match timeout(IO_TIMEOUT, stream.write_all(data)).await {
        Ok(result) => result.map_err(IpcError::Io),
        Err(_) => Err(IpcError::Timeout("Write operation timed out".to_string())),
    }
}

async fn read_message<R>(reader: &mut R) -> IpcResult<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut buf = String::new();

    loop {
        buf.clear();
        let mut limited = (&mut *reader).take(MAX_LINE_LEN);
        let read = match timeout(IO_TIMEOUT, limited.read_line(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(IpcError::Malformed("line is not valid UTF-8".to_string()))
            }
            Ok(Err(e)) => return Err(IpcError::Io(e)),
            Err(_) => return Err(IpcError::Timeout("Read operation timed out".to_string())),
        };

        if read == 0 {
            return if lines.is_empty() {
                Ok(None)
            } else {
                Err(IpcError::Closed)
            };
        }

        let Some(line) = buf.strip_suffix('\n') else {
            if read as u64 >= MAX_LINE_LEN {
                return Err(IpcError::Malformed(format!(
                    "line longer than {} bytes",
                    MAX_LINE_LEN
                )));
            }
            return Err(IpcError::Closed);
        };
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return Ok(Some(lines));
        }
        if lines.len() == MAX_MESSAGE_LINES {
            return Err(IpcError::Malformed(format!(
                "more than {} lines",
                MAX_MESSAGE_LINES
            )));
        }
        lines.push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ErrorCode, GetScope};
    use tokio::io::AsyncWriteExt;

    fn current_user() -> AuthConfig {
        AuthConfig::new()
            .allow_uid(unsafe { libc::getuid() })
            .allow_gid(unsafe { libc::getgid() })
    }

    #[test]
    fn socket_path_is_derived_from_interface_name() {
        assert_eq!(
            socket_path(Path::new("/var/run/edgetun"), "ZitiTUN"),
            PathBuf::from("/var/run/edgetun/ZitiTUN.sock")
        );
    }

    #[test]
    fn auth_config_rules() {
        let auth = AuthConfig::new().allow_uid(1000).allow_gid(50).allow_root(false);
        assert!(auth.is_allowed(&PeerCredentials { uid: 1000, gid: 1 }));
        assert!(auth.is_allowed(&PeerCredentials { uid: 7, gid: 50 }));
        assert!(!auth.is_allowed(&PeerCredentials { uid: 0, gid: 0 }));
        assert!(AuthConfig::new().is_allowed(&PeerCredentials { uid: 0, gid: 0 }));
    }

    #[tokio::test]
    async fn request_response_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "tun0");
        let listener = UapiListener::bind_with_auth(&path, current_user())
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            let mut connection = listener.accept().await.unwrap();
            assert_eq!(connection.peer_uid(), unsafe { libc::getuid() });

            let lines = connection.read_request().await.unwrap().unwrap();
            assert_eq!(lines, vec!["get=peers".to_string()]);
            connection
                .send_response(&ControlResponse::with_entries(vec![(
                    "public_key".to_string(),
                    "00".to_string(),
                )]))
                .await
                .unwrap();

            // client hangs up between requests
            assert!(connection.read_request().await.unwrap().is_none());
        });

        let mut client = UapiClient::connect(&path).await.unwrap();
        let response = client
            .request(&ControlRequest::Get(GetScope::Peers))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.get("public_key"), Some("00"));
        client.close().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn listener_removes_socket_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir.path().join("nested"), "tun0");

        // stale file from an earlier run
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let listener = UapiListener::bind_with_auth(&path, current_user())
            .await
            .unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn oversized_line_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "tun0");
        let listener = UapiListener::bind_with_auth(&path, current_user())
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            let mut connection = listener.accept().await.unwrap();
            let result = connection.read_request().await;
            assert!(matches!(result, Err(IpcError::Malformed(_))));
            connection
                .send_response(&ControlResponse::error(ErrorCode::Protocol))
                .await
                .unwrap();
        });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let long_line = "a".repeat(MAX_LINE_LEN as usize * 2);
        stream.write_all(long_line.as_bytes()).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_peer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "tun0");
        let auth = AuthConfig::new().allow_uid(12345).allow_root(false);
        let listener = UapiListener::bind_with_auth(&path, auth).await.unwrap();

        let server = tokio::spawn(async move {
            match listener.accept().await {
                Err(IpcError::Authentication(_)) => {}
                Ok(_) => panic!("Authentication should have failed"),
                Err(e) => panic!("Unexpected error: {:?}", e),
            }
        });

        let mut client = UapiClient::connect(&path).await.unwrap();
        server.await.unwrap();

        // the rejected stream is dropped, so no response ever arrives
        assert!(client
            .request(&ControlRequest::Get(GetScope::All))
            .await
            .is_err());
    }
}
