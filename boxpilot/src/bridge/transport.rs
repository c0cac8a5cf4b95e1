//! Local channel transport addressed by name.
//!
//! Platform-specific addressing:
//! - **Abstract**: Linux abstract namespace (no filesystem entry, auto-cleanup)
//! - **Named**: filesystem socket `{temp_dir}/{name}.sock` (macOS, BSD)

use std::io;
use std::path::PathBuf;

use tokio::net::{UnixListener, UnixStream};

/// Where a channel name lives on this platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddr {
    Named(PathBuf),
    #[cfg(target_os = "linux")]
    Abstract(String),
}

impl ChannelAddr {
    /// Platform default: abstract on Linux, named elsewhere.
    pub fn for_name(name: &str) -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Abstract(name.to_string())
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::named(name)
        }
    }

    pub fn named(name: &str) -> Self {
        Self::Named(std::env::temp_dir().join(format!("{name}.sock")))
    }
}

impl std::fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(path) => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

/// Listening end of a channel, owned by the supervisor.
pub struct ChannelListener {
    addr: ChannelAddr,
    listener: UnixListener,
}

impl ChannelListener {
    /// Bind the channel. Fails with `AddrInUse` if another process is already
    /// serving it; a stale socket file left by a dead process is replaced.
    pub fn bind(addr: ChannelAddr) -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let std_listener = match &addr {
            ChannelAddr::Named(path) => {
                if path.exists() {
                    if std::os::unix::net::UnixStream::connect(path).is_ok() {
                        return Err(io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("channel {} is already served", path.display()),
                        ));
                    }
                    tracing::debug!(path = %path.display(), "Removing stale socket file");
                    std::fs::remove_file(path)?;
                }
                StdUnixListener::bind(path)?
            }
            #[cfg(target_os = "linux")]
            ChannelAddr::Abstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                let sock_addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                StdUnixListener::bind_addr(&sock_addr)?
            }
        };
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::debug!(addr = %addr, "Bound channel");
        Ok(Self { addr, listener })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn addr(&self) -> &ChannelAddr {
        &self.addr
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let ChannelAddr::Named(path) = &self.addr
            && path.exists()
            && let Err(e) = std::fs::remove_file(path)
        {
            tracing::warn!(error = %e, path = %path.display(), "Failed to clean up socket file");
        }
    }
}

/// Connect to a channel served by another process.
pub async fn connect(addr: &ChannelAddr) -> io::Result<UnixStream> {
    match addr {
        ChannelAddr::Named(path) => UnixStream::connect(path).await,
        #[cfg(target_os = "linux")]
        ChannelAddr::Abstract(name) => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            let sock_addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&sock_addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}
