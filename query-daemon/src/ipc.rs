//! Platform byte-stream endpoint: unix domain socket or windows named pipe
//! behind one listener/stream API.

use anyhow::Result;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[cfg(unix)]
pub use unix_impl::{IpcListener, IpcStream};

#[cfg(windows)]
pub use windows_impl::{IpcListener, IpcStream};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    pub struct IpcListener {
        listener: UnixListener,
        path: String,
    }

    impl IpcListener {
        /// Bind the socket, replacing any stale file at the same path.
        ///
        /// The socket file is restricted to the owning user immediately
        /// after binding; the daemon is implicitly single-user.
        pub fn bind(path: &str) -> Result<Self> {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        pub async fn accept(&self) -> Result<IpcStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(IpcStream { stream })
        }

        pub fn local_addr(&self) -> &str {
            &self.path
        }
    }

    impl Drop for IpcListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub struct IpcStream {
        stream: UnixStream,
    }

    impl IpcStream {
        pub async fn connect(path: &str) -> Result<Self> {
            let stream = UnixStream::connect(path).await?;
            Ok(Self { stream })
        }
    }

    impl AsyncRead for IpcStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for IpcStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.stream).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };
    use tokio::sync::Mutex;

    pub struct IpcListener {
        path: String,
        // The pipe instance waiting for the next client; replaced on accept.
        pending: Mutex<Option<NamedPipeServer>>,
    }

    impl IpcListener {
        pub fn bind(path: &str) -> Result<Self> {
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .in_buffer_size(65536)
                .out_buffer_size(65536)
                .create(path)?;

            Ok(Self {
                path: path.to_string(),
                pending: Mutex::new(Some(server)),
            })
        }

        pub async fn accept(&self) -> Result<IpcStream> {
            let mut pending = self.pending.lock().await;
            let server = pending
                .take()
                .ok_or_else(|| anyhow::anyhow!("pipe listener exhausted"))?;

            server.connect().await?;

            *pending = Some(
                ServerOptions::new()
                    .first_pipe_instance(false)
                    .in_buffer_size(65536)
                    .out_buffer_size(65536)
                    .create(&self.path)?,
            );

            Ok(IpcStream {
                inner: StreamInner::Server(server),
            })
        }

        pub fn local_addr(&self) -> &str {
            &self.path
        }
    }

    enum StreamInner {
        Client(NamedPipeClient),
        Server(NamedPipeServer),
    }

    pub struct IpcStream {
        inner: StreamInner,
    }

    impl IpcStream {
        pub async fn connect(path: &str) -> Result<Self> {
            let client = ClientOptions::new().open(path)?;
            Ok(Self {
                inner: StreamInner::Client(client),
            })
        }
    }

    impl AsyncRead for IpcStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match &mut self.inner {
                StreamInner::Client(c) => Pin::new(c).poll_read(cx, buf),
                StreamInner::Server(s) => Pin::new(s).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for IpcStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            match &mut self.inner {
                StreamInner::Client(c) => Pin::new(c).poll_write(cx, buf),
                StreamInner::Server(s) => Pin::new(s).poll_write(cx, buf),
            }
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match &mut self.inner {
                StreamInner::Client(c) => Pin::new(c).poll_flush(cx),
                StreamInner::Server(s) => Pin::new(s).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            // Named pipes have no half-close; flushing is the best we can do.
            self.poll_flush(cx)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock").to_string_lossy().to_string();
        std::fs::write(&path, b"stale").unwrap();

        let listener = IpcListener::bind(&path).unwrap();
        assert_eq!(listener.local_addr(), path);
    }

    #[tokio::test]
    async fn socket_file_is_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock").to_string_lossy().to_string();
        let _listener = IpcListener::bind(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock").to_string_lossy().to_string();
        let listener = IpcListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = IpcStream::connect(&path).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");

        server.await.unwrap();
    }
}
