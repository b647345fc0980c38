use std::{borrow::Cow, io, time::Duration};

use anyhow::Context;

use crate::tunmux::tunnel::transport::BoxedStream;

/// Normalize a bind/listen address.
///
/// `":PORT"` is accepted as shorthand for every interface and rewritten to
/// `"0.0.0.0:PORT"`, which is what Tokio's bind APIs expect.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Where the server forwards accepted streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp(String),
    Unix(String),
}

impl Target {
    /// `host:port` (numeric port, `[v6]:port` allowed) is TCP; anything else is
    /// taken as a unix socket path. An empty host means loopback.
    pub fn parse(addr: &str) -> Self {
        let addr = addr.trim();
        match split_host_port(addr) {
            Some((host, port)) if host.is_empty() => Target::Tcp(format!("127.0.0.1:{port}")),
            Some(_) => Target::Tcp(addr.to_string()),
            None => Target::Unix(addr.to_string()),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Tcp(a) => write!(f, "tcp://{a}"),
            Target::Unix(p) => write!(f, "unix://{p}"),
        }
    }
}

/// Splits `host:port`, requiring a numeric port. Bracketed IPv6 hosts lose
/// their brackets.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if let Some(inner) = host.strip_prefix('[') {
        return inner.strip_suffix(']').map(|h| (h, port));
    }
    if host.contains(':') || host.contains('/') {
        return None;
    }
    Some((host, port))
}

async fn connect(target: &Target) -> io::Result<BoxedStream> {
    match target {
        Target::Tcp(addr) => {
            let c = tokio::net::TcpStream::connect(addr.as_str()).await?;
            let _ = c.set_nodelay(true);
            Ok(Box::new(c))
        }
        #[cfg(unix)]
        Target::Unix(path) => {
            let c = tokio::net::UnixStream::connect(path.as_str()).await?;
            Ok(Box::new(c))
        }
        #[cfg(not(unix))]
        Target::Unix(path) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unix socket targets are not supported on this platform: {path}"),
        )),
    }
}

/// Connects to `target`, giving up after `timeout`.
pub async fn dial_target(target: &Target, timeout: Duration) -> anyhow::Result<BoxedStream> {
    tokio::time::timeout(timeout, connect(target))
        .await
        .map_err(|_| anyhow::anyhow!("dial {target}: timed out after {timeout:?}"))?
        .with_context(|| format!("dial {target}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn host_port_targets_are_tcp() {
        assert_eq!(
            Target::parse("example.com:443"),
            Target::Tcp("example.com:443".into())
        );
        assert_eq!(Target::parse("[::1]:22"), Target::Tcp("[::1]:22".into()));
        assert_eq!(Target::parse(":8080"), Target::Tcp("127.0.0.1:8080".into()));
    }

    #[test]
    fn everything_else_is_a_unix_path() {
        assert_eq!(
            Target::parse("/run/app.sock"),
            Target::Unix("/run/app.sock".into())
        );
        assert_eq!(Target::parse("app:http"), Target::Unix("app:http".into()));
        assert_eq!(Target::parse("host:70000"), Target::Unix("host:70000".into()));
        assert_eq!(Target::parse("::1"), Target::Unix("::1".into()));
    }

    #[tokio::test]
    async fn dial_tcp_target_connects() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        let target = Target::parse(&format!(":{port}"));
        let accepted = tokio::spawn(async move { ln.accept().await.map(|_| ()) });
        dial_target(&target, Duration::from_secs(2)).await.unwrap();
        accepted.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dial_unix_target_connects() {
        let dir = std::env::temp_dir().join(format!("tunmux-net-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("target.sock");
        let _ = std::fs::remove_file(&path);
        let ln = tokio::net::UnixListener::bind(&path).unwrap();

        let target = Target::parse(path.to_str().unwrap());
        assert!(matches!(target, Target::Unix(_)));
        let accepted = tokio::spawn(async move { ln.accept().await.map(|_| ()) });
        dial_target(&target, Duration::from_secs(2)).await.unwrap();
        accepted.await.unwrap().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn dial_failure_carries_target() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);
        let err = match dial_target(&Target::Tcp(addr.to_string()), Duration::from_secs(2)).await {
            Ok(_) => panic!("dial to a closed port succeeded"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("dial tcp://"));
    }
}
