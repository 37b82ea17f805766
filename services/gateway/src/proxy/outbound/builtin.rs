//! Terminal outbounds `REJECT` and `RESET`.

use std::io;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::TcpStream;

use craftgate_networking::CachedStream;

pub const REJECT: &str = "REJECT";
pub const RESET: &str = "RESET";

/// Whether `name` belongs to a built-in outbound.
pub fn is_reserved(name: &str) -> bool {
    name == REJECT || name == RESET
}

/// Close the write side gracefully.
pub async fn reject(conn: &mut CachedStream<TcpStream>) -> io::Result<()> {
    conn.shutdown_inner().await
}

/// Arrange for the connection to be closed with RST when dropped.
pub fn reset(conn: &CachedStream<TcpStream>) -> io::Result<()> {
    SockRef::from(conn.get_ref()).set_linger(Some(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("REJECT"));
        assert!(is_reserved("RESET"));
        assert!(!is_reserved("reject"));
    }

    #[tokio::test]
    async fn test_reset_closes_with_rst() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let conn = CachedStream::new(accepted.unwrap().0);

        reset(&conn).unwrap();
        drop(conn);

        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_reject_closes_gracefully() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let mut conn = CachedStream::new(accepted.unwrap().0);

        reject(&mut conn).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
