//! Minimal client-side codec for the managed service's wire protocol
//! (RESP: `*N\r\n$len\r\narg\r\n...` commands, typed one-line replies).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("malformed reply: {0}")]
    Malformed(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected reply: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
}

pub async fn write_command<W>(w: &mut W, args: &[&[u8]]) -> Result<(), RespError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

async fn read_protocol_line<R>(r: &mut R) -> Result<String, RespError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Err(RespError::Closed);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

pub async fn read_reply<R>(r: &mut R) -> Result<Reply, RespError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_protocol_line(r).await?;
    let Some(kind) = line.chars().next() else {
        return Err(RespError::Malformed("empty reply line".to_string()));
    };
    let rest = &line[1..];

    match kind {
        '+' => Ok(Reply::Simple(rest.to_string())),
        '-' => Err(RespError::Server(rest.to_string())),
        ':' => rest
            .parse::<i64>()
            .map(Reply::Integer)
            .map_err(|_| RespError::Malformed(format!("bad integer: {rest}"))),
        '$' => {
            let len: i64 = rest
                .parse()
                .map_err(|_| RespError::Malformed(format!("bad bulk length: {rest}")))?;
            if len < 0 {
                return Ok(Reply::Nil);
            }
            let mut data = vec![0u8; len as usize + 2];
            r.read_exact(&mut data).await?;
            if &data[len as usize..] != b"\r\n" {
                return Err(RespError::Malformed("bulk missing terminator".to_string()));
            }
            data.truncate(len as usize);
            Ok(Reply::Bulk(data))
        }
        '*' => {
            let len: i64 = rest
                .parse()
                .map_err(|_| RespError::Malformed(format!("bad array length: {rest}")))?;
            if len < 0 {
                return Ok(Reply::Nil);
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(Box::pin(read_reply(r)).await?);
            }
            Ok(Reply::Array(items))
        }
        other => Err(RespError::Malformed(format!("unknown reply type: {other}"))),
    }
}

/// One pooled protocol connection to the managed service.
#[derive(Debug)]
pub struct RespConnection {
    stream: BufReader<TcpStream>,
}

impl RespConnection {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, RespError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RespError::ConnectTimeout)??;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply, RespError> {
        write_command(self.stream.get_mut(), args).await?;
        read_reply(&mut self.stream).await
    }

    pub async fn ping(&mut self) -> Result<(), RespError> {
        match self.command(&[b"PING"]).await? {
            Reply::Simple(s) if s == "PONG" => Ok(()),
            other => Err(RespError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, RespError> {
        match self.command(&[b"GET", key.as_bytes()]).await? {
            Reply::Bulk(data) => Ok(Some(data)),
            Reply::Nil => Ok(None),
            other => Err(RespError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn set(
        &mut self,
        key: &str,
        value: &[u8],
        ttl_seconds: Option<u64>,
    ) -> Result<(), RespError> {
        let ttl;
        let mut args: Vec<&[u8]> = vec![b"SET", key.as_bytes(), value];
        if let Some(secs) = ttl_seconds {
            ttl = secs.to_string();
            args.push(b"EX");
            args.push(ttl.as_bytes());
        }
        match self.command(&args).await? {
            Reply::Simple(s) if s == "OK" => Ok(()),
            other => Err(RespError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn del(&mut self, key: &str) -> Result<bool, RespError> {
        match self.command(&[b"DEL", key.as_bytes()]).await? {
            Reply::Integer(n) => Ok(n > 0),
            other => Err(RespError::Unexpected(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn encodes_command_arrays() {
        let (mut client, mut server) = duplex(256);
        write_command(&mut client, &[b"SET", b"k", b"v1"]).await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nv1\r\n");
    }

    #[tokio::test]
    async fn parses_simple_integer_and_bulk() {
        let (mut server, client) = duplex(256);
        server
            .write_all(b"+OK\r\n:3\r\n$5\r\nhello\r\n$-1\r\n")
            .await
            .unwrap();
        drop(server);

        let mut r = BufReader::new(client);
        assert_eq!(read_reply(&mut r).await.unwrap(), Reply::Simple("OK".to_string()));
        assert_eq!(read_reply(&mut r).await.unwrap(), Reply::Integer(3));
        assert_eq!(read_reply(&mut r).await.unwrap(), Reply::Bulk(b"hello".to_vec()));
        assert_eq!(read_reply(&mut r).await.unwrap(), Reply::Nil);
    }

    #[tokio::test]
    async fn parses_arrays() {
        let (mut server, client) = duplex(256);
        server
            .write_all(b"*2\r\n$1\r\na\r\n:42\r\n")
            .await
            .unwrap();
        drop(server);

        let mut r = BufReader::new(client);
        let reply = read_reply(&mut r).await.unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::Bulk(b"a".to_vec()), Reply::Integer(42)])
        );
    }

    #[tokio::test]
    async fn server_errors_become_typed_errors() {
        let (mut server, client) = duplex(256);
        server
            .write_all(b"-ERR wrong number of arguments for 'get' command\r\n")
            .await
            .unwrap();
        drop(server);

        let mut r = BufReader::new(client);
        let err = read_reply(&mut r).await.unwrap_err();
        assert!(matches!(err, RespError::Server(msg) if msg.contains("wrong number")));
    }

    #[tokio::test]
    async fn eof_is_reported_as_closed() {
        let (server, client) = duplex(256);
        drop(server);
        let mut r = BufReader::new(client);
        assert!(matches!(read_reply(&mut r).await.unwrap_err(), RespError::Closed));
    }

    #[tokio::test]
    async fn rejects_garbage_reply_type() {
        let (mut server, client) = duplex(256);
        server.write_all(b"?what\r\n").await.unwrap();
        drop(server);
        let mut r = BufReader::new(client);
        assert!(matches!(
            read_reply(&mut r).await.unwrap_err(),
            RespError::Malformed(_)
        ));
    }
}
