//! Minimal RESP2 codec: enough to send admin commands and read their replies.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::RedisError;

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Value>>),
}

impl Value {
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::Simple(s) if s == "OK")
    }

    /// Textual content of a simple or bulk string.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Simple(s) => Some(s.clone()),
            Value::Bulk(Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(Some(items)) => Some(items),
            _ => None,
        }
    }
}

/// Encode a command as an array of bulk strings.
pub fn encode_command<S: AsRef<[u8]>>(args: &[S]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.len() * 16);
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

async fn read_line<R>(reader: &mut R) -> Result<String, RedisError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| RedisError::Protocol(format!("read failed: {}", e)))?;
    if n == 0 {
        return Err(RedisError::Protocol("connection closed".to_string()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(RedisError::Protocol("line not terminated by CRLF".to_string()));
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).map_err(|_| RedisError::Protocol("non UTF-8 header".to_string()))
}

fn parse_len(s: &str) -> Result<i64, RedisError> {
    s.parse()
        .map_err(|_| RedisError::Protocol(format!("invalid length '{}'", s)))
}

/// Largest bulk string a server may send (`proto-max-bulk-len`).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Array headers are untrusted; larger arrays grow as elements arrive.
const MAX_ARRAY_PREALLOC: i64 = 1024;

/// Read one reply.
pub fn read_value<'a, R>(
    reader: &'a mut R,
) -> Pin<Box<dyn Future<Output = Result<Value, RedisError>> + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        let mut chars = line.chars();
        let tag = chars.next();
        let rest = chars.as_str();
        match tag {
            Some('+') => Ok(Value::Simple(rest.to_string())),
            Some('-') => Ok(Value::Error(rest.to_string())),
            Some(':') => Ok(Value::Integer(parse_len(rest)?)),
            Some('$') => {
                let len = parse_len(rest)?;
                if len < 0 {
                    return Ok(Value::Bulk(None));
                }
                if len > MAX_BULK_LEN {
                    return Err(RedisError::Protocol(format!("bulk string of {} bytes", len)));
                }
                let mut data = vec![0u8; len as usize + 2];
                reader
                    .read_exact(&mut data)
                    .await
                    .map_err(|e| RedisError::Protocol(format!("short bulk string: {}", e)))?;
                if !data.ends_with(b"\r\n") {
                    return Err(RedisError::Protocol("bulk string not terminated".to_string()));
                }
                data.truncate(len as usize);
                Ok(Value::Bulk(Some(data)))
            }
            Some('*') => {
                let len = parse_len(rest)?;
                if len < 0 {
                    return Ok(Value::Array(None));
                }
                let mut items = Vec::with_capacity(len.min(MAX_ARRAY_PREALLOC) as usize);
                for _ in 0..len {
                    items.push(read_value(reader).await?);
                }
                Ok(Value::Array(Some(items)))
            }
            other => Err(RedisError::Protocol(format!("unknown reply type {:?}", other))),
        }
    })
}
