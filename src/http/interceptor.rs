//! Streaming HTTP/1.x head rewriter.
//!
//! An [`HttpInterceptor`] sits in front of an output. It buffers writes until
//! the end of the head (`\r\n\r\n` or `\n\n`) has been seen, parses the start
//! line and headers, lets the owner rewrite them, emits the head through a
//! [`HeadSink`] and then passes every later byte straight through.

use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::HeaderCollection;
use crate::error::{Result, SubwayError};

/// First line of an HTTP head.
pub trait StartLine: fmt::Display + Sized + Send + Sync {
    fn parse(line: &str) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl StartLine for RequestLine {
    fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(' ').collect();
        match parts.as_slice() {
            [method, target, version] => Ok(Self {
                method: method.to_string(),
                target: target.to_string(),
                version: version.to_string(),
            }),
            _ => Err(SubwayError::MalformedHttp(format!(
                "invalid request line {:?}",
                line
            ))),
        }
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.target, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    /// `0` when the peer sent something that is not a number.
    pub status: u16,
    pub reason: String,
}

impl StartLine for StatusLine {
    fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
            return Err(SubwayError::MalformedHttp(format!(
                "invalid status line {:?}",
                line
            )));
        };
        Ok(Self {
            version: version.to_string(),
            status: status.trim().parse().unwrap_or(0),
            reason: parts.next().unwrap_or_default().to_string(),
        })
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.version, self.status)?;
        if !self.reason.is_empty() {
            write!(f, " {}", self.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead<L> {
    pub start: L,
    pub headers: HeaderCollection,
}

impl<L: StartLine> HttpHead<L> {
    /// Parse the text before the blank line. Lines may end in `\r\n` or `\n`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let first = lines
            .next()
            .ok_or_else(|| SubwayError::MalformedHttp("empty head".to_string()))?;
        let start = L::parse(first)?;

        let mut headers = HeaderCollection::new();
        for line in lines.filter(|l| !l.is_empty()) {
            headers.parse_line(line)?;
        }
        Ok(Self { start, headers })
    }

    /// Serialize with CRLF line endings and the terminating blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.start.to_string();
        out.push_str("\r\n");
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Where an interceptor sends the rewritten head and the body bytes.
#[async_trait]
pub trait HeadSink<L>: Send {
    async fn write_head(&mut self, head: &HttpHead<L>) -> Result<()>;
    async fn write_body(&mut self, data: &[u8]) -> Result<()>;
    async fn close(&mut self);
}

/// Writes the head back out as raw HTTP onto a byte stream.
pub struct StreamSink<W> {
    inner: W,
}

impl<W> StreamSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<L, W> HeadSink<L> for StreamSink<W>
where
    L: StartLine + 'static,
    W: AsyncWrite + Unpin + Send,
{
    async fn write_head(&mut self, head: &HttpHead<L>) -> Result<()> {
        self.inner.write_all(&head.to_bytes()).await?;
        Ok(())
    }

    async fn write_body(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

type Rewrite<L> = Box<dyn FnMut(&mut HttpHead<L>) + Send>;

enum State {
    Buffering { buffer: Vec<u8>, scanned: usize },
    PassThrough,
    Disposed,
}

pub struct HttpInterceptor<L, S> {
    sink: S,
    state: State,
    rewrite: Option<Rewrite<L>>,
    forced: Vec<(String, String)>,
}

pub type RequestInterceptor<S> = HttpInterceptor<RequestLine, S>;
pub type ResponseInterceptor<S> = HttpInterceptor<StatusLine, S>;

impl<L: StartLine, S: HeadSink<L>> HttpInterceptor<L, S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: State::Buffering {
                buffer: Vec::new(),
                scanned: 0,
            },
            rewrite: None,
            forced: Vec::new(),
        }
    }

    /// Upsert `name: value` into the head before it is emitted.
    pub fn force_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.forced.push((name.into(), value.into()));
        self
    }

    /// Hook run on the parsed head before forced headers are applied.
    pub fn with_rewrite(mut self, rewrite: impl FnMut(&mut HttpHead<L>) + Send + 'static) -> Self {
        self.rewrite = Some(Box::new(rewrite));
        self
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let (buffer, scanned) = match &mut self.state {
            State::Disposed => return Err(SubwayError::ConnectionClosed),
            State::PassThrough => {
                if data.is_empty() {
                    return Ok(());
                }
                return self.sink.write_body(data).await;
            }
            State::Buffering { buffer, scanned } => (buffer, scanned),
        };

        buffer.extend_from_slice(data);
        let Some((head_end, body_start)) = find_head_end(buffer, *scanned) else {
            *scanned = buffer.len();
            return Ok(());
        };

        let buffered = std::mem::take(buffer);
        self.state = State::PassThrough;

        let text = String::from_utf8_lossy(&buffered[..head_end]);
        let mut head = HttpHead::<L>::parse(&text)?;
        if let Some(rewrite) = self.rewrite.as_mut() {
            rewrite(&mut head);
        }
        for (name, value) in &self.forced {
            head.headers.set(name, value.clone());
        }

        self.sink.write_head(&head).await?;
        if body_start < buffered.len() {
            self.sink.write_body(&buffered[body_start..]).await?;
        }
        Ok(())
    }

    /// Release the output. Safe to call more than once.
    pub async fn dispose(&mut self) {
        if matches!(self.state, State::Disposed) {
            return;
        }
        self.state = State::Disposed;
        self.sink.close().await;
    }
}

/// Locate the blank line ending the head, returning `(head_end, body_start)`.
///
/// Scanning resumes a few bytes before `from` so that a terminator split
/// across two writes is still found.
fn find_head_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let start = from.saturating_sub(3).max(1);
    (start..buf.len()).find_map(|i| {
        if buf[i] != b'\n' {
            return None;
        }
        if buf[i - 1] == b'\n' {
            Some((i - 1, i + 1))
        } else if i >= 3 && &buf[i - 3..i] == b"\r\n\r" {
            Some((i - 3, i + 1))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorded {
        heads: Arc<Mutex<Vec<String>>>,
        body: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl<L: StartLine + 'static> HeadSink<L> for Recorded {
        async fn write_head(&mut self, head: &HttpHead<L>) -> Result<()> {
            let text = String::from_utf8(head.to_bytes()).unwrap();
            self.heads.lock().unwrap().push(text);
            Ok(())
        }

        async fn write_body(&mut self, data: &[u8]) -> Result<()> {
            self.body.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    const REQUEST: &[u8] = b"GET /index.html?q=1 HTTP/1.1\r\nHost: public.example\r\nAccept: */*\r\n\r\nBODY-BYTES";

    async fn feed(chunks: &[&[u8]]) -> Recorded {
        let recorded = Recorded::default();
        let mut interceptor = RequestInterceptor::new(recorded.clone())
            .force_header("Host", "localhost:3000")
            .force_header("Connection", "close");
        for chunk in chunks {
            interceptor.write(chunk).await.unwrap();
        }
        interceptor.dispose().await;
        interceptor.dispose().await;
        recorded
    }

    #[tokio::test]
    async fn test_output_independent_of_chunking() {
        let whole = feed(&[REQUEST]).await;

        for split in 1..REQUEST.len() {
            let (a, b) = REQUEST.split_at(split);
            let parts = feed(&[a, b]).await;
            assert_eq!(*parts.heads.lock().unwrap(), *whole.heads.lock().unwrap(), "split at {}", split);
            assert_eq!(*parts.body.lock().unwrap(), *whole.body.lock().unwrap(), "split at {}", split);
        }

        let bytewise: Vec<&[u8]> = REQUEST.chunks(1).collect();
        let bytewise = feed(&bytewise).await;
        assert_eq!(*bytewise.heads.lock().unwrap(), *whole.heads.lock().unwrap());
        assert_eq!(*bytewise.closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_forced_headers_replace_originals() {
        let recorded = feed(&[REQUEST]).await;
        let heads = recorded.heads.lock().unwrap();
        assert_eq!(
            heads[0],
            "GET /index.html?q=1 HTTP/1.1\r\nHost: localhost:3000\r\nAccept: */*\r\nConnection: close\r\n\r\n"
        );
        assert_eq!(&recorded.body.lock().unwrap()[..], b"BODY-BYTES");
    }

    #[tokio::test]
    async fn test_bare_newline_terminator() {
        let crlf = feed(&[&b"GET / HTTP/1.1\r\nHost: a\r\n\r\nxyz"[..]]).await;
        let lf = feed(&[&b"GET / HTTP/1.1\nHost: a\n\nxyz"[..]]).await;
        assert_eq!(*crlf.heads.lock().unwrap(), *lf.heads.lock().unwrap());
        assert_eq!(&lf.body.lock().unwrap()[..], b"xyz");
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        let mut interceptor = RequestInterceptor::new(Recorded::default());
        let err = interceptor.write(b"GARBAGE\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, SubwayError::MalformedHttp(_)));
    }

    #[tokio::test]
    async fn test_write_after_dispose_fails() {
        let mut interceptor = RequestInterceptor::new(Recorded::default());
        interceptor.dispose().await;
        assert!(interceptor.write(b"GET").await.is_err());
    }

    #[tokio::test]
    async fn test_rewrite_hook_sees_response_head() {
        let recorded = Recorded::default();
        let mut interceptor = ResponseInterceptor::new(recorded.clone()).with_rewrite(|head| {
            head.headers.remove("Server");
        });
        interceptor
            .write(b"HTTP/1.1 abc Weird\r\nServer: x\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        interceptor.write(b"tail").await.unwrap();

        assert_eq!(
            *recorded.heads.lock().unwrap(),
            vec!["HTTP/1.1 0 Weird\r\nContent-Length: 0\r\n\r\n".to_string()]
        );
        assert_eq!(&recorded.body.lock().unwrap()[..], b"tail");
    }

    #[test]
    fn test_status_line_without_reason() {
        let line = StatusLine::parse("HTTP/1.1 204").unwrap();
        assert_eq!(line.status, 204);
        assert_eq!(line.reason, "");
        assert_eq!(line.to_string(), "HTTP/1.1 204");
        assert!(StatusLine::parse("HTTP/1.1").is_err());
    }

    #[tokio::test]
    async fn test_stream_sink_writes_raw_http() {
        let mock = tokio_test::io::Builder::new()
            .write(b"POST /x HTTP/1.1\r\nHost: local\r\n\r\n")
            .write(b"a=1")
            .write(b"&b=2")
            .build();

        let mut interceptor =
            RequestInterceptor::new(StreamSink::new(mock)).force_header("Host", "local");
        interceptor
            .write(b"POST /x HTTP/1.1\r\nHost: remote\r\n\r\na=1")
            .await
            .unwrap();
        interceptor.write(b"&b=2").await.unwrap();
        interceptor.dispose().await;
    }
}
