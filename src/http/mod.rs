//! HTTP/1.x plumbing shared by the web tunnel connections.

mod chunked;
mod headers;
mod interceptor;

pub use chunked::ChunkedDecoder;
pub use headers::{host_without_port, is_hop_by_hop, HeaderCollection};
pub use interceptor::{
    HeadSink, HttpHead, HttpInterceptor, RequestInterceptor, ResponseInterceptor,
    StartLine, StatusLine, StreamSink,
};
