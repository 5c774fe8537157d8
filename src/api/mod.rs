use std::net::SocketAddr;
use tokio::net::TcpListener;

mod conn;
pub mod envelope;

pub use conn::{API_IDLE_TIMEOUT, ApiContext};
pub use envelope::{DownloadRequest, Envelope, MAX_REQUEST_BYTES};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Bind(std::io::Error),
    Accept(std::io::Error),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(source) => write!(f, "failed to bind API listener: {source}"),
            Self::Accept(source) => write!(f, "failed to accept API connection: {source}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(source) | Self::Accept(source) => Some(source),
        }
    }
}

pub async fn serve(addr: SocketAddr, ctx: ApiContext) -> ApiResult<()> {
    let listener = TcpListener::bind(addr).await.map_err(ApiError::Bind)?;
    tracing::info!(addr = %addr, "api listening");
    serve_with_listener(listener, ctx).await
}

/// Accept loop over an already-bound listener; one task per connection.
pub async fn serve_with_listener(listener: TcpListener, ctx: ApiContext) -> ApiResult<()> {
    let mut next_conn_id: u64 = 0;
    loop {
        let (socket, peer) = listener.accept().await.map_err(ApiError::Accept)?;
        next_conn_id += 1;
        tracing::debug!(peer = %peer, conn = next_conn_id, "api connection accepted");
        tokio::spawn(conn::handle_connection(socket, peer, next_conn_id, ctx.clone()));
    }
}
