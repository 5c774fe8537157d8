use crate::api::envelope::{DownloadRequest, Envelope, MAX_REQUEST_BYTES};
use crate::dcc::registry::{REMOVE_GRACE, RegistryEntry, SharedRegistry};
use crate::dcc::store::DownloadStore;
use crate::dcc::transfer::{self, ProgressSettings, TransferArgs, TransferEvent, TransferHandle};
use crate::irc::IrcHandle;
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{Duration, Instant, timeout},
};

/// An API connection with no traffic in either direction for this long is
/// detached; its transfer keeps running.
pub const API_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const READ_CHUNK: usize = 2048;

/// Everything a connection task needs, cheap to clone per accept.
#[derive(Clone)]
pub struct ApiContext {
    pub irc: IrcHandle,
    pub store: DownloadStore,
    pub registry: SharedRegistry,
    pub progress: ProgressSettings,
}

pub(crate) async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    ctx: ApiContext,
) {
    let (mut rd, mut wr) = socket.into_split();

    let request = match read_request(&mut rd).await {
        RequestOutcome::Parsed(request) => request,
        RequestOutcome::Gone => return,
        RequestOutcome::Rejected(message) => {
            reject(&mut rd, &mut wr, message).await;
            return;
        }
    };
    if let Err(message) = request.validate() {
        reject(&mut rd, &mut wr, message).await;
        return;
    }

    let pack_number = request.pack_digits();
    tracing::info!(
        peer = %peer,
        bot = %request.bot_name,
        pack = %pack_number,
        progress = request.send_progress,
        "download requested"
    );

    let mut handle = transfer::spawn(
        ctx.irc.clone(),
        ctx.store.clone(),
        TransferArgs {
            bot_nick: request.bot_name.clone(),
            pack_number: pack_number.clone(),
            resume: true,
            progress: ctx.progress.clone(),
        },
    );
    ctx.registry.lock().await.insert_pending(
        &request.bot_name,
        RegistryEntry {
            pack_number: pack_number.clone(),
            send_progress: request.send_progress,
            started_at: Instant::now(),
            client: Some(conn_id),
            cancel: handle.cancel_handle(),
        },
    );

    let ack = Envelope::Downloading {
        message: format!("requesting pack #{pack_number} from {}", request.bot_name),
        pack_number: pack_number.clone(),
    };
    let mut client_open = write_envelope(&mut wr, &ack).await.is_ok();
    if !client_open {
        ctx.registry.lock().await.detach_client(conn_id);
    }

    let promoted_key = forward_events(
        &mut handle,
        &mut rd,
        &mut wr,
        &mut client_open,
        conn_id,
        &request,
        &pack_number,
        &ctx,
    )
    .await;

    // Let the terminal envelope flush before the entry disappears and the
    // socket half-closes.
    tokio::time::sleep(REMOVE_GRACE).await;
    {
        let mut registry = ctx.registry.lock().await;
        match &promoted_key {
            Some(key) => {
                registry.remove(key);
            }
            None => {
                registry.remove_pending_for_client(conn_id);
            }
        }
    }
    if client_open {
        let _ = wr.shutdown().await;
    }
}

/// Pump transfer events to the client until the terminal one; returns the
/// registry key if the transfer got promoted.
#[allow(clippy::too_many_arguments)]
async fn forward_events(
    handle: &mut TransferHandle,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
    client_open: &mut bool,
    conn_id: u64,
    request: &DownloadRequest,
    pack_number: &str,
    ctx: &ApiContext,
) -> Option<String> {
    let mut promoted_key: Option<String> = None;
    let mut idle_deadline = Instant::now() + API_IDLE_TIMEOUT;
    let mut junk = [0u8; 64];

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(TransferEvent::Connected { pack }) => {
                    promoted_key = ctx
                        .registry
                        .lock()
                        .await
                        .promote(&request.bot_name, &pack.filename, pack.peer_port);
                }
                Some(TransferEvent::Progress { pack, received }) => {
                    if *client_open && request.send_progress {
                        let progress = if pack.file_size > 0 {
                            (received.saturating_mul(100) / pack.file_size).min(100)
                        } else {
                            0
                        };
                        let envelope = Envelope::Progress {
                            filename: pack.filename,
                            progress,
                            received,
                            total: pack.file_size,
                        };
                        if write_envelope(wr, &envelope).await.is_ok() {
                            idle_deadline = Instant::now() + API_IDLE_TIMEOUT;
                        } else {
                            detach(client_open, conn_id, ctx, "client write failed").await;
                        }
                    }
                }
                Some(TransferEvent::Complete { pack, path, size }) => {
                    if *client_open {
                        let envelope = Envelope::Success {
                            filename: pack.filename,
                            path: path.display().to_string(),
                            size,
                            pack_number: pack_number.to_string(),
                        };
                        let _ = write_envelope(wr, &envelope).await;
                    }
                    return promoted_key;
                }
                Some(TransferEvent::Failed { error, .. }) => {
                    if *client_open {
                        let envelope = Envelope::Error {
                            message: error.to_string(),
                            pack_number: Some(pack_number.to_string()),
                        };
                        let _ = write_envelope(wr, &envelope).await;
                    }
                    return promoted_key;
                }
                // The event channel never closes before the terminal event;
                // if it somehow does there is nothing left to report.
                None => return promoted_key,
            },
            read = rd.read(&mut junk), if *client_open => match read {
                Ok(0) | Err(_) => {
                    detach(client_open, conn_id, ctx, "client disconnected").await;
                }
                Ok(_) => {
                    // Requests are one object per connection; later bytes
                    // only count as liveness.
                    idle_deadline = Instant::now() + API_IDLE_TIMEOUT;
                }
            },
            _ = tokio::time::sleep_until(idle_deadline), if *client_open => {
                detach(client_open, conn_id, ctx, "client idle").await;
            }
        }
    }
}

async fn detach(client_open: &mut bool, conn_id: u64, ctx: &ApiContext, reason: &str) {
    *client_open = false;
    let detached = ctx.registry.lock().await.detach_client(conn_id);
    tracing::debug!(conn = conn_id, detached, reason, "api socket detached; transfer continues");
}

enum RequestOutcome {
    Parsed(DownloadRequest),
    /// Client vanished or went idle before sending a full object.
    Gone,
    Rejected(String),
}

/// Accumulate bytes until one JSON object parses. Incomplete or plain
/// broken input keeps buffering (requests may arrive split across
/// segments); only the byte cap or a structurally valid object of the wrong
/// shape ends the wait early.
async fn read_request(rd: &mut OwnedReadHalf) -> RequestOutcome {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match timeout(API_IDLE_TIMEOUT, rd.read(&mut chunk)).await {
            Err(_) | Ok(Err(_)) | Ok(Ok(0)) => return RequestOutcome::Gone,
            Ok(Ok(n)) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return RequestOutcome::Rejected("Request too large".to_string());
        }
        match serde_json::from_slice::<DownloadRequest>(&buf) {
            Ok(request) => return RequestOutcome::Parsed(request),
            Err(error) if error.classify() == serde_json::error::Category::Data => {
                return RequestOutcome::Rejected(format!("invalid request: {error}"));
            }
            Err(_) => continue,
        }
    }
}

async fn reject(rd: &mut OwnedReadHalf, wr: &mut OwnedWriteHalf, message: String) {
    tracing::debug!(message = %message, "rejecting api request");
    let envelope = Envelope::Error {
        message,
        pack_number: None,
    };
    let _ = write_envelope(wr, &envelope).await;
    let _ = wr.shutdown().await;
    // Drain whatever the client is still sending; closing with unread bytes
    // would reset the connection and can destroy the queued envelope.
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut sink = [0u8; READ_CHUNK];
    loop {
        match timeout(Duration::from_millis(250), rd.read(&mut sink)).await {
            Ok(Ok(n)) if n > 0 && Instant::now() < deadline => continue,
            _ => break,
        }
    }
}

async fn write_envelope(wr: &mut OwnedWriteHalf, envelope: &Envelope) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(envelope).map_err(std::io::Error::other)?;
    wr.write_all(&bytes).await?;
    wr.flush().await
}
