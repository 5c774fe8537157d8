use crate::dcc::errors::TransferError;
use crate::dcc::store::DownloadStore;
use crate::dcc::wire::{self, DccMessage};
use crate::irc::{CtcpPrivmsg, IrcHandle};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    time::{Duration, Instant, MissedTickBehavior},
};

/// Data-channel idle limit; a bot that stalls longer than this is dead.
pub const DATA_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long terminal-event listeners get before the channel closes under them.
const LISTENER_GRACE: Duration = Duration::from_millis(250);
const EVENT_QUEUE: usize = 64;
const READ_BUF_LEN: usize = 64 * 1024;

/// Everything negotiated out of a DCC SEND. Immutable afterwards except for
/// `resume_pos`, which is set once the bot confirms our RESUME offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackInfo {
    pub filename: String,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    /// Advertised size; 0 means unknown.
    pub file_size: u64,
    pub resume_pos: u64,
}

#[derive(Debug)]
pub enum TransferEvent {
    /// The bot answered our request; the transfer is now keyed by
    /// `(filename, port)`.
    Connected { pack: PackInfo },
    Progress { pack: PackInfo, received: u64 },
    Complete {
        pack: PackInfo,
        path: PathBuf,
        size: u64,
    },
    Failed {
        pack: Option<PackInfo>,
        error: TransferError,
    },
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub interval: Duration,
    /// Percent granularity for log lines; envelopes are never throttled.
    pub log_step: u64,
    /// Full log lines instead of a carriage-return-rewritten TTY line.
    pub plain_lines: bool,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            log_step: 10,
            plain_lines: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferArgs {
    pub bot_nick: String,
    /// Pack number digits, without the `#`.
    pub pack_number: String,
    pub resume: bool,
    pub progress: ProgressSettings,
}

/// Cloneable cancel capability; safe to fire at any time, any number of
/// times. After the terminal event it is a no-op.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }

    pub(crate) fn from_sender(tx: watch::Sender<bool>) -> Self {
        Self(Arc::new(tx))
    }
}

pub struct TransferHandle {
    events: mpsc::Receiver<TransferEvent>,
    cancel: CancelHandle,
}

impl TransferHandle {
    /// Next lifecycle event; `None` once the transfer is gone. Exactly one
    /// `Complete` or `Failed` is delivered before the stream ends.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

/// Spawn a transfer task. The caller owns the returned handle; the transfer
/// itself owns its CTCP subscription, data socket, and part file.
pub fn spawn(irc: IrcHandle, store: DownloadStore, args: TransferArgs) -> TransferHandle {
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(supervise(irc, store, args, event_tx, cancel_rx));
    TransferHandle {
        events: event_rx,
        cancel: CancelHandle::from_sender(cancel_tx),
    }
}

struct Finished {
    pack: PackInfo,
    path: PathBuf,
    size: u64,
}

struct Failure {
    pack: Option<PackInfo>,
    error: TransferError,
}

impl Failure {
    fn bare(error: TransferError) -> Self {
        Self { pack: None, error }
    }
}

/// Run the engine in an inner task so that a panic surfaces as a normal
/// terminal error instead of taking the process down. Emitting the terminal
/// event here, once, on every path is what makes kill idempotent.
async fn supervise(
    irc: IrcHandle,
    store: DownloadStore,
    args: TransferArgs,
    event_tx: mpsc::Sender<TransferEvent>,
    cancel_rx: watch::Receiver<bool>,
) {
    let bot = args.bot_nick.clone();
    let inner = tokio::spawn(run(irc, store, args, event_tx.clone(), cancel_rx));
    let terminal = match inner.await {
        Ok(Ok(done)) => {
            tracing::info!(bot = %bot, file = %done.pack.filename, size = done.size, path = %done.path.display(), "download complete");
            TransferEvent::Complete {
                pack: done.pack,
                path: done.path,
                size: done.size,
            }
        }
        Ok(Err(failure)) => {
            tracing::warn!(bot = %bot, error = %failure.error, "download failed");
            TransferEvent::Failed {
                pack: failure.pack,
                error: failure.error,
            }
        }
        Err(join_error) => {
            tracing::error!(bot = %bot, error = %join_error, "transfer task died");
            TransferEvent::Failed {
                pack: None,
                error: TransferError::Join(join_error),
            }
        }
    };
    let _ = event_tx.send(terminal).await;
    // Give listeners a moment with the terminal event before the channel
    // closes under them.
    tokio::time::sleep(LISTENER_GRACE).await;
}

async fn run(
    irc: IrcHandle,
    store: DownloadStore,
    args: TransferArgs,
    event_tx: mpsc::Sender<TransferEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<Finished, Failure> {
    // Subscribe before asking so the reply cannot race past us.
    let mut ctcp = irc.subscribe_ctcp();

    irc.send_privmsg(&args.bot_nick, &format!("XDCC SEND #{}", args.pack_number))
        .await
        .map_err(|_| Failure::bare(TransferError::IrcClosed))?;
    tracing::debug!(bot = %args.bot_nick, pack = %args.pack_number, "xdcc send requested");

    // AWAIT_SEND: the first DCC SEND from the bot is ours. Stray ACCEPTs
    // belong to a sibling transfer resuming against the same bot.
    let mut pack = loop {
        match next_dcc(&mut ctcp, &irc, &args.bot_nick, &mut cancel_rx).await {
            Negotiation::Cancelled => {
                let _ = irc.send_privmsg(&args.bot_nick, "XDCC CANCEL").await;
                return Err(Failure::bare(TransferError::Canceled));
            }
            Negotiation::IrcGone => return Err(Failure::bare(TransferError::IrcClosed)),
            Negotiation::Malformed(error) => {
                return Err(Failure::bare(TransferError::Wire(error)));
            }
            Negotiation::Message(DccMessage::Send {
                filename,
                ip,
                port,
                file_size,
            }) => {
                break PackInfo {
                    filename,
                    peer_ip: ip,
                    peer_port: port,
                    file_size,
                    resume_pos: 0,
                };
            }
            Negotiation::Message(DccMessage::Accept { .. }) => continue,
        }
    };
    tracing::info!(
        bot = %args.bot_nick,
        file = %pack.filename,
        peer = %format!("{}:{}", pack.peer_ip, pack.peer_port),
        size = pack.file_size,
        "dcc send accepted"
    );
    let _ = event_tx
        .send(TransferEvent::Connected { pack: pack.clone() })
        .await;

    let with_pack = |error: TransferError, pack: &PackInfo| Failure {
        pack: Some(pack.clone()),
        error,
    };

    let safe_name =
        DownloadStore::sanitize(&pack.filename).map_err(|e| with_pack(e.into(), &pack))?;
    store
        .ensure_dir()
        .await
        .map_err(|e| with_pack(e.into(), &pack))?;
    let offset = store
        .resume_offset(&safe_name, args.resume)
        .await
        .map_err(|e| with_pack(e.into(), &pack))?;

    if offset > 0 {
        irc.send_ctcp(
            &args.bot_nick,
            &wire::resume_payload(&pack.filename, pack.peer_port, offset),
        )
        .await
        .map_err(|_| with_pack(TransferError::IrcClosed, &pack))?;
        tracing::info!(file = %pack.filename, offset, "resume offered");

        // AWAIT_ACCEPT: only an ACCEPT that echoes our exact triple counts.
        loop {
            match next_dcc(&mut ctcp, &irc, &args.bot_nick, &mut cancel_rx).await {
                Negotiation::Cancelled => {
                    let _ = irc.send_privmsg(&args.bot_nick, "XDCC CANCEL").await;
                    return Err(with_pack(TransferError::Canceled, &pack));
                }
                Negotiation::IrcGone => return Err(with_pack(TransferError::IrcClosed, &pack)),
                Negotiation::Malformed(error) => {
                    return Err(with_pack(TransferError::Wire(error), &pack));
                }
                Negotiation::Message(DccMessage::Accept {
                    filename,
                    port,
                    offset: accepted,
                }) => {
                    if filename == pack.filename && port == pack.peer_port && accepted == offset {
                        pack.resume_pos = offset;
                        break;
                    }
                    return Err(with_pack(TransferError::AcceptMismatch, &pack));
                }
                // A SEND here is a sibling transfer's reply.
                Negotiation::Message(DccMessage::Send { .. }) => continue,
            }
        }
    }

    // The CTCP subscription has done its job; dropping it unsubscribes.
    drop(ctcp);

    download(irc, store, args, pack, safe_name, event_tx, cancel_rx).await
}

async fn download(
    irc: IrcHandle,
    store: DownloadStore,
    args: TransferArgs,
    pack: PackInfo,
    safe_name: String,
    event_tx: mpsc::Sender<TransferEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<Finished, Failure> {
    let with_pack = |error: TransferError| Failure {
        pack: Some(pack.clone()),
        error,
    };

    let mut file = store
        .open_part(&safe_name)
        .await
        .map_err(|e| with_pack(e.into()))?;
    let addr = SocketAddr::from((pack.peer_ip, pack.peer_port));
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| with_pack(TransferError::Connect { addr, source }))?;
    let (mut data_rx, mut data_tx) = stream.into_split();
    tracing::debug!(peer = %addr, file = %pack.filename, resume_pos = pack.resume_pos, "data channel open");

    let mut received: u64 = pack.resume_pos;
    let started = Instant::now();
    let mut idle_deadline = Instant::now() + DATA_IDLE_TIMEOUT;
    let mut reporter = ProgressReporter::new(&args.progress, &pack, received);
    let mut ticker = tokio::time::interval(args.progress.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately
    let mut buf = vec![0u8; READ_BUF_LEN];

    let failure = loop {
        tokio::select! {
            _ = cancelled(&mut cancel_rx) => {
                let _ = irc.send_privmsg(&args.bot_nick, "XDCC CANCEL").await;
                break with_pack(TransferError::Canceled);
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                break with_pack(TransferError::Idle(DATA_IDLE_TIMEOUT.as_secs()));
            }
            _ = ticker.tick() => {
                let _ = event_tx.try_send(TransferEvent::Progress {
                    pack: pack.clone(),
                    received,
                });
                reporter.tick(received, started.elapsed());
            }
            read = data_rx.read(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(source) => break with_pack(TransferError::Io {
                        what: "read from data channel",
                        source,
                    }),
                };
                if n == 0 {
                    return finish(&store, &safe_name, pack.clone(), received, file).await;
                }
                idle_deadline = Instant::now() + DATA_IDLE_TIMEOUT;

                if pack.file_size > 0 && received + n as u64 > pack.file_size {
                    break with_pack(TransferError::Overrun {
                        expected: pack.file_size,
                        received: received + n as u64,
                    });
                }
                if let Err(source) = file.write_all(&buf[..n]).await {
                    break with_pack(TransferError::Io {
                        what: "write part file",
                        source,
                    });
                }
                received += n as u64;

                // One acknowledgment per arrival, before the next read.
                if let Err(source) = data_tx.write_all(&wire::ack_frame(received)).await {
                    // Some bots close as soon as the last byte is out and
                    // never drain the final ACK.
                    if pack.file_size > 0 && received == pack.file_size {
                        return finish(&store, &safe_name, pack.clone(), received, file).await;
                    }
                    break with_pack(TransferError::Io {
                        what: "write acknowledgment",
                        source,
                    });
                }
            }
        }
    };

    // Whatever went wrong, the bytes that did arrive belong in the .part
    // file before the terminal event goes out.
    let _ = file.flush().await;
    Err(failure)
}

/// Clean peer close: settle the transfer. Writes are flushed before any
/// terminal outcome so the `.part` content matches `received`.
async fn finish(
    store: &DownloadStore,
    safe_name: &str,
    pack: PackInfo,
    received: u64,
    mut file: tokio::fs::File,
) -> Result<Finished, Failure> {
    let with_pack = |error: TransferError| Failure {
        pack: Some(pack.clone()),
        error,
    };
    file.flush()
        .await
        .map_err(|source| with_pack(TransferError::Io {
            what: "flush part file",
            source,
        }))?;
    drop(file);

    let complete = if pack.file_size > 0 {
        received == pack.file_size
    } else {
        // Unknown size: the peer closing is the only completion signal.
        true
    };
    if !complete {
        return Err(with_pack(TransferError::UnexpectedClose));
    }
    let path = store
        .promote(safe_name)
        .await
        .map_err(|e| with_pack(e.into()))?;
    Ok(Finished {
        pack,
        path,
        size: received,
    })
}

enum Negotiation {
    Message(DccMessage),
    Malformed(crate::dcc::errors::WireError),
    Cancelled,
    IrcGone,
}

/// Wait for the next DCC payload addressed to us by the expected bot.
async fn next_dcc(
    ctcp: &mut broadcast::Receiver<CtcpPrivmsg>,
    irc: &IrcHandle,
    bot_nick: &str,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Negotiation {
    loop {
        tokio::select! {
            _ = cancelled(cancel_rx) => return Negotiation::Cancelled,
            msg = ctcp.recv() => match msg {
                Ok(ev) => {
                    if ev.sender != bot_nick
                        || ev.target != irc.nick()
                        || !ev.payload.starts_with("DCC ")
                    {
                        continue;
                    }
                    match DccMessage::parse(&ev.payload) {
                        Ok(parsed) => return Negotiation::Message(parsed),
                        Err(error) => return Negotiation::Malformed(error),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "ctcp subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Negotiation::IrcGone,
            },
        }
    }
}

/// Resolve once the cancel flag flips; never resolves if it cannot anymore.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Per-tick progress bookkeeping for the log sink. The client-facing
/// envelopes are the event channel's business and are never throttled here.
struct ProgressReporter {
    filename: String,
    file_size: u64,
    interval_secs: u64,
    log_step: u64,
    plain_lines: bool,
    last_tick_received: u64,
    last_logged_percent: Option<u64>,
}

impl ProgressReporter {
    fn new(settings: &ProgressSettings, pack: &PackInfo, start: u64) -> Self {
        Self {
            filename: pack.filename.clone(),
            file_size: pack.file_size,
            interval_secs: settings.interval.as_secs().max(1),
            log_step: settings.log_step.max(1),
            plain_lines: settings.plain_lines,
            last_tick_received: start,
            last_logged_percent: None,
        }
    }

    fn tick(&mut self, received: u64, elapsed: Duration) {
        let speed_recent = (received - self.last_tick_received) / self.interval_secs;
        self.last_tick_received = received;
        let elapsed_secs = elapsed.as_secs().max(1);
        let speed_avg = received / elapsed_secs;

        if self.file_size == 0 {
            // Percent is undefined without a size; log raw byte counts.
            if self.plain_lines {
                tracing::info!(
                    file = %self.filename,
                    received,
                    speed = %format!("{}/s", human_bytes(speed_recent)),
                    "progress"
                );
            } else {
                rewrite_tty_line(&format!(
                    "{}: {} ({}/s)",
                    self.filename,
                    human_bytes(received),
                    human_bytes(speed_recent)
                ));
            }
            return;
        }

        let percent = (received.saturating_mul(100) / self.file_size).min(100);
        let denominator = if speed_recent > 0 { speed_recent } else { speed_avg };
        let eta = if denominator > 0 {
            Some((self.file_size - received) / denominator)
        } else {
            None
        };

        if !self.plain_lines {
            rewrite_tty_line(&format!(
                "{}: {percent}% {}/{} ({}/s, eta {})",
                self.filename,
                human_bytes(received),
                human_bytes(self.file_size),
                human_bytes(speed_recent),
                eta.map(|s| format!("{s}s")).unwrap_or_else(|| "∞".to_string()),
            ));
            return;
        }

        let on_step = percent % self.log_step == 0 || percent == 100;
        if !on_step || self.last_logged_percent == Some(percent) {
            return;
        }
        self.last_logged_percent = Some(percent);
        tracing::info!(
            file = %self.filename,
            percent,
            received,
            total = self.file_size,
            speed = %format!("{}/s", human_bytes(speed_recent)),
            eta_secs = eta,
            "progress"
        );
    }
}

fn rewrite_tty_line(line: &str) {
    use std::io::Write;
    let mut stderr = std::io::stderr().lock();
    let _ = write!(stderr, "\r{line}");
    let _ = stderr.flush();
}

fn human_bytes(n: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    if n >= GIB {
        format!("{:.2} GiB", n as f64 / GIB as f64)
    } else if n >= MIB {
        format!("{:.2} MiB", n as f64 / MIB as f64)
    } else if n >= KIB {
        format!("{:.2} KiB", n as f64 / KIB as f64)
    } else {
        format!("{n} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_sane_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn reporter_logs_only_on_step_boundaries() {
        let pack = PackInfo {
            filename: "a.bin".to_string(),
            peer_ip: Ipv4Addr::LOCALHOST,
            peer_port: 5000,
            file_size: 1000,
            resume_pos: 0,
        };
        let mut reporter = ProgressReporter::new(&ProgressSettings::default(), &pack, 0);

        // 35% is not on a 10% boundary
        reporter.tick(350, Duration::from_secs(1));
        assert_eq!(reporter.last_logged_percent, None);

        reporter.tick(400, Duration::from_secs(2));
        assert_eq!(reporter.last_logged_percent, Some(40));

        // Same decile twice: second tick must not re-log.
        reporter.tick(401, Duration::from_secs(3));
        assert_eq!(reporter.last_logged_percent, Some(40));

        reporter.tick(1000, Duration::from_secs(4));
        assert_eq!(reporter.last_logged_percent, Some(100));
    }

    #[tokio::test]
    async fn cancel_handle_is_idempotent() {
        let (tx, mut rx) = watch::channel(false);
        let handle = CancelHandle(Arc::new(tx));
        handle.cancel();
        handle.cancel();
        cancelled(&mut rx).await; // resolves because the flag is set
    }
}
