use crate::irc::message::{self, CtcpPrivmsg, IrcLine};
use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{broadcast, mpsc},
    time::{Duration, timeout},
};

pub const DEFAULT_IRC_PORT: u16 = 6667;
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
const OUTBOUND_QUEUE: usize = 64;
const CTCP_FANOUT: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `host` or `host:port`; the port defaults to 6667.
    pub server: String,
    pub nick: String,
    pub channel: String,
}

/// A line queued for the IRC socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Line(String),
    /// Send QUIT with the given message and stop the writer.
    Quit(String),
}

/// Cheap, cloneable capability handle onto the IRC session.
///
/// This is the only surface the transfer engine sees: send a PRIVMSG or CTCP
/// to a nick, and subscribe to inbound CTCP PRIVMSGs. Dropping the receiver
/// returned by [`subscribe_ctcp`](Self::subscribe_ctcp) is the unsubscribe.
#[derive(Clone)]
pub struct IrcHandle {
    nick: Arc<str>,
    outbound: mpsc::Sender<Outbound>,
    ctcp_tx: broadcast::Sender<CtcpPrivmsg>,
}

impl IrcHandle {
    /// Assemble a handle from raw channel ends. The session task uses this
    /// internally; tests drive both sides directly.
    pub fn from_parts(
        nick: &str,
        outbound: mpsc::Sender<Outbound>,
        ctcp_tx: broadcast::Sender<CtcpPrivmsg>,
    ) -> Self {
        Self {
            nick: Arc::from(nick),
            outbound,
            ctcp_tx,
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub async fn send_privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.send_line(message::render_privmsg(target, text)).await
    }

    pub async fn send_ctcp(&self, target: &str, payload: &str) -> Result<()> {
        self.send_line(message::render_ctcp(target, payload)).await
    }

    pub fn subscribe_ctcp(&self) -> broadcast::Receiver<CtcpPrivmsg> {
        self.ctcp_tx.subscribe()
    }

    pub async fn quit(&self, quit_message: &str) {
        let _ = self
            .outbound
            .send(Outbound::Quit(quit_message.to_string()))
            .await;
    }

    async fn send_line(&self, line: String) -> Result<()> {
        if self.outbound.send(Outbound::Line(line)).await.is_err() {
            bail!("IRC session is gone");
        }
        Ok(())
    }
}

pub struct IrcSession {
    handle: IrcHandle,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl IrcSession {
    /// Connect, register, join the configured channel, and spawn the reader
    /// and writer tasks. Registration failures are startup errors.
    pub async fn connect(cfg: &SessionConfig) -> Result<Self> {
        let addr = if cfg.server.contains(':') {
            cfg.server.clone()
        } else {
            format!("{}:{DEFAULT_IRC_PORT}", cfg.server)
        };
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to IRC server at {addr}"))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        write_line(&mut writer, &format!("NICK {}", cfg.nick)).await?;
        write_line(
            &mut writer,
            &format!("USER {} 0 * :{}", cfg.nick, cfg.nick),
        )
        .await?;

        timeout(
            REGISTRATION_TIMEOUT,
            wait_for_welcome(&mut reader, &mut writer),
        )
        .await
        .context("timed out waiting for IRC registration")??;

        write_line(&mut writer, &format!("JOIN {}", cfg.channel)).await?;
        tracing::info!(server = %addr, nick = %cfg.nick, channel = %cfg.channel, "irc session ready");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (ctcp_tx, _) = broadcast::channel(CTCP_FANOUT);
        let handle = IrcHandle::from_parts(&cfg.nick, outbound_tx.clone(), ctcp_tx.clone());

        let writer_task = tokio::spawn(run_writer(writer, outbound_rx));
        let reader_task = tokio::spawn(run_reader(reader, outbound_tx, ctcp_tx));

        Ok(Self {
            handle,
            reader: reader_task,
            writer: writer_task,
        })
    }

    pub fn handle(&self) -> IrcHandle {
        self.handle.clone()
    }

    /// Send QUIT and wait for both session tasks to wind down.
    pub async fn shutdown(self, quit_message: &str) {
        self.handle.quit(quit_message).await;
        let _ = self.writer.await;
        self.reader.abort();
        let _ = self.reader.await;
    }
}

async fn wait_for_welcome(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<()> {
    loop {
        let line = read_line(reader).await?;
        let Some(parsed) = IrcLine::parse(&line) else {
            continue;
        };
        match parsed.command.as_str() {
            // RPL_WELCOME: registration done
            "001" => return Ok(()),
            "PING" => {
                let token = parsed.params.first().map(String::as_str).unwrap_or("");
                write_line(writer, &format!("PONG :{token}")).await?;
            }
            // ERR_NICKNAMEINUSE / ERR_ERRONEUSNICKNAME
            "433" | "432" => bail!("IRC server rejected nickname: {line}"),
            "ERROR" => bail!("IRC server closed registration: {line}"),
            _ => {}
        }
    }
}

async fn run_writer(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        let (line, is_quit) = match item {
            Outbound::Line(line) => (line, false),
            Outbound::Quit(msg) => (format!("QUIT :{msg}"), true),
        };
        if let Err(error) = write_line(&mut writer, &line).await {
            tracing::warn!(error = %error, "irc write failed; dropping session writer");
            return;
        }
        if is_quit {
            tracing::debug!("irc QUIT sent");
            return;
        }
    }
}

async fn run_reader(
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    outbound: mpsc::Sender<Outbound>,
    ctcp_tx: broadcast::Sender<CtcpPrivmsg>,
) {
    loop {
        let line = match read_line(&mut reader).await {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(error = %error, "irc read loop ended");
                return;
            }
        };
        let Some(parsed) = IrcLine::parse(&line) else {
            tracing::debug!(line = %line, "ignoring unparseable irc line");
            continue;
        };
        match parsed.command.as_str() {
            "PING" => {
                let token = parsed.params.first().map(String::as_str).unwrap_or("");
                if outbound
                    .send(Outbound::Line(format!("PONG :{token}")))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            "PRIVMSG" => {
                if let Some(ctcp) = message::ctcp_privmsg(&parsed) {
                    tracing::debug!(from = %ctcp.sender, payload = %ctcp.payload, "ctcp privmsg");
                    // No receivers just means no transfer is waiting.
                    let _ = ctcp_tx.send(ctcp);
                }
            }
            "ERROR" => {
                tracing::warn!(line = %line, "irc server error");
                return;
            }
            _ => {}
        }
    }
}

async fn write_line(writer: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) -> Result<()> {
    // IRC requires CRLF.
    writer
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .with_context(|| format!("failed to write IRC line: {line}"))?;
    writer.flush().await?;
    Ok(())
}

async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Result<String> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        bail!("IRC server closed the connection");
    }
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}
