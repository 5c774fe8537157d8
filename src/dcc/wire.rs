use crate::dcc::errors::WireError;
use std::net::Ipv4Addr;

pub type Result<T> = std::result::Result<T, WireError>;

/// Length of an acknowledgment frame on the data channel.
pub const ACK_FRAME_LEN: usize = 4;

/// A recognized CTCP DCC control message.
///
/// Grammar: `DCC <cmd> <filename> <numbers...>` where the filename may be
/// wrapped in `"` or `'`. Bots in the wild mix the quote characters and
/// sometimes drop the closing one; the parser accepts all of that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccMessage {
    /// `DCC SEND <filename> <ip_u32> <port> <filesize>`; size 0 means unknown.
    Send {
        filename: String,
        ip: Ipv4Addr,
        port: u16,
        file_size: u64,
    },
    /// `DCC ACCEPT <filename> <port> <offset>` confirming an earlier RESUME.
    Accept {
        filename: String,
        port: u16,
        offset: u64,
    },
}

impl DccMessage {
    pub fn parse(payload: &str) -> Result<Self> {
        let rest = payload.strip_prefix("DCC ").ok_or(WireError::NotDcc)?;
        let rest = rest.trim_start();
        let (cmd, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        if cmd.is_empty() {
            return Err(WireError::MissingField("command"));
        }
        let (filename, rest) = take_filename(rest.trim_start())?;
        let nums: Vec<&str> = rest.split_whitespace().collect();

        match cmd {
            "SEND" => {
                if nums.len() < 3 {
                    return Err(WireError::MissingField("ip/port/filesize"));
                }
                let ip = int_to_ip(parse_num(nums[0], "ip")?);
                let port = parse_port(nums[1])?;
                let file_size: u64 = parse_num(nums[2], "filesize")?;
                Ok(Self::Send {
                    filename,
                    ip,
                    port,
                    file_size,
                })
            }
            "ACCEPT" => {
                // Some bots echo the ip field back; the last two numbers are
                // always (port, offset).
                if nums.len() < 2 {
                    return Err(WireError::MissingField("port/offset"));
                }
                let port = parse_port(nums[nums.len() - 2])?;
                let offset: u64 = parse_num(nums[nums.len() - 1], "offset")?;
                Ok(Self::Accept {
                    filename,
                    port,
                    offset,
                })
            }
            other => Err(WireError::UnknownCommand(other.to_string())),
        }
    }
}

/// Pull the filename off the front of `input`, honoring (lenient) quoting.
fn take_filename(input: &str) -> Result<(String, &str)> {
    if input.is_empty() {
        return Err(WireError::MissingField("filename"));
    }
    let mut chars = input.chars();
    let first = chars.next().unwrap_or_default();
    if first == '"' || first == '\'' {
        let body = chars.as_str();
        // Accept either quote character as the closer, matched or not.
        if let Some(end) = body.find(['"', '\'']) {
            let name = &body[..end];
            if name.is_empty() {
                return Err(WireError::MissingField("filename"));
            }
            return Ok((name.to_string(), &body[end + 1..]));
        }
        // Opening quote without a closer: fall back to one bare token.
        let (token, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
        if token.is_empty() {
            return Err(WireError::MissingField("filename"));
        }
        return Ok((token.to_string(), rest));
    }
    let (token, rest) = input
        .split_once(char::is_whitespace)
        .unwrap_or((input, ""));
    Ok((token.to_string(), rest))
}

fn parse_num<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T> {
    value.parse().map_err(|_| WireError::BadNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_port(value: &str) -> Result<u16> {
    let port: u16 = parse_num(value, "port")?;
    if port == 0 {
        return Err(WireError::BadNumber {
            field: "port",
            value: value.to_string(),
        });
    }
    Ok(port)
}

/// DCC encodes IPv4 addresses as a decimal u32 in big-endian octet order.
pub fn ip_to_int(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

pub fn int_to_ip(n: u32) -> Ipv4Addr {
    Ipv4Addr::from(n)
}

/// CTCP payload asking the bot to continue `filename` from `offset`.
pub fn resume_payload(filename: &str, port: u16, offset: u64) -> String {
    format!("DCC RESUME {filename} {port} {offset}")
}

/// The 4-byte big-endian cumulative acknowledgment written after every data
/// arrival. The counter wraps at 2^32 for files larger than 4 GiB.
pub fn ack_frame(received: u64) -> [u8; ACK_FRAME_LEN] {
    ((received & 0xFFFF_FFFF) as u32).to_be_bytes()
}
