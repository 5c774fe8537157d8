/// A parsed IRC server line, e.g.:
/// `:nick!user@host PRIVMSG target :hello`
/// `PING :irc.example.net`
/// `:irc.example.net 001 ournick :Welcome`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
    pub raw: String,
}

impl IrcLine {
    pub fn parse(line: &str) -> Option<Self> {
        let raw = line.trim_end_matches(['\r', '\n']).to_string();
        let mut rest = raw.as_str();

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, tail) = stripped.split_once(' ')?;
            rest = tail.trim_start_matches(' ');
            Some(prefix.to_string())
        } else {
            None
        };

        let command = match rest.split_once(' ') {
            Some((cmd, tail)) => {
                rest = tail.trim_start_matches(' ');
                cmd.to_string()
            }
            None => {
                let cmd = rest.to_string();
                rest = "";
                cmd
            }
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((p, tail)) => {
                    params.push(p.to_string());
                    rest = tail.trim_start_matches(' ');
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command,
            params,
            raw,
        })
    }

    /// Nick portion of the prefix (`nick!user@host` -> `nick`).
    pub fn sender_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }
}

/// A CTCP message carried in a PRIVMSG, delimited by `\x01`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtcpPrivmsg {
    /// Nick of the sender.
    pub sender: String,
    /// PRIVMSG target (our nick for direct messages).
    pub target: String,
    /// Payload with the `\x01` framing stripped, e.g. `DCC SEND ...`.
    pub payload: String,
}

/// Extract a CTCP payload from a parsed PRIVMSG, if there is one.
///
/// The trailing `\x01` is optional; some clients omit it.
pub fn ctcp_privmsg(line: &IrcLine) -> Option<CtcpPrivmsg> {
    if line.command != "PRIVMSG" || line.params.len() < 2 {
        return None;
    }
    let text = line.params[1].as_str();
    let payload = text.strip_prefix('\x01')?;
    let payload = payload.strip_suffix('\x01').unwrap_or(payload);
    Some(CtcpPrivmsg {
        sender: line.sender_nick()?.to_string(),
        target: line.params[0].clone(),
        payload: payload.to_string(),
    })
}

pub fn render_privmsg(target: &str, text: &str) -> String {
    format!("PRIVMSG {target} :{text}")
}

/// Render a CTCP PRIVMSG; the payload is wrapped in `\x01` markers.
pub fn render_ctcp(target: &str, payload: &str) -> String {
    format!("PRIVMSG {target} :\x01{payload}\x01")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_privmsg_with_prefix() {
        let line = IrcLine::parse(":Bot|A!xdcc@host.example PRIVMSG dlbot :hello there\r\n")
            .expect("parse");
        assert_eq!(line.prefix.as_deref(), Some("Bot|A!xdcc@host.example"));
        assert_eq!(line.sender_nick(), Some("Bot|A"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["dlbot", "hello there"]);
    }

    #[test]
    fn parses_ping_without_prefix() {
        let line = IrcLine::parse("PING :irc.example.net").expect("parse");
        assert_eq!(line.prefix, None);
        assert_eq!(line.command, "PING");
        assert_eq!(line.params, vec!["irc.example.net"]);
    }

    #[test]
    fn parses_numeric_with_middle_params() {
        let line = IrcLine::parse(":server 001 dlbot :Welcome to IRC").expect("parse");
        assert_eq!(line.command, "001");
        assert_eq!(line.params, vec!["dlbot", "Welcome to IRC"]);
    }

    #[test]
    fn rejects_empty_line() {
        assert!(IrcLine::parse("").is_none());
        assert!(IrcLine::parse("\r\n").is_none());
    }

    #[test]
    fn extracts_ctcp_payload() {
        let line =
            IrcLine::parse(":Bot|A!u@h PRIVMSG dlbot :\x01DCC SEND \"a.bin\" 2130706433 5000 5\x01")
                .expect("parse");
        let ctcp = ctcp_privmsg(&line).expect("ctcp");
        assert_eq!(ctcp.sender, "Bot|A");
        assert_eq!(ctcp.target, "dlbot");
        assert_eq!(ctcp.payload, "DCC SEND \"a.bin\" 2130706433 5000 5");
    }

    #[test]
    fn ctcp_tolerates_missing_trailing_marker() {
        let line = IrcLine::parse(":b!u@h PRIVMSG me :\x01DCC ACCEPT a.bin 5000 3").expect("parse");
        assert_eq!(
            ctcp_privmsg(&line).expect("ctcp").payload,
            "DCC ACCEPT a.bin 5000 3"
        );
    }

    #[test]
    fn plain_privmsg_is_not_ctcp() {
        let line = IrcLine::parse(":b!u@h PRIVMSG me :DCC SEND a.bin 1 2 3").expect("parse");
        assert!(ctcp_privmsg(&line).is_none());
    }

    #[test]
    fn renders_outbound_lines() {
        assert_eq!(
            render_privmsg("Bot|A", "XDCC SEND #7"),
            "PRIVMSG Bot|A :XDCC SEND #7"
        );
        assert_eq!(
            render_ctcp("Bot|A", "DCC RESUME a.bin 5000 3"),
            "PRIVMSG Bot|A :\x01DCC RESUME a.bin 5000 3\x01"
        );
    }
}
