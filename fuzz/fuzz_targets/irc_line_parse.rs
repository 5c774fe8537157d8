#![no_main]

use libfuzzer_sys::fuzz_target;
use xdccd::irc::message::{IrcLine, ctcp_privmsg};

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        if let Some(parsed) = IrcLine::parse(line) {
            let _ = parsed.sender_nick();
            let _ = ctcp_privmsg(&parsed);
        }
    }
});
