#![no_main]

use libfuzzer_sys::fuzz_target;
use xdccd::dcc::wire::DccMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = std::str::from_utf8(data) {
        let _ = DccMessage::parse(payload);
    }
});
