#![no_main]

use libfuzzer_sys::fuzz_target;
use session_net::protocol::dispatcher::{decode_envelope, Envelope};
use session_net::protocol::message::ControlMessage;

fuzz_target!(|data: &[u8]| {
    // Envelope and control decoding must reject bad input without panicking
    if let Ok(Envelope::Control { kind, body }) = decode_envelope(data) {
        if let Ok(message) = ControlMessage::decode(kind, body) {
            let _ = message.encode();
        }
    }
});
