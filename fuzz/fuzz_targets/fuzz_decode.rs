//! Fuzz target for wire decoding.
//!
//! Decoding never panics on arbitrary input, and anything that decodes
//! re-encodes to a payload that decodes to the same message.

#![no_main]

use libfuzzer_sys::fuzz_target;
use versioned_replication::protocol::{decode_command, decode_push, encode};
use versioned_replication::Record;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(command) = decode_command::<Record>(payload) {
        let encoded = encode(&command).expect("decoded command re-encodes");
        let again = decode_command::<Record>(&encoded).expect("re-encoded command decodes");
        assert_eq!(command.version, again.version);
        assert_eq!(command.is_catch_up(), again.is_catch_up());
    }

    if let Ok(push) = decode_push::<Record>(payload) {
        let encoded = encode(&push).expect("decoded push re-encodes");
        let again = decode_push::<Record>(&encoded).expect("re-encoded push decodes");
        assert_eq!(push.kind(), again.kind());
        assert_eq!(push.version(), again.version());
    }
});
