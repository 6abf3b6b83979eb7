#![no_main]

use libfuzzer_sys::fuzz_target;
use concord::network::decode_message;

fuzz_target!(|data: &[u8]| {
    // A 4-byte LE length prefix followed by a bincode Message. Anything
    // undecodable must come back as None, never a panic.
    let _ = decode_message(data);
});
