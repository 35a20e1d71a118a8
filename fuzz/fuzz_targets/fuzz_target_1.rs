#![no_main]

use libfuzzer_sys::fuzz_target;
use mux_socket::frame::ControlFrame;

// ControlFrame::decode is the one piece of this crate that parses bytes an
// untrusted peer controls directly; everything else downstream only ever
// sees already-decoded, already-validated values.
fuzz_target!(|data: &[u8]| {
    let _ = ControlFrame::decode(data);
});
