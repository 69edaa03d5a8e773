#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Single lines: framing, notification parsing and escape decoding
    let _ = termq::control::protocol::parse_output_line(data);
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = termq::control::protocol::parse_control_line(s);
        let _ = termq::control::protocol::parse_notification(s);
        let _ = termq::control::protocol::decode_octal_escapes(s);
    }
});
