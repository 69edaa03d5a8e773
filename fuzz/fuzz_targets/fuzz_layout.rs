#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(layout) = termq::control::layout::Layout::parse(s) {
            let _ = layout.panes();
            let _ = layout.size();
        }
    }
});
