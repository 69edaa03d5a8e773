#![no_main]
use libfuzzer_sys::fuzz_target;
use parking_lot::RwLock;
use std::sync::Arc;

use termq::control::{ControlParser, Snapshot};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes through the stateful parser, split at the first byte
    let snapshot = Arc::new(RwLock::new(Snapshot::new("termq-fuzz0000")));
    let (events, _) = tokio::sync::broadcast::channel(64);
    let mut parser = ControlParser::new(snapshot, events, None);
    let split = data.first().map(|b| *b as usize % (data.len() + 1)).unwrap_or(0);
    let _ = parser.feed(&data[..split]);
    let _ = parser.feed(&data[split..]);
    let _ = parser.finish();
});
