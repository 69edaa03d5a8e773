use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use termq::control::layout::Layout;
use termq::control::protocol::{decode_octal_escapes, parse_notification};
use termq::control::{ControlParser, Snapshot};

// ── Helpers ─────────────────────────────────────────────────────────

/// A control stream shaped like a busy session: mostly output, with
/// occasional layout changes and command replies.
fn make_stream(lines: usize) -> Vec<u8> {
    let mut out = String::new();
    for i in 0..lines {
        match i % 50 {
            0 => out.push_str(
                "%layout-change @1 020a,80x24,0,0{40x24,0,0,1,39x24,41,0,2} \
                 020a,80x24,0,0{40x24,0,0,1,39x24,41,0,2} *\n",
            ),
            1 => {
                out.push_str(&format!("%begin 1700000000 {i} 1\n"));
                out.push_str("%1\t@1\t1\t0\t0\t/home/user\tzsh\n");
                out.push_str(&format!("%end 1700000000 {i} 1\n"));
            }
            n => out.push_str(&format!(
                "%output %{} line {i} \\033[32mok\\033[0m \\015\\012\n",
                1 + n % 2
            )),
        }
    }
    out.into_bytes()
}

fn parser() -> ControlParser {
    let snapshot = Arc::new(RwLock::new(Snapshot::new("termq-bench0000")));
    let (events, _) = broadcast::channel(1024);
    ControlParser::new(snapshot, events, None)
}

// ── Benchmarks ──────────────────────────────────────────────────────

fn bench_stream_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_stream");

    for n in [100, 1000, 10_000] {
        let stream = make_stream(n);
        group.throughput(Throughput::Bytes(stream.len() as u64));

        group.bench_function(format!("single_read_{n}_lines"), |b| {
            b.iter(|| {
                let mut p = parser();
                black_box(p.feed(black_box(&stream)));
            });
        });

        group.bench_function(format!("4k_reads_{n}_lines"), |b| {
            b.iter(|| {
                let mut p = parser();
                for chunk in stream.chunks(4096) {
                    black_box(p.feed(black_box(chunk)));
                }
            });
        });
    }

    group.finish();
}

fn bench_line_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_lines");

    let output = "%output %12 \\033[1;34mdrwxr-xr-x\\033[0m  4 user staff  128 src\\015\\012";
    group.bench_function("parse_output_notification", |b| {
        b.iter(|| parse_notification(black_box(output)));
    });

    group.bench_function("decode_octal_escapes", |b| {
        b.iter(|| decode_octal_escapes(black_box(&output[12..])));
    });

    let layout = "f160,80x24,0,0[80x12,0,0,1,80x11,0,13{40x11,0,13,2,39x11,41,13,3}]";
    group.bench_function("parse_nested_layout", |b| {
        b.iter(|| Layout::parse(black_box(layout)));
    });

    group.finish();
}

criterion_group!(benches, bench_stream_feed, bench_line_parsing);
criterion_main!(benches);
