use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread;
use stdtee::config::ForwarderConfig;
use stdtee::forward::{FanOut, Registry};
use stdtee::Forwarder;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn dev_null() -> File {
    OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .expect("Failed to open /dev/null")
}

/// Consumer that only counts bytes, so the benchmark measures the fan-out
#[derive(Default)]
struct CountingWriter(u64);

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn fanout_with_consumers(count: usize) -> FanOut {
    let registry = Arc::new(Registry::new());
    for i in 0..count {
        registry.insert(
            format!("client-{}", i),
            Box::new(Mutex::new(CountingWriter::default())),
        );
    }
    FanOut::new("bench", dev_null(), registry)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_fanout_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_write");
    let line = b"[12:00:00.000] apply: step 1/5\n";
    group.throughput(Throughput::Bytes(line.len() as u64));

    for consumers in [0, 1, 4, 16, 64] {
        let fanout = fanout_with_consumers(consumers);
        group.bench_with_input(BenchmarkId::from_parameter(consumers), &consumers, |b, _| {
            b.iter(|| fanout.write(black_box(line)).unwrap());
        });
    }

    group.finish();
}

fn bench_chunk_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_chunk_size");
    let fanout = fanout_with_consumers(4);

    for size in [64usize, 4 * 1024, 32 * 1024] {
        let chunk = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &chunk, |b, chunk| {
            b.iter(|| fanout.write(black_box(chunk)).unwrap());
        });
    }

    group.finish();
}

/// End to end through a pipe-backed forwarder: write, copy loop, consumer
fn bench_pipe_roundtrip(c: &mut Criterion) {
    let (mut terminal_reader, terminal_writer) = os_pipe::pipe().expect("Failed to create pipe");
    let drain = thread::spawn(move || {
        let mut buf = [0u8; 64 * 1024];
        while matches!(terminal_reader.read(&mut buf), Ok(n) if n > 0) {}
    });

    let forwarder = Forwarder::for_fd("bench", terminal_writer.as_raw_fd(), ForwarderConfig::default());
    forwarder
        .register("client", CountingWriter::default())
        .expect("Failed to register consumer");

    let payload = vec![b'y'; 16 * 1024];
    let mut group = c.benchmark_group("forwarder_pipe");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("write_16k", |b| {
        b.iter(|| (&terminal_writer).write_all(black_box(&payload)).unwrap());
    });
    group.finish();

    forwarder.close().expect("Failed to close forwarder");
    drop(terminal_writer);
    let _ = drain.join();
}

criterion_group!(benches, bench_fanout_write, bench_chunk_sizes, bench_pipe_roundtrip);
criterion_main!(benches);
