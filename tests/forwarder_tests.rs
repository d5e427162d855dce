// Forwarders over private pipes, so these tests never touch the process's own
// stdout/stderr and can run in parallel under the normal harness.

use os_pipe::{PipeReader, PipeWriter};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use stdtee::config::ForwarderConfig;
use stdtee::{Forwarder, ForwarderState, Sink};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that takes a while per chunk
struct SlowSink {
    delay: Duration,
    buf: SharedBuf,
}

impl Sink for SlowSink {
    fn write_chunk(&self, chunk: &[u8]) -> io::Result<()> {
        thread::sleep(self.delay);
        self.buf.clone().write_all(chunk)
    }
}

/// A pipe standing in for a terminal: the forwarder intercepts the write end,
/// a drain thread collects everything that reaches the "terminal".
struct FakeTerminal {
    writer: Arc<PipeWriter>,
    drain: JoinHandle<Vec<u8>>,
}

impl FakeTerminal {
    fn new() -> Self {
        let (mut reader, writer): (PipeReader, PipeWriter) = os_pipe::pipe().unwrap();
        let drain = thread::spawn(move || {
            let mut seen = Vec::new();
            reader.read_to_end(&mut seen).unwrap();
            seen
        });
        Self {
            writer: Arc::new(writer),
            drain,
        }
    }

    fn forwarder(&self, config: ForwarderConfig) -> Forwarder {
        Forwarder::for_fd("fake-terminal", self.writer.as_raw_fd(), config)
    }

    fn write(&self, bytes: &[u8]) {
        (&*self.writer).write_all(bytes).unwrap();
    }

    /// Everything the terminal received, once every write end is gone
    fn finish(self) -> Vec<u8> {
        drop(self.writer);
        self.drain.join().unwrap()
    }
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for forwarded output");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_large_payload_arrives_intact() {
    let terminal = FakeTerminal::new();
    let forwarder = terminal.forwarder(ForwarderConfig::default());
    let consumer = SharedBuf::default();
    forwarder.register("client", consumer.clone()).unwrap();

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    terminal.write(&payload);

    forwarder.close().unwrap();
    assert_eq!(forwarder.live_copy_loops(), 0);

    assert_eq!(consumer.contents().len(), payload.len());
    assert!(consumer.contents() == payload);
    assert!(terminal.finish() == payload);
}

#[test]
fn test_concurrent_writers_keep_lines_whole() {
    const THREADS: usize = 8;
    const LINES: usize = 200;

    let terminal = Arc::new(FakeTerminal::new());
    let forwarder = terminal.forwarder(ForwarderConfig::default());
    let consumer = SharedBuf::default();
    forwarder.register("client", consumer.clone()).unwrap();

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let terminal = Arc::clone(&terminal);
            thread::spawn(move || {
                for n in 0..LINES {
                    // Small writes to a pipe are atomic
                    terminal.write(format!("writer-{} line-{:04}\n", t, n).as_bytes());
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    forwarder.close().unwrap();

    let text = String::from_utf8(consumer.contents()).unwrap();
    let mut last_seen: HashMap<usize, usize> = HashMap::new();
    let mut total = 0;
    for line in text.lines() {
        let (writer, number) = line
            .strip_prefix("writer-")
            .and_then(|rest| rest.split_once(" line-"))
            .unwrap_or_else(|| panic!("torn line: {:?}", line));
        let writer: usize = writer.parse().unwrap();
        let number: usize = number.parse().unwrap();
        if let Some(previous) = last_seen.insert(writer, number) {
            assert!(number > previous, "writer {} out of order", writer);
        }
        total += 1;
    }
    assert_eq!(total, THREADS * LINES);

    let terminal = Arc::try_unwrap(terminal).ok().unwrap();
    assert_eq!(terminal.finish(), consumer.contents());
}

#[test]
fn test_late_consumer_sees_only_later_bytes() {
    let terminal = FakeTerminal::new();
    let forwarder = terminal.forwarder(ForwarderConfig::default());
    let early = SharedBuf::default();
    let late = SharedBuf::default();

    forwarder.register("early", early.clone()).unwrap();
    terminal.write(b"before\n");
    wait_for(|| early.contents() == b"before\n");

    forwarder.register("late", late.clone()).unwrap();
    terminal.write(b"after\n");
    forwarder.close().unwrap();

    assert_eq!(early.contents(), b"before\nafter\n");
    assert_eq!(late.contents(), b"after\n");
    assert_eq!(terminal.finish(), b"before\nafter\n");
}

#[test]
fn test_close_drains_through_slow_consumer() {
    let terminal = FakeTerminal::new();
    let forwarder = terminal.forwarder(ForwarderConfig {
        read_buffer_size: 512,
    });
    let buf = SharedBuf::default();
    forwarder
        .register_sink(
            "slow",
            SlowSink {
                delay: Duration::from_millis(2),
                buf: buf.clone(),
            },
        )
        .unwrap();

    let mut expected = Vec::new();
    for i in 0..50 {
        let line = format!("event {}\n", i);
        terminal.write(line.as_bytes());
        expected.extend_from_slice(line.as_bytes());
    }
    forwarder.close().unwrap();

    assert_eq!(buf.contents(), expected);
    assert_eq!(terminal.finish(), expected);
}

#[test]
fn test_drain_covers_slow_consumer() {
    let terminal = FakeTerminal::new();
    let forwarder = terminal.forwarder(ForwarderConfig {
        read_buffer_size: 512,
    });
    let buf = SharedBuf::default();
    forwarder
        .register_sink(
            "slow",
            SlowSink {
                delay: Duration::from_millis(20),
                buf: buf.clone(),
            },
        )
        .unwrap();

    let mut expected = Vec::new();
    for i in 0..20 {
        let line = format!("step {}/20\n", i + 1);
        terminal.write(line.as_bytes());
        expected.extend_from_slice(line.as_bytes());
    }

    // Still intercepting: everything written so far is delivered on return
    assert!(forwarder.drain(Duration::from_secs(10)));
    assert_eq!(buf.contents(), expected);
    assert_eq!(forwarder.state(), ForwarderState::Intercepting);

    forwarder.close().unwrap();
    assert_eq!(terminal.finish(), expected);
}

#[test]
fn test_close_without_interception() {
    let terminal = FakeTerminal::new();
    let forwarder = terminal.forwarder(ForwarderConfig::default());

    forwarder.close().unwrap();
    assert_eq!(forwarder.state(), ForwarderState::Closed);
    assert_eq!(forwarder.interceptions(), 0);

    terminal.write(b"untouched\n");
    drop(forwarder);
    assert_eq!(terminal.finish(), b"untouched\n");
}

#[test]
fn test_drop_restores_stream() {
    let terminal = FakeTerminal::new();
    let consumer = SharedBuf::default();
    {
        let forwarder = terminal.forwarder(ForwarderConfig::default());
        forwarder.register("client", consumer.clone()).unwrap();
        terminal.write(b"forwarded\n");
    }
    terminal.write(b"direct\n");

    assert_eq!(consumer.contents(), b"forwarded\n");
    assert_eq!(terminal.finish(), b"forwarded\ndirect\n");
}
