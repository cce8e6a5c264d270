//! Tests d'intégration du flux temps réel
//!
//! Les tests de cadence tournent sur une horloge Tokio en pause
//! (`start_paused = true`) : les temps mesurés sont exacts.

use bytes::Bytes;
use pmortstream::{
    Bitrate, ByteSource, EventKind, EventReceiver, MemoryByteSource, RtStream, RtStreamError,
    StreamConfig, StreamEvent, StreamState,
};
use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep, Instant};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn assert_near(actual: Duration, expected: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(diff <= ms(2), "expected ~{:?}, got {:?}", expected, actual);
}

/// 256000 octets/s, chunks de 32000 octets : 125 ms par chunk
fn live_config() -> StreamConfig {
    StreamConfig::new(Bitrate::from_bytes_per_sec(256_000)).with_chunk_size(32_000)
}

fn memory_stream(len: usize, config: StreamConfig) -> RtStream {
    RtStream::new(Arc::new(MemoryByteSource::new(pattern(len))), config).unwrap()
}

async fn next_event(events: &mut EventReceiver) -> StreamEvent {
    events.recv().await.expect("event channel closed")
}

async fn next_data(events: &mut EventReceiver) -> (u64, Bytes, Instant) {
    loop {
        if let StreamEvent::Data(chunk) = next_event(events).await {
            return (chunk.offset(), chunk.into_bytes(), Instant::now());
        }
    }
}

/// Source qui échoue pour toute lecture à partir de `fail_from`
struct FlakySource {
    data: Bytes,
    fail_from: u64,
}

#[async_trait::async_trait]
impl ByteSource for FlakySource {
    async fn read_at(&self, offset: u64, size: usize) -> pmortstream::Result<Bytes> {
        if offset >= self.fail_from {
            return Err(RtStreamError::Io(std::io::Error::other("bad sector")));
        }
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(size).min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    async fn len(&self) -> pmortstream::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// Source dont chaque lecture prend `delay`
struct SlowSource {
    data: Bytes,
    delay: Duration,
}

#[async_trait::async_trait]
impl ByteSource for SlowSource {
    async fn read_at(&self, offset: u64, size: usize) -> pmortstream::Result<Bytes> {
        sleep(self.delay).await;
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(size).min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    async fn len(&self) -> pmortstream::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_chunks_paced_then_end() {
    let mut stream = memory_stream(64_000, live_config());
    let mut events = stream
        .subscribe(&[EventKind::Data, EventKind::End, EventKind::Close])
        .unwrap();

    let t0 = Instant::now();
    stream.start().unwrap();

    let (first, bytes, t1) = next_data(&mut events).await;
    assert_eq!(first, 0);
    assert_eq!(bytes.len(), 32_000);
    assert_near(t1 - t0, ms(125));

    let (second, bytes, t2) = next_data(&mut events).await;
    assert_eq!(second, 32_000);
    assert_eq!(&bytes[..], &pattern(64_000)[32_000..]);
    assert_near(t2 - t1, ms(125));

    assert!(matches!(next_event(&mut events).await, StreamEvent::End));
    assert!(matches!(next_event(&mut events).await, StreamEvent::Close));

    sleep(ms(1_000)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(stream.state(), StreamState::Ended);
    assert_eq!(stream.position(), 64_000);
}

#[tokio::test(start_paused = true)]
async fn test_seek_yields_chunk_at_new_offset() {
    let mut stream = memory_stream(64_000, live_config());
    let mut events = stream.subscribe(&[EventKind::Data, EventKind::End]).unwrap();

    stream.start().unwrap();
    stream.seek(32_000).unwrap();
    assert_eq!(stream.offset(), 32_000);

    let (offset, bytes, _) = next_data(&mut events).await;
    assert_eq!(offset, 32_000);
    assert_eq!(&bytes[..], &pattern(64_000)[32_000..64_000]);
    assert!(matches!(next_event(&mut events).await, StreamEvent::End));
}

#[tokio::test(start_paused = true)]
async fn test_seek_during_pending_read_drops_old_data() {
    let source = Arc::new(SlowSource {
        data: Bytes::from(pattern(64_000)),
        delay: ms(300),
    });
    let mut stream = RtStream::new(source, live_config()).unwrap();
    let mut events = stream.subscribe(&[EventKind::Data, EventKind::End]).unwrap();

    stream.start().unwrap();
    // la première lecture à l'offset 0 est encore en cours
    sleep(ms(100)).await;
    stream.seek(32_000).unwrap();

    let mut offsets = Vec::new();
    loop {
        match next_event(&mut events).await {
            StreamEvent::Data(chunk) => {
                assert_eq!(&chunk.data()[..], &pattern(64_000)[32_000..]);
                offsets.push(chunk.offset());
            }
            StreamEvent::End => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(offsets, vec![32_000]);

    sleep(ms(1_000)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_pause_resume_preserves_elapsed_time() {
    let mut stream = memory_stream(128_000, live_config());
    let mut events = stream.subscribe(&[EventKind::Data]).unwrap();

    stream.start().unwrap();
    sleep(ms(40)).await;
    stream.pause().unwrap();
    sleep(ms(1_000)).await;
    assert!(events.try_recv().is_err());

    let resumed_at = Instant::now();
    stream.resume().unwrap();
    let (offset, _, at) = next_data(&mut events).await;
    assert_eq!(offset, 0);
    assert_near(at - resumed_at, ms(85));

    // la cadence nominale reprend ensuite
    let (_, _, next) = next_data(&mut events).await;
    assert_near(next - at, ms(125));
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_are_idempotent() {
    let mut stream = memory_stream(64_000, live_config());
    let mut events = stream
        .subscribe(&[EventKind::Data, EventKind::Pause, EventKind::Resume])
        .unwrap();

    stream.start().unwrap();
    sleep(ms(50)).await;
    stream.pause().unwrap();
    stream.pause().unwrap();
    sleep(ms(100)).await;

    let resumed_at = Instant::now();
    stream.resume().unwrap();
    stream.resume().unwrap();

    assert!(matches!(next_event(&mut events).await, StreamEvent::Pause));
    assert!(matches!(next_event(&mut events).await, StreamEvent::Resume));
    let (offset, _, at) = next_data(&mut events).await;
    assert_eq!(offset, 0);
    assert_near(at - resumed_at, ms(75));
}

#[tokio::test(start_paused = true)]
async fn test_observers_survive_seek_into_failing_region() {
    let source = Arc::new(FlakySource {
        data: Bytes::from(pattern(128_000)),
        fail_from: 96_000,
    });
    let mut stream = RtStream::new(source, live_config()).unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let data = Arc::new(AtomicUsize::new(0));
    // deux observateurs Error de l'appelant : aucun ne doit être perdu
    for _ in 0..2 {
        let errors = errors.clone();
        stream
            .on(EventKind::Error, move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    let counter = data.clone();
    stream
        .on(EventKind::Data, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let mut closes = stream.subscribe(&[EventKind::Close]).unwrap();

    stream.start().unwrap();
    sleep(ms(130)).await;
    assert_eq!(data.load(Ordering::SeqCst), 1);

    stream.seek(100_000).unwrap();
    assert!(matches!(next_event(&mut closes).await, StreamEvent::Close));
    sleep(ms(500)).await;

    assert_eq!(errors.load(Ordering::SeqCst), 2);
    assert_eq!(data.load(Ordering::SeqCst), 1);
    assert_eq!(stream.state(), StreamState::Failed);

    // nouvelle tentative depuis une zone saine : mêmes observateurs
    stream.seek(0).unwrap();
    sleep(ms(130)).await;
    assert_eq!(data.load(Ordering::SeqCst), 2);
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(errors.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_chunk_offsets_are_contiguous() {
    let config = StreamConfig::new(Bitrate::from_bytes_per_sec(1_000_000))
        .with_chunk_size(10_000)
        .with_read_size(4_096)
        .with_channel_size(2);
    let source = pattern(95_000);
    let mut stream = memory_stream(source.len(), config);
    let mut events = stream.subscribe(&[EventKind::Data, EventKind::End]).unwrap();
    stream.start().unwrap();

    let mut offsets = Vec::new();
    let mut received = Vec::new();
    loop {
        match next_event(&mut events).await {
            StreamEvent::Data(chunk) => {
                offsets.push(chunk.offset());
                received.extend_from_slice(chunk.data());
            }
            StreamEvent::End => break,
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(offsets.len(), 10);
    assert!(offsets.windows(2).all(|w| w[1] - w[0] == 10_000));
    assert_eq!(received, source);
}

#[tokio::test(start_paused = true)]
async fn test_seek_past_end_ends_immediately() {
    let mut stream = memory_stream(64_000, live_config());
    let mut events = stream.subscribe(&[EventKind::Data, EventKind::End]).unwrap();
    stream.start().unwrap();

    let t0 = Instant::now();
    stream.seek(1_000_000).unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::End));
    assert_near(Instant::now() - t0, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_close_detaches_consumer() {
    let mut stream = memory_stream(640_000, live_config());
    let mut events = stream
        .subscribe(&[EventKind::Data, EventKind::Unsubscribe, EventKind::Close])
        .unwrap();
    stream.start().unwrap();
    next_data(&mut events).await;

    stream.close().unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Unsubscribe));
    assert!(matches!(next_event(&mut events).await, StreamEvent::Close));

    sleep(ms(1_000)).await;
    assert!(events.try_recv().is_err());
    assert!(stream.pause().unwrap_err().is_invalid_state());
    assert!(stream.seek(0).unwrap_err().is_invalid_state());
}

#[tokio::test]
async fn test_file_stream_matches_file_content() {
    let content = pattern(50_000);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&content).unwrap();
    file.flush().unwrap();

    let config = StreamConfig::from_yaml_str(
        "rtstream:\n  byte_rate: 1600000\n  chunk_size: 16000\n  read_size: 5000\n",
    )
    .unwrap();
    assert_eq!(config.base_delay(), ms(10));

    let mut stream = RtStream::open(file.path(), config).await.unwrap();
    let mut events = stream
        .subscribe(&[EventKind::Data, EventKind::End, EventKind::Error])
        .unwrap();
    stream.start().unwrap();

    let mut received = Vec::new();
    loop {
        match next_event(&mut events).await {
            StreamEvent::Data(chunk) => received.extend_from_slice(chunk.data()),
            StreamEvent::End => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(received, content);
}
