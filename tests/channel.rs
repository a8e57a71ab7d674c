use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serial_test::serial;
use shm_rpc_channel::error::{ChannelError, CodecError};
use shm_rpc_channel::Channel::{ChannelBuilder, ChunkChain, LoopExit, SharedMemoryChannel};
use shm_rpc_channel::Dispatch::MessageDispatcher;
use shm_rpc_channel::Messages::{
    InvokeRequire, Message, MessageType, MetricRequire, PayloadType,
};
use shm_rpc_channel::Queue::{ChunkFlags, CHUNK_DATA_SIZE};
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// What the receive loop handed over for one message.
#[derive(Debug, Clone)]
struct Seen {
    id: u32,
    msg_type: u8,
    fragments: usize,
    first_points_at_head: bool,
    links_follow_order: bool,
    last_flag_only_on_tail: bool,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

impl MessageDispatcher for Recorder {
    fn process_message(&self, _channel: &Arc<SharedMemoryChannel>, chain: ChunkChain) {
        let indices: Vec<u32> = chain.indices().collect();
        let chunks: Vec<_> = chain.chunks().collect();
        let seen = Seen {
            id: chain.id(),
            msg_type: chain.msg_type(),
            fragments: chain.len(),
            first_points_at_head: chunks.iter().all(|c| c.first == chain.head_index()),
            links_follow_order: chunks
                .windows(2)
                .zip(indices.iter().skip(1))
                .all(|(pair, next)| pair[0].next == *next),
            last_flag_only_on_tail: chunks
                .iter()
                .enumerate()
                .all(|(i, c)| c.is_last() == (i == chunks.len() - 1)),
            payload: chain.to_bytes(),
        };
        self.seen.lock().push(seen);
    }
}

/// Decodes everything as `InvokeRequire` and keeps the error.
#[derive(Default)]
struct StrictInvokeDecoder {
    errors: Mutex<Vec<ChannelError>>,
}

impl MessageDispatcher for StrictInvokeDecoder {
    fn process_message(&self, channel: &Arc<SharedMemoryChannel>, chain: ChunkChain) {
        if let Err(e) = channel.deserialize::<InvokeRequire>(Some(chain)) {
            self.errors.lock().push(e);
        }
    }
}

/// Carries the `InvokeRequire` message type with a metric payload discriminant.
#[derive(Serialize, Deserialize)]
struct Impostor {
    padding: String,
}

impl Message for Impostor {
    const MESSAGE_TYPE: MessageType = MessageType::InvokeRequire;
    const PAYLOAD_TYPE: PayloadType = PayloadType::MetricRequire;
}

/// Fails after writing a few chunks worth of body.
#[derive(Serialize, Deserialize)]
struct Exploding {
    bytes_before_failure: usize,
}

impl Message for Exploding {
    const MESSAGE_TYPE: MessageType = MessageType::MetricRequire;
    const PAYLOAD_TYPE: PayloadType = PayloadType::MetricRequire;

    fn encode_body<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        writer.write_all(&vec![b'x'; self.bytes_before_failure])?;
        Err(CodecError::Custom("body encoder gave up".to_string()))
    }
}

#[test]
#[serial]
fn test_three_fragment_message_is_dispatched_once() {
    let name = unique_name("three");
    let (host, worker) = channel_pair(&name, 16);
    let recorder = Arc::new(Recorder::default());
    let receive_loop = worker.spawn_receive_loop(recorder.clone()).unwrap();

    // 1 discriminant byte + JSON body spanning between two and three chunks
    let metric = MetricRequire {
        method: "m".repeat(CHUNK_DATA_SIZE * 2 + 100),
        duration_micros: 5,
    };
    let id = host.send(&metric).unwrap();

    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1));
    let report = receive_loop.shutdown().unwrap();

    let seen = recorder.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    let message = &seen[0];
    assert_eq!(message.id, id);
    assert_eq!(message.msg_type, MessageType::MetricRequire.value());
    assert_eq!(message.fragments, 3);
    assert!(message.first_points_at_head);
    assert!(message.links_follow_order);
    assert!(message.last_flag_only_on_tail);

    let decoded: MetricRequire =
        shm_rpc_channel::Messages::codec::decode_message(&mut message.payload.as_slice()).unwrap();
    assert_eq!(decoded, metric);

    assert_eq!(report.exit, LoopExit::Stopped);
    assert_eq!(report.dispatched, 1);
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_random_sizes_reassemble_in_order() {
    let name = unique_name("random");
    let (host, worker) = channel_pair(&name, 32);
    let recorder = Arc::new(Recorder::default());
    let receive_loop = worker.spawn_receive_loop(recorder.clone()).unwrap();

    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let mut expected = Vec::new();
    for _ in 0..40 {
        let len = rng.usize(0..CHUNK_DATA_SIZE * 6);
        let metric = MetricRequire {
            method: "a".repeat(len),
            duration_micros: rng.u64(..),
        };
        let wire_len = 1 + serde_json::to_vec(&metric).unwrap().len();
        let fragments = wire_len.div_ceil(CHUNK_DATA_SIZE).max(1);
        let id = host.send(&metric).unwrap();
        expected.push((id, fragments, metric));
    }

    assert!(wait_until(Duration::from_secs(10), || recorder.count() == expected.len()));
    receive_loop.shutdown().unwrap();

    let seen = recorder.seen.lock().clone();
    for (id, fragments, metric) in expected {
        let message = seen.iter().find(|s| s.id == id).unwrap();
        assert_eq!(message.fragments, fragments, "message {id}");
        assert!(message.first_points_at_head);
        assert!(message.links_follow_order);
        assert!(message.last_flag_only_on_tail);
        let decoded: MetricRequire =
            shm_rpc_channel::Messages::codec::decode_message(&mut message.payload.as_slice())
                .unwrap();
        assert_eq!(decoded, metric);
    }
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_wrong_payload_type_is_rejected_and_chunks_freed() {
    let name = unique_name("wrongtype");
    let (host, worker) = channel_pair(&name, 8);
    let decoder = Arc::new(StrictInvokeDecoder::default());
    let receive_loop = worker.spawn_receive_loop(decoder.clone()).unwrap();

    host.send(&Impostor {
        padding: "p".repeat(CHUNK_DATA_SIZE + 10),
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || decoder.errors.lock().len() == 1));
    receive_loop.shutdown().unwrap();

    match &decoder.errors.lock()[0] {
        ChannelError::DeserializeFailByMessageType { expected, actual } => {
            assert_eq!(*expected, PayloadType::InvokeRequire.value());
            assert_eq!(*actual, PayloadType::MetricRequire.value());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_missing_chain_fails_to_deserialize() {
    let name = unique_name("nullchain");
    let (host, worker) = channel_pair(&name, 4);
    let err = worker.deserialize::<InvokeRequire>(None).unwrap_err();
    assert!(matches!(err, ChannelError::DeserializeFailByFirstSegmentIsNull));
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_concurrent_senders_get_distinct_ids() {
    const PER_THREAD: usize = 1_000;

    let name = unique_name("ids");
    let (host, worker) = channel_pair(&name, 64);
    let recorder = Arc::new(Recorder::default());
    let receive_loop = worker.spawn_receive_loop(recorder.clone()).unwrap();

    let senders: Vec<_> = (0..2)
        .map(|t| {
            let host = Arc::clone(&host);
            thread::spawn(move || {
                let mut ids = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let metric = MetricRequire {
                        method: format!("t{t}.m{i}"),
                        duration_micros: i as u64,
                    };
                    ids.push(host.send(&metric).unwrap());
                }
                ids
            })
        })
        .collect();

    let mut sent = HashSet::new();
    for s in senders {
        for id in s.join().unwrap() {
            assert!(sent.insert(id), "id {id} handed out twice");
        }
    }

    assert!(wait_until(Duration::from_secs(10), || recorder.count() == 2 * PER_THREAD));
    receive_loop.shutdown().unwrap();

    let received: HashSet<u32> = recorder.seen.lock().iter().map(|s| s.id).collect();
    assert_eq!(received.len(), 2 * PER_THREAD);
    assert_eq!(received, sent);
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_stop_sentinel_ends_the_loop() {
    let name = unique_name("stop");
    let (host, worker) = channel_pair(&name, 16);
    let recorder = Arc::new(Recorder::default());
    let receive_loop = worker.spawn_receive_loop(recorder.clone()).unwrap();

    for i in 0..3 {
        host.send(&MetricRequire {
            method: format!("before.{i}"),
            duration_micros: 0,
        })
        .unwrap();
    }

    let started = Instant::now();
    worker.stop().unwrap();
    let report = receive_loop.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.exit, LoopExit::Stopped);
    assert_eq!(report.dispatched, 3);

    host.send(&MetricRequire {
        method: "after".to_string(),
        duration_micros: 0,
    })
    .unwrap();
    thread::sleep(Duration::from_millis(50));

    assert_eq!(recorder.count(), 3);
    assert_eq!(worker.receive_queue().posted_len(), 1);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_failed_serialization_cancels_partial_message() {
    let name = unique_name("cancel");
    let (host, worker) = channel_pair(&name, 16);
    let recorder = Arc::new(Recorder::default());
    let receive_loop = worker.spawn_receive_loop(recorder.clone()).unwrap();

    let err = host
        .send(&Exploding {
            bytes_before_failure: CHUNK_DATA_SIZE * 2 + 10,
        })
        .unwrap_err();
    assert!(matches!(err, ChannelError::SerializeFail(CodecError::Custom(_))));

    let good = host
        .send(&MetricRequire {
            method: "after.cancel".to_string(),
            duration_micros: 1,
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1));
    let report = receive_loop.shutdown().unwrap();

    assert_eq!(recorder.seen.lock()[0].id, good);
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.abandoned, 0);
    // the held-back fragment went straight back to the pool, the rest were posted
    let sent = host.send_queue().stats();
    assert_eq!(sent.posted + sent.returned, sent.acquired_for_write);
    assert_eq!(sent.returned, 1);
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_panicking_dispatcher_does_not_kill_the_loop() {
    struct Grumpy(AtomicUsize);
    impl MessageDispatcher for Grumpy {
        fn process_message(&self, _channel: &Arc<SharedMemoryChannel>, _chain: ChunkChain) {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first message upsets the dispatcher");
            }
        }
    }

    let name = unique_name("panic");
    let (host, worker) = channel_pair(&name, 8);
    let grumpy = Arc::new(Grumpy(AtomicUsize::new(0)));
    let receive_loop = worker.spawn_receive_loop(grumpy.clone()).unwrap();

    for _ in 0..2 {
        host.send(&MetricRequire {
            method: "x".to_string(),
            duration_micros: 0,
        })
        .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || grumpy.0.load(Ordering::SeqCst) == 2));
    let report = receive_loop.shutdown().unwrap();
    assert_eq!(report.dispatched, 2);
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_oversized_message_fails_without_wedging_the_channel() {
    let name = unique_name("oversized");
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let host = ChannelBuilder::new(name.clone())
        .with_send_slots(4)
        .with_receive_slots(4)
        .with_send_timeout(Duration::from_millis(200))
        .create()
        .unwrap();
    let worker = ChannelBuilder::new(name.clone()).open().unwrap();
    let recorder = Arc::new(Recorder::default());
    let receive_loop = worker.spawn_receive_loop(recorder.clone()).unwrap();

    // six chunks of body cannot fit a four-slot queue
    let err = host
        .send(&MetricRequire {
            method: "m".repeat(CHUNK_DATA_SIZE * 6),
            duration_micros: 1,
        })
        .unwrap_err();
    assert!(matches!(err, ChannelError::SerializeFail(_)), "{err:?}");

    let small = host
        .send(&MetricRequire {
            method: "small".to_string(),
            duration_micros: 2,
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1));
    let report = receive_loop.shutdown().unwrap();

    assert_eq!(recorder.seen.lock()[0].id, small);
    assert_eq!(report.exit, LoopExit::Stopped);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.abandoned, 0);
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_interleaved_partial_messages_cannot_drain_the_pool() {
    let name = unique_name("interleave");
    let (host, worker) = channel_pair(&name, 4);
    let recorder = Arc::new(Recorder::default());
    let receive_loop = worker.spawn_receive_loop(recorder.clone()).unwrap();

    // two senders each mid-message: three of four chunks held by the receiver
    post_fragment(&host, 1, ChunkFlags::NONE, b"a1");
    post_fragment(&host, 1, ChunkFlags::NONE, b"a2");
    post_fragment(&host, 2, ChunkFlags::NONE, b"b1");

    // the larger partial message is dropped and its chunks come back
    assert!(wait_until(Duration::from_secs(5), || {
        worker.receive_queue().free_len() == 3
    }));

    post_fragment(&host, 1, ChunkFlags::LAST_CHUNK, b"a3");
    post_fragment(&host, 2, ChunkFlags::LAST_CHUNK, b"b2");

    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1));
    let report = receive_loop.shutdown().unwrap();

    let seen = recorder.seen.lock().clone();
    assert_eq!(seen[0].id, 2);
    assert_eq!(seen[0].payload, b"b1b2");
    assert_eq!(report.dispatched, 1);
    // the eviction itself plus the straggling last fragment of message 1
    assert_eq!(report.evicted, 2);
    assert_eq!(report.abandoned, 0);
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

#[test]
#[serial]
fn test_shutdown_with_exhausted_receive_queue() {
    let name = unique_name("exhausted");
    let (host, worker) = channel_pair(&name, 4);
    let recorder = Arc::new(Recorder::default());
    let receive_loop = worker.spawn_receive_loop(recorder.clone()).unwrap();

    let held: Vec<_> = (0..4)
        .map(|_| host.send_queue().try_acquire_for_write().unwrap())
        .collect();
    assert_eq!(worker.receive_queue().free_len(), 0);

    let started = Instant::now();
    let report = receive_loop.shutdown().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.exit, LoopExit::Stopped);
    assert_eq!(report.dispatched, 0);

    for handle in held {
        host.send_queue().return_chunk(handle).unwrap();
    }

    // the wake-up is consumed; a later loop runs until its own sentinel
    host.send(&MetricRequire {
        method: "after.wake".to_string(),
        duration_micros: 0,
    })
    .unwrap();
    worker.stop().unwrap();
    let report = worker.run_receive_loop(recorder.as_ref());
    assert_eq!(report.dispatched, 1);
    assert_eq!(recorder.count(), 1);
    assert_conserved(&worker);
    teardown(&name, host, worker);
}

// Helper functions

/// Post one raw fragment of message `id`.
fn post_fragment(from: &SharedMemoryChannel, id: u32, flag: u8, payload: &[u8]) {
    let queue = from.send_queue();
    let mut handle = queue.acquire_for_write_timeout(Duration::from_secs(1)).unwrap();
    let chunk = queue.chunk_mut(&mut handle);
    chunk.id = id;
    chunk.msg_type = MessageType::MetricRequire.value();
    chunk.flag = flag;
    chunk.data[..payload.len()].copy_from_slice(payload);
    chunk.data_len = payload.len() as u16;
    queue.post(handle).unwrap();
}

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "shmrpc-chan-{}-{}-{}",
        std::process::id(),
        tag,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn channel_pair(name: &str, slots: usize) -> (Arc<SharedMemoryChannel>, Arc<SharedMemoryChannel>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let host = ChannelBuilder::new(name)
        .with_send_slots(slots)
        .with_receive_slots(slots)
        .create()
        .unwrap();
    let worker = ChannelBuilder::new(name).open().unwrap();
    (host, worker)
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

/// Every chunk the worker read went back to the pool.
fn assert_conserved(worker: &SharedMemoryChannel) {
    let queue = worker.receive_queue();
    let stats = queue.stats();
    assert_eq!(stats.acquired_for_read, stats.returned);
    assert_eq!(queue.free_len(), queue.slot_count());
}

fn teardown(name: &str, host: Arc<SharedMemoryChannel>, worker: Arc<SharedMemoryChannel>) {
    drop(worker);
    drop(host);
    let _ = SharedMemoryChannel::unlink(name);
}
