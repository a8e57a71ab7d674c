use serial_test::serial;
use shm_rpc_channel::error::QueueError;
use shm_rpc_channel::Queue::{ChunkFlags, SharedMessageQueue};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
#[serial]
fn test_create_and_attach() -> io::Result<()> {
    let name = unique_name("attach");
    let writer = SharedMessageQueue::create(&name, 16)?;
    let reader = SharedMessageQueue::attach(&name)?;

    assert_eq!(writer.slot_count(), 16);
    assert_eq!(reader.slot_count(), 16);
    assert_eq!(reader.free_len(), 16);
    assert_eq!(reader.posted_len(), 0);

    drop(reader);
    drop(writer);
    cleanup(&name);
    Ok(())
}

#[test]
#[serial]
fn test_slot_count_must_be_power_of_two() {
    let name = unique_name("pow2");
    let err = SharedMessageQueue::create(&name, 12).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    cleanup(&name);
}

#[test]
#[serial]
fn test_attach_missing_segment_fails() {
    let err = SharedMessageQueue::attach(&unique_name("missing")).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}

#[test]
#[serial]
fn test_chunks_cross_the_mapping_in_order() -> io::Result<()> {
    let name = unique_name("fifo");
    let writer = SharedMessageQueue::create(&name, 8)?;
    let reader = SharedMessageQueue::attach(&name)?;

    for id in 1..=5u32 {
        let mut handle = writer.acquire_for_write().unwrap();
        let chunk = writer.chunk_mut(&mut handle);
        chunk.id = id;
        chunk.flag = ChunkFlags::LAST_CHUNK;
        chunk.data[0] = id as u8 * 10;
        chunk.data_len = 1;
        writer.post(handle).unwrap();
    }

    for id in 1..=5u32 {
        let handle = reader.acquire_for_read().unwrap();
        let chunk = reader.chunk(&handle);
        assert_eq!(chunk.id, id);
        assert!(chunk.is_last());
        assert_eq!(chunk.payload(), &[id as u8 * 10]);
        reader.return_chunk(handle).unwrap();
    }

    assert_eq!(reader.free_len(), 8);
    drop(reader);
    drop(writer);
    cleanup(&name);
    Ok(())
}

#[test]
#[serial]
fn test_full_queue_and_timeouts() -> io::Result<()> {
    let name = unique_name("full");
    let queue = SharedMessageQueue::create(&name, 2)?;

    let a = queue.try_acquire_for_write().unwrap();
    let b = queue.try_acquire_for_write().unwrap();
    assert!(matches!(queue.try_acquire_for_write(), Err(QueueError::Full(_))));

    let started = Instant::now();
    let err = queue
        .acquire_for_write_timeout(Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, QueueError::TimedOut(_)));
    assert!(started.elapsed() >= Duration::from_millis(40));

    assert!(queue
        .acquire_for_read_timeout(Duration::from_millis(20))
        .unwrap()
        .is_none());

    queue.post(a).unwrap();
    queue.post(b).unwrap();
    for _ in 0..2 {
        let handle = queue.acquire_for_read().unwrap();
        queue.return_chunk(handle).unwrap();
    }
    assert_eq!(queue.free_len(), 2);

    drop(queue);
    cleanup(&name);
    Ok(())
}

#[test]
#[serial]
fn test_handle_from_other_queue_is_refused() -> io::Result<()> {
    let first = unique_name("own-a");
    let second = unique_name("own-b");
    let a = SharedMessageQueue::create(&first, 4)?;
    let b = SharedMessageQueue::create(&second, 4)?;

    let handle = a.acquire_for_write().unwrap();
    let err = b.post(handle).unwrap_err();
    assert!(matches!(err, QueueError::ForeignHandle { .. }));
    assert_eq!(b.posted_len(), 0);

    drop(a);
    drop(b);
    cleanup(&first);
    cleanup(&second);
    Ok(())
}

#[test]
#[serial]
fn test_blocked_reader_wakes_on_post() -> io::Result<()> {
    let name = unique_name("wake");
    let writer = Arc::new(SharedMessageQueue::create(&name, 4)?);
    let reader = Arc::new(SharedMessageQueue::attach(&name)?);

    let reader_thread = {
        let reader = Arc::clone(&reader);
        thread::spawn(move || {
            let handle = reader.acquire_for_read().unwrap();
            let id = reader.chunk(&handle).id;
            reader.return_chunk(handle).unwrap();
            id
        })
    };

    thread::sleep(Duration::from_millis(50));
    let mut handle = writer.acquire_for_write().unwrap();
    writer.chunk_mut(&mut handle).id = 77;
    writer.post(handle).unwrap();

    assert_eq!(reader_thread.join().unwrap(), 77);
    drop(reader);
    drop(writer);
    cleanup(&name);
    Ok(())
}

#[test]
#[serial]
fn test_chunk_conservation_under_contention() -> io::Result<()> {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 2_000;

    let name = unique_name("conserve");
    let writer = Arc::new(SharedMessageQueue::create(&name, 16)?);
    let reader = Arc::new(SharedMessageQueue::attach(&name)?);
    let received = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let reader = Arc::clone(&reader);
        let received = Arc::clone(&received);
        thread::spawn(move || {
            while received.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
                if let Some(handle) = reader
                    .acquire_for_read_timeout(Duration::from_millis(100))
                    .unwrap()
                {
                    reader.return_chunk(handle).unwrap();
                    received.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    let handle = writer
                        .acquire_for_write_timeout(Duration::from_secs(5))
                        .unwrap();
                    writer.post(handle).unwrap();
                }
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    consumer.join().unwrap();

    let written = writer.stats();
    let read = reader.stats();
    assert_eq!(written.acquired_for_write, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(written.posted, written.acquired_for_write);
    assert_eq!(read.acquired_for_read, read.returned);
    assert_eq!(read.returned, written.posted);
    assert_eq!(reader.free_len(), 16);

    drop(reader);
    drop(writer);
    cleanup(&name);
    Ok(())
}

// Helper functions

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "shmrpc-queue-{}-{}-{}",
        std::process::id(),
        tag,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn cleanup(name: &str) {
    let _ = shm_rpc_channel::Core::unlink_shared_memory(name);
}
