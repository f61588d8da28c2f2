//! 共享内存并发撕裂测试
//!
//! 一个写端高频发布、一个读端按重试协议读取，断言读端永远观测不到
//! 写了一半的 blob。blob 内容为某个序号字节的重复模式，内部一致性
//! 检查即"所有字节相等"。

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use vrlink_protocol::{ShmReader, ShmWriter};

const BLOB_SIZE: usize = 1024;

#[test]
fn test_concurrent_writer_reader_never_observes_torn_blob() {
    let name = format!("/vrlink-fuzz-{}", std::process::id());
    let mut writer = ShmWriter::create(&name, BLOB_SIZE).unwrap();
    let reader = ShmReader::open(&name, BLOB_SIZE).unwrap();

    let stop = Arc::new(AtomicBool::new(false));

    let stop_writer = stop.clone();
    let writer_handle = thread::Builder::new()
        .name("shm_fuzz_writer".into())
        .spawn(move || {
            let mut rng = rand::thread_rng();
            let mut seq: u8 = 0;
            let mut published = 0u64;
            while !stop_writer.load(Ordering::Relaxed) {
                seq = seq.wrapping_add(1);
                let blob = [seq; BLOB_SIZE];
                writer.publish(&blob).unwrap();
                published += 1;
                // 随机微抖动，扫过不同的交错窗口
                if rng.gen_bool(0.25) {
                    thread::yield_now();
                }
            }
            published
        })
        .unwrap();

    let stop_reader = stop.clone();
    let reader_handle = thread::Builder::new()
        .name("shm_fuzz_reader".into())
        .spawn(move || {
            let mut out = [0u8; BLOB_SIZE];
            let mut observed = 0u64;
            let mut last_counter = 0usize;
            while !stop_reader.load(Ordering::Relaxed) {
                let counter = reader.read_blob(&mut out).unwrap();
                if counter == 0 {
                    continue;
                }
                // 内部一致性：整个 blob 必须是同一个字节
                let first = out[0];
                assert!(
                    out.iter().all(|&b| b == first),
                    "torn blob observed at counter {counter}"
                );
                // 计数器单调不减
                assert!(counter >= last_counter, "counter went backwards");
                last_counter = counter;
                observed += 1;
            }
            observed
        })
        .unwrap();

    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);

    let published = writer_handle.join().unwrap();
    let observed = reader_handle.join().unwrap();
    assert!(published > 0, "writer never published");
    assert!(observed > 0, "reader never observed a blob");
}
