//! Manager 并发语义集成测试
//!
//! 规则：保留单个来源（线程）内的更新顺序，不同来源之间不做任何
//! 跨线程排序承诺。

use std::sync::{Arc, Mutex};
use std::thread;

use vrlink_protocol::{DeviceLayout, TrackerState};
use vrlink_server::{DeviceManager, Streamer};

fn bare_manager(layout: DeviceLayout) -> Arc<DeviceManager> {
    let mut alloc = vrlink_server::DeviceAllocator::new();
    alloc.allocate_trackers(layout.trackers);
    alloc.allocate_buttons(layout.buttons);
    alloc.allocate_valuators(layout.valuators);
    Arc::new(alloc.into_manager(Vec::new()))
}

/// 记录 (tracker, timestamp) 序列的 streamer
struct SequenceRecorder {
    seen: Arc<Mutex<Vec<(usize, u64)>>>,
}

impl Streamer for SequenceRecorder {
    fn tracker_updated(&mut self, index: usize, state: &TrackerState) {
        self.seen.lock().unwrap().push((index, state.timestamp_us));
    }
}

/// 两个驱动线程各自按递增时间戳写自己的 tracker：全局交错任意，
/// 但每个 tracker 观察到的时间戳序列必须严格保持各自线程的顺序
#[test]
fn test_per_thread_ordering_preserved() {
    let manager = bare_manager(DeviceLayout {
        trackers: 2,
        buttons: 0,
        valuators: 0,
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    manager.set_streamer(Box::new(SequenceRecorder { seen: seen.clone() }));

    const UPDATES: u64 = 500;
    let mut threads = Vec::new();
    for tracker in 0..2usize {
        let manager = manager.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("driver{tracker}"))
                .spawn(move || {
                    for ts in 1..=UPDATES {
                        manager.set_tracker_state(tracker, TrackerState {
                            timestamp_us: ts,
                            valid: true,
                            ..Default::default()
                        });
                    }
                })
                .unwrap(),
        );
    }
    for t in threads {
        t.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2 * UPDATES as usize);
    for tracker in 0..2usize {
        let per_source: Vec<u64> = seen
            .iter()
            .filter(|(i, _)| *i == tracker)
            .map(|&(_, ts)| ts)
            .collect();
        let expected: Vec<u64> = (1..=UPDATES).collect();
        assert_eq!(per_source, expected, "tracker {tracker} updates reordered");
    }
}

/// setter 并发打击同一个 tracker 也不破坏状态完整性：最终快照
/// 必须等于某次完整写入，掩码语义不受竞争影响
#[test]
fn test_concurrent_setters_leave_consistent_state() {
    let manager = bare_manager(DeviceLayout {
        trackers: 1,
        buttons: 1,
        valuators: 1,
    });

    let mut threads = Vec::new();
    for worker in 0..4u64 {
        let manager = manager.clone();
        threads.push(thread::spawn(move || {
            for i in 0..200u64 {
                manager.set_tracker_state(0, TrackerState {
                    timestamp_us: worker * 1_000 + i,
                    valid: true,
                    ..Default::default()
                });
                manager.set_button_state(0, i % 2 == 0);
                manager.set_valuator_state(0, i as f64 / 200.0);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    let snapshot = manager.state_snapshot();
    assert!(snapshot.trackers[0].valid);
    assert!(snapshot.trackers[0].timestamp_us >= 199);
    assert!((0.0..=1.0).contains(&snapshot.valuators[0]));
}
