//! 共享内存快速路径演示：按固定频率从段里拉最新状态
//!
//! 需要守护进程启用共享内存并通过 Unix 套接字连接：
//!
//! ```bash
//! cargo run --example shm_poll -- /run/vrlink.sock
//! ```

use std::path::Path;
use std::time::Duration;

use vrlink_sdk::{EventDispatcher, VrClient};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    vrlink_sdk::init_logging("shm_poll=info");

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/run/vrlink.sock".into());

    let dispatcher = EventDispatcher::new()?;
    let client = VrClient::connect_unix(Path::new(&path), false, &dispatcher.handle())?;
    if !client.has_shared_memory() {
        return Err("server did not offer a shared memory segment".into());
    }

    loop {
        if client.update_device_states()? {
            let state = client.device_state();
            let valid = state.trackers.iter().filter(|t| t.valid).count();
            println!("{valid}/{} trackers valid", state.trackers.len());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
