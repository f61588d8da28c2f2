//! 流模式演示：连接守护进程并打印每个整包
//!
//! ```bash
//! cargo run --example stream_dump -- 127.0.0.1 8555
//! ```

use vrlink_sdk::{EventDispatcher, VrClient};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    vrlink_sdk::init_logging("stream_dump=info");

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".into());
    let port: u16 = args.next().as_deref().unwrap_or("8555").parse()?;

    let mut dispatcher = EventDispatcher::new()?;
    let client = VrClient::connect_tcp(&host, port, &dispatcher.handle())?;
    println!(
        "connected: protocol v{}, layout {:?}, {} virtual device(s)",
        client.protocol_version(),
        client.layout(),
        client.virtual_devices().len(),
    );
    for vd in client.virtual_devices() {
        println!("  - {} ({:?})", vd.name, vd.track_type);
    }

    client.activate();
    client.start_stream(|state| {
        for (i, t) in state.trackers.iter().enumerate() {
            if t.valid {
                println!(
                    "tracker {i}: pos {:?} ts {}us",
                    t.pose.position, t.timestamp_us
                );
            }
        }
    })?;

    dispatcher.run()?;
    Ok(())
}
