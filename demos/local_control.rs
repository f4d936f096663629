/**
 * Local Control Example
 *
 * Connects to one device over the LAN, reads its data points, flips switch 1
 * and prints whatever the device pushes back for a few seconds.
 *
 * TUYA_DEVICE_ID, TUYA_DEVICE_IP and TUYA_LOCAL_KEY must be set.
 * TUYA_VERSION defaults to 3.3.
 */
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tuyalink::{CommandType, Device, LinkEvent, Version};

#[tokio::main]
async fn main() -> tuyalink::error::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- tuyalink - Local Control ---");

    let id = std::env::var("TUYA_DEVICE_ID").unwrap_or_default();
    let ip = std::env::var("TUYA_DEVICE_IP").unwrap_or_default();
    let key = std::env::var("TUYA_LOCAL_KEY").unwrap_or_default();
    let version: Version = std::env::var("TUYA_VERSION")
        .unwrap_or_else(|_| "3.3".into())
        .parse()?;

    let device = Device::builder(&id, &ip, &key).version(version).build()?;
    let events = device.subscribe();
    tokio::pin!(events);

    device.connect().await?;
    println!("[INFO] Connected to {} ({})", id, ip);

    // 1. Query current state
    let reply = device.request(1, CommandType::DpQuery, None).await?;
    println!(
        "[STATUS] {}",
        reply.payload_as_string().unwrap_or_default()
    );

    // 2. Toggle switch 1
    let on = reply
        .payload_json()
        .ok()
        .and_then(|v| v["dps"]["1"].as_bool())
        .unwrap_or(false);
    device
        .send(2, CommandType::Control, Some(json!({ "1": !on })))
        .await?;
    println!("[INFO] Switch 1 set to {}", !on);

    // 3. Print pushed frames for a while
    let timeout = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(timeout);
    loop {
        tokio::select! {
            Some(event) = events.next() => match event {
                LinkEvent::Frame(frame) => println!(
                    "[EVENT] {} seqno={} {}",
                    frame.cmd,
                    frame.seqno,
                    frame.payload_as_string().unwrap_or_default()
                ),
                LinkEvent::DecodeError(e) => eprintln!("[WARN] Bad frame: {}", e),
                LinkEvent::Disconnected => {
                    println!("[INFO] Device hung up");
                    break;
                }
            },
            _ = &mut timeout => break,
        }
    }

    device.close().await;
    Ok(())
}
