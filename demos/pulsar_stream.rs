/**
 * Pulsar Stream Example
 *
 * Subscribes to the project's OpenPulsar topic and prints device reports
 * and online/offline changes for one minute.
 *
 * TUYA_ACCESS_ID and TUYA_ACCESS_SECRET must be set.
 */
use futures_util::StreamExt;
use std::time::Duration;
use tuyalink::{CloudConfig, Endpoint, OpenPulsar, PulsarEvent};

#[tokio::main]
async fn main() -> tuyalink::error::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- tuyalink - Pulsar Stream ---");

    let access_id = std::env::var("TUYA_ACCESS_ID").unwrap_or_default();
    let secret = std::env::var("TUYA_ACCESS_SECRET").unwrap_or_default();
    let pulsar = OpenPulsar::new(
        CloudConfig::new(access_id, secret).with_endpoint(Endpoint::America),
    );

    let events = pulsar.subscribe();
    tokio::pin!(events);
    pulsar.connect().await?;
    println!("[INFO] Listening on {}", pulsar.topic_url());

    let timeout = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(timeout);
    loop {
        tokio::select! {
            Some(event) = events.next() => match event {
                PulsarEvent::DeviceStatus { dev_id, status } => {
                    for dp in status {
                        println!("[STATUS] {} {} = {:?}", dev_id, dp.code, dp.value);
                    }
                }
                PulsarEvent::DeviceState { dev_id, online } => {
                    println!("[STATE] {} online={}", dev_id, online);
                }
                PulsarEvent::Error(e) => eprintln!("[ERROR] {}", e),
                PulsarEvent::Lost => {
                    println!("[INFO] Stream lost");
                    break;
                }
                PulsarEvent::Disconnected => break,
            },
            _ = &mut timeout => {
                println!("[INFO] Example timeout reached. Exiting.");
                break;
            }
        }
    }

    pulsar.disconnect().await;
    Ok(())
}
