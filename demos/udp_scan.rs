/**
 * Scanner Example
 *
 * Listens for device announcements on UDP 6666/6667 and prints what it hears.
 */
use std::time::Duration;
use tuyalink::Scanner;

#[tokio::main]
async fn main() -> tuyalink::error::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- tuyalink - Scanner ---");
    println!("[INFO] Listening for Tuya devices...");

    let devices = Scanner::new()
        .with_timeout(Duration::from_secs(10))
        .scan()
        .await?;

    for (i, device) in devices.iter().enumerate() {
        println!(
            "[{}] Found Device: ID={}, IP={}, Version={:?}",
            i + 1,
            device.id,
            device.ip,
            device.version
        );
    }
    println!("[INFO] Scan finished. Total devices found: {}", devices.len());
    Ok(())
}
