/**
 * Cloud Devices Example
 *
 * Lists every device linked to the cloud project and prints the status of
 * the first one. Uses the blocking client, no async runtime needed.
 *
 * TUYA_ACCESS_ID and TUYA_ACCESS_SECRET must be set. TUYA_REGION picks the
 * data center (cn, us, eu, in), default us.
 */
use tuyalink::{BlockingOpenApi, CloudConfig, Endpoint};

fn main() -> tuyalink::error::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- tuyalink - Cloud Devices ---");

    let access_id = std::env::var("TUYA_ACCESS_ID").unwrap_or_default();
    let secret = std::env::var("TUYA_ACCESS_SECRET").unwrap_or_default();
    let endpoint = match std::env::var("TUYA_REGION").as_deref() {
        Ok("cn") => Endpoint::China,
        Ok("eu") => Endpoint::Europe,
        Ok("in") => Endpoint::India,
        _ => Endpoint::America,
    };

    let api = BlockingOpenApi::new(CloudConfig::new(access_id, secret).with_endpoint(endpoint))?;
    api.connect()?;

    let devices = api.all_devices()?;
    println!("[INFO] {} devices in project", devices.len());
    for device in &devices {
        println!(
            "  {} {:<24} online={} local_key={}",
            device.id,
            device.name,
            device.online,
            device.local_key.as_deref().unwrap_or("-")
        );
    }

    if let Some(first) = devices.first() {
        for dp in api.device_status(&first.id)? {
            println!("[STATUS] {} = {:?}", dp.code, dp.value);
        }
    }
    Ok(())
}
