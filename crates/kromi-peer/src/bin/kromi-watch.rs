use clap::Parser;
use kromi_common::{DeviceInfo, SignalMessage, ViewerRegistration};
use kromi_peer::{DeviceRoster, SignalingClient};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kromi-watch")]
#[command(about = "Watch device presence for a Kromi event")]
struct Args {
    /// Signaling relay WebSocket URL
    #[arg(long, env = "KROMI_SIGNAL_URL", default_value = "ws://127.0.0.1:3000/ws")]
    url: String,
    /// Event to watch
    #[arg(long)]
    event: String,
    /// Viewer id (generated by the relay when omitted)
    #[arg(long)]
    viewer_id: Option<String>,
}

fn describe(device: &DeviceInfo) -> String {
    format!(
        "{} ({}) {:?}{}",
        device.device_id,
        device.device_name,
        device.status,
        if device.streaming { " streaming" } else { "" }
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kromi_common::init_tracing_with_default("kromi_watch=info,kromi_peer=info");
    let args = Args::parse();

    let mut client = SignalingClient::connect(&args.url).await?;
    client
        .register_viewer(ViewerRegistration {
            event_id: args.event.clone(),
            viewer_id: args.viewer_id.clone(),
        })
        .await?;

    let mut roster = DeviceRoster::new();
    loop {
        let msg = tokio::select! {
            msg = client.recv() => msg?,
            _ = tokio::signal::ctrl_c() => {
                client.send(&SignalMessage::Unregister(Default::default())).await?;
                break;
            }
        };

        match msg {
            SignalMessage::Registered(registered) => {
                info!("watching event {} as {}", registered.event_id, registered.participant_id);
            }
            SignalMessage::DevicesList(devices) => {
                roster.replace(devices);
                info!("{} devices online", roster.len());
                for device in roster.devices() {
                    info!("  {}", describe(device));
                }
            }
            SignalMessage::DeviceOnline(device) => {
                info!("online: {}", describe(&device));
                roster.upsert(device);
            }
            SignalMessage::DeviceOffline(device) => {
                info!("offline: {}", device.device_id);
                roster.remove(&device.device_id);
            }
            SignalMessage::Error(error) => warn!("relay error: {}", error.message),
            other => info!("{}", other.kind()),
        }
    }

    Ok(())
}
