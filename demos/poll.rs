use std::sync::Arc;
use std::time::Duration;

use blemetry::{AdapterKind, BluestRadio, DeviceTarget, Fetcher, SessionConfig};

/// Usage: poll <mac_address> <renogy_rover|jbd>
#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(address), Some(adapter)) = (args.next(), args.next()) else {
        anyhow::bail!("usage: poll <mac_address> <renogy_rover|jbd>");
    };
    let kind: AdapterKind = adapter.parse()?;

    let radio = BluestRadio::new().await?;
    let fetcher = Fetcher::new(Arc::new(radio), SessionConfig::default());
    loop {
        match fetcher.fetch(DeviceTarget::new(address.as_str()), kind).await {
            Ok(snapshot) => println!("{}", snapshot.into_value()),
            Err(err) => eprintln!("{err}"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
