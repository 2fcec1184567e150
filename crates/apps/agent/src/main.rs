mod proxy;
mod supervisor;
mod usb;

use app_state::load_app_settings;
use color_eyre::Result;
use once_cell::sync::Lazy;
use prometheus::{register_int_gauge, IntGauge};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

static START_TIME: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("agent_start_timestamp_seconds", "Start timestamp (unix)")
        .expect("register agent_start_timestamp_seconds")
});

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let settings = load_app_settings()?;

    let level = if settings.logging.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    START_TIME.set(chrono::Utc::now().timestamp());
    info!(camera = settings.camera.id, "camera agent starting");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    supervisor::run(settings, cancel).await
}
