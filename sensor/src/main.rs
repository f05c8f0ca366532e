use anyhow::Context;

#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;
#[cfg(not(feature = "esp32"))]
mod session;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await.context("sensor node stopped")
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run().context("sensor node stopped")
}
