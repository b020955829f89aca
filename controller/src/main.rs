mod bus;
mod control_loop;
mod ecoflow;
mod error;
mod feed;
mod host;
mod meter;
mod status;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
