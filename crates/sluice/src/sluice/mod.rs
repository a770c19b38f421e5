pub mod admin;
pub mod admin_client;
pub mod app;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tls;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
