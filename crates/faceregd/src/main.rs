use anyhow::{anyhow, Context, Result};
use facereg_core::Config;
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceregd starting");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        store = %config.store_path.display(),
        backend = ?config.store_backend,
        tolerance = config.tolerance,
        output = %config.output_dir.display(),
        "configuration loaded"
    );

    let (engine, engine_thread) =
        engine::spawn_engine(&config).context("failed to start recognition engine")?;

    let conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(
            dbus_interface::OBJECT_PATH,
            dbus_interface::RegistryService::new(engine.clone()),
        )?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(name = dbus_interface::BUS_NAME, "faceregd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceregd shutting down");

    drop(conn);
    let pending = engine.shutdown().await.context("engine stopped unexpectedly")?;
    tokio::task::spawn_blocking(move || engine_thread.join())
        .await
        .context("failed to wait for the engine thread")?
        .map_err(|_| anyhow!("engine thread panicked"))?;

    if pending > 0 {
        tracing::error!(pending, "enrollments could not be persisted before exit");
    }
    tracing::info!("faceregd stopped");

    Ok(())
}
