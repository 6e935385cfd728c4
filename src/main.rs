use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use std::{fs::File, path::Path};
use tokio::select;
use tracing::{info, level_filters::LevelFilter};
use voicebridge::{
    app::{self, AppStateBuilder},
    config::{Cli, Config},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.conf {
        Some(ref conf) if Path::new(conf).exists() => Config::load(conf)?,
        _ => Config::default(),
    };

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let mut _guard = None;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = Some(guard);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let prometheus = app::install_prometheus(&config);
    let mut builder = AppStateBuilder::new().config(config);
    if let Some(handle) = prometheus {
        builder = builder.prometheus(handle);
    }
    let state = builder.build()?;

    info!("Starting voicebridge on {}", state.config.http_addr);
    select! {
        result = app::run(state.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
            app::shutdown(&state).await;
        }
    }
    Ok(())
}
