use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::bot::Bot;
use crate::clock::SystemClock;
use crate::config;
use crate::dispatch::Dispatcher;
use crate::gate::{Gate, Settings};
use crate::logging;
use crate::storage::{self, SkipCounter};
use crate::telegram;
use crate::transport::Transport;

pub fn run() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let cfg = cfg.validate().context("validate config")?;
    logging::init(&cfg.log.level)?;

    let store = storage::open(&cfg.storage)?;
    let targets = cfg.gate.parsed_targets();

    let client = Arc::new(
        telegram::Client::new(telegram::ClientConfig {
            token: cfg.telegram.bot_token.clone(),
            api_base: Some(cfg.telegram.api_base.clone()),
            poll_timeout: cfg.telegram.poll_timeout,
            http_client: None,
        })
        .context("build telegram client")?,
    );
    let me = client.get_me().context("telegram getMe")?;
    info!(
        bot = me.username.as_deref().unwrap_or("?"),
        targets = targets.len(),
        backend = ?cfg.storage.backend,
        entry = ?cfg.gate.entry,
        "bot starting"
    );

    let transport: Arc<dyn Transport> = client.clone();
    let gate = Arc::new(Gate::new(
        Settings::from_config(&cfg),
        targets,
        store.clone(),
        transport.clone(),
        Arc::new(SystemClock),
    ));
    let bot = Arc::new(Bot::new(gate, store, transport, cfg.gate.entry));

    let dispatcher = Dispatcher::new(bot, cfg.telegram.workers);
    dispatcher.run(&client);
    Ok(())
}

/// Reads skip counters from the configured store without contacting Telegram.
pub fn skip_stats(limit: usize) -> Result<Vec<SkipCounter>> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let store = storage::open(&cfg.storage)?;
    store.top_skips(limit)
}
