use std::sync::Arc;

use {
    anyhow::Result,
    clap::Subcommand,
    teleindex_config::TeleindexConfig,
    teleindex_ingest::{
        model::{ListenerStats, StopOutcome},
        state::ListenerStateManager,
        store_sqlite::SqliteStatusStore,
    },
};

#[derive(Subcommand)]
pub enum ChannelAction {
    /// List monitored channel ids.
    List,
    /// Start monitoring a channel.
    Add {
        #[arg(allow_negative_numbers = true)]
        channel_id: i64,
    },
    /// Stop monitoring a channel.
    Remove {
        #[arg(allow_negative_numbers = true)]
        channel_id: i64,
    },
}

pub async fn open_state(config: &TeleindexConfig) -> Result<ListenerStateManager> {
    let store = SqliteStatusStore::new(&config.database.url).await?;
    Ok(ListenerStateManager::new(Arc::new(store)))
}

pub async fn status(state: &ListenerStateManager, json: bool) -> Result<()> {
    let stats = state.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }
    Ok(())
}

fn print_stats(stats: &ListenerStats) {
    let status = &stats.status;
    println!("Running:          {}", status.is_running);
    println!("Phase:            {:?}", status.phase);
    println!("Download images:  {}", status.download_images);
    if let Some(ref task_id) = status.task_id {
        println!("Task:             {task_id}");
    }
    if let Some(started) = status.started_at {
        println!("Started:          {}", started.to_rfc3339());
    }
    if let Some(stopped) = status.stopped_at {
        println!("Stopped:          {}", stopped.to_rfc3339());
    }
    if let Some(ref error) = status.error {
        println!("Last error:       {error}");
    }
    println!("Monitored:        {} channel(s)", stats.monitored.len());
}

pub async fn stop(state: &ListenerStateManager) -> Result<()> {
    match state.request_stop().await? {
        StopOutcome::Stopping => println!("Stop requested; the listener winds down on its next status check."),
        StopOutcome::NotRunning => println!("Listener is not running."),
    }
    Ok(())
}

pub async fn handle_channels(state: &ListenerStateManager, action: ChannelAction) -> Result<()> {
    match action {
        ChannelAction::List => {
            let channels = state.monitored_channels().await?;
            if channels.is_empty() {
                println!("No monitored channels.");
            }
            for id in channels {
                println!("{id}");
            }
        },
        ChannelAction::Add { channel_id } => {
            if state.add_channel(channel_id).await? {
                println!("Now monitoring {channel_id}.");
            } else {
                println!("{channel_id} is already monitored.");
            }
        },
        ChannelAction::Remove { channel_id } => {
            if state.remove_channel(channel_id).await? {
                println!("Stopped monitoring {channel_id}.");
            } else {
                println!("{channel_id} was not monitored.");
            }
        },
    }
    Ok(())
}
