use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyEventKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod actions;
mod app;
mod commands;
mod config;
mod error;
mod server;
mod tmux;
mod transport;

use actions::Action;
use app::{App, StatusMessage};
use config::Config;
use server::{ControllerConfig, ProcMetrics, ProcessMetrics, SessionController, Subscription};
use tmux::TmuxClient;

type Controller = SessionController<TmuxClient>;

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = Config::data_dir();
    std::fs::create_dir_all(&data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    let log_path = data_dir.join("mc-console-ctrl.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    // Initialize logging; stdout belongs to the terminal UI
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .init();

    let config_path = Config::default_path();
    let config = Config::load_or_create(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    let ruleset = config.ruleset()?;
    info!(path = %config_path.display(), session = %config.session_name, rules = ruleset.len(), "config loaded");
    if ruleset.is_empty() {
        warn!("no classification rules configured; every line will be unrecognized");
    }

    let client = TmuxClient::new(data_dir.join("captures"))
        .with_backlog_lines(config.backlog_lines)
        .with_poll_interval(config.poll_interval());
    let controller = Arc::new(SessionController::new(
        client,
        ControllerConfig::from_config(&config),
        ruleset,
    ));

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    // Initialize terminal
    let mut terminal = ratatui::init();

    // Spawn input handler
    let input_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            if event::poll(Duration::from_millis(100)).unwrap_or(false) {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.kind == KeyEventKind::Press {
                        let _ = input_tx.send(Action::KeyPress(key));
                    }
                }
            }
        }
    });

    // Forward state changes that arrive without a line
    let state_tx = tx.clone();
    let mut state_rx = controller.watch_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            if state_tx.send(Action::StateChanged(state)).is_err() {
                break;
            }
        }
    });

    // Spawn resource poller
    let metrics_tx = tx.clone();
    let names = config.server_process_names.clone();
    let keywords = config.server_process_keywords.clone();
    tokio::spawn(async move {
        let metrics = ProcMetrics::new();
        loop {
            let sample = match metrics.find_server_process(&names, &keywords) {
                Some(process) => match metrics.lookup(process.pid).await {
                    Ok(sample) => Some(sample),
                    Err(e) => {
                        debug!(pid = process.pid, command = %process.command, error = %e, "resource lookup failed");
                        None
                    }
                },
                None => None,
            };
            if metrics_tx.send(Action::Resources(sample)).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
    });

    // Create app state
    let mut app = App::new(&config);
    attach(&controller, &mut app, &tx, true).await;

    // Main event loop
    let result = loop {
        // Render
        terminal.draw(|f| app.render(f))?;

        // Process any pending actions from the app
        for pending_action in app.take_pending_actions() {
            match pending_action {
                Action::Submit(line) => {
                    if let Err(e) = controller.submit_command(line).await {
                        let hint = if e.requires_reattach() { " (Ctrl-R to reattach)" } else { "" };
                        app.handle_action(Action::Error(format!("{e}{hint}")))?;
                    }
                }
                Action::Reattach => attach(&controller, &mut app, &tx, false).await,
                Action::SaveConfig(settings) => match settings.save(&config_path).await {
                    Ok(()) => {
                        info!(path = %config_path.display(), "config saved");
                        app.handle_action(Action::Info("Settings saved".to_string()))?;
                    }
                    Err(e) => {
                        warn!(path = %config_path.display(), error = %e, "config save failed");
                        app.handle_action(Action::Error(format!("Saving settings failed: {e}")))?;
                    }
                },
                Action::CopyConsole(text) => match arboard::Clipboard::new() {
                    Ok(mut clipboard) => {
                        if let Err(e) = clipboard.set_text(text) {
                            app.message = Some(StatusMessage::Error(format!("Clipboard error: {}", e)));
                        } else {
                            app.handle_action(Action::Info("Console copied to clipboard!".to_string()))?;
                        }
                    }
                    Err(e) => {
                        app.message = Some(StatusMessage::Error(format!("Clipboard error: {}", e)));
                    }
                },
                _ => {}
            }
        }

        // Handle events from channel
        tokio::select! {
            Some(action) = rx.recv() => {
                match app.handle_action(action) {
                    Ok(should_quit) => {
                        if should_quit {
                            break Ok(());
                        }
                    }
                    Err(e) => {
                        break Err(e);
                    }
                }
            }
        }
    };

    // Restore terminal
    ratatui::restore();
    controller.detach().await;
    result
}

/// Attach (or reattach) to the configured session and stream its updates into the app
async fn attach(controller: &Controller, app: &mut App, tx: &mpsc::UnboundedSender<Action>, fresh: bool) {
    let attached = if fresh {
        controller.attach().await
    } else {
        controller.reattach().await
    };
    app.attachment += 1;
    app.state = controller.current_state();
    match attached {
        Ok((session, updates)) => {
            let target = session.target.as_deref().unwrap_or("?");
            app.message = Some(StatusMessage::Info(format!("Attached to '{}' ({})", session.name, target)));
            tokio::spawn(forward_updates(updates, tx.clone(), app.attachment));
        }
        Err(e) => {
            let _ = app.handle_action(Action::Error(format!("Attach failed: {}", e)));
        }
    }
    app.attached = controller.is_attached();
}

async fn forward_updates(mut updates: Subscription, tx: mpsc::UnboundedSender<Action>, attachment: u64) {
    while let Some(update) = updates.next().await {
        if tx.send(Action::Update(update)).is_err() {
            return;
        }
    }
    let _ = tx.send(Action::StreamEnded(attachment));
}
