#![deny(clippy::all)]

mod app;
mod audio;
mod config;
mod connection;
mod error;
mod media;
mod mode;
mod preferences;
mod protocol;
mod transcript;

use app::{AppEvent, ChatApp, PlaybackFactory, UserCommand};
use audio::playback::{CpalPlayback, DiscardPlayback, PlaybackDevice};
use audio::CpalMicrophone;
use connection::Connection;
use media::PatternSource;
use mode::ModeController;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use transcript::TranscriptLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = config::load_config()?;
    let language = preferences::get_language_code();
    let dev_mode = preferences::get_dev_mode();

    let connection = Connection::new(config.server.url);
    let modes = ModeController::new(CpalMicrophone::default(), PatternSource::default());
    let playback_factory: PlaybackFactory = Box::new(|| match CpalPlayback::open() {
        Ok(device) => Ok(Box::new(device) as Box<dyn PlaybackDevice>),
        Err(e) => {
            warn!("No output device, discarding agent audio: {e}");
            Ok(Box::new(DiscardPlayback))
        }
    });

    // Print finished transcript entries as they land
    let (render_tx, mut render_rx) = mpsc::unbounded_channel::<transcript::TranscriptEntry>();
    tokio::spawn(async move {
        while let Some(entry) = render_rx.recv().await {
            println!("[{}] {}", entry.at().format("%H:%M:%S"), entry);
        }
    });
    let log = TranscriptLog::with_listener(render_tx);

    let (events_tx, events_rx) = mpsc::channel(64);
    let mut chat = ChatApp::new(
        connection,
        modes,
        log,
        playback_factory,
        language,
        dev_mode,
        events_tx.clone(),
    );
    chat.connect()?;

    spawn_command_reader(events_tx);
    chat.run(events_rx).await;
    Ok(())
}

/// Reads slash commands and chat lines from stdin.
fn spawn_command_reader(events_tx: mpsc::Sender<AppEvent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(command) = parse_command(&line) else {
                        continue;
                    };
                    let quit = command == UserCommand::Quit;
                    if events_tx.send(AppEvent::Command(command)).await.is_err() || quit {
                        return;
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    let _ = events_tx.send(AppEvent::Command(UserCommand::Quit)).await;
                    return;
                }
                Err(e) => {
                    warn!("failed to read stdin: {e}");
                    return;
                }
            }
        }
    });
}

/// Maps one input line to a command. Lines without a leading slash are chat
/// text; unknown slash commands print usage and map to nothing. Settings
/// commands write preferences directly since session parameters are frozen
/// until restart.
fn parse_command(line: &str) -> Option<UserCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(UserCommand::SendText(line.to_string()));
    }

    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "/audio" if arg == "stop" => Some(UserCommand::StopAudio),
        "/audio" => Some(UserCommand::StartAudio),
        "/webcam" if arg == "stop" => Some(UserCommand::StopWebcam),
        "/webcam" => Some(UserCommand::StartWebcam),
        "/screen" if arg == "stop" => Some(UserCommand::StopScreen),
        "/screen" => Some(UserCommand::StartScreen),
        "/image" if !arg.is_empty() => Some(UserCommand::UploadImage(PathBuf::from(arg))),
        "/image" => {
            println!("usage: /image <path>");
            None
        }
        "/lang" if !arg.is_empty() => {
            match preferences::set_language_code(arg) {
                Ok(()) => println!("Language set to {}. Takes effect on next run.", arg),
                Err(e) => warn!("could not save language: {e}"),
            }
            None
        }
        "/dev" => {
            let enabled = arg != "off";
            match preferences::set_dev_mode(enabled) {
                Ok(()) => println!(
                    "Dev mode {}. Takes effect on next run.",
                    if enabled { "on" } else { "off" }
                ),
                Err(e) => warn!("could not save dev mode: {e}"),
            }
            None
        }
        "/status" => Some(UserCommand::ShowStatus),
        "/quit" | "/exit" => Some(UserCommand::Quit),
        other => {
            println!(
                "unknown command {}. Commands: /audio, /webcam, /screen [stop], /image <path>, /lang <code>, /dev [off], /status, /quit",
                other
            );
            None
        }
    }
}
