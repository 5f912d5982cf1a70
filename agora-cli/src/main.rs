//! `agora`: join a room from the terminal.
//!
//! ```text
//! agora <room-id>
//! ```
//!
//! Configuration comes from `AGORA_*` environment variables. Lines typed on
//! stdin are sent as chat; `/older` pages history, `/who` lists members,
//! `/quit` (or EOF, or Ctrl-C) leaves the room.

use std::process::ExitCode;
use std::sync::Arc;

use agora_sync::{
    ChatMessage, ConnectionState, HttpRoomApi, RoomEvent, RoomSession, SyncConfig,
};
use chrono::Utc;
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let Some(room_id) = std::env::args().nth(1) else {
        eprintln!("usage: agora <room-id>");
        return ExitCode::from(2);
    };

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    let api = match HttpRoomApi::new(&config) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    info!("Joining room {room_id}...");
    let session = match RoomSession::enter(&config, api, room_id).await {
        Ok(session) => session,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match session.load_initial().await {
        Ok(messages) => messages.iter().for_each(print_message),
        Err(e) => error!("{e}"),
    }

    let (mut events, _subscription) = session.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&session, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.leave().await;
    ExitCode::SUCCESS
}

/// Returns false when the user asked to quit.
async fn handle_line(session: &RoomSession, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/older" => match session.load_older().await {
            Ok(messages) => {
                println!("── {} messages{} ──", messages.len(), if session.has_older() { "" } else { " (start of room)" });
                messages.iter().for_each(print_message);
            }
            Err(e) => error!("{e}"),
        },
        "/who" => {
            for entry in session.members(Utc::now()) {
                let status = if entry.online { "online" } else { "away" };
                println!("  {} ({status})", entry.member.label());
            }
        }
        text => {
            if session.connection_state() != ConnectionState::Open {
                println!("(not connected; message not sent)");
            } else {
                session.send_chat(text);
            }
        }
    }
    true
}

fn print_message(msg: &ChatMessage) {
    println!(
        "[{}] {}: {}",
        msg.created_at.format("%H:%M:%S"),
        msg.user_id,
        msg.text
    );
}

fn print_event(event: &RoomEvent) {
    match event {
        RoomEvent::Opened => println!("── connected ──"),
        RoomEvent::Closed => println!("── disconnected ──"),
        RoomEvent::TransportError { detail } => println!("── connection error: {detail} ──"),
        RoomEvent::PresenceSnapshot { members } => println!("── {} in room ──", members.len()),
        RoomEvent::PeerJoined { member } => println!("── {} joined ──", member.label()),
        RoomEvent::PeerLeft { member_id } => println!("── user {member_id} left ──"),
        RoomEvent::ChatMessage(msg) => print_message(msg),
        RoomEvent::ChatAck { .. } => {}
    }
}
