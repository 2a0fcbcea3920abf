//! Terminal front end for the chat relay.
//!
//! Commands:
//!   login NAME        register a display name with the server
//!   users             list who is online
//!   send ID TEXT...   send a direct message to the user with that id
//!   history ID        print the recorded conversation with that id
//!   quit              disconnect and exit

use async_std::prelude::FutureExt;
use async_std::prelude::*;
use async_std::{channel, io, task};
use chat_relay::cache::MessageCache;
use chat_relay::client::{ChatClient, ClientEvent};
use chat_relay::utils::ChatResult;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDRESS: &str = "localhost:34752";
const DEFAULT_DATA_DIR: &str = "./Data";

/// Given a string `input`, return `Some((token, rest))`, where `token` is the
/// first run of non-whitespace characters in `input`, and `rest` is the rest of
/// the string. If the string contains no non-whitespace characters, return
/// `None`.
fn next_token(mut input: &str) -> Option<(&str, &str)> {
    input = input.trim_start();

    if input.is_empty() {
        return None;
    }

    match input.find(char::is_whitespace) {
        Some(space) => Some((&input[0..space], &input[space..])),
        None => Some((input, "")),
    }
}

/// One parsed line of user input.
enum Command {
    Login(String),
    Users,
    Send { peer_id: u32, text: String },
    History(u32),
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let (command, rest) = next_token(line)?;
    match command {
        "login" => {
            let name = rest.trim();
            if name.is_empty() {
                return None;
            }
            Some(Command::Login(name.to_string()))
        }
        "users" => Some(Command::Users),
        "send" => {
            let (id, rest) = next_token(rest)?;
            let peer_id = id.parse().ok()?;
            let text = rest.trim_start().to_string();
            if text.is_empty() {
                return None;
            }
            Some(Command::Send { peer_id, text })
        }
        "history" => {
            let (id, rest) = next_token(rest)?;
            if !rest.trim().is_empty() {
                return None;
            }
            Some(Command::History(id.parse().ok()?))
        }
        "quit" => Some(Command::Quit),
        _ => None,
    }
}

fn main() -> ChatResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
    let data_dir =
        std::env::var("CHAT_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());

    task::block_on(async {
        let cache = MessageCache::new(data_dir);
        let (client, events) = ChatClient::connect(address.as_str(), cache).await?;

        println!("connected to {}; log in with: login NAME", address);

        // One task prints server events, another reads commands from
        // standard input. The process ends when either finishes.
        let showing = show_events(events, client.clone());
        let sending = send_commands(client);
        showing.race(sending).await?;

        Ok(())
    })
}

/// Print server-driven updates as they arrive.
async fn show_events(
    events: channel::Receiver<ClientEvent>,
    client: Arc<ChatClient>,
) -> ChatResult<()> {
    while let Ok(event) = events.recv().await {
        match event {
            ClientEvent::RosterChanged(users) => {
                let names: Vec<String> = users
                    .iter()
                    .map(|u| format!("{} (id {})", u.name, u.unique_id))
                    .collect();
                println!("online: {}", names.join(", "));
            }
            ClientEvent::PeerUpdated(peer_id) => {
                let name = client
                    .roster()
                    .into_iter()
                    .find(|u| u.unique_id == peer_id)
                    .map(|u| u.name)
                    .unwrap_or_else(|| format!("id {}", peer_id));
                println!("[conversation with {} updated]", name);
            }
            ClientEvent::ConnectionLost => {
                println!("connection to server lost");
                break;
            }
        }
    }

    Ok(())
}

/// Read commands from standard input and act on them.
async fn send_commands(client: Arc<ChatClient>) -> ChatResult<()> {
    let mut lines = io::BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next().await {
        let line = line?;
        let Some(command) = parse_command(&line) else {
            eprintln!("unrecognized command: {:?}", line);
            continue;
        };

        match command {
            Command::Login(name) => {
                let reply = client.submit_login(&name).await?;
                let me = reply.await?;
                println!("logged in as {} (id {})", me.name, me.unique_id);
            }
            Command::Users => {
                for user in client.roster() {
                    println!("{} (id {})", user.name, user.unique_id);
                }
            }
            Command::Send { peer_id, text } => {
                let target = client.roster().into_iter().find(|u| u.unique_id == peer_id);
                match target {
                    Some(user) => client.submit_message(&text, &user).await?,
                    None => eprintln!("no user with id {} is online", peer_id),
                }
            }
            Command::History(peer_id) => match client.history(peer_id).await {
                Ok(text) if text.is_empty() => println!("(no messages yet)"),
                Ok(text) => print!("{}", text),
                // A broken history file shouldn't take the session down.
                Err(_) => println!("(history unavailable)"),
            },
            Command::Quit => {
                client.request_shutdown().await;
                break;
            }
        }
    }

    Ok(())
}
