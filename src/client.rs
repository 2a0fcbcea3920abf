//! The client-side protocol engine.
//!
//! A [`ChatClient`] owns one socket to the relay server. A background
//! task reads envelopes from it and turns them into [`ClientEvent`]s on a
//! queue; the UI layer drains that queue on its own schedule, so network
//! timing never dictates rendering timing. Outbound calls
//! ([`ChatClient::submit_login`], [`ChatClient::submit_message`],
//! [`ChatClient::request_shutdown`]) may be issued from any task; writes
//! to the socket are serialized so frames never interleave on the wire.

use async_std::channel;
use async_std::net::{self, Shutdown};
use async_std::prelude::*;
use async_std::sync::Mutex as AsyncMutex;
use async_std::task;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cache::MessageCache;
use crate::utils::{self, ChatResult};
use crate::{Envelope, User};

/// Notifications from the network task to the UI-facing task.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server sent a fresh roster. This is the complete online list;
    /// the previous view should be replaced, not merged.
    RosterChanged(Vec<User>),

    /// The history file for this peer gained a line.
    PeerUpdated(u32),

    /// The connection to the server is gone. No reconnect is attempted.
    ConnectionLost,
}

/// State the receive loop and outbound callers both touch.
#[derive(Default)]
struct ClientState {
    /// Who we are, once a login has been answered.
    identity: Option<User>,

    /// The latest roster from the server.
    roster: Vec<User>,

    /// The name we logged in with, and where to deliver the identity
    /// once the server assigns an id.
    pending_login: Option<(String, oneshot::Sender<User>)>,
}

/// A live connection to the relay server.
pub struct ChatClient {
    outbound: AsyncMutex<net::TcpStream>,
    state: Mutex<ClientState>,
    events: channel::Sender<ClientEvent>,
    cache: MessageCache,
}

impl ChatClient {
    /// Connect to the server at `addr` and start the background receive
    /// loop. Returns the client handle and the event queue's receiving
    /// end.
    pub async fn connect(
        addr: impl net::ToSocketAddrs,
        cache: MessageCache,
    ) -> ChatResult<(Arc<ChatClient>, channel::Receiver<ClientEvent>)> {
        let socket = net::TcpStream::connect(addr).await?;
        let (events, event_queue) = channel::unbounded();

        let client = Arc::new(ChatClient {
            outbound: AsyncMutex::new(socket.clone()),
            state: Mutex::new(ClientState::default()),
            events,
            cache,
        });

        task::spawn(utils::log_error(receive_loop(client.clone(), socket)));

        Ok((client, event_queue))
    }

    /// Ask the server to register `name`. The returned receiver resolves
    /// with our full identity once the login reply arrives.
    pub async fn submit_login(&self, name: &str) -> ChatResult<oneshot::Receiver<User>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            state.pending_login = Some((name.to_string(), tx));
        }

        self.send_envelope(&Envelope::LoginRequest {
            name: name.to_string(),
        })
        .await?;
        Ok(rx)
    }

    /// Send `text` to `to`, and record the optimistic local echo in the
    /// history for that peer. Delivery is best-effort: if the recipient
    /// goes offline in flight, the server drops the message silently.
    pub async fn submit_message(&self, text: &str, to: &User) -> ChatResult<()> {
        let me = self.identity().ok_or("not logged in yet")?;

        self.send_envelope(&Envelope::Plain {
            from: me.clone(),
            to: to.clone(),
            text: text.to_string(),
        })
        .await?;

        self.cache
            .append_line(me.unique_id, to.unique_id, &format!("You: {}", text))
            .await?;
        let _ = self
            .events
            .send(ClientEvent::PeerUpdated(to.unique_id))
            .await;
        Ok(())
    }

    /// Leave the chat: tell the server we're going (best-effort), close
    /// the socket, and remove this session's history files.
    pub async fn request_shutdown(&self) {
        let me = self.identity();

        if let Some(me) = &me {
            // The server also detects the closed socket on its own, so a
            // failed disconnect notice is not worth surfacing.
            if let Err(err) = self
                .send_envelope(&Envelope::Disconnect {
                    user_id: me.unique_id,
                })
                .await
            {
                debug!("disconnect notice not sent: {}", err);
            }
        }

        let socket = self.outbound.lock().await;
        if let Err(err) = socket.shutdown(Shutdown::Both) {
            debug!("socket shutdown: {}", err);
        }
        drop(socket);

        if let Some(me) = me {
            if let Err(err) = self.cache.delete_all(me.unique_id).await {
                warn!("could not clear message history: {}", err);
            }
        }
    }

    /// The recorded conversation with `peer_id`.
    pub async fn history(&self, peer_id: u32) -> ChatResult<String> {
        let me = self.identity().ok_or("not logged in yet")?;
        Ok(self.cache.read_all(me.unique_id, peer_id).await?)
    }

    /// Our identity, once the server has assigned one.
    pub fn identity(&self) -> Option<User> {
        self.state.lock().unwrap().identity.clone()
    }

    /// The latest roster received from the server.
    pub fn roster(&self) -> Vec<User> {
        self.state.lock().unwrap().roster.clone()
    }

    /// Write one envelope to the socket. The async mutex keeps two
    /// callers' frames from interleaving.
    async fn send_envelope(&self, envelope: &Envelope) -> ChatResult<()> {
        let mut socket = self.outbound.lock().await;
        utils::send_as_json(&mut socket, envelope).await
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::LoginReply { user_id } => {
                let resolved = {
                    let mut state = self.state.lock().unwrap();
                    state.pending_login.take().map(|(name, reply)| {
                        let me = User::new(user_id, name);
                        state.identity = Some(me.clone());
                        (me, reply)
                    })
                };
                match resolved {
                    Some((me, reply)) => {
                        info!("logged in as {} (id {})", me.name, me.unique_id);
                        let _ = reply.send(me);
                    }
                    None => warn!("login reply with no login pending; ignoring"),
                }
            }

            Envelope::Roster { users } => {
                self.state.lock().unwrap().roster = users.clone();
                let _ = self.events.send(ClientEvent::RosterChanged(users)).await;
            }

            Envelope::Plain { from, text, .. } => {
                let Some(me) = self.identity() else {
                    warn!("chat message arrived before login; ignoring");
                    return;
                };
                let line = format!("{}: {}", from.name, text);
                // A history write failure loses the line but not the
                // connection.
                if let Err(err) = self
                    .cache
                    .append_line(me.unique_id, from.unique_id, &line)
                    .await
                {
                    warn!("could not record message: {}", err);
                }
                let _ = self
                    .events
                    .send(ClientEvent::PeerUpdated(from.unique_id))
                    .await;
            }

            other => {
                warn!("unexpected envelope from server: {:?}", other);
            }
        }
    }
}

/// Read envelopes from the server until the connection drops.
async fn receive_loop(client: Arc<ChatClient>, socket: net::TcpStream) -> ChatResult<()> {
    let mut inbound = utils::receive_as_json::<_, Envelope>(async_std::io::BufReader::new(socket));

    while let Some(envelope) = inbound.next().await {
        match envelope {
            Ok(envelope) => client.handle_envelope(envelope).await,
            Err(err) if err.is::<io::Error>() => {
                warn!("connection to server lost: {}", err);
                break;
            }
            Err(err) => {
                // One bad frame doesn't cost us the connection.
                warn!("discarding undecodable frame: {}", err);
            }
        }
    }

    let _ = client.events.send(ClientEvent::ConnectionLost).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::io::BufReader;
    use async_std::net::{TcpListener, TcpStream};

    /// A scripted stand-in for the relay server: accepts one client and
    /// hands the test its socket.
    async fn fake_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    async fn next_envelope(
        inbound: &mut (impl Stream<Item = ChatResult<Envelope>> + Unpin),
    ) -> Envelope {
        inbound.next().await.unwrap().unwrap()
    }

    #[test]
    fn login_resolves_with_assigned_id() {
        task::block_on(async {
            let (listener, addr) = fake_server().await;
            let dir = tempfile::tempdir().unwrap();
            let (client, _events) =
                ChatClient::connect(addr.as_str(), MessageCache::new(dir.path().to_path_buf()))
                    .await
                    .unwrap();

            let (mut server_side, _) = listener.accept().await.unwrap();
            let reply = client.submit_login("Alice").await.unwrap();

            let mut inbound =
                utils::receive_as_json::<_, Envelope>(BufReader::new(server_side.clone()));
            assert_eq!(
                next_envelope(&mut inbound).await,
                Envelope::LoginRequest {
                    name: "Alice".to_string()
                }
            );

            utils::send_as_json(&mut server_side, &Envelope::LoginReply { user_id: 5 })
                .await
                .unwrap();

            let me = reply.await.unwrap();
            assert_eq!(me, User::new(5, "Alice"));
            assert_eq!(client.identity(), Some(me));
        });
    }

    #[test]
    fn roster_replaces_previous_view() {
        task::block_on(async {
            let (listener, addr) = fake_server().await;
            let dir = tempfile::tempdir().unwrap();
            let (client, events) =
                ChatClient::connect(addr.as_str(), MessageCache::new(dir.path().to_path_buf()))
                    .await
                    .unwrap();
            let (mut server_side, _) = listener.accept().await.unwrap();

            let first = vec![User::new(0, "Alice"), User::new(1, "Bob")];
            utils::send_as_json(
                &mut server_side,
                &Envelope::Roster {
                    users: first.clone(),
                },
            )
            .await
            .unwrap();
            assert_eq!(
                events.recv().await.unwrap(),
                ClientEvent::RosterChanged(first)
            );

            let second = vec![User::new(0, "Alice")];
            utils::send_as_json(
                &mut server_side,
                &Envelope::Roster {
                    users: second.clone(),
                },
            )
            .await
            .unwrap();
            assert_eq!(
                events.recv().await.unwrap(),
                ClientEvent::RosterChanged(second.clone())
            );
            assert_eq!(client.roster(), second);
        });
    }

    #[test]
    fn incoming_message_lands_in_history() {
        task::block_on(async {
            let (listener, addr) = fake_server().await;
            let dir = tempfile::tempdir().unwrap();
            let (client, events) =
                ChatClient::connect(addr.as_str(), MessageCache::new(dir.path().to_path_buf()))
                    .await
                    .unwrap();
            let (mut server_side, _) = listener.accept().await.unwrap();

            let reply = client.submit_login("Bob").await.unwrap();
            let mut inbound =
                utils::receive_as_json::<_, Envelope>(BufReader::new(server_side.clone()));
            let _ = next_envelope(&mut inbound).await;
            utils::send_as_json(&mut server_side, &Envelope::LoginReply { user_id: 1 })
                .await
                .unwrap();
            let me = reply.await.unwrap();

            utils::send_as_json(
                &mut server_side,
                &Envelope::Plain {
                    from: User::new(0, "Alice"),
                    to: me.clone(),
                    text: "hi".to_string(),
                },
            )
            .await
            .unwrap();

            assert_eq!(events.recv().await.unwrap(), ClientEvent::PeerUpdated(0));
            assert_eq!(client.history(0).await.unwrap(), "Alice: hi\n");
        });
    }

    #[test]
    fn sent_message_echoes_locally() {
        task::block_on(async {
            let (listener, addr) = fake_server().await;
            let dir = tempfile::tempdir().unwrap();
            let (client, events) =
                ChatClient::connect(addr.as_str(), MessageCache::new(dir.path().to_path_buf()))
                    .await
                    .unwrap();
            let (mut server_side, _) = listener.accept().await.unwrap();

            let reply = client.submit_login("Alice").await.unwrap();
            let mut inbound =
                utils::receive_as_json::<_, Envelope>(BufReader::new(server_side.clone()));
            let _ = next_envelope(&mut inbound).await;
            utils::send_as_json(&mut server_side, &Envelope::LoginReply { user_id: 0 })
                .await
                .unwrap();
            let me = reply.await.unwrap();

            let bob = User::new(1, "Bob");
            client.submit_message("hi", &bob).await.unwrap();

            // The wire sees the full envelope; the history sees the echo.
            assert_eq!(
                next_envelope(&mut inbound).await,
                Envelope::Plain {
                    from: me,
                    to: bob,
                    text: "hi".to_string(),
                }
            );
            assert_eq!(events.recv().await.unwrap(), ClientEvent::PeerUpdated(1));
            assert_eq!(client.history(1).await.unwrap(), "You: hi\n");
        });
    }

    #[test]
    fn shutdown_sends_disconnect_and_clears_history() {
        task::block_on(async {
            let (listener, addr) = fake_server().await;
            let dir = tempfile::tempdir().unwrap();
            let cache = MessageCache::new(dir.path().to_path_buf());
            let (client, _events) = ChatClient::connect(addr.as_str(), cache.clone())
                .await
                .unwrap();
            let (mut server_side, _) = listener.accept().await.unwrap();

            let reply = client.submit_login("Alice").await.unwrap();
            let mut inbound =
                utils::receive_as_json::<_, Envelope>(BufReader::new(server_side.clone()));
            let _ = next_envelope(&mut inbound).await;
            utils::send_as_json(&mut server_side, &Envelope::LoginReply { user_id: 4 })
                .await
                .unwrap();
            reply.await.unwrap();

            let bob = User::new(1, "Bob");
            client.submit_message("bye", &bob).await.unwrap();
            let _ = next_envelope(&mut inbound).await;

            client.request_shutdown().await;

            assert_eq!(
                next_envelope(&mut inbound).await,
                Envelope::Disconnect { user_id: 4 }
            );
            assert_eq!(cache.read_all(4, 1).await.unwrap(), "");
        });
    }

    #[test]
    fn server_hangup_emits_connection_lost() {
        task::block_on(async {
            let (listener, addr) = fake_server().await;
            let dir = tempfile::tempdir().unwrap();
            let (_client, events) =
                ChatClient::connect(addr.as_str(), MessageCache::new(dir.path().to_path_buf()))
                    .await
                    .unwrap();
            let (server_side, _) = listener.accept().await.unwrap();

            drop(server_side);

            assert_eq!(events.recv().await.unwrap(), ClientEvent::ConnectionLost);
        });
    }

    #[test]
    fn corrupt_frame_does_not_end_the_session() {
        task::block_on(async {
            let (listener, addr) = fake_server().await;
            let dir = tempfile::tempdir().unwrap();
            let (client, events) =
                ChatClient::connect(addr.as_str(), MessageCache::new(dir.path().to_path_buf()))
                    .await
                    .unwrap();
            let (mut server_side, _) = listener.accept().await.unwrap();

            server_side.write_all(b"this is not json\n").await.unwrap();
            utils::send_as_json(
                &mut server_side,
                &Envelope::Roster {
                    users: vec![User::new(0, "Alice")],
                },
            )
            .await
            .unwrap();

            // The bad line is skipped; the roster after it still arrives.
            assert_eq!(
                events.recv().await.unwrap(),
                ClientEvent::RosterChanged(vec![User::new(0, "Alice")])
            );
            assert_eq!(client.roster(), vec![User::new(0, "Alice")]);
        });
    }

    #[test]
    fn invalid_utf8_frame_does_not_end_the_session() {
        task::block_on(async {
            let (listener, addr) = fake_server().await;
            let dir = tempfile::tempdir().unwrap();
            let (client, events) =
                ChatClient::connect(addr.as_str(), MessageCache::new(dir.path().to_path_buf()))
                    .await
                    .unwrap();
            let (mut server_side, _) = listener.accept().await.unwrap();

            // Raw non-UTF-8 bytes must read as one bad frame, not as a
            // lost connection.
            server_side.write_all(&[0xff, 0xfe, 0xfd, b'\n']).await.unwrap();
            utils::send_as_json(
                &mut server_side,
                &Envelope::Roster {
                    users: vec![User::new(0, "Alice")],
                },
            )
            .await
            .unwrap();

            assert_eq!(
                events.recv().await.unwrap(),
                ClientEvent::RosterChanged(vec![User::new(0, "Alice")])
            );
            assert_eq!(client.roster(), vec![User::new(0, "Alice")]);
        });
    }
}
