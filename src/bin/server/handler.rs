//! One task per connected client: decode its envelope stream, mutate the
//! registry, route chat messages, and rebroadcast the roster on every
//! membership change.

use async_std::io::BufReader;
use async_std::net;
use async_std::prelude::*;
use chat_relay::utils::{self, ChatResult};
use chat_relay::{Envelope, User};
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::outbound::Outbound;
use crate::registry::{ConnectionHandle, Registry};

/// Serve one client until it disconnects or its socket fails.
pub async fn serve_connection(socket: net::TcpStream, registry: Arc<Registry>) -> ChatResult<()> {
    let peer_addr = socket.peer_addr()?;
    let outbound = Outbound::new(socket.clone());

    // Set at login; an implicit disconnect removes this id.
    let mut user_id: Option<u32> = None;

    let mut inbound = utils::receive_as_json::<_, Envelope>(BufReader::new(socket));
    while let Some(envelope) = inbound.next().await {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(err) if err.is::<io::Error>() => {
                // Transport fault: treat like a disconnect from whoever
                // this connection last claimed to be.
                warn!("read from {} failed: {}", peer_addr, err);
                break;
            }
            Err(err) => {
                warn!("discarding undecodable frame from {}: {}", peer_addr, err);
                continue;
            }
        };

        match envelope {
            Envelope::LoginRequest { name } => {
                // A second registration from the same connection would
                // leave a stale handle behind at disconnect time.
                if user_id.is_some() {
                    warn!("client {} is already logged in; ignoring repeat login", peer_addr);
                    continue;
                }

                let id = registry.allocate_user_id();
                let user = User::new(id, name);
                info!("new user {} (id {}) from {}", user.name, id, peer_addr);

                registry.add_user(
                    user,
                    ConnectionHandle {
                        client_id: id,
                        peer_addr,
                        outbound: outbound.clone(),
                    },
                );
                user_id = Some(id);

                if outbound.send(Envelope::LoginReply { user_id: id }).is_err() {
                    warn!("login reply to {} not sent; client gone", peer_addr);
                }
                broadcast_roster(&registry);
            }

            Envelope::Plain { ref to, .. } => {
                let target = registry
                    .snapshot_connections()
                    .into_iter()
                    .find(|c| c.client_id == to.unique_id);
                match target {
                    Some(handle) => {
                        // Forward the envelope verbatim; the recipient
                        // sees exactly what the sender wrote.
                        if handle.outbound.send(envelope.clone()).is_err() {
                            warn!("recipient {} hung up; message dropped", to.unique_id);
                        }
                    }
                    None => {
                        debug!("recipient {} not online; message dropped", to.unique_id);
                    }
                }
            }

            Envelope::Disconnect { user_id: id } => {
                registry.remove_user(id, peer_addr);
                broadcast_roster(&registry);
                user_id = None;
                break;
            }

            Envelope::Connect | Envelope::Roster { .. } => {
                warn!("unexpected envelope kind from client {}; ignoring", peer_addr);
            }

            Envelope::LoginReply { .. } => {
                warn!("client {} sent a login reply; ignoring", peer_addr);
            }
        }
    }

    // Reached on socket failure or end-of-stream without an explicit
    // disconnect.
    if let Some(id) = user_id {
        registry.remove_user(id, peer_addr);
        broadcast_roster(&registry);
    }

    Ok(())
}

/// Send a copy of the current online list to every known connection. A
/// handle whose client has just vanished is logged and skipped; the rest
/// still get the roster.
pub fn broadcast_roster(registry: &Registry) {
    let users = registry.snapshot_users();
    for handle in registry.snapshot_connections() {
        let roster = Envelope::Roster {
            users: users.clone(),
        };
        if handle.outbound.send(roster).is_err() {
            warn!("roster not sent to client {}; client gone", handle.client_id);
        }
    }
}
