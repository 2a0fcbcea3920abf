//! The server's record of who is online and how to reach them.

use async_std::net::SocketAddr;
use chat_relay::User;
use std::sync::Mutex;
use tracing::info;

use crate::outbound::Outbound;

/// How the server addresses one connected client: the id assigned at
/// login, the peer address the connection arrived from, and the queue
/// that writes to its socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub client_id: u32,
    pub peer_addr: SocketAddr,
    pub outbound: Outbound,
}

/// The single source of truth for online users, guarded by one lock so
/// every membership change and every snapshot sees both lists in a
/// consistent state.
pub struct Registry(Mutex<RegistryInner>);

struct RegistryInner {
    online_users: Vec<User>,
    connections: Vec<ConnectionHandle>,
    next_user_id: u32,
}

impl Registry {
    pub fn new() -> Registry {
        Registry(Mutex::new(RegistryInner {
            online_users: Vec::new(),
            connections: Vec::new(),
            next_user_id: 0,
        }))
    }

    /// Hand out a fresh user id. Ids start at zero, grow strictly, and
    /// are never reused, even after the user disconnects.
    pub fn allocate_user_id(&self) -> u32 {
        let mut inner = self.0.lock().unwrap();
        let id = inner.next_user_id;
        inner.next_user_id += 1;
        id
    }

    /// Record a newly logged-in user and its connection in one step, so
    /// no snapshot ever sees one list updated without the other.
    pub fn add_user(&self, user: User, handle: ConnectionHandle) {
        let mut inner = self.0.lock().unwrap();
        inner.online_users.push(user);
        inner.connections.push(handle);
    }

    /// Drop the user with this id and the connection from this peer
    /// address. Either may already be gone; whatever is still present is
    /// removed.
    pub fn remove_user(&self, user_id: u32, peer_addr: SocketAddr) {
        let mut inner = self.0.lock().unwrap();

        let mut name = "unknown user".to_string();
        if let Some(at) = inner
            .online_users
            .iter()
            .position(|u| u.unique_id == user_id)
        {
            name = inner.online_users.remove(at).name;
        }

        if let Some(at) = inner
            .connections
            .iter()
            .position(|c| c.peer_addr == peer_addr)
        {
            inner.connections.remove(at);
        }

        info!("user {} ({}) has disconnected", user_id, name);
    }

    /// A copy of the current online list. Callers may serialize and send
    /// it at leisure; later registry changes won't show through.
    pub fn snapshot_users(&self) -> Vec<User> {
        self.0.lock().unwrap().online_users.clone()
    }

    /// A copy of the current connection handles.
    pub fn snapshot_connections(&self) -> Vec<ConnectionHandle> {
        self.0.lock().unwrap().connections.clone()
    }
}
