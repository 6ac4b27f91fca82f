use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub address: String,
}

/// Read-only snapshot of known clients, loaded once per page and shared by
/// every resolver call in a session. Roster order is the match order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientRoster {
    clients: Vec<Client>,
}

impl ClientRoster {
    pub fn new(clients: Vec<Client>) -> Self {
        Self { clients }
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|client| client.name.as_str())
    }

    pub fn find(&self, id: &ClientId) -> Option<&Client> {
        self.clients.iter().find(|client| &client.id == id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl FromIterator<Client> for ClientRoster {
    fn from_iter<T: IntoIterator<Item = Client>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
