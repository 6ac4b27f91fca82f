use crate::domain::client::{Client, ClientRoster};

/// Maps a free-text client name onto the roster.
///
/// A client matches when its stored name contains the query, compared
/// case-insensitively after trimming the query. The first match in roster
/// order wins. Empty or blank queries never match.
pub fn resolve_client<'a>(name: Option<&str>, roster: &'a ClientRoster) -> Option<&'a Client> {
    let needle = normalize_name(name?);
    if needle.is_empty() {
        return None;
    }

    roster.clients().iter().find(|client| normalize_name(&client.name).contains(&needle))
}

fn normalize_name(text: &str) -> String {
    text.trim().to_lowercase()
}
