//! Console input parsing.

use apclient_session::UserCommand;

const ITEMS_USAGE: &str = "Usage: /items on|off";

/// Parse one console line.
///
/// Returns `Ok(None)` for a blank line and `Err` with usage text for a
/// malformed local command.
pub fn parse_line(line: &str) -> Result<Option<UserCommand>, &'static str> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let mut words = line.split_whitespace();
    let command = match words.next() {
        Some("/connect") => UserCommand::Connect {
            address: words.next().unwrap_or_default().to_string(),
            password: words.next().map(str::to_string),
        },
        Some("/disconnect") => UserCommand::Disconnect,
        Some("/sync") => UserCommand::Sync,
        Some("/items") => match words.next() {
            Some("on") => UserCommand::SetReceiveItems(true),
            Some("off") => UserCommand::SetReceiveItems(false),
            _ => return Err(ITEMS_USAGE),
        },
        Some("/quit" | "/exit") => UserCommand::Shutdown,
        _ => UserCommand::Say(line.to_string()),
    };
    Ok(Some(command))
}
