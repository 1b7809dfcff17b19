//! Server address normalisation.

/// Port used when the address carries none.
pub const DEFAULT_SERVER_PORT: u16 = 38281;

/// Turn user input into a WebSocket URL.
///
/// Strips a leading `/connect `, appends [`DEFAULT_SERVER_PORT`] when no
/// port is given and prefixes `ws://` unless a scheme is present. Returns
/// `None` for empty input.
#[must_use]
pub fn normalize_address(input: &str) -> Option<String> {
    let mut address = input.trim();
    if let Some(rest) = address.strip_prefix("/connect") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            address = rest.trim();
        }
    }
    if address.is_empty() {
        return None;
    }

    let (scheme, host) = if let Some(rest) = address.strip_prefix("wss://") {
        ("wss://", rest)
    } else if let Some(rest) = address.strip_prefix("ws://") {
        ("ws://", rest)
    } else {
        ("ws://", address)
    };

    let host = host.trim_end_matches('/');
    if has_port(host) {
        Some(format!("{scheme}{host}"))
    } else {
        Some(format!("{scheme}{host}:{DEFAULT_SERVER_PORT}"))
    }
}

fn has_port(host: &str) -> bool {
    host.rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}
