use std::borrow::Cow;

/// Address the forwarding pairs dial for the local service.
///
/// IPv6 literals are bracketed so the result parses as `host:port`.
pub fn local_service_addr(host: &str, port: u16) -> String {
    let host = host.trim();
    let host = if host.is_empty() { "localhost" } else { host };
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Host part of a `host:port` relay address, as shown to the user.
pub fn relay_host(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return Cow::Owned(format!("[{}]", &rest[..end]));
        }
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => Cow::Borrowed(host),
        _ => Cow::Borrowed(addr),
    }
}
