use std::borrow::Cow;

use anyhow::Context;

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "bind on all interfaces". `SocketAddr`
/// parsing and the Tokio bind APIs do not accept `":PORT"`, so it is
/// rewritten to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Join a host and port into a dialable address, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Split a `host:port` address, unbracketing IPv6 hosts.
pub fn split_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let s = addr.trim();
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("address {s:?} is missing a port"))?;
    let port: u16 = port
        .trim()
        .parse()
        .with_context(|| format!("address {s:?} has an invalid port"))?;

    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        anyhow::bail!("address {s:?} is missing a host");
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("localhost", 22), "localhost:22");
        assert_eq!(join_host_port("::1", 22), "[::1]:22");
        assert_eq!(join_host_port("[::1]", 22), "[::1]:22");
    }

    #[test]
    fn split_host_port_roundtrips() {
        assert_eq!(
            split_host_port("localhost:9000").unwrap(),
            ("localhost".into(), 9000)
        );
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1".into(), 80));
    }

    #[test]
    fn split_host_port_rejects_bad_input() {
        assert!(split_host_port("localhost").is_err());
        assert!(split_host_port(":9000").is_err());
        assert!(split_host_port("host:notaport").is_err());
    }
}
