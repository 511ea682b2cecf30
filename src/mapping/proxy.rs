use std::net::Ipv6Addr;

/// PROXY protocol header announcing `ip` as the source of a local connection.
///
/// The destination is always the loopback address of the matching family and
/// both ports are fixed placeholders.
pub fn preamble(ip: &str) -> String {
    if ip.parse::<Ipv6Addr>().is_ok() {
        format!("PROXY TCP6 {ip} ::1 1024 1024\r\n")
    } else {
        format!("PROXY TCP4 {ip} 127.0.0.1 1024 1024\r\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_family() {
        assert_eq!(
            preamble("203.0.113.5"),
            "PROXY TCP4 203.0.113.5 127.0.0.1 1024 1024\r\n"
        );
        assert_eq!(
            preamble("2001:db8::7"),
            "PROXY TCP6 2001:db8::7 ::1 1024 1024\r\n"
        );
    }
}
