//! Physical address helpers.
//!
//! A physical address is a `host:port` string, with bracketing for
//! multi-colon (IPv6) hosts: `[a:b:c:d]:port`.

use crate::{RouterError, RouterResult};

/// Return the host portion of a `host:port` address.
///
/// Fails with [`RouterError::NotFoundPort`] when the colon-terminated
/// suffix is not a positive integer. On failure the input is returned
/// unchanged alongside the error so callers can log it.
pub fn strip_port(addr: &str) -> RouterResult<&str> {
    let idx = addr.rfind(':').ok_or(RouterError::NotFoundPort)?;
    let (host, port) = (&addr[..idx], &addr[idx + 1..]);

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RouterError::NotFoundPort);
    }
    // A bare IPv6 host without brackets would split mid-address.
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(RouterError::NotFoundPort);
    }

    Ok(host)
}

/// Split an address into host and numeric port.
pub fn split_addr(addr: &str) -> RouterResult<(&str, u16)> {
    let host = strip_port(addr)?;
    let port = addr[host.len() + 1..]
        .parse::<u16>()
        .map_err(|_| RouterError::NotFoundPort)?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        let cases: &[(&str, Option<&str>)] = &[
            ("test:123", Some("test")),
            ("test:test", None),
            ("test", None),
            ("[test:test:test:test]:123", Some("[test:test:test:test]")),
            ("[test:test:test:test]:test", None),
        ];

        for (addr, want) in cases {
            match (strip_port(addr), want) {
                (Ok(host), Some(expected)) => assert_eq!(&host, expected, "addr {}", addr),
                (Err(RouterError::NotFoundPort), None) => {}
                (got, _) => panic!("strip_port({}) = {:?}, want {:?}", addr, got, want),
            }
        }
    }

    #[test]
    fn test_split_addr() {
        let (host, port) = split_addr("node1:3000").unwrap();
        assert_eq!(host, "node1");
        assert_eq!(port, 3000);

        assert!(split_addr("node1:99999").is_err());
    }
}
