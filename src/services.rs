//! Well-known TCP port to service-class lookup, used to bucket persisted
//! artifacts by protocol.

/// Returns the service class for a destination port, or None when the port
/// is not registered. Only `"tcp"` is populated.
pub fn lookup_service_by_port(port: u16, proto: &str) -> Option<&'static str> {
    if proto != "tcp" {
        return None;
    }
    let name = match port {
        20 | 21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 | 465 | 587 => "smtp",
        53 => "domain",
        80 | 8080 => "http",
        110 => "pop3",
        143 => "imap",
        389 => "ldap",
        443 | 8443 => "https",
        445 => "smb",
        993 => "imaps",
        995 => "pop3s",
        1433 => "mssql",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgres",
        5900 => "vnc",
        6379 => "redis",
        9200 => "elasticsearch",
        27017 => "mongodb",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_ports() {
        assert_eq!(lookup_service_by_port(80, "tcp"), Some("http"));
        assert_eq!(lookup_service_by_port(21, "tcp"), Some("ftp"));
        assert_eq!(lookup_service_by_port(443, "tcp"), Some("https"));
    }

    #[test]
    fn test_lookup_misses() {
        assert_eq!(lookup_service_by_port(54321, "tcp"), None);
        assert_eq!(lookup_service_by_port(80, "udp"), None);
    }
}
