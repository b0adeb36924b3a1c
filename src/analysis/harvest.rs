// SPDX-License-Identifier: MIT
//! Pluggable credential extraction over reconstructed conversations.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A credential record extracted from a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub service: String,
    pub user: String,
    pub password: String,
    pub ident: String,
    pub captured_at: DateTime<Utc>,
}

/// Scans a raw conversation for credentials. Harvesters run in order when a
/// conversation is persisted; the first match wins.
pub trait CredentialHarvester: Send + Sync {
    fn harvest(
        &self,
        data: &[u8],
        ident: &str,
        first_packet: DateTime<Utc>,
    ) -> Option<Credentials>;
}

/// Matches the FTP `USER`/`PASS` command pair.
pub struct FtpHarvester;

impl CredentialHarvester for FtpHarvester {
    fn harvest(
        &self,
        data: &[u8],
        ident: &str,
        first_packet: DateTime<Utc>,
    ) -> Option<Credentials> {
        let text = std::str::from_utf8(data).ok()?;
        let mut user: Option<&str> = None;
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(u) = line.strip_prefix("USER ") {
                user = Some(u.trim());
            } else if let Some(p) = line.strip_prefix("PASS ") {
                if let Some(u) = user {
                    return Some(Credentials {
                        service: "ftp".to_string(),
                        user: u.to_string(),
                        password: p.trim().to_string(),
                        ident: ident.to_string(),
                        captured_at: first_packet,
                    });
                }
            }
        }
        None
    }
}

/// The harvesters shipped with the analyzer.
pub fn default_harvesters() -> Vec<Box<dyn CredentialHarvester>> {
    vec![Box::new(FtpHarvester)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn when() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_ftp_user_pass_pair() {
        let convo = b"220 ready\r\nUSER alice\r\n331 ok\r\nPASS hunter2\r\n230 in\r\n";
        let creds = FtpHarvester
            .harvest(convo, "10.0.0.1:49152->10.0.0.2:21", when())
            .unwrap();
        assert_eq!(creds.service, "ftp");
        assert_eq!(creds.user, "alice");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn test_ftp_pass_without_user_is_ignored() {
        assert!(FtpHarvester.harvest(b"PASS lonely\r\n", "x", when()).is_none());
        assert!(FtpHarvester.harvest(b"\xff\xfe\x00", "x", when()).is_none());
    }
}
