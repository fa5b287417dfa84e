//! What each protocol backend can do and how it spells it.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Direction;
use crate::capabilities::{Capability, CapabilityStore, Tri};
use crate::server::ServerKey;
use crate::timestamps::{format_compact, from_unix_seconds, parse_compact, shift};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Ftp,
    Sftp,
    Http,
    ObjectStore,
}

/// How a backend learns about a file the directory cache cannot vouch for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataProbe {
    /// `SIZE`, then `MDTM`.
    Size,
    /// A modification time request.
    Time,
    None,
}

impl Backend {
    pub fn scheme(self) -> &'static str {
        match self {
            Backend::Ftp => "ftp",
            Backend::Sftp => "sftp",
            Backend::Http => "http",
            Backend::ObjectStore => "object",
        }
    }

    /// Tracks a working directory, so transfers start with a cwd.
    pub fn changes_directory(self) -> bool {
        matches!(self, Backend::Ftp | Backend::Sftp)
    }

    pub fn lists_directories(self) -> bool {
        self != Backend::Http
    }

    pub fn metadata_probe(self) -> MetadataProbe {
        match self {
            Backend::Ftp => MetadataProbe::Size,
            Backend::Sftp => MetadataProbe::Time,
            Backend::Http | Backend::ObjectStore => MetadataProbe::None,
        }
    }

    pub fn can_fetch_time(self, caps: &CapabilityStore, server: &ServerKey) -> bool {
        match self {
            Backend::Ftp => caps.get(server, Capability::MdtmCommand) == Tri::Yes,
            Backend::Sftp => true,
            Backend::Http | Backend::ObjectStore => false,
        }
    }

    pub fn can_set_time(self, caps: &CapabilityStore, server: &ServerKey) -> bool {
        match self {
            Backend::Ftp => caps.get(server, Capability::MfmtCommand) == Tri::Yes,
            Backend::Sftp => true,
            Backend::Http | Backend::ObjectStore => false,
        }
    }

    /// Servers of this kind are known to break resume of very large files.
    pub fn probes_resume(self) -> bool {
        self == Backend::Ftp
    }

    /// Data is moved by a separate worker process through shared memory.
    pub fn uses_worker_process(self) -> bool {
        self == Backend::Sftp
    }

    pub fn supports_upload(self) -> bool {
        self != Backend::Http
    }

    pub fn supports_resume(self, direction: Direction) -> bool {
        match self {
            Backend::Ftp | Backend::Sftp => true,
            Backend::Http => direction == Direction::Download,
            Backend::ObjectStore => false,
        }
    }

    pub fn size_command(self, name: &str) -> Option<String> {
        match self {
            Backend::Ftp => Some(format!("SIZE {name}")),
            _ => None,
        }
    }

    pub fn time_command(self, name: &str) -> Option<String> {
        match self {
            Backend::Ftp => Some(format!("MDTM {name}")),
            Backend::Sftp => Some(format!("mtime {}", quote(name))),
            _ => None,
        }
    }

    /// Command setting the remote modification time. `time` is UTC; the
    /// server's offset is taken back out before sending.
    pub fn set_time_command(
        self,
        name: &str,
        time: DateTime<Utc>,
        timezone_offset: i32,
    ) -> Option<String> {
        let server_time = shift(time, -timezone_offset);
        match self {
            Backend::Ftp => Some(format!("MFMT {} {name}", format_compact(server_time))),
            Backend::Sftp => Some(format!(
                "chmtime {} {}",
                server_time.timestamp(),
                quote(name)
            )),
            _ => None,
        }
    }

    pub fn parse_size(self, line: &str) -> Option<u64> {
        if self != Backend::Ftp {
            return None;
        }
        let rest = line.strip_prefix("213 ")?;
        let digits: &str = &rest[..rest.bytes().take_while(u8::is_ascii_digit).count()];
        digits.parse().ok()
    }

    pub fn parse_time(self, line: &str, timezone_offset: i32) -> Option<DateTime<Utc>> {
        let time = match self {
            Backend::Ftp => {
                if line.len() <= 16 {
                    return None;
                }
                parse_compact(line.strip_prefix("213 ")?)?
            }
            Backend::Sftp => {
                let line = line.trim();
                if line.is_empty() || !line.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                from_unix_seconds(line.parse().ok()?)?
            }
            Backend::Http | Backend::ObjectStore => return None,
        };
        Some(shift(time, timezone_offset))
    }

    /// The command that starts the data transfer.
    ///
    /// `remote` is already formatted for the backend. For FTP uploads a
    /// resume without `rest_stream` appends instead of seeking.
    pub fn transfer_command(
        self,
        direction: Direction,
        resume: bool,
        rest_stream: bool,
        remote: &str,
        local: &Path,
    ) -> String {
        let local = local.to_string_lossy();
        match (self, direction) {
            (Backend::Ftp, Direction::Download) => format!("RETR {remote}"),
            (Backend::Ftp, Direction::Upload) if resume && !rest_stream => {
                format!("APPE {remote}")
            }
            (Backend::Ftp, Direction::Upload) => format!("STOR {remote}"),
            (Backend::Sftp, Direction::Download) => {
                let verb = if resume { "reget" } else { "get" };
                format!("{verb} {} {}", quote(remote), quote(&local))
            }
            (Backend::Sftp, Direction::Upload) => {
                let verb = if resume { "reput" } else { "put" };
                format!("{verb} {} {}", quote(&local), quote(remote))
            }
            (Backend::ObjectStore, Direction::Download) => {
                format!("get {} {}", quote(remote), quote(&local))
            }
            (Backend::ObjectStore, Direction::Upload) => {
                format!("put {} {}", quote(&local), quote(remote))
            }
            (Backend::Http, _) => format!("GET {remote}"),
        }
    }
}

/// Wraps a name in double quotes, doubling embedded quotes.
fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(backend: Backend) -> ServerKey {
        ServerKey::new("example.org", 21, backend)
    }

    #[test]
    fn size_reply() {
        assert_eq!(Backend::Ftp.parse_size("213 1048576"), Some(1048576));
        assert_eq!(Backend::Ftp.parse_size("213 12 bytes"), Some(12));
        assert_eq!(Backend::Ftp.parse_size("213 "), None);
        assert_eq!(Backend::Ftp.parse_size("550 No such file"), None);
        assert_eq!(Backend::Sftp.parse_size("213 5"), None);
    }

    #[test]
    fn mdtm_reply_applies_timezone() {
        let t = Backend::Ftp.parse_time("213 20240102030405", 60).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 1, 2, 4, 4, 5).unwrap());
        assert_eq!(Backend::Ftp.parse_time("213 2024010203", 0), None);
        assert_eq!(Backend::Ftp.parse_time("550 20240102030405", 0), None);
    }

    #[test]
    fn sftp_mtime_reply() {
        let t = Backend::Sftp.parse_time("1000000000", 0).unwrap();
        assert_eq!(t.timestamp(), 1_000_000_000);
        assert_eq!(Backend::Sftp.parse_time("no such file", 0), None);
    }

    #[test]
    fn set_time_removes_offset() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 4, 4, 5).unwrap();
        assert_eq!(
            Backend::Ftp.set_time_command("a.bin", t, 60).unwrap(),
            "MFMT 20240102030405 a.bin"
        );
        assert_eq!(
            Backend::Sftp.set_time_command("/d/a \"b\"", t, 0).unwrap(),
            format!("chmtime {} \"/d/a \"\"b\"\"\"", t.timestamp())
        );
        assert_eq!(Backend::ObjectStore.set_time_command("a", t, 0), None);
    }

    #[test]
    fn ftp_upload_resume_appends_without_rest_stream() {
        let local = Path::new("/tmp/a.bin");
        let ftp = Backend::Ftp;
        assert_eq!(
            ftp.transfer_command(Direction::Upload, true, false, "a.bin", local),
            "APPE a.bin"
        );
        assert_eq!(
            ftp.transfer_command(Direction::Upload, true, true, "a.bin", local),
            "STOR a.bin"
        );
        assert_eq!(
            ftp.transfer_command(Direction::Download, true, false, "a.bin", local),
            "RETR a.bin"
        );
    }

    #[test]
    fn sftp_commands_quote_both_names() {
        let local = Path::new("/tmp/a.bin");
        assert_eq!(
            Backend::Sftp.transfer_command(Direction::Download, true, false, "/r/a.bin", local),
            "reget \"/r/a.bin\" \"/tmp/a.bin\""
        );
        assert_eq!(
            Backend::Sftp.transfer_command(Direction::Upload, false, false, "/r/a.bin", local),
            "put \"/tmp/a.bin\" \"/r/a.bin\""
        );
        assert_eq!(
            Backend::Sftp.time_command("/r/a.bin").unwrap(),
            "mtime \"/r/a.bin\""
        );
    }

    #[test]
    fn time_capabilities() {
        let mut caps = CapabilityStore::new();
        let ftp = key(Backend::Ftp);
        assert!(!Backend::Ftp.can_fetch_time(&caps, &ftp));
        caps.set(&ftp, Capability::MdtmCommand, Tri::Yes);
        assert!(Backend::Ftp.can_fetch_time(&caps, &ftp));
        assert!(!Backend::Ftp.can_set_time(&caps, &ftp));
        assert!(Backend::Sftp.can_set_time(&caps, &key(Backend::Sftp)));
        assert!(!Backend::Http.can_fetch_time(&caps, &key(Backend::Http)));
    }

    #[test]
    fn resume_support() {
        assert!(Backend::Http.supports_resume(Direction::Download));
        assert!(!Backend::Http.supports_resume(Direction::Upload));
        assert!(!Backend::ObjectStore.supports_resume(Direction::Download));
        assert!(!Backend::Http.supports_upload());
    }
}
