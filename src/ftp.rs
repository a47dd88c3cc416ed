//! FTP implementation of the remote boundary (suppaftp, blocking)
//!
//! A client whose control connection may be out of step with the server
//! drops it and logs in again before its next command.

use crate::config::ConnectionConfig;
use crate::error::{normalize_timeout, RemoteError};
use crate::remote::{Connector, EntryKind, RangeConsumer, RangeError, RemoteClient, RemoteEntry};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};

#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Bound on connecting and on every blocking read or write.
    pub timeout: Duration,
}

impl From<&ConnectionConfig> for FtpSettings {
    fn from(c: &ConnectionConfig) -> Self {
        Self {
            address: c.address.clone(),
            port: c.port,
            username: c.username.clone(),
            password: c.password.clone(),
            timeout: Duration::from_secs(c.timeout_secs),
        }
    }
}

pub struct FtpConnector {
    settings: FtpSettings,
}

impl FtpConnector {
    pub fn new(settings: FtpSettings) -> Self {
        Self { settings }
    }
}

impl Connector for FtpConnector {
    type Client = FtpClient;

    fn connect(&self) -> Result<FtpClient, RemoteError> {
        let stream = login(&self.settings)?;
        Ok(FtpClient {
            settings: self.settings.clone(),
            stream: Some(stream),
        })
    }

    fn target(&self) -> String {
        format!(
            "ftp://{}@{}:{}",
            self.settings.username, self.settings.address, self.settings.port
        )
    }
}

pub struct FtpClient {
    settings: FtpSettings,
    /// `None` after the control connection was lost or left mid-reply.
    stream: Option<FtpStream>,
}

fn login(settings: &FtpSettings) -> Result<FtpStream, RemoteError> {
    if settings.address.is_empty() {
        return Err(RemoteError::Protocol("no server address configured".into()));
    }
    let control = open_control(settings)?;
    let mut ftp = FtpStream::connect_with_stream(control).map_err(map_error)?;
    ftp.login(settings.username.as_str(), settings.password.as_str())
        .map_err(map_error)?;
    ftp.transfer_type(FileType::Binary).map_err(map_error)?;
    Ok(ftp)
}

/// Connect to the first address that answers within the timeout.
fn open_control(settings: &FtpSettings) -> Result<TcpStream, RemoteError> {
    let addrs = (settings.address.as_str(), settings.port).to_socket_addrs()?;
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, settings.timeout) {
            Ok(tcp) => {
                tcp.set_read_timeout(Some(settings.timeout))?;
                tcp.set_write_timeout(Some(settings.timeout))?;
                return Ok(tcp);
            }
            Err(e) => last = Some(e),
        }
    }
    let e = last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{} has no addresses", settings.address))
    });
    Err(RemoteError::Io(normalize_timeout(e)))
}

/// Offset for `REST`; refused rather than truncated where `usize` is narrow.
fn rest_offset(offset: u64) -> Result<usize, RemoteError> {
    usize::try_from(offset)
        .map_err(|_| RemoteError::Protocol(format!("offset {offset} does not fit a REST command here")))
}

impl FtpClient {
    fn stream(&mut self) -> Result<&mut FtpStream, RemoteError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => login(&self.settings)?,
        };
        Ok(self.stream.insert(stream))
    }

    fn fail(&mut self, e: FtpError) -> RemoteError {
        if matches!(e, FtpError::ConnectionError(_)) {
            self.stream = None;
        }
        map_error(e)
    }
}

impl RemoteClient for FtpClient {
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let result = self.stream()?.list(Some(path));
        let lines = result.map_err(|e| self.fail(e))?;
        parse_listing(&lines)
    }

    fn read_range(
        &mut self,
        path: &str,
        offset: u64,
        length: u64,
        consume: RangeConsumer<'_>,
    ) -> Result<(), RangeError> {
        let rest = rest_offset(offset).map_err(RangeError::Open)?;
        let timeout = self.settings.timeout;
        let ftp = self.stream().map_err(RangeError::Open)?;
        let opened = ftp.resume_transfer(rest).and_then(|_| ftp.retr_as_stream(path));
        let data = match opened {
            Ok(data) => data,
            Err(e) => return Err(RangeError::Open(self.fail(e))),
        };
        if let Err(e) = data.get_ref().set_read_timeout(Some(timeout)) {
            // The server is mid-transfer; start over on a fresh connection.
            self.stream = None;
            return Err(RangeError::Open(RemoteError::Io(e)));
        }

        let mut reader = data.take(length);
        let consumed = consume(&mut reader);

        // Stopping short of the end of the file makes some servers answer
        // 426 and then 226; reconnect rather than guess which reply is next.
        let finished = match self.stream.as_mut() {
            Some(ftp) => ftp.finalize_retr_stream(reader),
            None => Ok(()),
        };
        if finished.is_err() {
            self.stream = None;
        }
        consumed.map_err(RangeError::Consume)
    }
}

impl Drop for FtpClient {
    fn drop(&mut self) {
        if let Some(mut ftp) = self.stream.take() {
            let _ = ftp.quit();
        }
    }
}

/// Parse `LIST` output lines (POSIX or DOS style).
pub fn parse_listing(lines: &[String]) -> Result<Vec<RemoteEntry>, RemoteError> {
    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("total ") {
            continue;
        }
        let file = suppaftp::list::File::from_str(line)
            .map_err(|e| RemoteError::Protocol(format!("unparseable listing line {line:?}: {e}")))?;
        let name = file.name();
        if name == "." || name == ".." {
            continue;
        }
        let kind = if file.is_directory() {
            EntryKind::Directory
        } else if file.is_symlink() {
            EntryKind::Link
        } else {
            EntryKind::File
        };
        entries.push(RemoteEntry {
            name: name.to_string(),
            kind,
            size: if kind == EntryKind::File { file.size() as u64 } else { 0 },
        });
    }
    Ok(entries)
}

fn map_error(e: FtpError) -> RemoteError {
    match e {
        FtpError::ConnectionError(io) => RemoteError::Io(normalize_timeout(io)),
        FtpError::UnexpectedResponse(resp) => RemoteError::Command {
            code: resp.status.code(),
            message: String::from_utf8_lossy(&resp.body).trim().to_string(),
        },
        other => RemoteError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn settings(address: &str, port: u16, timeout: Duration) -> FtpSettings {
        FtpSettings {
            address: address.into(),
            port,
            username: "anonymous".into(),
            password: String::new(),
            timeout,
        }
    }

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn posix_listing_is_classified() {
        let listing = parse_listing(&lines(&[
            "total 12",
            "drwxr-xr-x 2 ftp ftp 4096 Jan 01 12:00 Sideloader Modpack",
            "-rw-r--r-- 1 ftp ftp 10485760 Mar 03 2023 f1.bin",
            "-rw-r--r-- 1 ftp ftp 0 Mar 03 2023 f2.bin",
            "lrwxrwxrwx 1 ftp ftp 6 Jan 01 12:00 latest -> f1.bin",
        ]))
        .unwrap();

        assert_eq!(listing.len(), 4);
        assert_eq!(listing[0], RemoteEntry::directory("Sideloader Modpack"));
        assert_eq!(listing[1], RemoteEntry::file("f1.bin", 10 * 1024 * 1024));
        assert_eq!(listing[2], RemoteEntry::file("f2.bin", 0));
        assert_eq!(listing[3].kind, EntryKind::Link);
    }

    #[test]
    fn garbage_line_is_a_protocol_error() {
        let err = parse_listing(&lines(&["this is not a listing"])).unwrap_err();
        assert!(matches!(err, RemoteError::Protocol(_)));
        assert!(!err.is_retryable_listing());
    }

    #[test]
    fn connection_errors_stay_transient() {
        let err = map_error(FtpError::ConnectionError(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(err.is_transient());
    }

    #[test]
    fn missing_address_fails_fast() {
        let connector = FtpConnector::new(settings("", 21, Duration::from_secs(30)));
        assert!(matches!(connector.connect(), Err(RemoteError::Protocol(_))));
        assert_eq!(connector.target(), "ftp://anonymous@:21");
    }

    #[test]
    fn timeouts_read_as_io_errors() {
        let err = map_error(FtpError::ConnectionError(io::Error::new(
            io::ErrorKind::WouldBlock,
            "resource temporarily unavailable",
        )));
        assert!(matches!(&err, RemoteError::Io(e) if e.kind() == io::ErrorKind::TimedOut));
        assert!(err.is_transient());
        assert!(err.is_retryable_listing());
    }

    #[test]
    fn silent_server_times_out() {
        // Accepts the TCP connection but never sends a greeting.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = FtpConnector::new(settings("127.0.0.1", port, Duration::from_millis(200)));

        let started = Instant::now();
        let err = connector.connect().err().expect("no greeting arrives");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.is_transient(), "{err}");
        drop(listener);
    }

    #[test]
    fn rest_offsets_are_checked() {
        assert_eq!(rest_offset(0).unwrap(), 0);
        assert_eq!(rest_offset(10 * 1024 * 1024).unwrap(), 10 * 1024 * 1024);
        if usize::BITS < u64::BITS {
            assert!(matches!(rest_offset(u64::MAX), Err(RemoteError::Protocol(_))));
        }
    }
}
