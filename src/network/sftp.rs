//! SFTP primitives
//!
//! [`SftpClient`] is the small set of remote operations the SFTP transport
//! is built from. [`Ssh2SftpClient`] implements it over libssh2.

use crate::error::Result;
use std::io::{Read, Write};

/// Remote directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// File name (no directory part)
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Remote file operations over an SFTP session.
///
/// Paths are `/`-separated remote paths.
pub trait SftpClient: Send {
    /// Open the session; no-op when already connected
    fn connect(&mut self) -> Result<()>;

    /// Close the session; safe to call when not connected
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Host label for errors and logs
    fn host(&self) -> &str;

    fn exists(&mut self, path: &str) -> Result<bool>;

    /// Create or truncate `path` and fill it from `source`
    fn upload(&mut self, source: &mut dyn Read, path: &str) -> Result<u64>;

    /// Stream `path` into `dest`; a missing file is `NotFound`
    fn download(&mut self, path: &str, dest: &mut dyn Write) -> Result<u64>;

    /// Rename, replacing any existing `to`
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    /// Remove a file; a missing file is not an error
    fn delete(&mut self, path: &str) -> Result<()>;

    /// List a directory; a missing directory is `NotFound`
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>>;

    fn create_dir_all(&mut self, dir: &str) -> Result<()>;
}

/// Join remote path segments with `/`
pub fn remote_join(base: &str, rest: &str) -> String {
    match (base.trim_end_matches('/'), rest.trim_start_matches('/')) {
        ("", r) if base.starts_with('/') => format!("/{}", r),
        ("", r) => r.to_string(),
        (b, "") => b.to_string(),
        (b, r) => format!("{}/{}", b, r),
    }
}

/// Split a remote path into (parent, file name)
pub fn remote_split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

#[cfg(feature = "ssh")]
pub use ssh2_client::Ssh2SftpClient;

#[cfg(feature = "ssh")]
mod ssh2_client {
    use super::{RemoteEntry, SftpClient};
    use crate::config::RemoteConfig;
    use crate::error::{Result, TransportError};
    use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
    use std::io::{self, Read, Write};
    use std::net::{TcpStream, ToSocketAddrs};
    use std::path::Path;
    use std::time::Duration;
    use tracing::{debug, info};

    /// SFTP status codes
    const SFTP_NO_SUCH_FILE: i32 = 2;
    const SFTP_OP_UNSUPPORTED: i32 = 8;

    const COPY_BUFFER: usize = 1024 * 1024;

    /// [`SftpClient`] backed by an `ssh2` session
    pub struct Ssh2SftpClient {
        config: RemoteConfig,
        timeout: Duration,
        session: Option<(Session, Sftp)>,
    }

    impl Ssh2SftpClient {
        pub fn new(config: RemoteConfig, timeout: Duration) -> Self {
            Self {
                config,
                timeout,
                session: None,
            }
        }

        fn sftp(&self) -> Result<&Sftp> {
            self.session
                .as_ref()
                .map(|(_, sftp)| sftp)
                .ok_or_else(|| TransportError::connection(&self.config.host, "not connected"))
        }

        fn remote_err(&self, action: &str, path: &str, e: ssh2::Error) -> TransportError {
            if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) {
                TransportError::NotFound(format!("{}:{}", self.config.host, path))
            } else {
                TransportError::Remote(format!("{} '{}' failed: {}", action, path, e))
            }
        }

        fn authenticate(&self, session: &mut Session) -> Result<()> {
            let config = &self.config;
            let auth_err = |e: ssh2::Error| TransportError::auth(&config.user, &config.host, e.to_string());

            if let Some(password) = &config.password {
                session.userauth_password(&config.user, password).map_err(auth_err)?;
            } else if let Some(key_path) = &config.key_path {
                session
                    .userauth_pubkey_file(&config.user, None, key_path, None)
                    .map_err(auth_err)?;
            } else {
                let mut agent = session.agent().map_err(auth_err)?;
                agent.connect().map_err(auth_err)?;
                agent.list_identities().map_err(auth_err)?;

                let identities = agent.identities().unwrap_or_default();
                let authenticated = identities
                    .iter()
                    .any(|identity| agent.userauth(&config.user, identity).is_ok());
                if !authenticated {
                    return Err(TransportError::auth(
                        &config.user,
                        &config.host,
                        "No valid SSH key found in agent",
                    ));
                }
            }

            if !session.authenticated() {
                return Err(TransportError::auth(&config.user, &config.host, "Authentication failed"));
            }
            Ok(())
        }
    }

    impl SftpClient for Ssh2SftpClient {
        fn connect(&mut self) -> Result<()> {
            if self.session.is_some() {
                return Ok(());
            }
            let host = self.config.host.clone();
            let conn_err = |e: &dyn std::fmt::Display| TransportError::connection(&host, e.to_string());

            let addr = (host.as_str(), self.config.port)
                .to_socket_addrs()
                .map_err(|e| conn_err(&e))?
                .next()
                .ok_or_else(|| TransportError::connection(&host, "host did not resolve"))?;
            let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| conn_err(&e))?;

            let mut session = Session::new().map_err(|e| conn_err(&e))?;
            session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
            session.set_tcp_stream(tcp);
            session.handshake().map_err(|e| conn_err(&e))?;

            self.authenticate(&mut session)?;

            let sftp = session.sftp().map_err(|e| conn_err(&e))?;
            info!("SFTP session open to {}@{}:{}", self.config.user, host, self.config.port);
            self.session = Some((session, sftp));
            Ok(())
        }

        fn disconnect(&mut self) {
            if let Some((session, sftp)) = self.session.take() {
                drop(sftp);
                if let Err(e) = session.disconnect(None, "closing", None) {
                    debug!("SSH disconnect from {} failed: {}", self.config.host, e);
                }
            }
        }

        fn is_connected(&self) -> bool {
            self.session.is_some()
        }

        fn host(&self) -> &str {
            &self.config.host
        }

        fn exists(&mut self, path: &str) -> Result<bool> {
            match self.sftp()?.stat(Path::new(path)) {
                Ok(_) => Ok(true),
                Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(false),
                Err(e) => Err(self.remote_err("stat", path, e)),
            }
        }

        fn upload(&mut self, source: &mut dyn Read, path: &str) -> Result<u64> {
            let mut remote = self
                .sftp()?
                .create(Path::new(path))
                .map_err(|e| self.remote_err("create", path, e))?;

            let mut buffer = vec![0u8; COPY_BUFFER];
            let mut total = 0u64;
            loop {
                let n = match source.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted && e.get_ref().is_none() => continue,
                    Err(e) => return Err(e.into()),
                };
                remote
                    .write_all(&buffer[..n])
                    .map_err(|e| TransportError::Remote(format!("write '{}' failed: {}", path, e)))?;
                total += n as u64;
            }
            remote
                .fsync()
                .or_else(|e| if e.code() == ErrorCode::SFTP(SFTP_OP_UNSUPPORTED) { Ok(()) } else { Err(e) })
                .map_err(|e| self.remote_err("fsync", path, e))?;
            Ok(total)
        }

        fn download(&mut self, path: &str, dest: &mut dyn Write) -> Result<u64> {
            let mut remote = self
                .sftp()?
                .open(Path::new(path))
                .map_err(|e| self.remote_err("open", path, e))?;

            let mut buffer = vec![0u8; COPY_BUFFER];
            let mut total = 0u64;
            loop {
                let n = remote
                    .read(&mut buffer)
                    .map_err(|e| TransportError::Remote(format!("read '{}' failed: {}", path, e)))?;
                if n == 0 {
                    break;
                }
                dest.write_all(&buffer[..n])?;
                total += n as u64;
            }
            dest.flush()?;
            Ok(total)
        }

        fn rename(&mut self, from: &str, to: &str) -> Result<()> {
            let sftp = self.sftp()?;
            let flags = Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE);
            if sftp.rename(Path::new(from), Path::new(to), flags).is_ok() {
                return Ok(());
            }
            // SFTPv3 servers refuse to rename over an existing file
            if self.exists(to)? {
                self.delete(to)?;
            }
            self.sftp()?
                .rename(Path::new(from), Path::new(to), None)
                .map_err(|e| self.remote_err("rename", from, e))
        }

        fn delete(&mut self, path: &str) -> Result<()> {
            match self.sftp()?.unlink(Path::new(path)) {
                Ok(()) => Ok(()),
                Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(()),
                Err(e) => Err(self.remote_err("unlink", path, e)),
            }
        }

        fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>> {
            let entries = self
                .sftp()?
                .readdir(Path::new(dir))
                .map_err(|e| self.remote_err("readdir", dir, e))?;

            Ok(entries
                .into_iter()
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_string_lossy().into_owned();
                    Some(RemoteEntry {
                        name,
                        size: stat.size.unwrap_or(0),
                        is_dir: stat.is_dir(),
                    })
                })
                .collect())
        }

        fn create_dir_all(&mut self, dir: &str) -> Result<()> {
            let mut current = if dir.starts_with('/') { String::from("/") } else { String::new() };

            for component in dir.split('/').filter(|c| !c.is_empty()) {
                if !current.is_empty() && !current.ends_with('/') {
                    current.push('/');
                }
                current.push_str(component);

                let sftp = self.sftp()?;
                match sftp.stat(Path::new(&current)) {
                    Ok(stat) if stat.is_dir() => {}
                    Ok(_) => {
                        return Err(TransportError::Remote(format!(
                            "Path exists but is not a directory: {}",
                            current
                        )));
                    }
                    Err(_) => {
                        sftp.mkdir(Path::new(&current), 0o755)
                            .map_err(|e| self.remote_err("mkdir", &current, e))?;
                    }
                }
            }
            Ok(())
        }
    }

    impl Drop for Ssh2SftpClient {
        fn drop(&mut self) {
            self.disconnect();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        // Requires an SSH server on localhost with agent authentication
        #[test]
        #[ignore]
        fn test_ssh2_round_trip() {
            let config = RemoteConfig {
                host: "localhost".to_string(),
                user: std::env::var("USER").unwrap_or_else(|_| "test".to_string()),
                port: 22,
                key_path: None,
                password: None,
                sessions: 1,
            };
            let mut client = Ssh2SftpClient::new(config, Duration::from_secs(10));
            client.connect().unwrap();

            let path = format!("/tmp/zim-ssh2-{}", uuid::Uuid::new_v4());
            client.upload(&mut &b"hello"[..], &path).unwrap();
            let mut out = Vec::new();
            client.download(&path, &mut out).unwrap();
            assert_eq!(out, b"hello");
            client.delete(&path).unwrap();
            assert!(!client.exists(&path).unwrap());
            client.disconnect();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/srv/zim", "zim-data/a.txt"), "/srv/zim/zim-data/a.txt");
        assert_eq!(remote_join("/srv/zim/", "/x"), "/srv/zim/x");
        assert_eq!(remote_join("/", "x"), "/x");
        assert_eq!(remote_join("", "x"), "x");
        assert_eq!(remote_join("base", ""), "base");
    }

    #[test]
    fn test_remote_split() {
        assert_eq!(remote_split("/srv/zim/a.txt"), ("/srv/zim", "a.txt"));
        assert_eq!(remote_split("/a.txt"), ("/", "a.txt"));
        assert_eq!(remote_split("a.txt"), ("", "a.txt"));
    }
}
