use super::{ConnectionInfo, ResolvedAuth, Transport, TransportError};
use log::debug;
use ssh2::Session;
use std::io::Read;
use std::net::TcpStream;
use std::path::Path;

/// Blocking SSH transport over libssh2. One TCP session per call; the
/// remote script repository owns long-running work, so connections are not
/// pooled.
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        SshTransport
    }

    fn connect(&self, conn: &ConnectionInfo) -> Result<Session, TransportError> {
        let tcp = TcpStream::connect(format!("{}:{}", conn.hostname, conn.port))
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut sess = Session::new().map_err(|e| TransportError::Ssh(e.to_string()))?;
        sess.set_tcp_stream(tcp);
        sess.handshake()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        match &conn.auth {
            ResolvedAuth::Password(password) => {
                sess.userauth_password(&conn.username, password)
                    .map_err(|e| TransportError::AuthFailed(e.to_string()))?;
            }
            ResolvedAuth::KeyData(key) => {
                sess.userauth_pubkey_memory(&conn.username, None, key, None)
                    .map_err(|e| TransportError::AuthFailed(e.to_string()))?;
            }
            ResolvedAuth::KeyFile(path) => {
                sess.userauth_pubkey_file(&conn.username, None, Path::new(path), None)
                    .map_err(|e| TransportError::AuthFailed(e.to_string()))?;
            }
            ResolvedAuth::Agent => {
                sess.userauth_agent(&conn.username)
                    .map_err(|e| TransportError::AuthFailed(e.to_string()))?;
            }
        }

        if !sess.authenticated() {
            return Err(TransportError::AuthFailed(format!(
                "authentication for user '{}' on {} did not complete",
                conn.username, conn.hostname
            )));
        }

        Ok(sess)
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SshTransport {
    fn execute(
        &self,
        conn: &ConnectionInfo,
        command_text: &str,
    ) -> Result<String, TransportError> {
        let sess = self.connect(conn)?;

        let mut channel = sess
            .channel_session()
            .map_err(|e| TransportError::Ssh(e.to_string()))?;
        channel
            .exec(command_text)
            .map_err(|e| TransportError::Ssh(e.to_string()))?;

        // Drain both streams into one buffer, in arrival order. Callers get
        // unstructured combined text; the outcome classifier works on that.
        let mut output = String::new();
        let mut stdout_buffer = [0u8; 1024];
        let mut stderr_buffer = [0u8; 1024];

        loop {
            match channel.read(&mut stdout_buffer) {
                Ok(n) if n > 0 => {
                    output.push_str(&String::from_utf8_lossy(&stdout_buffer[0..n]));
                }
                _ => {}
            }

            match channel.stderr().read(&mut stderr_buffer) {
                Ok(n) if n > 0 => {
                    output.push_str(&String::from_utf8_lossy(&stderr_buffer[0..n]));
                }
                _ => {}
            }

            if channel.eof() {
                break;
            }

            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let _ = channel.wait_close();
        debug!(
            "remote command on {} finished, {} bytes of output",
            conn.hostname,
            output.len()
        );
        Ok(output)
    }
}
