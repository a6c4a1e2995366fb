//! GPG key wrapping via the external gpg binary
//!
//! Used for key slots that wrap the master key with a GPG key instead of a
//! passphrase. The agent is a trait so unlock logic can be tested without a
//! GPG installation.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Encrypts and decrypts small blobs with an external GPG agent
#[async_trait]
pub trait GpgAgent: Send + Sync {
    /// Encrypt `plaintext` to the given GPG key
    async fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>>;

    /// Decrypt a blob with whatever private key the agent holds
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// GPG agent backed by the `gpg` command-line binary
pub struct GpgCli {
    program: String,
}

impl GpgCli {
    pub fn new() -> Self {
        GpgCli {
            program: "gpg".to_string(),
        }
    }

    async fn run(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Crypto(format!("failed to start gpg: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Crypto(format!("gpg did not complete: {}", e)))?;

        if !output.status.success() {
            debug!("gpg exited with status {}", output.status);
            return Err(Error::Crypto("gpg operation failed".to_string()));
        }

        Ok(output.stdout)
    }
}

impl Default for GpgCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpgAgent for GpgCli {
    async fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>> {
        self.run(
            &[
                "--encrypt",
                "--recipient",
                key_id,
                "--batch",
                "--yes",
                "--quiet",
                "--output",
                "-",
            ],
            plaintext,
        )
        .await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.run(&["--decrypt", "--batch", "--quiet"], ciphertext).await
    }
}
