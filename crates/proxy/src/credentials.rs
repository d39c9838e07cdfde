//! Bearer token acquisition and refresh.
//!
//! Two modes: a static token taken from the environment, or OAuth tokens
//! minted by shelling out to `databricks auth token`. Tokens are cached and
//! refreshed shortly before expiry; concurrent refreshes are coalesced so the
//! CLI runs at most once per expiry.

use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::CredentialMode;

/// Refresh this long before the recorded expiry.
const REFRESH_MARGIN_SECS: i64 = 60;

/// An access token and its expiry, if known.
#[derive(Clone)]
pub struct Token {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// True when the token expires within the refresh margin (or already has).
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now < chrono::Duration::seconds(REFRESH_MARGIN_SECS),
            None => false,
        }
    }
}

// The token value must never land in logs.
impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to launch `{program} auth token`: {source}")]
    CliLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program} auth token` exited with {status}: {stderr}")]
    CliFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("could not parse CLI token output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("server rejected the static token; set a fresh DATABRICKS_TOKEN")]
    StaticTokenRejected,
}

/// Wire format of `databricks auth token` stdout.
#[derive(Debug, Deserialize)]
struct CliTokenOutput {
    access_token: String,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
}

pub struct CredentialProvider {
    mode: CredentialMode,
    host: Option<String>,
    /// Overridable so tests can substitute a stub executable.
    cli_program: String,
    cached: tokio::sync::Mutex<Option<Token>>,
}

impl CredentialProvider {
    pub fn new(mode: CredentialMode, host: Option<String>) -> Self {
        Self {
            mode,
            host,
            cli_program: "databricks".to_string(),
            cached: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_cli_program(mut self, program: impl Into<String>) -> Self {
        self.cli_program = program.into();
        self
    }

    /// Returns a bearer token, minting or refreshing one if needed.
    ///
    /// The cache lock is held across the CLI invocation, so concurrent
    /// callers wait for one refresh instead of each spawning the CLI.
    pub async fn bearer_token(&self) -> Result<String, AuthError> {
        match &self.mode {
            CredentialMode::StaticToken(token) => Ok(token.clone()),
            CredentialMode::OauthCli { profile } => {
                let mut cached = self.cached.lock().await;
                if let Some(token) = cached.as_ref() {
                    if !token.needs_refresh(Utc::now()) {
                        return Ok(token.access_token.clone());
                    }
                    debug!("cached token near expiry, refreshing");
                }
                let token = self.mint(profile.as_deref()).await?;
                let access = token.access_token.clone();
                *cached = Some(token);
                Ok(access)
            }
        }
    }

    /// Replaces a token the server rejected.
    ///
    /// Callers pass the rejected token; if the cache already holds a
    /// different one, another caller finished a refresh while this one
    /// waited on the lock, and the CLI is not run again. Static tokens
    /// cannot be re-minted, so rejection there is terminal.
    pub async fn force_refresh(&self, rejected: &str) -> Result<String, AuthError> {
        match &self.mode {
            CredentialMode::StaticToken(_) => Err(AuthError::StaticTokenRejected),
            CredentialMode::OauthCli { profile } => {
                let mut cached = self.cached.lock().await;
                if let Some(token) = cached.as_ref() {
                    if token.access_token != rejected {
                        return Ok(token.access_token.clone());
                    }
                }
                let token = self.mint(profile.as_deref()).await?;
                let access = token.access_token.clone();
                *cached = Some(token);
                Ok(access)
            }
        }
    }

    async fn mint(&self, profile: Option<&str>) -> Result<Token, AuthError> {
        let mut cmd = Command::new(&self.cli_program);
        cmd.arg("auth").arg("token");
        if let Some(host) = &self.host {
            cmd.arg("--host").arg(host);
        }
        if let Some(profile) = profile {
            cmd.arg("--profile").arg(profile);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|source| AuthError::CliLaunch {
            program: self.cli_program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = %output.status, "databricks CLI token request failed");
            return Err(AuthError::CliFailed {
                program: self.cli_program.clone(),
                status: output.status,
                stderr,
            });
        }

        let parsed: CliTokenOutput = serde_json::from_slice(&output.stdout)?;
        debug!(expiry = ?parsed.expiry, "minted OAuth token");
        Ok(Token {
            access_token: parsed.access_token,
            expires_at: parsed.expiry,
        })
    }
}
