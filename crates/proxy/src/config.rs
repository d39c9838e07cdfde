//! Command line and environment configuration.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

/// How the proxy obtains bearer tokens for the remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialMode {
    /// Fixed token from `DATABRICKS_TOKEN`; never refreshed.
    StaticToken(String),
    /// Tokens minted on demand by the `databricks auth token` CLI.
    OauthCli { profile: Option<String> },
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Fully resolved MCP endpoint URL (with the `/mcp` path applied).
    pub mcp_url: reqwest::Url,
    /// Workspace host passed through to the Databricks CLI, if any.
    pub databricks_host: Option<String>,
    pub credentials: CredentialMode,
    /// Deadline for each forwarded request, POST through delivered response.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long the SSE stream may stay silent before being reopened.
    pub sse_idle_timeout: Duration,
    /// How long to wait for in-flight responses after stdin closes.
    pub drain_grace: Duration,
    pub max_message_bytes: usize,
    /// Databricks CLI binary used to mint OAuth tokens.
    pub token_cli: String,
}

/// Bridges a stdio MCP client to a Databricks-hosted MCP server.
///
/// Reads line-delimited JSON-RPC on stdin, forwards it over streamable HTTP,
/// and writes responses back to stdout. All diagnostics go to stderr.
#[derive(Debug, Parser)]
#[command(name = "dbx-mcp-proxy", version)]
pub struct Cli {
    /// Base URL of the Databricks app hosting the MCP server.
    #[arg(long, value_name = "URL")]
    pub databricks_app_url: String,

    /// Workspace host for CLI-based authentication (e.g. https://acme.cloud.databricks.com).
    #[arg(long, value_name = "URL")]
    pub databricks_host: Option<String>,

    /// Per-request timeout in milliseconds.
    #[arg(long, default_value_t = 30_000, value_name = "MS")]
    pub timeout_ms: u64,

    /// TCP connect timeout in milliseconds.
    #[arg(long, default_value_t = 10_000, value_name = "MS")]
    pub connect_timeout_ms: u64,

    /// SSE stream idle timeout in milliseconds before the stream is reopened.
    #[arg(long, default_value_t = 120_000, value_name = "MS")]
    pub sse_idle_timeout_ms: u64,

    /// Grace period in milliseconds for in-flight requests after stdin closes.
    #[arg(long, default_value_t = 5_000, value_name = "MS")]
    pub drain_grace_ms: u64,

    /// Databricks CLI binary used to mint OAuth tokens.
    #[arg(long, default_value = "databricks", value_name = "PATH")]
    pub token_cli: String,
}

impl Cli {
    /// Resolves flags and environment into a [`ProxyConfig`].
    ///
    /// `DATABRICKS_TOKEN` selects static-token mode; otherwise tokens come
    /// from the Databricks CLI, honoring `DATABRICKS_CONFIG_PROFILE`.
    pub fn into_config(self) -> anyhow::Result<ProxyConfig> {
        let mcp_url = normalize_app_url(&self.databricks_app_url)?;

        let credentials = match std::env::var("DATABRICKS_TOKEN") {
            Ok(token) if !token.is_empty() => CredentialMode::StaticToken(token),
            _ => CredentialMode::OauthCli {
                profile: std::env::var("DATABRICKS_CONFIG_PROFILE")
                    .ok()
                    .filter(|p| !p.is_empty()),
            },
        };

        Ok(ProxyConfig {
            mcp_url,
            databricks_host: self.databricks_host,
            credentials,
            request_timeout: Duration::from_millis(self.timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            sse_idle_timeout: Duration::from_millis(self.sse_idle_timeout_ms),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            max_message_bytes: dbx_jsonrpc::DEFAULT_MAX_MESSAGE_BYTES,
            token_cli: self.token_cli,
        })
    }
}

/// Appends the conventional `/mcp` path when the app URL has no path.
pub fn normalize_app_url(raw: &str) -> anyhow::Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(raw).with_context(|| format!("invalid app URL: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("app URL must be http(s): {raw}");
    }
    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/mcp");
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_app_url_gets_mcp_path() {
        let url = normalize_app_url("https://app.example.databricksapps.com").unwrap();
        assert_eq!(url.as_str(), "https://app.example.databricksapps.com/mcp");

        let with_slash = normalize_app_url("https://app.example.databricksapps.com/").unwrap();
        assert_eq!(with_slash.path(), "/mcp");
    }

    #[test]
    fn explicit_path_is_preserved() {
        let url = normalize_app_url("https://app.example.com/api/mcp").unwrap();
        assert_eq!(url.path(), "/api/mcp");
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        assert!(normalize_app_url("ftp://app.example.com").is_err());
        assert!(normalize_app_url("not a url").is_err());
    }
}
