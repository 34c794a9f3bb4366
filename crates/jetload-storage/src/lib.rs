//! CRM session login, report export fetch, and the raw export archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use reqwest::Url;
use roxmltree::Document;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jetload-storage";

pub const DEFAULT_LOGIN_URL: &str = "https://login.salesforce.com/services/Soap/u/38.0";
pub const DEFAULT_HOST: &str = "salesforce.com";

/// Login identity for one CRM instance.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Subdomain serving report exports, e.g. `na12`. Empty means "use the
    /// server returned by login".
    pub instance: String,
    pub security_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("instance", &self.instance)
            .field("security_token", &self.security_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub login_url: String,
    pub host: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_url: DEFAULT_LOGIN_URL.to_string(),
            host: DEFAULT_HOST.to_string(),
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("login rejected: {0}")]
    Login(String),
    #[error("invalid server url {url:?}: {reason}")]
    ServerUrl { url: String, reason: String },
}

/// Raw export text as returned by the instance.
#[derive(Debug, Clone)]
pub struct FetchedExport {
    pub report_id: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: String,
}

/// Authenticated session against one CRM instance.
///
/// A session lives for the loads of one source and is dropped afterwards;
/// nothing is shared between instances.
#[derive(Debug)]
pub struct SourceSession {
    client: reqwest::Client,
    session_id: String,
    base_url: String,
}

impl SourceSession {
    /// Log in with the partner SOAP endpoint and keep the returned session id.
    pub async fn login(config: &SessionConfig, credentials: &Credentials) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;

        let span = info_span!("crm_login", username = %credentials.username, login_url = %config.login_url);
        async move {
            let resp = client
                .post(&config.login_url)
                .header(CONTENT_TYPE, "text/xml; charset=UTF-8")
                .header("SOAPAction", "login")
                .body(login_envelope(credentials))
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            let login = parse_login_response(status.as_u16(), &body, &config.login_url)?;

            let base_url = report_base_url(&credentials.instance, &config.host, &login.server_url)?;
            info!(%base_url, "session established");
            Ok::<_, FetchError>(Self {
                client,
                session_id: login.session_id,
                base_url,
            })
        }
        .instrument(span)
        .await
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn report_url(&self, report_id: &str) -> String {
        report_export_url(&self.base_url, report_id)
    }

    /// Download a report as CSV export text.
    pub async fn fetch_report(&self, report_id: &str) -> Result<FetchedExport, FetchError> {
        let url = self.report_url(report_id);
        let span = info_span!("report_fetch", report_id, %url);
        async {
            let fetched_at = Utc::now();
            let resp = self
                .client
                .get(&url)
                .header(AUTHORIZATION, format!("Bearer {}", self.session_id))
                .header(COOKIE, format!("sid={}", self.session_id))
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "report export downloaded");
            Ok::<_, FetchError>(FetchedExport {
                report_id: report_id.to_string(),
                url: url.clone(),
                fetched_at,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

pub fn report_export_url(base_url: &str, report_id: &str) -> String {
    format!(
        "{}/{}?export=1&enc=UTF-8&xf=csv",
        base_url.trim_end_matches('/'),
        report_id
    )
}

fn report_base_url(instance: &str, host: &str, server_url: &str) -> Result<String, FetchError> {
    let instance = instance.trim();
    if !instance.is_empty() {
        return Ok(format!("https://{instance}.{host}"));
    }
    let parsed = Url::parse(server_url).map_err(|err| FetchError::ServerUrl {
        url: server_url.to_string(),
        reason: err.to_string(),
    })?;
    let server_host = parsed.host_str().ok_or_else(|| FetchError::ServerUrl {
        url: server_url.to_string(),
        reason: "missing host".to_string(),
    })?;
    Ok(format!("{}://{}", parsed.scheme(), server_host))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoginResult {
    session_id: String,
    server_url: String,
}

fn login_envelope(credentials: &Credentials) -> String {
    let password = format!(
        "{}{}",
        credentials.password,
        credentials.security_token.as_deref().unwrap_or_default()
    );
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8" ?>"#,
            r#"<env:Envelope xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:env="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<env:Body><n1:login xmlns:n1="urn:partner.soap.sforce.com">"#,
            "<n1:username>{}</n1:username><n1:password>{}</n1:password>",
            "</n1:login></env:Body></env:Envelope>"
        ),
        escape(credentials.username.as_str()),
        escape(password.as_str())
    )
}

/// SOAP faults are reported even on a 500; any other non-success status is
/// reported before the body is read.
fn parse_login_response(status: u16, body: &str, url: &str) -> Result<LoginResult, FetchError> {
    let doc = Document::parse(body);
    if let Some(fault) = doc.as_ref().ok().and_then(|doc| element_text(doc, "faultstring")) {
        return Err(FetchError::Login(fault));
    }
    if !(200..300).contains(&status) {
        return Err(FetchError::HttpStatus {
            status,
            url: url.to_string(),
        });
    }
    let doc = doc.map_err(|err| FetchError::Login(format!("malformed login response: {err}")))?;
    let session_id = element_text(&doc, "sessionId")
        .ok_or_else(|| FetchError::Login("response has no sessionId".to_string()))?;
    let server_url = element_text(&doc, "serverUrl")
        .ok_or_else(|| FetchError::Login("response has no serverUrl".to_string()))?;
    Ok(LoginResult {
        session_id,
        server_url,
    })
}

/// Trimmed text of the first element with this local name, if non-empty.
fn element_text(doc: &Document<'_>, local_name: &str) -> Option<String> {
    let node = doc
        .descendants()
        .find(|node| node.is_element() && node.tag_name().name() == local_name)?;
    let text: String = node
        .descendants()
        .filter(|child| child.is_text())
        .filter_map(|child| child.text())
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[derive(Debug, Clone)]
pub struct ArchivedExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed store for raw report exports.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    root: PathBuf,
}

impl ExportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        report_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{report_id}-{content_hash}.csv"))
    }

    /// Write an export once; an identical export for the same day, source and
    /// report is not written again.
    pub async fn archive(
        &self,
        source_id: &str,
        export: &FetchedExport,
    ) -> anyhow::Result<ArchivedExport> {
        let bytes = export.body.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::relative_path_for(export.fetched_at, source_id, &export.report_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let archived = |deduplicated| ArchivedExport {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp archive {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(archived(false))
    }
}
