//! Dependency probes
//!
//! A probe answers one question: is this dependency usable right now? The
//! supervisor wraps every dependency probe in that dependency's circuit breaker
//! and bounds it with the configured probe timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use tracing::trace;

use crate::config::{CommandSpec, HttpMethod, ProbeConfig};
use crate::process;
use crate::storage::StorageBackend;

#[async_trait]
pub trait DependencyProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// Checks an HTTP endpoint (status code and optional body pattern)
pub struct HttpProbe {
    url: String,
    method: HttpMethod,
    expected_status: Option<Vec<u16>>,
    body_pattern: Option<Regex>,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(
        url: impl Into<String>,
        method: HttpMethod,
        expected_status: Option<Vec<u16>>,
        body_pattern: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let body_pattern = body_pattern
            .map(Regex::new)
            .transpose()
            .context("invalid body pattern")?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            url: url.into(),
            method,
            expected_status,
            body_pattern,
            client,
        })
    }

    fn status_ok(&self, status_code: u16) -> bool {
        match &self.expected_status {
            Some(expected) => expected.contains(&status_code),
            None => (200..300).contains(&status_code),
        }
    }
}

#[async_trait]
impl DependencyProbe for HttpProbe {
    async fn probe(&self) -> Result<()> {
        trace!("probing {}", self.url);

        let method = match self.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Head => reqwest::Method::HEAD,
        };

        let response = self
            .client
            .request(method, &self.url)
            .send()
            .await
            .context("HTTP request failed")?;

        let status_code = response.status().as_u16();
        if !self.status_ok(status_code) {
            bail!("unexpected status code: {status_code}");
        }

        if let Some(pattern) = &self.body_pattern {
            let body = response
                .text()
                .await
                .context("failed to read response body")?;

            if !pattern.is_match(&body) {
                bail!("response body does not match '{pattern}'");
            }
        }

        Ok(())
    }
}

/// Healthy when the command exits with status 0 (e.g. `zpool list`, `docker info`)
pub struct CommandProbe {
    spec: CommandSpec,
}

impl CommandProbe {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl DependencyProbe for CommandProbe {
    async fn probe(&self) -> Result<()> {
        process::run(&self.spec).await.map(|_| ())
    }
}

/// Liveness query against the storage backend
pub struct DatabaseProbe {
    backend: Arc<dyn StorageBackend>,
}

impl DatabaseProbe {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl DependencyProbe for DatabaseProbe {
    async fn probe(&self) -> Result<()> {
        let status = self.backend.health_check().await?;
        if !status.healthy {
            bail!("{}", status.message);
        }
        Ok(())
    }
}

/// Build the probe described by a dependency's configuration
pub fn build_probe(config: &ProbeConfig, timeout: Duration) -> Result<Arc<dyn DependencyProbe>> {
    let probe: Arc<dyn DependencyProbe> = match config {
        ProbeConfig::Http {
            url,
            method,
            expected_status,
            body_pattern,
        } => Arc::new(HttpProbe::new(
            url.clone(),
            *method,
            expected_status.clone(),
            body_pattern.as_deref(),
            timeout,
        )?),
        ProbeConfig::Command(spec) => Arc::new(CommandProbe::new(spec.clone())),
    };

    Ok(probe)
}
