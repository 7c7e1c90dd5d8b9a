//! Client for the Connect cluster REST control plane.
use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;

/// The Connect REST API rejected a request.
#[derive(Debug, thiserror::Error)]
#[error("connect API {method} {path} returned {status}: {body}")]
pub struct ConnectApiError {
    pub method: &'static str,
    pub path: String,
    pub status: u16,
    pub body: String,
}

impl ConnectApiError {
    /// True when the error is a missing-resource response.
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// Status document reported for a connector.
#[derive(Clone, Debug, Deserialize)]
pub struct ConnectorStatus {
    pub name: String,
    pub connector: ConnectorState,
    #[serde(default)]
    pub tasks: Vec<ConnectorTaskState>,
}

impl ConnectorStatus {
    /// True once the connector itself reports RUNNING.
    pub fn is_running(&self) -> bool {
        self.connector.state == "RUNNING"
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConnectorState {
    pub state: String,
    #[serde(default)]
    pub worker_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConnectorTaskState {
    pub id: u32,
    pub state: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
}

/// Client for the Connect cluster REST control plane.
#[derive(Clone)]
pub struct ConnectClient {
    base_url: String,
    client: reqwest::Client,
}

impl ConnectClient {
    pub fn new(base_url: &str) -> ConnectClient {
        ConnectClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// List the names of all connectors in the cluster.
    pub async fn connectors(&self) -> Result<Vec<String>> {
        let response = self.get("/connectors").await?;
        let names = serde_json::from_value(response)?;
        Ok(names)
    }

    /// Fetch a connector's definition.
    pub async fn connector(&self, name: &str) -> Result<Value> {
        self.get(&format!("/connectors/{}", name)).await
    }

    /// Fetch a connector's status.
    pub async fn status(&self, name: &str) -> Result<ConnectorStatus> {
        let response = self.get(&format!("/connectors/{}/status", name)).await?;
        let status = serde_json::from_value(response)?;
        Ok(status)
    }

    /// Create a connector with the given configuration.
    pub async fn create(&self, name: &str, config: &BTreeMap<String, String>) -> Result<Value> {
        let body = json!({ "name": name, "config": config });
        self.send("POST", "/connectors", Some(&body)).await
    }

    /// Replace a connector's configuration.
    pub async fn update_config(
        &self,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let body = serde_json::to_value(config)?;
        self.send("PUT", &format!("/connectors/{}/config", name), Some(&body))
            .await
    }

    /// Restart a connector.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.send("POST", &format!("/connectors/{}/restart", name), None)
            .await?;
        Ok(())
    }

    /// Pause a connector; its tasks stop polling until resumed.
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.send("PUT", &format!("/connectors/{}/pause", name), None)
            .await?;
        Ok(())
    }

    /// Resume a paused connector.
    pub async fn resume(&self, name: &str) -> Result<()> {
        self.send("PUT", &format!("/connectors/{}/resume", name), None)
            .await?;
        Ok(())
    }

    /// Delete a connector resource.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.send("DELETE", &format!("/connectors/{}", name), None)
            .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send("GET", path, None).await
    }

    async fn send(&self, method: &'static str, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            other => anyhow::bail!("unsupported connect API method '{}'", other),
        };
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(ConnectApiError {
                method,
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let raw = response.text().await?;
        if raw.is_empty() {
            return Ok(Value::Null);
        }
        let value = serde_json::from_str(&raw)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectorStatus;

    #[test]
    fn status_running_detection() {
        let status: ConnectorStatus = serde_json::from_value(serde_json::json!({
            "name": "tributary-orders",
            "connector": { "state": "RUNNING", "worker_id": "10.0.0.5:8083" },
            "tasks": [{ "id": 0, "state": "RUNNING", "worker_id": "10.0.0.5:8083" }],
        }))
        .unwrap();
        assert!(status.is_running());
    }

    #[test]
    fn status_failed_detection() {
        let status: ConnectorStatus = serde_json::from_value(serde_json::json!({
            "name": "tributary-orders",
            "connector": { "state": "FAILED" },
        }))
        .unwrap();
        assert!(!status.is_running());
        assert!(status.tasks.is_empty());
    }
}
