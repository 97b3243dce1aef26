use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use tracing::warn;

use crate::{ModelOpsError, Result};

/// Timeout for inventory and delete calls. Pulls are unbounded.
pub const AUX_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Deserialize)]
pub struct HubModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<HubModel>,
}

/// One line of the pull stream.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PullEvent {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullEvent {
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("success")
    }

    pub fn percent(&self) -> Option<u8> {
        match (self.completed, self.total) {
            (Some(c), Some(t)) if t > 0 => Some(((c.min(t) * 100) / t) as u8),
            _ => None,
        }
    }
}

/// Client for an Ollama-style model hub.
#[derive(Clone)]
pub struct HubClient {
    base_url: String,
    client: reqwest::Client,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn tags(&self) -> Result<Vec<HubModel>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(url)
            .timeout(AUX_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let body: TagsResponse = resp.json().await?;
        Ok(body.models)
    }

    /// Start a pull and return its NDJSON progress lines.
    pub async fn pull(&self, name: &str) -> Result<BoxStream<'static, Result<PullEvent>>> {
        let url = format!("{}/api/pull", self.base_url);
        let resp = self
            .client
            .post(url)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?
            .error_for_status()?;
        Ok(ndjson(resp.bytes_stream()).boxed())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let url = format!("{}/api/delete", self.base_url);
        let resp = self
            .client
            .delete(url)
            .timeout(AUX_TIMEOUT)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ModelOpsError::ExternalTool(format!(
                "hub delete of {name} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

struct LineState<S> {
    inner: Pin<Box<S>>,
    buf: Vec<u8>,
    done: bool,
}

/// Split a byte stream into JSON lines. Blank lines are skipped; a line that
/// is not valid JSON is logged and skipped.
pub(crate) fn ndjson<S, B, E>(bytes: S) -> impl Stream<Item = Result<PullEvent>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ModelOpsError> + Send + 'static,
{
    let state = LineState {
        inner: Box::pin(bytes),
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                if let Some(ev) = parse_line(&line) {
                    return Some((Ok(ev), st));
                }
                continue;
            }
            if st.done {
                if st.buf.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut st.buf);
                match parse_line(&line) {
                    Some(ev) => return Some((Ok(ev), st)),
                    None => return None,
                }
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(e.into()), st));
                }
                None => st.done = true,
            }
        }
    })
}

fn parse_line(line: &[u8]) -> Option<PullEvent> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<PullEvent>(text) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!("hub: skipping malformed pull line: {e}");
            None
        }
    }
}
