use std::collections::BTreeSet;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

pub const HF_API_URL: &str = "https://huggingface.co";

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const DETAIL_TIMEOUT: Duration = Duration::from_secs(5);
const TRENDING_DOWNLOADS: u64 = 100_000;

/// Result size for an empty query and for a real one.
pub const TRENDING_LIMIT: usize = 10;
pub const SEARCH_LIMIT: usize = 20;

const VLLM_ARCHITECTURES: [&str; 18] = [
    "llama", "mistral", "qwen", "phi", "gemma", "gpt2", "gptj", "gpt_neox", "opt", "bloom", "falcon", "mpt",
    "starcoder", "baichuan", "aquila", "chatglm", "internlm", "yi",
];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub name: String,
    pub description: String,
    pub downloads: u64,
    pub likes: u64,
    pub size: String,
    pub task: String,
    pub quantizations: Vec<String>,
    pub vllm_compatible: bool,
    pub trending: bool,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    id: String,
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
    #[serde(default)]
    pipeline_tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiModelDetail {
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
    #[serde(default)]
    siblings: Vec<Sibling>,
    #[serde(default)]
    config: Option<ApiConfig>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Sibling {
    pub rfilename: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiConfig {
    #[serde(default)]
    model_type: Option<String>,
}

/// Text-generation model search against the Hugging Face hub API.
#[derive(Clone)]
pub struct HfSearchClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HfSearchClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    /// Top models for `query`, most downloaded first. No query lists the
    /// trending ones. Never fails: an unreachable hub yields a fixed list.
    pub async fn search(&self, query: Option<&str>) -> Vec<SearchResult> {
        let (query, limit) = match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => (q, SEARCH_LIMIT),
            None => ("", TRENDING_LIMIT),
        };
        match self.list(query, limit).await {
            Ok(models) => {
                let mut out = join_all(models.into_iter().map(|m| self.enrich(m))).await;
                out.truncate(limit);
                out
            }
            Err(e) => {
                warn!(query=%query, "hf search failed, serving trending list: {e}");
                let mut out = trending_models();
                out.truncate(limit);
                out
            }
        }
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn list(&self, query: &str, limit: usize) -> Result<Vec<ApiModel>> {
        let limit = limit.to_string();
        let resp = self
            .get(format!("{}/api/models", self.base_url))
            .query(&[
                ("search", query),
                ("filter", "text-generation"),
                ("limit", limit.as_str()),
                ("sort", "downloads"),
            ])
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn detail(&self, model_id: &str) -> Result<ApiModelDetail> {
        let resp = self
            .get(format!("{}/api/models/{model_id}", self.base_url))
            .timeout(DETAIL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn enrich(&self, model: ApiModel) -> SearchResult {
        let name = model.id.rsplit('/').next().unwrap_or(&model.id).to_string();
        match self.detail(&model.id).await {
            Ok(detail) => SearchResult {
                name,
                description: model.pipeline_tag.unwrap_or_else(|| "Text generation model".to_string()),
                downloads: detail.downloads,
                likes: detail.likes,
                size: size_from_files(&detail.siblings),
                task: "text-generation".to_string(),
                quantizations: detect_quantizations(&detail.siblings),
                vllm_compatible: vllm_compatible(
                    detail.config.as_ref().and_then(|c| c.model_type.as_deref()),
                    &detail.tags,
                ),
                trending: detail.downloads > TRENDING_DOWNLOADS,
                id: model.id,
            },
            Err(e) => {
                debug!(model_id=%model.id, "hf detail fetch failed: {e}");
                SearchResult {
                    name,
                    description: "Model from Hugging Face".to_string(),
                    downloads: model.downloads,
                    likes: model.likes,
                    size: "Unknown".to_string(),
                    task: "text-generation".to_string(),
                    quantizations: vec!["Q4_K_M".to_string(), "Q5_K_M".to_string()],
                    vllm_compatible: true,
                    trending: false,
                    id: model.id,
                }
            }
        }
    }
}

/// Quantizations offered by a repo, judged from its file names. Sorted.
pub fn detect_quantizations(files: &[Sibling]) -> Vec<String> {
    let mut found = BTreeSet::new();
    for f in files {
        let lower = f.rfilename.to_ascii_lowercase();
        for (needle, label) in [
            ("awq", "AWQ"),
            ("gptq", "GPTQ"),
            ("q4_k_m", "Q4_K_M"),
            ("q5_k_m", "Q5_K_M"),
            ("q8_0", "Q8_0"),
            ("f16", "F16"),
        ] {
            if lower.contains(needle) {
                found.insert(label);
            }
        }
        // gguf repos usually ship several quants
        if f.rfilename.contains(".gguf") {
            found.extend(["Q4_K_M", "Q5_K_M", "Q8_0"]);
        }
    }
    if found.is_empty() {
        found.extend(["Q4_K_M", "Q5_K_M"]);
    }
    found.into_iter().map(str::to_string).collect()
}

/// A known architecture or a text-generation tag is compatible. A repo that
/// names an unknown architecture and carries no such tag is not; one that
/// names none is given the benefit of the doubt.
pub fn vllm_compatible(model_type: Option<&str>, tags: &[String]) -> bool {
    if tags.iter().any(|t| t == "text-generation") {
        return true;
    }
    match model_type.map(str::to_ascii_lowercase) {
        Some(arch) if !arch.is_empty() => VLLM_ARCHITECTURES.iter().any(|a| arch.contains(a)),
        _ => true,
    }
}

fn size_from_files(files: &[Sibling]) -> String {
    let total: u64 = files.iter().filter_map(|f| f.size).sum();
    if total == 0 {
        return "Unknown".to_string();
    }
    let gb = total as f64 / 1024f64.powi(3);
    if gb > 1.0 {
        format!("{gb:.1}GB")
    } else {
        format!("{:.0}MB", total as f64 / 1024f64.powi(2))
    }
}

fn trending_models() -> Vec<SearchResult> {
    let entry = |id: &str, name: &str, description: &str, downloads: u64, likes: u64, size: &str, quants: &[&str]| {
        SearchResult {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            downloads,
            likes,
            size: size.to_string(),
            task: "text-generation".to_string(),
            quantizations: quants.iter().map(|q| q.to_string()).collect(),
            vllm_compatible: true,
            trending: true,
        }
    };
    vec![
        entry(
            "meta-llama/Meta-Llama-3.1-8B-Instruct",
            "Llama 3.1 8B Instruct",
            "Latest Llama model optimized for instruction following",
            2_500_000,
            15_000,
            "16GB",
            &["Q4_K_M", "Q5_K_M", "Q8_0", "F16"],
        ),
        entry(
            "Qwen/Qwen2.5-32B-Instruct-AWQ",
            "Qwen 2.5 32B Instruct AWQ",
            "State-of-the-art model with 32K context length",
            1_800_000,
            12_000,
            "18GB",
            &["AWQ"],
        ),
        entry(
            "mistralai/Mistral-7B-Instruct-v0.2",
            "Mistral 7B Instruct v0.2",
            "Efficient 7B model with sliding window attention",
            3_200_000,
            18_000,
            "14GB",
            &["Q4_K_M", "Q5_K_M", "Q8_0"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    fn sib(name: &str) -> Sibling {
        Sibling { rfilename: name.to_string(), size: None }
    }

    #[test]
    fn test_detect_quantizations() {
        let gguf = detect_quantizations(&[sib("README.md"), sib("phi-3-mini.Q4_K_M.gguf")]);
        assert_eq!(gguf, vec!["Q4_K_M", "Q5_K_M", "Q8_0"]);

        let awq = detect_quantizations(&[sib("config.json"), sib("model-awq.safetensors"), sib("model.fp16.bin")]);
        assert_eq!(awq, vec!["AWQ", "F16"]);

        assert_eq!(detect_quantizations(&[sib("model.safetensors")]), vec!["Q4_K_M", "Q5_K_M"]);
        assert_eq!(detect_quantizations(&[]), vec!["Q4_K_M", "Q5_K_M"]);
    }

    #[test]
    fn test_vllm_compatible() {
        assert!(vllm_compatible(Some("Qwen2"), &[]));
        assert!(vllm_compatible(Some("mamba"), &["text-generation".to_string()]));
        assert!(!vllm_compatible(Some("mamba"), &["conversational".to_string()]));
        assert!(vllm_compatible(None, &[]));
    }

    #[test]
    fn test_size_from_files() {
        let files = |sizes: &[Option<u64>]| -> Vec<Sibling> {
            sizes.iter().map(|s| Sibling { rfilename: "f".into(), size: *s }).collect()
        };
        assert_eq!(size_from_files(&files(&[None, None])), "Unknown");
        assert_eq!(size_from_files(&files(&[Some(3 << 30), Some(1 << 29), None])), "3.5GB");
        assert_eq!(size_from_files(&files(&[Some(300 << 20)])), "300MB");
    }

    async fn spawn_hf() -> String {
        async fn list(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
            let authed = headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer hf_test");
            assert_eq!(q.get("filter").map(String::as_str), Some("text-generation"));
            assert_eq!(q.get("sort").map(String::as_str), Some("downloads"));
            let search = q.get("search").cloned().unwrap_or_default();
            let limit = q.get("limit").cloned().unwrap_or_default();
            Json(json!([
                {"id": "Qwen/Qwen2.5-7B-Instruct-AWQ", "downloads": 5, "likes": 1, "pipeline_tag": "text-generation"},
                {"id": "someone/broken", "downloads": 7, "likes": 2},
                {"id": format!("meta/{search}-{limit}-{authed}"), "downloads": 0, "likes": 0}
            ]))
        }
        async fn detail(Path(id): Path<String>) -> std::result::Result<Json<Value>, StatusCode> {
            match id.as_str() {
                "Qwen/Qwen2.5-7B-Instruct-AWQ" => Ok(Json(json!({
                    "downloads": 250000,
                    "likes": 900,
                    "config": {"model_type": "qwen2"},
                    "siblings": [
                        {"rfilename": "config.json", "size": 1024},
                        {"rfilename": "model-awq.safetensors", "size": 5368709120u64}
                    ]
                }))),
                "someone/broken" => Err(StatusCode::INTERNAL_SERVER_ERROR),
                _ => Ok(Json(json!({"downloads": 3, "siblings": []}))),
            }
        }

        let app = Router::new()
            .route("/api/models", get(list))
            .route("/api/models/*id", get(detail));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_search_enriches_each_hit() {
        let url = spawn_hf().await;
        let client = HfSearchClient::new(url, Some("hf_test".into()));

        let results = client.search(Some("qwen")).await;

        assert_eq!(results.len(), 3);
        let qwen = &results[0];
        assert_eq!(qwen.name, "Qwen2.5-7B-Instruct-AWQ");
        assert_eq!(qwen.description, "text-generation");
        assert_eq!(qwen.downloads, 250000);
        assert_eq!(qwen.size, "5.0GB");
        assert_eq!(qwen.quantizations, vec!["AWQ"]);
        assert!(qwen.vllm_compatible);
        assert!(qwen.trending);

        let broken = &results[1];
        assert_eq!(broken.description, "Model from Hugging Face");
        assert_eq!(broken.downloads, 7);
        assert_eq!(broken.size, "Unknown");
        assert_eq!(broken.quantizations, vec!["Q4_K_M", "Q5_K_M"]);

        assert_eq!(results[2].id, "meta/qwen-20-true");
        assert_eq!(results[2].description, "Text generation model");
        assert!(!results[2].trending);
    }

    #[tokio::test]
    async fn test_empty_query_lists_trending_without_token() {
        let url = spawn_hf().await;
        let client = HfSearchClient::new(url, None);

        let results = client.search(Some("  ")).await;

        assert_eq!(results[2].id, "meta/-10-false");
    }

    #[tokio::test]
    async fn test_unreachable_hub_serves_fixed_list() {
        let client = HfSearchClient::new("http://127.0.0.1:9", None);
        let results = client.search(None).await;
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "meta-llama/Meta-Llama-3.1-8B-Instruct",
                "Qwen/Qwen2.5-32B-Instruct-AWQ",
                "mistralai/Mistral-7B-Instruct-v0.2"
            ]
        );
        assert!(results.iter().all(|r| r.trending && r.vllm_compatible));
    }
}
