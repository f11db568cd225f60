use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};
use weave_core::documents::{ObjectAcl, ObjectStorage, PageLayout, PdfRenderer};
use weave_core::{CoreError, CoreResult};

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    wait_for_selector: &'a str,
    format: &'a str,
    landscape: bool,
}

/// Client for the headless-browser print service.
#[derive(Clone)]
pub struct HttpPdfRenderer {
    endpoint: String,
    client: Client,
}

impl HttpPdfRenderer {
    pub fn new(endpoint: &str) -> Self {
        Self { endpoint: endpoint.to_string(), client: Client::new() }
    }
}

#[async_trait]
impl PdfRenderer for HttpPdfRenderer {
    async fn render_pdf(&self, url: &str, selector: &str, layout: &PageLayout) -> CoreResult<Vec<u8>> {
        let body = RenderRequest {
            url,
            wait_for_selector: selector,
            format: &layout.format,
            landscape: layout.landscape,
        };
        debug!("Rendering {} to PDF", url);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::DocumentError(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(CoreError::DocumentError(format!("render failed ({}): {}", status, message)));
        }
        let bytes = response.bytes().await.map_err(|e| CoreError::DocumentError(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Object store reached over plain HTTP PUT, e.g. a presigning proxy in front of S3.
#[derive(Clone)]
pub struct HttpObjectStorage {
    base_url: String,
    client: Client,
}

impl HttpObjectStorage {
    pub fn new(base_url: &str, token: Option<&str>) -> CoreResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let val = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| CoreError::DocumentError(e.to_string()))?;
            headers.insert(AUTHORIZATION, val);
        }
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::DocumentError(e.to_string()))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
    }
}

fn acl_header(acl: ObjectAcl) -> &'static str {
    match acl {
        ObjectAcl::Private => "private",
        ObjectAcl::PublicRead => "public-read",
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        acl: ObjectAcl,
    ) -> CoreResult<()> {
        let url = format!("{}/{}/{}", self.base_url, bucket, key);
        let size = bytes.len();
        let response = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, content_type)
            .header("x-amz-acl", acl_header(acl))
            .body(bytes)
            .send()
            .await
            .map_err(|e| CoreError::DocumentError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::DocumentError(format!(
                "upload of {} failed with {}",
                key,
                response.status().as_u16()
            )));
        }
        info!("Uploaded {} bytes to {}/{}", size, bucket, key);
        Ok(())
    }
}
