use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::CoreResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageLayout {
    pub format: String,
    pub landscape: bool,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self { format: "A4".to_string(), landscape: false }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectAcl {
    Private,
    PublicRead,
}

/// Headless-browser print service.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render_pdf(&self, url: &str, selector: &str, layout: &PageLayout) -> CoreResult<Vec<u8>>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        acl: ObjectAcl,
    ) -> CoreResult<()>;
}
