//! Concrete `archive_store::blob::Downloader` over `reqwest` (spec §4.B),
//! kept in this crate rather than `archive-store` so the store crate never
//! depends on an HTTP client.

use archive_store::Downloader;

#[derive(Clone)]
pub struct ReqwestDownloader {
    http: reqwest::Client,
}

impl ReqwestDownloader {
    pub fn new(http: reqwest::Client) -> ReqwestDownloader {
        ReqwestDownloader { http }
    }
}

#[async_trait::async_trait]
impl Downloader for ReqwestDownloader {
    async fn fetch(&self, download_url: &str) -> Result<Vec<u8>, String> {
        let resp = self.http.get(download_url).send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(resp.status().to_string());
        }
        resp.bytes().await.map(|b| b.to_vec()).map_err(|e| e.to_string())
    }
}
