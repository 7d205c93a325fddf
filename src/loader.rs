//! Document loader: local files plus an optional URL list.
//!
//! Output order is every local file (sorted by file name) followed by every
//! URL (in listing order). A file or URL that cannot be read, fetched or
//! extracted is logged and skipped; it never aborts the load.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use kb_assist_core::models::Document;

use crate::extract::{self, DocumentKind};

pub struct DocumentLoader {
    client: reqwest::Client,
}

impl DocumentLoader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("kba/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Load `docs_dir/*` then every URL in `urls_file`.
    ///
    /// A missing `docs_dir` or `urls_file` contributes nothing.
    pub async fn load(&self, docs_dir: &Path, urls_file: &Path) -> Result<Vec<Document>> {
        let mut documents = load_files(docs_dir);
        if urls_file.exists() {
            documents.extend(self.load_urls(urls_file).await?);
        }
        Ok(documents)
    }

    pub async fn load_urls(&self, urls_file: &Path) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        for url in read_url_list(urls_file)? {
            match self.fetch_url(&url).await {
                Ok(doc) => documents.push(doc),
                Err(e) => warn!(url = %url, error = %format!("{:#}", e), "skipping URL"),
            }
        }
        Ok(documents)
    }

    /// Fetch one URL and reduce it to text. Non-2xx statuses are errors.
    pub async fn fetch_url(&self, url: &str) -> Result<Document> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} from {}", status, url);
        }

        let kind = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(DocumentKind::from_content_type)
            .unwrap_or(DocumentKind::Html);
        let body = response.bytes().await?;
        let extracted = extract::extract(&body, kind)?;
        debug!(url = %url, chars = extracted.text.chars().count(), "fetched URL");

        let mut doc = Document::new(extracted.text, url).with_metadata("source_type", "url");
        if let Some(title) = extracted.title {
            doc = doc.with_metadata("title", title);
        }
        Ok(doc)
    }
}

/// Every regular file directly under `docs_dir`, sorted by file name.
///
/// Dotfiles are ignored.
pub fn load_files(docs_dir: &Path) -> Vec<Document> {
    if !docs_dir.is_dir() {
        return Vec::new();
    }

    let walker = WalkDir::new(docs_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();

    let mut documents = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        match load_file(entry.path()) {
            Ok(doc) => documents.push(doc),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %format!("{:#}", e), "skipping file")
            }
        }
    }
    documents
}

fn load_file(path: &Path) -> Result<Document> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let extracted = extract::extract(&bytes, DocumentKind::from_path(path))?;

    let mut doc = Document::new(extracted.text, path.display().to_string())
        .with_metadata("source_type", "file");
    if let Some(name) = path.file_name() {
        doc = doc.with_metadata("file_name", name.to_string_lossy());
    }
    if let Some(title) = extracted.title {
        doc = doc.with_metadata("title", title);
    }
    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
        let modified: DateTime<Utc> = modified.into();
        doc = doc.with_metadata("modified", modified.to_rfc3339());
    }
    Ok(doc)
}

/// One URL per line; blank lines and `#` comments are ignored.
pub fn read_url_list(urls_file: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(urls_file)
        .with_context(|| format!("Failed to read {}", urls_file.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn loader() -> DocumentLoader {
        DocumentLoader::new(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_files_sorted_and_not_recursive() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), "second").unwrap();
        std::fs::write(dir.path().join("a.md"), "first").unwrap();
        std::fs::write(dir.path().join(".hidden"), "nope").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c.txt"), "deep").unwrap();

        let docs = load_files(dir.path());
        let contents: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(docs[0].metadata.get("file_name").map(String::as_str), Some("a.md"));
    }

    #[test]
    fn test_unparseable_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.pdf"), "not a pdf").unwrap();
        std::fs::write(dir.path().join("ok.txt"), "fine").unwrap();
        let docs = load_files(dir.path());
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "fine");
    }

    #[test]
    fn test_url_list_ignores_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(&path, "https://a.example\n\n   \n# note\nhttps://b.example\n").unwrap();
        assert_eq!(
            read_url_list(&path).unwrap(),
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[tokio::test]
    async fn test_missing_urls_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "local").unwrap();
        let docs = loader()
            .load(dir.path(), &dir.path().join("urls.txt"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_url_does_not_abort_load() {
        let dir = TempDir::new().unwrap();
        let docs_dir = dir.path().join("docs");
        std::fs::create_dir(&docs_dir).unwrap();
        std::fs::write(docs_dir.join("a.txt"), "local").unwrap();
        let urls = dir.path().join("urls.txt");
        // Port 9 (discard) is closed on loopback, so the connect fails fast.
        std::fs::write(&urls, "http://127.0.0.1:9/nothing\n").unwrap();

        let docs = loader().load(&docs_dir, &urls).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "local");
    }

    async fn serve_html(server: &MockServer, route: &str, html: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html; charset=utf-8"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_urls_follow_local_files_in_listing_order() {
        let server = MockServer::start().await;
        serve_html(
            &server,
            "/paris",
            "<html><head><title>Paris</title><script>var x = 1;</script></head>\
             <body><p>Paris is the capital of France.</p></body></html>",
        )
        .await;
        serve_html(
            &server,
            "/berlin",
            "<html><head><title>Berlin</title></head>\
             <body><h1>Germany</h1><p>Berlin is the capital.</p></body></html>",
        )
        .await;

        let dir = TempDir::new().unwrap();
        let docs_dir = dir.path().join("docs");
        std::fs::create_dir(&docs_dir).unwrap();
        std::fs::write(docs_dir.join("z.txt"), "local notes").unwrap();
        let berlin = format!("{}/berlin", server.uri());
        let paris = format!("{}/paris", server.uri());
        let urls = dir.path().join("urls.txt");
        std::fs::write(&urls, format!("{berlin}\n# skipped\n{paris}\n")).unwrap();

        let docs = loader().load(&docs_dir, &urls).await.unwrap();
        let local = docs_dir.join("z.txt").display().to_string();
        let sources: Vec<String> = docs.iter().map(|d| d.source.clone()).collect();
        assert_eq!(sources, vec![local, berlin, paris]);

        assert_eq!(docs[1].metadata.get("title").map(String::as_str), Some("Berlin"));
        assert_eq!(docs[1].metadata.get("source_type").map(String::as_str), Some("url"));
        assert_eq!(docs[1].content, "Germany\nBerlin is the capital.");
        assert_eq!(docs[2].metadata.get("title").map(String::as_str), Some("Paris"));
        assert_eq!(docs[2].content, "Paris is the capital of France.");
        assert!(!docs[2].content.contains("var x"));
    }

    #[tokio::test]
    async fn test_http_error_status_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        serve_html(&server, "/ok", "<html><body><p>still here</p></body></html>").await;

        let dir = TempDir::new().unwrap();
        let urls = dir.path().join("urls.txt");
        std::fs::write(&urls, format!("{0}/gone\n{0}/ok\n", server.uri())).unwrap();

        let docs = loader().load_urls(&urls).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source, format!("{}/ok", server.uri()));
        assert_eq!(docs[0].content, "still here");
        assert!(docs[0].metadata.get("title").is_none());
    }
}
