//! Visibility preloader: hides unprocessed pictures before they paint.
//!
//! Pages that hydrate client-side are left alone; injecting a rule there would
//! make the server markup diverge from what the client framework expects.

use crate::document::{Document, DocumentShell, StyleError};
use std::time::Duration;
use tokio::time::sleep;

/// Hides every picture that has not been processed and is not an inline payload.
pub const HIDE_RULE: &str =
    r#"img:not([data-veil-processed]):not([src^="data:"]) { visibility: hidden !important; }"#;

/// Markup fragments left by client-side hydrating frameworks.
const HYDRATION_SIGNATURES: &[&str] = &[
    "__NEXT_DATA__",
    "id=\"__next\"",
    "data-reactroot",
    "__NUXT__",
    "ng-version",
    "data-server-rendered",
    "data-sveltekit",
    "___gatsby",
    "__remixContext",
    "astro-island",
];

/// Hosts known to hydrate without leaving a recognizable signature.
const HYDRATING_HOSTS: &[&str] = &[
    "twitter.com",
    "x.com",
    "facebook.com",
    "instagram.com",
    "reddit.com",
    "youtube.com",
    "linkedin.com",
];

const INSTALL_ATTEMPTS: u32 = 20;
const INSTALL_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOutcome {
    Installed,
    /// Page hydrates; the first pass must wait for an idle point.
    SkippedHydration,
    /// The document head never appeared.
    Failed,
}

pub fn detects_hydration(shell: &DocumentShell) -> bool {
    let host = shell.host.trim_start_matches("www.").to_ascii_lowercase();
    let host_match = HYDRATING_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{h}")));
    host_match || HYDRATION_SIGNATURES.iter().any(|sig| shell.markup.contains(sig))
}

/// Install [`HIDE_RULE`], retrying while the head does not exist yet.
pub async fn install(document: &dyn Document) -> PreloadOutcome {
    let shell = document.shell();
    if detects_hydration(&shell) {
        tracing::info!(host = %shell.host, "hydrating page, preloader skipped");
        return PreloadOutcome::SkippedHydration;
    }

    for attempt in 1..=INSTALL_ATTEMPTS {
        match document.install_style_rule(HIDE_RULE) {
            Ok(()) => {
                tracing::debug!(attempt, "hide rule installed");
                return PreloadOutcome::Installed;
            }
            Err(StyleError::HeadMissing) => sleep(INSTALL_RETRY).await,
        }
    }
    tracing::warn!(attempts = INSTALL_ATTEMPTS, "document head never appeared, hide rule not installed");
    PreloadOutcome::Failed
}

/// Wait for the host page's next idle point, at most `fallback`.
pub async fn wait_for_hydration(document: &dyn Document, fallback: Duration) {
    let idle = document.on_idle();
    if tokio::time::timeout(fallback, idle).await.is_err() {
        tracing::debug!(?fallback, "no idle point before fallback, starting first pass");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryDocument;
    use std::sync::Arc;

    fn shell(host: &str, markup: &str) -> DocumentShell {
        DocumentShell {
            host: host.into(),
            markup: markup.into(),
        }
    }

    #[test]
    fn test_detects_framework_signatures() {
        assert!(detects_hydration(&shell(
            "shop.example",
            r#"<script id="__NEXT_DATA__" type="application/json">{}</script>"#
        )));
        assert!(detects_hydration(&shell("example.org", r#"<div data-server-rendered="true">"#)));
        assert!(!detects_hydration(&shell("example.org", "<html><body><img src=a.jpg>")));
    }

    #[test]
    fn test_detects_allow_listed_hosts() {
        assert!(detects_hydration(&shell("www.reddit.com", "")));
        assert!(detects_hydration(&shell("old.reddit.com", "")));
        assert!(!detects_hydration(&shell("notreddit.com", "")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_retries_until_head_exists() {
        let doc = Arc::new(MemoryDocument::new().without_head());
        let late = doc.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(35)).await;
            late.create_head();
        });
        assert_eq!(install(doc.as_ref()).await, PreloadOutcome::Installed);
        assert_eq!(doc.style_rules(), vec![HIDE_RULE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_gives_up_without_head() {
        let doc = MemoryDocument::new().without_head();
        assert_eq!(install(&doc).await, PreloadOutcome::Failed);
    }

    #[tokio::test]
    async fn test_hydrating_page_gets_no_rule() {
        let doc = MemoryDocument::with_shell(shell("x.com", ""));
        assert_eq!(install(&doc).await, PreloadOutcome::SkippedHydration);
        assert!(doc.style_rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_hydration_falls_back() {
        let doc = MemoryDocument::new();
        let start = tokio::time::Instant::now();
        wait_for_hydration(&doc, Duration::from_millis(1_500)).await;
        assert!(start.elapsed() >= Duration::from_millis(1_500));
    }
}
