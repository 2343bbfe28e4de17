//! Page extraction: render the URL in a pooled browser, apply the config's
//! locators, normalize the values. Deterministic for a fixed page and
//! config; never touches the database.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::debug;

use browser_pool::{BrowserPool, PageHandle, PoolError};
use watcher_common::{
    check_url, normalize_value, resolve_and_check, ExtractError, KeySpec, LocatorKind, StateMap,
    Target,
};

pub struct Extractor {
    pool: Arc<BrowserPool>,
    lease_timeout: Duration,
}

impl Extractor {
    pub fn new(pool: Arc<BrowserPool>, lease_timeout: Duration) -> Self {
        Self {
            pool,
            lease_timeout,
        }
    }

    /// Render the target's URL and reduce it to a normalized state map.
    ///
    /// A locator that matches nothing records an empty string for its key;
    /// only a page where every locator comes up empty is an error.
    pub async fn extract(&self, target: &Target) -> Result<StateMap, ExtractError> {
        // The URL was vetted at admission, but DNS may have moved since.
        let url = check_url(&target.url)
            .map_err(|e| ExtractError::SsrfRejected(e.to_string()))?;
        resolve_and_check(&url)
            .await
            .map_err(|e| ExtractError::SsrfRejected(e.to_string()))?;

        let mut lease = self
            .pool
            .lease(self.lease_timeout)
            .await
            .map_err(map_pool_error)?;

        let page = lease
            .load_page(target.url.as_str())
            .await
            .map_err(map_pool_error)?;

        let mut state = StateMap::new();
        let mut matched_any = false;

        for (key, spec) in &target.config.keys {
            match self.evaluate_locator(&page, spec).await {
                Ok(Some(raw)) => {
                    matched_any = true;
                    state.insert(key.clone(), normalize_value(&raw, &spec.normalize, key));
                }
                Ok(None) => {
                    debug!(target_id = %target.id, key, "locator matched nothing");
                    state.insert(key.clone(), String::new());
                }
                Err(e) => {
                    // A broken evaluation usually means a wedged renderer.
                    lease.mark_faulted();
                    return Err(e);
                }
            }
        }

        drop(page);

        if !matched_any && !target.config.keys.is_empty() {
            return Err(ExtractError::SelectorAllMissing);
        }

        Ok(state)
    }

    async fn evaluate_locator(
        &self,
        page: &PageHandle,
        spec: &KeySpec,
    ) -> Result<Option<String>, ExtractError> {
        let js = locator_js(spec);
        page.eval_string(&js)
            .await
            .map_err(|e| ExtractError::Other(anyhow!("locator evaluation failed: {e}")))
    }
}

/// JS expression resolving a locator to the first match's text content, or
/// null when nothing matches. The locator is embedded as a JSON string
/// literal, so arbitrary selector text cannot escape into the script.
fn locator_js(spec: &KeySpec) -> String {
    let literal = serde_json::to_string(&spec.locator).unwrap_or_else(|_| "\"\"".to_string());
    match spec.kind() {
        LocatorKind::Css => format!(
            r#"(() => {{
                const el = document.querySelector({literal});
                return el ? String(el.textContent) : null;
            }})()"#
        ),
        LocatorKind::XPath => format!(
            r#"(() => {{
                const result = document.evaluate({literal}, document, null,
                    XPathResult.FIRST_ORDERED_NODE_TYPE, null);
                const node = result.singleNodeValue;
                return node ? String(node.textContent) : null;
            }})()"#
        ),
    }
}

fn map_pool_error(e: PoolError) -> ExtractError {
    match e {
        PoolError::Exhausted => ExtractError::PoolExhausted,
        PoolError::LoadTimeout(d) => ExtractError::LoadTimeout(d),
        PoolError::Navigation(msg) => ExtractError::Navigation(msg),
        PoolError::Launch(msg) => ExtractError::Other(anyhow!("browser launch failed: {msg}")),
        PoolError::Other(e) => ExtractError::Other(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watcher_common::Normalize;

    fn spec(locator: &str) -> KeySpec {
        KeySpec {
            locator: locator.to_string(),
            normalize: Normalize::default(),
            alert_values: Vec::new(),
        }
    }

    #[test]
    fn css_locator_renders_query_selector() {
        let js = locator_js(&spec("#status > span"));
        assert!(js.contains("document.querySelector(\"#status > span\")"));
    }

    #[test]
    fn xpath_locator_renders_document_evaluate() {
        let js = locator_js(&spec("//div[@id='status']"));
        assert!(js.contains("document.evaluate(\"//div[@id='status']\""));
        assert!(js.contains("FIRST_ORDERED_NODE_TYPE"));
    }

    #[test]
    fn locator_text_cannot_break_out_of_the_literal() {
        let js = locator_js(&spec(r#""); alert(1); ("#));
        // The quote is escaped into the JSON literal, not closing the call.
        assert!(js.contains(r#"\"); alert(1); (\""#));
    }

    #[test]
    fn pool_errors_map_to_extract_kinds() {
        assert!(matches!(
            map_pool_error(PoolError::Exhausted),
            ExtractError::PoolExhausted
        ));
        assert!(matches!(
            map_pool_error(PoolError::LoadTimeout(Duration::from_secs(30))),
            ExtractError::LoadTimeout(_)
        ));
        assert!(matches!(
            map_pool_error(PoolError::Navigation("dns".to_string())),
            ExtractError::Navigation(_)
        ));
    }
}
