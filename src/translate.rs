//! Machine translation for final transcripts.
//!
//! One outbound call per target language, run concurrently with a per-call
//! timeout. Individual language failures are logged and omitted from the
//! returned map; the service never raises to the pipeline. Identical inputs
//! are answered from a small TTL cache so repeated finals (reconnect
//! overlap, caption re-posts) do not re-bill the provider.

use crate::config::{TranslationProvider, TranslationSettings};
use crate::defaults;
use futures_util::future::join_all;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Insertion-ordered cache with per-entry TTL.
struct TtlCache {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<String, (Instant, HashMap<String, String>)>,
    order: VecDeque<String>,
}

impl TtlCache {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<HashMap<String, String>> {
        match self.entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                self.entries.remove(key);
                self.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: String, value: HashMap<String, String>) {
        while self.entries.len() >= self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        if self.entries.insert(key.clone(), (Instant::now(), value)).is_none() {
            self.order.push_back(key);
        }
    }
}

pub struct TranslationService {
    settings: TranslationSettings,
    timeout: Duration,
    http: reqwest::Client,
    cache: Mutex<TtlCache>,
}

impl TranslationService {
    pub fn new(settings: TranslationSettings) -> Self {
        let timeout = Duration::from_secs_f64(settings.timeout_seconds);
        Self {
            http: reqwest::Client::new(),
            cache: Mutex::new(TtlCache::new(
                timeout * 4,
                defaults::TRANSLATION_CACHE_MAX_ENTRIES,
            )),
            timeout,
            settings,
        }
    }

    pub fn is_active(&self) -> bool {
        self.settings.is_active()
    }

    /// Target languages in configured order.
    pub fn targets(&self) -> &[String] {
        &self.settings.targets
    }

    /// Translate into every configured target concurrently.
    ///
    /// Returns within the per-call timeout plus a small overhead. Languages
    /// that fail or time out are simply absent from the map.
    pub async fn translate(&self, text: &str) -> HashMap<String, String> {
        let text = text.trim();
        if !self.is_active() || text.is_empty() {
            return HashMap::new();
        }

        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(text)
        {
            return cached;
        }

        let calls = self.settings.targets.iter().map(|target| {
            let target = target.clone();
            async move {
                let result =
                    tokio::time::timeout(self.timeout, self.translate_single(text, &target)).await;
                match result {
                    Ok(Ok(translated)) if !translated.trim().is_empty() => {
                        Some((target, translated))
                    }
                    Ok(Ok(_)) => None,
                    Ok(Err(message)) => {
                        warn!("Translation to {target} failed: {message}");
                        None
                    }
                    Err(_) => {
                        warn!("Translation to {target} timed out after {:?}", self.timeout);
                        None
                    }
                }
            }
        });

        let translations: HashMap<String, String> =
            join_all(calls).await.into_iter().flatten().collect();

        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(text.to_string(), translations.clone());
        translations
    }

    async fn translate_single(
        &self,
        text: &str,
        target: &str,
    ) -> std::result::Result<String, String> {
        match self.settings.provider {
            TranslationProvider::Libre => self.translate_libre(text, target).await,
            TranslationProvider::Google => self.translate_google(text, target).await,
        }
    }

    async fn translate_libre(&self, text: &str, target: &str) -> std::result::Result<String, String> {
        let mut payload = json!({
            "q": text,
            "source": self.settings.source_language,
            "target": target,
            "format": "text",
        });
        if let Some(api_key) = &self.settings.libre_api_key {
            payload["api_key"] = json!(api_key);
        }

        let url = format!("{}/translate", self.settings.libre_url);
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {body}"));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("unreadable response: {e}"))?;
        body.get("translatedText")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| "response carried no translatedText".to_string())
    }

    async fn translate_google(
        &self,
        text: &str,
        target: &str,
    ) -> std::result::Result<String, String> {
        let api_key = self
            .settings
            .google_api_key
            .as_ref()
            .ok_or_else(|| "GOOGLE_TRANSLATE_API_KEY not configured".to_string())?;

        let payload = json!({
            "q": text,
            "source": self.settings.source_language,
            "target": target,
            "format": "text",
        });
        let response = self
            .http
            .post("https://translation.googleapis.com/language/translate/v2")
            .query(&[("key", api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {body}"));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("unreadable response: {e}"))?;
        body.pointer("/data/translations/0/translatedText")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| "response carried no translations".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_targets(targets: &[&str]) -> TranslationSettings {
        TranslationSettings {
            enabled: !targets.is_empty(),
            targets: targets.iter().map(|s| s.to_string()).collect(),
            ..TranslationSettings::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_service_returns_empty() {
        let service = TranslationService::new(settings_with_targets(&[]));
        assert!(!service.is_active());
        let translations = service.translate("Bonan tagon.").await;
        assert!(translations.is_empty());
    }

    #[tokio::test]
    async fn test_empty_text_returns_empty_without_calls() {
        let service = TranslationService::new(settings_with_targets(&["ja"]));
        let translations = service.translate("   ").await;
        assert!(translations.is_empty());
    }

    #[test]
    fn test_cache_hit_within_ttl() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 8);
        let mut value = HashMap::new();
        value.insert("ja".to_string(), "こんにちは".to_string());
        cache.insert("saluton".to_string(), value.clone());
        assert_eq!(cache.get("saluton"), Some(value));
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let mut cache = TtlCache::new(Duration::from_millis(10), 8);
        cache.insert("saluton".to_string(), HashMap::new());
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("saluton"), None);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn test_cache_evicts_oldest_at_capacity() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a".to_string(), HashMap::new());
        cache.insert("b".to_string(), HashMap::new());
        cache.insert("c".to_string(), HashMap::new());
        assert_eq!(cache.get("a"), None);
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_cache_miss_on_unknown_key() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 8);
        assert_eq!(cache.get("nope"), None);
    }

    #[test]
    fn test_targets_preserve_configured_order() {
        let service = TranslationService::new(settings_with_targets(&["ja", "ko", "en"]));
        assert_eq!(service.targets(), &["ja", "ko", "en"]);
    }
}
