//! Per-user language preference cache.
//!
//! Learns which language each user speaks so transcription requests can carry
//! a hint instead of paying for auto-detection every time. Confidence follows
//! an exponential moving average: repeated sightings of the same language
//! push it toward 1, a different language resets it low and switches.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};
use tracing::{debug, warn};

/// A cached preference for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguagePreference {
    pub language: String,
    pub confidence: f64,
}

pub struct LanguageCache {
    conn: Mutex<Connection>,
    ttl_secs: i64,
    confidence_threshold: f64,
}

impl LanguageCache {
    /// Open (or create) the cache database at the given path.
    pub fn open(path: &Path, ttl_days: i64, confidence_threshold: f64) -> Self {
        let conn = Connection::open(path).expect("Failed to open language cache");
        let cache = Self {
            conn: Mutex::new(conn),
            ttl_secs: ttl_days * 24 * 3600,
            confidence_threshold,
        };
        cache.init_schema();
        cache
    }

    /// In-memory cache, used in tests.
    pub fn in_memory(ttl_days: i64, confidence_threshold: f64) -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory cache");
        let cache = Self {
            conn: Mutex::new(conn),
            ttl_secs: ttl_days * 24 * 3600,
            confidence_threshold,
        };
        cache.init_schema();
        cache
    }

    fn init_schema(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS lang_prefs (
                user_id INTEGER PRIMARY KEY,
                language TEXT NOT NULL,
                confidence REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .expect("Failed to init language cache schema");
    }

    /// Language hint for a transcription request: only returned when the
    /// cached confidence clears the threshold and the language is one we
    /// prioritize.
    pub fn hint_for(&self, user_id: i64, priority_languages: &[String]) -> Option<String> {
        let pref = self.get(user_id)?;
        if pref.confidence > self.confidence_threshold
            && priority_languages.iter().any(|l| *l == pref.language)
        {
            debug!("Using cached language for user {user_id}: {}", pref.language);
            Some(pref.language)
        } else {
            None
        }
    }

    pub fn get(&self, user_id: i64) -> Option<LanguagePreference> {
        self.get_at(user_id, chrono::Utc::now().timestamp())
    }

    /// Record a detection. `observed_confidence` is the caller's trust in
    /// this single observation (longer transcripts count for more).
    pub fn observe(&self, user_id: i64, language: &str, observed_confidence: f64) {
        self.observe_at(user_id, language, observed_confidence, chrono::Utc::now().timestamp());
    }

    fn get_at(&self, user_id: i64, now: i64) -> Option<LanguagePreference> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT language, confidence, updated_at FROM lang_prefs WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, i64>(2)?))
                },
            )
            .ok()?;

        let (language, confidence, updated_at) = row;
        if now - updated_at > self.ttl_secs {
            // Expired after long inactivity; forget it.
            if let Err(e) = conn.execute("DELETE FROM lang_prefs WHERE user_id = ?1", params![user_id]) {
                warn!("Failed to purge expired language preference: {e}");
            }
            return None;
        }
        Some(LanguagePreference { language, confidence })
    }

    fn observe_at(&self, user_id: i64, language: &str, observed_confidence: f64, now: i64) {
        let existing = self.get_at(user_id, now);

        let confidence = match &existing {
            Some(pref) if pref.language == language => {
                (pref.confidence * 0.9 + observed_confidence * 0.1).min(1.0)
            }
            // Different language: reset low and switch.
            Some(_) => observed_confidence * 0.5,
            // First sighting starts below full trust.
            None => observed_confidence * 0.8,
        };

        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO lang_prefs (user_id, language, confidence, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 language = excluded.language,
                 confidence = excluded.confidence,
                 updated_at = excluded.updated_at",
            params![user_id, language, confidence, now],
        );
        match result {
            Ok(_) => debug!(
                "Updated language preference for user {user_id}: {language} (confidence {confidence:.2})"
            ),
            Err(e) => warn!("Failed to store language preference: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> LanguageCache {
        LanguageCache::in_memory(30, 0.7)
    }

    #[test]
    fn test_first_sighting_starts_below_full_trust() {
        let cache = cache();
        cache.observe_at(1, "ru", 1.0, 100);
        let pref = cache.get_at(1, 100).unwrap();
        assert_eq!(pref.language, "ru");
        assert!((pref.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_grows_toward_one_for_same_language() {
        let cache = cache();
        let mut last = 0.0;
        for i in 0..20 {
            cache.observe_at(1, "ru", 1.0, 100 + i);
            let pref = cache.get_at(1, 100 + i).unwrap();
            assert!(pref.confidence >= last, "confidence must be non-decreasing");
            assert!(pref.confidence <= 1.0);
            last = pref.confidence;
        }
        assert!(last > 0.9);
    }

    #[test]
    fn test_different_language_resets_and_switches() {
        let cache = cache();
        for i in 0..10 {
            cache.observe_at(1, "ru", 1.0, 100 + i);
        }
        cache.observe_at(1, "en", 1.0, 200);
        let pref = cache.get_at(1, 200).unwrap();
        assert_eq!(pref.language, "en");
        assert!((pref.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let cache = cache();
        cache.observe_at(1, "ru", 1.0, 0);
        let ttl = 30 * 24 * 3600;
        assert!(cache.get_at(1, ttl - 1).is_some());
        assert!(cache.get_at(1, ttl + 1).is_none());
        // The expired row is purged, not resurrected later.
        assert!(cache.get_at(1, ttl - 1).is_none());
    }

    #[test]
    fn test_hint_requires_threshold_and_priority_language() {
        let cache = cache();
        let priority = vec!["ru".to_string(), "en".to_string()];

        // One sighting: confidence 0.8 > 0.7, hint available.
        cache.observe(1, "ru", 1.0);
        assert_eq!(cache.hint_for(1, &priority), Some("ru".to_string()));

        // Low-confidence observation stays below the threshold.
        cache.observe(2, "ru", 0.2);
        assert_eq!(cache.hint_for(2, &priority), None);

        // Confident but non-priority language gives no hint.
        cache.observe(3, "de", 1.0);
        assert_eq!(cache.hint_for(3, &priority), None);
    }

    #[test]
    fn test_users_are_independent() {
        let cache = cache();
        cache.observe(1, "ru", 1.0);
        cache.observe(2, "en", 1.0);
        assert_eq!(cache.get(1).unwrap().language, "ru");
        assert_eq!(cache.get(2).unwrap().language, "en");
    }
}
