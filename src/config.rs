use std::env;

use log::info;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Tunables for one matching task.
///
/// Read once when a task starts and applied uniformly for its whole run, so
/// a single task produces a coherent decision surface even if the
/// environment changes underneath it.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// PRIMARY records per page.
    pub batch_size: usize,
    /// Parallel match workers within a page.
    pub workers_per_page: usize,
    /// L3 acceptance threshold.
    pub theta1: f64,
    /// L4 acceptance threshold.
    pub theta2: f64,
    /// L3 hard gate on name_core similarity.
    pub name_core_hard_gate: f64,
    /// L4 floor on name_core similarity; corroborating attributes can never
    /// promote a candidate below this.
    pub l4_name_core_floor: f64,
    /// Prefilter candidate cap K.
    pub candidate_cap: usize,
    /// Prefilter full-text hit cap T.
    pub text_search_limit: usize,
    /// Prefilter address-keyword hit cap.
    pub address_keyword_limit: usize,
    /// Soft deadline per record, milliseconds.
    pub per_record_deadline_ms: u64,
    /// Optional whole-task deadline, seconds. 0 disables it.
    pub task_deadline_secs: u64,
    /// SECONDARY records loaded into the attribute graph at task start.
    pub graph_unit_limit: usize,
    /// Retry attempts for transient store errors.
    pub store_retry_attempts: u32,
    /// Base backoff between store retries, milliseconds.
    pub store_retry_backoff_ms: u64,
    /// Whether the binary renders indicatif progress bars.
    pub progress_enabled: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            workers_per_page: 4,
            theta1: 0.75,
            theta2: 0.70,
            name_core_hard_gate: 0.70,
            l4_name_core_floor: 0.60,
            candidate_cap: 100,
            text_search_limit: 50,
            address_keyword_limit: 30,
            per_record_deadline_ms: 2000,
            task_deadline_secs: 0,
            graph_unit_limit: 50_000,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 200,
            progress_enabled: true,
        }
    }
}

impl MatchingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            batch_size: env_parse("LINKAGE_BATCH_SIZE", defaults.batch_size).max(1),
            workers_per_page: env_parse("LINKAGE_WORKERS_PER_PAGE", defaults.workers_per_page)
                .max(1),
            theta1: env_parse("LINKAGE_THETA1", defaults.theta1),
            theta2: env_parse("LINKAGE_THETA2", defaults.theta2),
            name_core_hard_gate: env_parse(
                "LINKAGE_NAME_CORE_HARD_GATE",
                defaults.name_core_hard_gate,
            ),
            l4_name_core_floor: env_parse(
                "LINKAGE_L4_NAME_CORE_FLOOR",
                defaults.l4_name_core_floor,
            ),
            candidate_cap: env_parse("LINKAGE_CANDIDATE_CAP", defaults.candidate_cap).max(1),
            text_search_limit: env_parse("LINKAGE_TEXT_SEARCH_LIMIT", defaults.text_search_limit),
            address_keyword_limit: env_parse(
                "LINKAGE_ADDRESS_KEYWORD_LIMIT",
                defaults.address_keyword_limit,
            ),
            per_record_deadline_ms: env_parse(
                "LINKAGE_PER_RECORD_DEADLINE_MS",
                defaults.per_record_deadline_ms,
            ),
            task_deadline_secs: env_parse("LINKAGE_TASK_DEADLINE_SECS", defaults.task_deadline_secs),
            graph_unit_limit: env_parse("LINKAGE_GRAPH_UNIT_LIMIT", defaults.graph_unit_limit),
            store_retry_attempts: env_parse(
                "LINKAGE_STORE_RETRY_ATTEMPTS",
                defaults.store_retry_attempts,
            ),
            store_retry_backoff_ms: env_parse(
                "LINKAGE_STORE_RETRY_BACKOFF_MS",
                defaults.store_retry_backoff_ms,
            ),
            progress_enabled: env_parse("LINKAGE_PROGRESS", defaults.progress_enabled),
        };
        info!(
            "Matching config: batch_size={}, workers={}, theta1={}, theta2={}, hard_gate={}, K={}, T={}",
            config.batch_size,
            config.workers_per_page,
            config.theta1,
            config.theta2,
            config.name_core_hard_gate,
            config.candidate_cap,
            config.text_search_limit,
        );
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = MatchingConfig::default();
        assert_eq!(c.batch_size, 100);
        assert_eq!(c.workers_per_page, 4);
        assert_eq!(c.theta1, 0.75);
        assert_eq!(c.theta2, 0.70);
        assert_eq!(c.name_core_hard_gate, 0.70);
        assert_eq!(c.candidate_cap, 100);
        assert_eq!(c.text_search_limit, 50);
        assert_eq!(c.per_record_deadline_ms, 2000);
        assert_eq!(c.graph_unit_limit, 50_000);
    }

    #[test]
    fn env_overrides_apply() {
        env::set_var("LINKAGE_BATCH_SIZE", "250");
        env::set_var("LINKAGE_THETA1", "0.8");
        env::set_var("LINKAGE_PROGRESS", "false");

        let c = MatchingConfig::from_env();
        assert_eq!(c.batch_size, 250);
        assert_eq!(c.theta1, 0.8);
        assert!(!c.progress_enabled);

        env::remove_var("LINKAGE_BATCH_SIZE");
        env::remove_var("LINKAGE_THETA1");
        env::remove_var("LINKAGE_PROGRESS");
    }

    #[test]
    fn malformed_values_fall_back() {
        env::set_var("LINKAGE_WORKERS_PER_PAGE", "many");
        let c = MatchingConfig::from_env();
        assert_eq!(c.workers_per_page, 4);
        env::remove_var("LINKAGE_WORKERS_PER_PAGE");
    }
}
