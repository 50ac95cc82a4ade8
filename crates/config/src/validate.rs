//! Configuration validation.
//!
//! Detects syntax errors, unknown or misspelled keys, and values the engine
//! would reject at runtime (zero page sizes, parallelism above the limit).

use std::path::{Path, PathBuf};

use crate::schema::TeleindexConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "range", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "backfill.page_size"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

/// Known sections and their keys, mirroring `schema.rs`.
const KNOWN_SECTIONS: &[(&str, &[&str])] = &[
    ("index", &["messages", "channels", "bulk_chunk_size"]),
    ("storage", &["bucket", "public_base_url"]),
    (
        "listener",
        &["poll_interval_ms", "max_in_flight", "download_images"],
    ),
    (
        "backfill",
        &[
            "page_size",
            "page_delay_ms",
            "window_page_delay_ms",
            "media_parallelism",
            "max_batch_size",
        ],
    ),
    (
        "sync",
        &[
            "default_max_parallel",
            "max_parallel_limit",
            "task_retention_secs",
            "max_finished_tasks",
        ],
    ),
    ("database", &["url"]),
    ("metrics", &["enabled", "labels"]),
];

/// Hard ceiling on reconciliation fan-out.
const MAX_PARALLEL_CEILING: usize = 20;

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Closest candidate within `max_distance`, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

fn unknown_field(path: String, key: &str, candidates: &[&str]) -> Diagnostic {
    let message = match suggest(key, candidates, 3) {
        Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
        None => "unknown field".to_string(),
    };
    Diagnostic::new(Severity::Error, "unknown-field", path, message)
}

/// Validate a config file at the given path, or the discovered one if `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");

    let mut result = if is_toml {
        match std::fs::read_to_string(&actual_path) {
            Ok(content) => validate_toml_str(&crate::env_subst::substitute_env(&content)),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "syntax",
                    "",
                    format!("failed to read config file: {e}"),
                )],
                config_path: None,
            },
        }
    } else {
        // Key checks only cover TOML; other formats get range checks.
        match crate::loader::load_config(&actual_path) {
            Ok(cfg) => ValidationResult {
                diagnostics: check_config(&cfg),
                config_path: None,
            },
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "type-error",
                    "",
                    e.to_string(),
                )],
                config_path: None,
            },
        }
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate a TOML string without touching the file system.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    if let Some(table) = value.as_table() {
        let section_names: Vec<&str> = KNOWN_SECTIONS.iter().map(|(name, _)| *name).collect();
        for (key, child) in table {
            let Some((_, fields)) = KNOWN_SECTIONS.iter().find(|(name, _)| name == key) else {
                diagnostics.push(unknown_field(key.clone(), key, &section_names));
                continue;
            };
            if let Some(section) = child.as_table() {
                for field in section.keys() {
                    if !fields.contains(&field.as_str()) {
                        diagnostics.push(unknown_field(format!("{key}.{field}"), field, fields));
                    }
                }
            }
        }
    }

    match toml::from_str::<TeleindexConfig>(toml_str) {
        Ok(cfg) => diagnostics.extend(check_config(&cfg)),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Range checks on a parsed config.
#[must_use]
pub fn check_config(cfg: &TeleindexConfig) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    let mut require_positive = |path: &str, value: usize| {
        if value == 0 {
            out.push(Diagnostic::new(
                Severity::Error,
                "range",
                path,
                "must be greater than zero",
            ));
        }
    };

    require_positive("index.bulk_chunk_size", cfg.index.bulk_chunk_size);
    require_positive("listener.max_in_flight", cfg.listener.max_in_flight);
    require_positive("backfill.page_size", cfg.backfill.page_size);
    require_positive("backfill.media_parallelism", cfg.backfill.media_parallelism);
    require_positive("backfill.max_batch_size", cfg.backfill.max_batch_size);
    require_positive("sync.default_max_parallel", cfg.sync.default_max_parallel);

    if cfg.sync.max_parallel_limit == 0 || cfg.sync.max_parallel_limit > MAX_PARALLEL_CEILING {
        out.push(Diagnostic::new(
            Severity::Error,
            "range",
            "sync.max_parallel_limit",
            format!("must be between 1 and {MAX_PARALLEL_CEILING}"),
        ));
    }
    if cfg.sync.default_max_parallel > cfg.sync.max_parallel_limit {
        out.push(Diagnostic::new(
            Severity::Error,
            "range",
            "sync.default_max_parallel",
            "exceeds sync.max_parallel_limit",
        ));
    }
    if cfg.listener.poll_interval_ms == 0 {
        out.push(Diagnostic::new(
            Severity::Warning,
            "range",
            "listener.poll_interval_ms",
            "zero poll interval makes the status watch spin",
        ));
    }
    if cfg.backfill.page_delay_ms == 0 || cfg.backfill.window_page_delay_ms == 0 {
        out.push(Diagnostic::new(
            Severity::Warning,
            "range",
            "backfill",
            "page delays of zero may trip platform rate limits",
        ));
    }
    if cfg.storage.bucket.is_empty() {
        out.push(Diagnostic::new(
            Severity::Error,
            "range",
            "storage.bucket",
            "bucket name must not be empty",
        ));
    }
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("", "", 0)]
    #[case("page_size", "page_size", 0)]
    #[case("page_sise", "page_size", 1)]
    #[case("bukcet", "bucket", 2)]
    #[case("abc", "", 3)]
    fn levenshtein_distance(#[case] a: &str, #[case] b: &str, #[case] expected: usize) {
        assert_eq!(levenshtein(a, b), expected);
    }

    #[test]
    fn empty_config_is_valid() {
        let result = validate_toml_str("");
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn misspelled_section_gets_suggestion() {
        let result = validate_toml_str("[backfil]\npage_size = 10\n");
        let diag = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field")
            .unwrap();
        assert_eq!(diag.path, "backfil");
        assert!(diag.message.contains("\"backfill\""));
    }

    #[test]
    fn misspelled_field_gets_suggestion() {
        let result = validate_toml_str("[listener]\nmax_inflight = 4\n");
        let diag = result
            .diagnostics
            .iter()
            .find(|d| d.path == "listener.max_inflight")
            .unwrap();
        assert!(diag.message.contains("max_in_flight"));
    }

    #[test]
    fn metrics_and_retention_keys_are_known() {
        let result = validate_toml_str(
            "[sync]\ntask_retention_secs = 60\nmax_finished_tasks = 10\n\n[metrics]\nenabled = \
             false\n\n[metrics.labels]\nhost = \"a\"\n",
        );
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn syntax_error_detected() {
        let result = validate_toml_str("[index\n");
        assert_eq!(result.count(Severity::Error), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn type_error_detected() {
        let result = validate_toml_str("[backfill]\npage_size = \"many\"\n");
        assert!(result.diagnostics.iter().any(|d| d.category == "type-error"));
    }

    #[rstest]
    #[case("[backfill]\npage_size = 0\n", "backfill.page_size")]
    #[case("[sync]\nmax_parallel_limit = 21\n", "sync.max_parallel_limit")]
    #[case(
        "[sync]\ndefault_max_parallel = 10\nmax_parallel_limit = 5\n",
        "sync.default_max_parallel"
    )]
    #[case("[storage]\nbucket = \"\"\n", "storage.bucket")]
    fn range_errors(#[case] toml_str: &str, #[case] path: &str) {
        let result = validate_toml_str(toml_str);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.severity == Severity::Error && d.path == path),
            "{:?}",
            result.diagnostics
        );
    }

    #[test]
    fn zero_poll_interval_is_warning() {
        let result = validate_toml_str("[listener]\npoll_interval_ms = 0\n");
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn validates_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teleindex.toml");
        std::fs::write(&path, "[sync]\nmax_parallel_limit = 50\n").unwrap();
        let result = validate(Some(&path));
        assert!(result.has_errors());
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
    }
}
