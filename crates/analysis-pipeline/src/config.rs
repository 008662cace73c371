//! Pipeline and worker configuration from environment variables and AWS Secrets Manager

use std::env;
use std::str::FromStr;
use std::time::Duration;

use aws_sdk_secretsmanager::Client as SecretsClient;
use tracing::info;

use crate::analysis::Category;
use crate::engine::SearchLimits;
use crate::error::PipelineError;

/// Classification thresholds in centipawns, mover's perspective.
///
/// Deployment contract:
/// `brilliant_cp > great_cp > 0 > inaccuracy_cp > mistake_cp > blunder_cp`.
/// [`Thresholds::validate`] checks it once at startup; the classifier
/// itself trusts whatever it is given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thresholds {
    pub brilliant_cp: i32,
    pub great_cp: i32,
    pub inaccuracy_cp: i32,
    pub mistake_cp: i32,
    pub blunder_cp: i32,
    pub near_best_tolerance_cp: i32,
    /// Centipawn value of an immediate mate
    pub mate_score_cp: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            brilliant_cp: 900,
            great_cp: 600,
            inaccuracy_cp: -400,
            mistake_cp: -800,
            blunder_cp: -1200,
            near_best_tolerance_cp: 10,
            mate_score_cp: 10_000,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let ordered = self.brilliant_cp > self.great_cp
            && self.great_cp > 0
            && 0 > self.inaccuracy_cp
            && self.inaccuracy_cp > self.mistake_cp
            && self.mistake_cp > self.blunder_cp;
        if !ordered {
            return Err(PipelineError::Configuration(format!(
                "thresholds must satisfy brilliant > great > 0 > inaccuracy > mistake > blunder, got {}/{}/{}/{}/{}",
                self.brilliant_cp, self.great_cp, self.inaccuracy_cp, self.mistake_cp, self.blunder_cp
            )));
        }
        if self.near_best_tolerance_cp < 0 {
            return Err(PipelineError::Configuration(
                "near-best tolerance must not be negative".into(),
            ));
        }
        if self.mate_score_cp <= 2 * self.brilliant_cp.max(-self.blunder_cp) {
            return Err(PipelineError::Configuration(format!(
                "mate score {} must exceed twice the largest threshold",
                self.mate_score_cp
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Path to Stockfish binary
    pub path: String,
    pub threads: u32,
    pub hash_mb: u32,
    /// Concurrent engine processes
    pub pool_size: usize,
    pub fast: SearchLimits,
    pub deep: SearchLimits,
    /// Wall-clock bound on one search
    pub response_timeout: Duration,
    /// Wall-clock bound on waiting for a free session
    pub acquire_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Doubled after every failed attempt
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub engine: EngineSettings,
    pub thresholds: Thresholds,
    pub retry: RetryPolicy,
    /// Fast-pass categories that are re-checked by the deep pass
    pub deep_candidates: Vec<Category>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; a present but malformed value is an error.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, PipelineError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Thresholds::default();
        let thresholds = Thresholds {
            brilliant_cp: parse_or(&lookup, "THRESH_BRILLIANT_CP", defaults.brilliant_cp)?,
            great_cp: parse_or(&lookup, "THRESH_GREAT_CP", defaults.great_cp)?,
            inaccuracy_cp: parse_or(&lookup, "THRESH_INACCURACY_CP", defaults.inaccuracy_cp)?,
            mistake_cp: parse_or(&lookup, "THRESH_MISTAKE_CP", defaults.mistake_cp)?,
            blunder_cp: parse_or(&lookup, "THRESH_BLUNDER_CP", defaults.blunder_cp)?,
            near_best_tolerance_cp: parse_or(
                &lookup,
                "THRESH_NEAR_BEST_TOL_CP",
                defaults.near_best_tolerance_cp,
            )?,
            mate_score_cp: parse_or(&lookup, "MATE_SCORE_CP", defaults.mate_score_cp)?,
        };
        thresholds.validate()?;

        let fast = SearchLimits {
            movetime_ms: parse_or(&lookup, "ENGINE_FAST_MOVETIME_MS", 40)?,
            depth: parse_opt(&lookup, "ENGINE_FAST_DEPTH")?,
            multipv: 1,
        };
        let deep = SearchLimits {
            movetime_ms: parse_or(&lookup, "ENGINE_DEEP_MOVETIME_MS", 400)?,
            depth: parse_opt(&lookup, "ENGINE_DEEP_DEPTH")?,
            multipv: parse_or(&lookup, "ENGINE_DEEP_MULTIPV", 3)?,
        };

        let engine = EngineSettings {
            path: lookup("STOCKFISH_PATH").unwrap_or_else(|| "/usr/local/bin/stockfish".to_string()),
            threads: parse_or(&lookup, "ENGINE_THREADS", 1)?,
            hash_mb: parse_or(&lookup, "ENGINE_HASH_MB", 256)?,
            pool_size: parse_or(&lookup, "ENGINE_POOL_SIZE", num_cpus::get())?,
            fast,
            deep,
            response_timeout: Duration::from_millis(parse_or(
                &lookup,
                "ENGINE_RESPONSE_TIMEOUT_MS",
                5_000u64,
            )?),
            acquire_timeout: Duration::from_millis(parse_or(
                &lookup,
                "ENGINE_ACQUIRE_TIMEOUT_MS",
                30_000u64,
            )?),
        };

        let retry = RetryPolicy {
            max_retries: parse_or(&lookup, "ENGINE_MAX_RETRIES", 2)?,
            backoff: Duration::from_millis(parse_or(&lookup, "ENGINE_RETRY_BACKOFF_MS", 250u64)?),
        };

        let deep_candidates = match lookup("DEEP_CANDIDATES") {
            Some(raw) => parse_categories(&raw)?,
            None => vec![Category::Mistake, Category::Blunder, Category::Brilliant],
        };

        let config = Self {
            engine,
            thresholds,
            retry,
            deep_candidates,
        };
        config.validate_engine()?;
        Ok(config)
    }

    fn validate_engine(&self) -> Result<(), PipelineError> {
        let engine = &self.engine;
        if engine.pool_size == 0 {
            return Err(PipelineError::Configuration("ENGINE_POOL_SIZE must be at least 1".into()));
        }
        if engine.deep.multipv == 0 {
            return Err(PipelineError::Configuration("ENGINE_DEEP_MULTIPV must be at least 1".into()));
        }
        let longest = engine.fast.movetime_ms.max(engine.deep.movetime_ms);
        if engine.response_timeout <= Duration::from_millis(longest) {
            return Err(PipelineError::Configuration(format!(
                "ENGINE_RESPONSE_TIMEOUT_MS ({:?}) must exceed the longest movetime ({longest} ms)",
                engine.response_timeout
            )));
        }
        Ok(())
    }
}

fn parse_or<L, T>(lookup: &L, key: &str, default: T) -> Result<T, PipelineError>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_opt<L, T>(lookup: &L, key: &str) -> Result<Option<T>, PipelineError>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::Configuration(format!("{key} has invalid value '{raw}'"))),
    }
}

fn parse_categories(raw: &str) -> Result<Vec<Category>, PipelineError> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.parse::<Category>()
                .map_err(|e| PipelineError::Configuration(format!("DEEP_CANDIDATES: {e}")))
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Database connection URL (fetched from Secrets Manager in prod)
    pub database_url: String,

    /// SQS queue URL for analysis jobs
    pub sqs_queue_url: String,

    /// Custom SQS endpoint URL (for LocalStack)
    pub sqs_endpoint_url: Option<String>,

    /// Consecutive empty SQS receives before exiting
    pub max_empty_receives: u32,

    /// SQS visibility timeout in seconds
    pub visibility_timeout_secs: u32,

    pub pipeline: PipelineConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    /// In production, fetches DATABASE_URL from AWS Secrets Manager.
    pub async fn load() -> Result<Self, PipelineError> {
        let pipeline = PipelineConfig::from_env()?;

        let sqs_queue_url = env::var("SQS_QUEUE_URL")
            .map_err(|_| PipelineError::Configuration("SQS_QUEUE_URL not set".into()))?;

        // Custom endpoint for LocalStack
        let sqs_endpoint_url = env::var("SQS_ENDPOINT_URL").ok();

        let lookup = |key: &str| env::var(key).ok();
        let max_empty_receives = parse_or(&lookup, "MAX_EMPTY_RECEIVES", 5)?;
        let visibility_timeout_secs = parse_or(&lookup, "VISIBILITY_TIMEOUT_SECS", 300)?;

        let database_url = if env::var("LOCAL_DEV").is_ok() {
            info!("Local dev mode: using DATABASE_URL from environment");
            env::var("DATABASE_URL").map_err(|_| {
                PipelineError::Configuration("DATABASE_URL not set (LOCAL_DEV mode)".into())
            })?
        } else {
            let secret_arn = env::var("DB_SECRET_ARN")
                .map_err(|_| PipelineError::Configuration("DB_SECRET_ARN not set".into()))?;

            info!(secret_arn = %secret_arn, "Fetching database URL from Secrets Manager");
            fetch_database_url_from_secrets(&secret_arn).await?
        };

        Ok(Self {
            database_url,
            sqs_queue_url,
            sqs_endpoint_url,
            max_empty_receives,
            visibility_timeout_secs,
            pipeline,
        })
    }
}

/// Fetch database URL from AWS Secrets Manager
async fn fetch_database_url_from_secrets(secret_arn: &str) -> Result<String, PipelineError> {
    let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let client = SecretsClient::new(&config);

    let response = client
        .get_secret_value()
        .secret_id(secret_arn)
        .send()
        .await
        .map_err(|e| PipelineError::SecretsManager(e.to_string()))?;

    let secret_string = response
        .secret_string()
        .ok_or_else(|| PipelineError::SecretsManager("Secret has no string value".into()))?;

    database_url_from_secret(secret_string)
}

/// Secret is either a plain connection string or a JSON object with
/// connection details.
fn database_url_from_secret(secret_string: &str) -> Result<String, PipelineError> {
    if secret_string.starts_with("postgresql://") || secret_string.starts_with("postgres://") {
        return Ok(secret_string.to_string());
    }

    let secret: serde_json::Value = serde_json::from_str(secret_string)
        .map_err(|e| PipelineError::SecretsManager(format!("Failed to parse secret JSON: {e}")))?;

    if let Some(url) = secret.get("url").or(secret.get("DATABASE_URL")) {
        return url
            .as_str()
            .map(String::from)
            .ok_or_else(|| PipelineError::SecretsManager("Database URL is not a string".into()));
    }

    let field = |name: &str| {
        secret
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::SecretsManager(format!("Missing '{name}' in secret")))
    };
    let host = field("host")?;
    let username = field("username")?;
    let password = field("password")?;
    let database = secret
        .get("dbname")
        .or(secret.get("database"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::SecretsManager("Missing 'dbname' in secret".into()))?;
    let port = secret.get("port").and_then(|v| v.as_u64()).unwrap_or(5432);

    Ok(format!(
        "postgresql://{username}:{password}@{host}:{port}/{database}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_lookup(lookup_from(&[("ENGINE_POOL_SIZE", "2")])).unwrap();
        assert_eq!(config.thresholds, Thresholds::default());
        assert_eq!(config.engine.pool_size, 2);
        assert_eq!(config.engine.fast.movetime_ms, 40);
        assert_eq!(config.engine.fast.multipv, 1);
        assert_eq!(config.engine.deep.multipv, 3);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(
            config.deep_candidates,
            vec![Category::Mistake, Category::Blunder, Category::Brilliant]
        );
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("THRESH_BLUNDER_CP", "-300"),
            ("THRESH_MISTAKE_CP", "-150"),
            ("THRESH_INACCURACY_CP", "-100"),
            ("ENGINE_DEEP_DEPTH", "22"),
            ("DEEP_CANDIDATES", "blunder, great"),
        ]))
        .unwrap();
        assert_eq!(config.thresholds.blunder_cp, -300);
        assert_eq!(config.engine.deep.depth, Some(22));
        assert_eq!(config.deep_candidates, vec![Category::Blunder, Category::Great]);
    }

    #[test]
    fn test_malformed_threshold_is_configuration_error() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("THRESH_GREAT_CP", "lots")])).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_misordered_thresholds_rejected_at_load() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("THRESH_MISTAKE_CP", "-1500")])).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_timeout_must_exceed_movetime() {
        let err = PipelineConfig::from_lookup(lookup_from(&[
            ("ENGINE_DEEP_MOVETIME_MS", "8000"),
            ("ENGINE_RESPONSE_TIMEOUT_MS", "5000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let retry = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_database_url_from_secret() {
        assert_eq!(
            database_url_from_secret("postgres://u:p@h/db").unwrap(),
            "postgres://u:p@h/db"
        );
        let json = r#"{"host":"db","username":"cb","password":"pw","dbname":"chessbuddy"}"#;
        assert_eq!(
            database_url_from_secret(json).unwrap(),
            "postgresql://cb:pw@db:5432/chessbuddy"
        );
        assert!(database_url_from_secret(r#"{"host":"db"}"#).is_err());
    }
}
