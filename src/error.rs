use thiserror::Error;

/// Failure while turning a run record into a result row
#[derive(Debug, Error, PartialEq)]
pub enum ProjectionError {
    #[error("run {run_id}: parameter `{key}` is not an integer: {value:?}")]
    MalformedInteger {
        run_id: String,
        key: String,
        value: String,
    },
}

/// Failure talking to the experiment tracker
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracking request to {endpoint} failed")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("tracking server returned {status} for {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("unexpected tracking response from {endpoint}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid configuration values
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("environment variable {name} is not an integer: {value:?}")]
    InvalidEnvInteger { name: String, value: String },
    #[error("score scale must be finite with min < max and max > 0 (got min={min}, max={max})")]
    InvalidScoreScale { min: f64, max: f64 },
    #[error("rate limit must not be NaN")]
    InvalidRateLimit,
}

/// The judge replied with something that cannot be read as a grade
#[derive(Debug, Error, PartialEq)]
pub enum GradingError {
    #[error("no `[[rating]]` found in judge reply: {0:?}")]
    MissingRating(String),
    #[error("judge rating is not a number: {0:?}")]
    InvalidRating(String),
    #[error("no CORRECT/INCORRECT verdict in judge reply: {0:?}")]
    MissingVerdict(String),
}
