use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use singlet_core::{
    gate::PolicyKind,
    types::{
        DEFAULT_CAPACITY, DEFAULT_EVICTION_WAIT_MS, DEFAULT_MIN_PROMPT_LENGTH,
        DEFAULT_TIMEOUT_SECS, SamplingParams,
    },
};
use std::path::PathBuf;

/// Runtime configuration for the `singlet-server` binary.
///
/// These settings control admission, per-request deadlines, buffering and the
/// sampling parameters forwarded to the engine. All values are parsed from CLI
/// arguments or environment variables (a `.env` file is honored).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "singlet-server",
    version,
    about = "Streams generated text over HTTP, one inference at a time"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:3000"))]
    pub server_addr: String,

    /// Maximum number of generations running at the same time.
    ///
    /// Requests arriving while this many are in flight are handled by the
    /// admission policy.
    ///
    /// Environment variable: `CAPACITY`
    #[arg(long, env = "CAPACITY", default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,

    /// Prompts shorter than this many characters are refused.
    ///
    /// Environment variable: `MIN_PROMPT_LENGTH`
    #[arg(long, env = "MIN_PROMPT_LENGTH", default_value_t = DEFAULT_MIN_PROMPT_LENGTH)]
    pub min_prompt_length: usize,

    /// Seconds after admission before a request is cancelled. Zero cancels
    /// immediately, which is only useful in tests; a value too large for the
    /// clock disables the deadline.
    ///
    /// Environment variable: `TIMEOUT_SECS`
    #[arg(long, env = "TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Behavior when capacity is exhausted: `reject` the new request, or
    /// `evict-oldest` to cancel the oldest in-flight request and admit the new
    /// one once the slot is free.
    ///
    /// Environment variable: `ADMISSION_POLICY`
    #[arg(long, env = "ADMISSION_POLICY", default_value_t = PolicyKind::Reject)]
    pub admission_policy: PolicyKind,

    /// Milliseconds an arriving request waits for an evicted request to
    /// free its slot before it is refused. Only used by `evict-oldest`.
    ///
    /// Environment variable: `EVICTION_WAIT_MS`
    #[arg(long, env = "EVICTION_WAIT_MS", default_value_t = DEFAULT_EVICTION_WAIT_MS)]
    pub eviction_wait_ms: u64,

    /// Number of text chunks buffered between the generation and the HTTP
    /// response body.
    ///
    /// Lower values make cancellation of a slow reader more responsive;
    /// higher values smooth over bursty generation.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Upper bound on tokens produced per request.
    ///
    /// Environment variable: `MAX_TOKENS`
    #[arg(long, env = "MAX_TOKENS", default_value_t = 512)]
    pub max_tokens: usize,

    /// Sampling temperature forwarded to the engine.
    ///
    /// Environment variable: `TEMPERATURE`
    #[arg(long, env = "TEMPERATURE", default_value_t = 0.8)]
    pub temperature: f32,

    /// Nucleus sampling threshold forwarded to the engine.
    ///
    /// Environment variable: `TOP_P`
    #[arg(long, env = "TOP_P", default_value_t = 0.95)]
    pub top_p: f32,

    /// Delay between tokens of the built-in engine, in milliseconds.
    ///
    /// Environment variable: `TOKEN_DELAY_MS`
    #[arg(long, env = "TOKEN_DELAY_MS", default_value_t = 40)]
    pub token_delay_ms: u64,

    /// Directory of static assets served for paths no route matches.
    ///
    /// Environment variable: `STATIC_DIR`
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Seconds to let in-flight requests finish on shutdown before they are
    /// cancelled.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub capacity: usize,
    pub min_prompt_length: usize,
    pub timeout: Duration,
    pub admission_policy: PolicyKind,
    pub eviction_wait: Duration,
    pub stream_buffer_size: usize,
    pub sampling: SamplingParams,
    pub token_delay: Duration,
    pub static_dir: Option<PathBuf>,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: String::from("0.0.0.0:3000"),
            capacity: DEFAULT_CAPACITY,
            min_prompt_length: DEFAULT_MIN_PROMPT_LENGTH,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            admission_policy: PolicyKind::Reject,
            eviction_wait: Duration::from_millis(DEFAULT_EVICTION_WAIT_MS),
            stream_buffer_size: 8,
            sampling: SamplingParams::default(),
            token_delay: Duration::from_millis(40),
            static_dir: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.capacity == 0 {
            bail!("CAPACITY must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.max_tokens == 0 {
            bail!("MAX_TOKENS must be greater than 0");
        }

        if !args.temperature.is_finite() || args.temperature < 0.0 {
            bail!("TEMPERATURE ({}) must be a non-negative number", args.temperature);
        }

        if !(args.top_p > 0.0 && args.top_p <= 1.0) {
            bail!("TOP_P ({}) must be in (0, 1]", args.top_p);
        }

        if let Some(dir) = &args.static_dir {
            if !dir.is_dir() {
                bail!("STATIC_DIR ({}) is not a directory", dir.display());
            }
        }

        Ok(Self {
            server_addr: args.server_addr,
            capacity: args.capacity,
            min_prompt_length: args.min_prompt_length,
            timeout: Duration::from_secs(args.timeout_secs),
            admission_policy: args.admission_policy,
            eviction_wait: Duration::from_millis(args.eviction_wait_ms),
            stream_buffer_size: args.stream_buffer_size,
            sampling: SamplingParams {
                temperature: args.temperature,
                top_p: args.top_p,
                max_tokens: args.max_tokens,
            },
            token_delay: Duration::from_millis(args.token_delay_ms),
            static_dir: args.static_dir,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = core::iter::once("singlet-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.capacity, 1);
        assert_eq!(config.min_prompt_length, 16);
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.admission_policy, PolicyKind::Reject);
        assert_eq!(config.eviction_wait, Duration::from_secs(5));
        assert_eq!(config.sampling, SamplingParams::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = parse(&[
            "--capacity",
            "2",
            "--timeout-secs",
            "0",
            "--admission-policy",
            "evict-oldest",
            "--min-prompt-length",
            "4",
            "--eviction-wait-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(config.capacity, 2);
        assert_eq!(config.timeout, Duration::ZERO);
        assert_eq!(config.admission_policy, PolicyKind::EvictOldest);
        assert_eq!(config.min_prompt_length, 4);
        assert_eq!(config.eviction_wait, Duration::from_millis(250));
    }

    #[test]
    fn huge_timeouts_are_accepted() {
        let max = u64::MAX.to_string();
        let config = parse(&["--timeout-secs", &max]).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn invalid_values_are_refused() {
        assert!(parse(&["--capacity", "0"]).is_err());
        assert!(parse(&["--stream-buffer-size", "0"]).is_err());
        assert!(parse(&["--top-p", "1.5"]).is_err());
        assert!(parse(&["--temperature", "-1"]).is_err());
        assert!(parse(&["--admission-policy", "fifo"]).is_err());
        assert!(parse(&["--static-dir", "/definitely/not/here"]).is_err());
    }
}
