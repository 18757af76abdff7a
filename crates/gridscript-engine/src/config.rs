use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the scheduler wakes to drain one unit of work
    pub tick_interval: Duration,
    /// Quiet period after the last mutation before a sheet is persisted
    pub persist_debounce: Duration,
    /// Wall-clock bound on a single script invocation
    pub script_timeout: Duration,
    /// Interpreter binary for the embedded scripting runtime
    pub interpreter: String,
    /// Directory the JSON sheet snapshots live under
    pub data_dir: PathBuf,
    /// Whether script-written cells cascade into further recalculation
    pub trigger_next: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tick_interval: Duration::from_millis(50),
            persist_debounce: Duration::from_secs(2),
            script_timeout: Duration::from_secs(30),
            interpreter: "python3".to_string(),
            data_dir: PathBuf::from("data"),
            trigger_next: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = EngineConfig::default();

        let tick_interval = match env::var("GRIDSCRIPT_TICK_MS") {
            Ok(v) => Duration::from_millis(v.parse()?),
            Err(_) => defaults.tick_interval,
        };
        let persist_debounce = match env::var("GRIDSCRIPT_DEBOUNCE_MS") {
            Ok(v) => Duration::from_millis(v.parse()?),
            Err(_) => defaults.persist_debounce,
        };
        let script_timeout = match env::var("GRIDSCRIPT_SCRIPT_TIMEOUT_MS") {
            Ok(v) => Duration::from_millis(v.parse()?),
            Err(_) => defaults.script_timeout,
        };
        let interpreter =
            env::var("GRIDSCRIPT_INTERPRETER").unwrap_or_else(|_| defaults.interpreter.clone());
        let data_dir = env::var("GRIDSCRIPT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| defaults.data_dir.clone());
        let trigger_next = match env::var("GRIDSCRIPT_TRIGGER_NEXT") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.trigger_next,
        };

        Ok(EngineConfig {
            tick_interval,
            persist_debounce,
            script_timeout,
            interpreter,
            data_dir,
            trigger_next,
        })
    }
}
