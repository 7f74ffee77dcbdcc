//! Boot-time configuration (C11).
//!
//! Tunables load from environment variables via `clap`'s derive `env`
//! support, mirroring the teacher's CLI-driven config surface. Every field
//! has a sane default so the server boots with zero configuration for local
//! development, matching the teacher's `-t` test-mode convenience.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "game-master", about = "Authoritative social-deduction game server")]
pub struct Config {
    /// Address:port to bind the HTTP/RPC surface to.
    #[arg(long, env = "GM_BIND_ADDR", default_value = "127.0.0.1:4000")]
    pub bind_addr: String,

    /// Base URL of the external on-chain identity registry.
    #[arg(long, env = "GM_REGISTRY_URL", default_value = "http://localhost:8090")]
    pub registry_url: String,

    /// Seconds a positive registry lookup may be cached for.
    #[arg(long, env = "GM_REGISTRY_CACHE_TTL_SECS", default_value_t = 30)]
    pub registry_cache_ttl_secs: u64,

    /// Minimum players required to start a session.
    #[arg(long, env = "GM_MIN_PLAYERS", default_value_t = 5)]
    pub min_players: usize,

    /// Maximum players a single session admits.
    #[arg(long, env = "GM_MAX_PLAYERS", default_value_t = 10)]
    pub max_players: usize,

    /// Fraction of players assigned the imposter role at session start.
    #[arg(long, env = "GM_IMPOSTER_RATIO", default_value_t = 0.25)]
    pub imposter_ratio: f64,

    /// Number of tasks assigned to each crewmate.
    #[arg(long, env = "GM_TASK_COUNT", default_value_t = 3)]
    pub task_count: usize,

    /// Minimum time between kills by the same imposter, in milliseconds.
    #[arg(long, env = "GM_KILL_COOLDOWN_MS", default_value_t = 20_000)]
    pub kill_cooldown_ms: u64,

    /// Duration of the Discussion phase, in milliseconds.
    #[arg(long, env = "GM_DISCUSSION_TIME_MS", default_value_t = 60_000)]
    pub discussion_time_ms: u64,

    /// Duration of the Voting phase, in milliseconds.
    #[arg(long, env = "GM_VOTING_TIME_MS", default_value_t = 30_000)]
    pub voting_time_ms: u64,

    /// Number of emergency meetings each player may call per game.
    #[arg(long, env = "GM_EMERGENCY_MEETINGS", default_value_t = 1)]
    pub emergency_meetings: u32,

    /// Grace period, in seconds, before an Ended session becomes eligible for reaping.
    #[arg(long, env = "GM_SESSION_GRACE_SECS", default_value_t = 300)]
    pub session_grace_secs: u64,

    /// Enables `/debug/*` introspection routes. MUST be off in production.
    #[arg(long, env = "GM_DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        // `parse_from` with no arguments exercises the same defaults the
        // CLI would use, so there's exactly one place these are defined.
        Config::parse_from(std::iter::empty::<String>())
    }
}

/// The subset of [`Config`] the session engine actually needs, copied out so
/// `SessionEngine` doesn't hold a reference to the whole boot-time config.
#[derive(Debug, Clone, Copy)]
pub struct GameRules {
    pub min_players: usize,
    pub max_players: usize,
    pub imposter_ratio: f64,
    pub task_count: usize,
    pub kill_cooldown_ms: u64,
    pub discussion_time_ms: u64,
    pub voting_time_ms: u64,
    pub emergency_meetings: u32,
}

impl From<&Config> for GameRules {
    fn from(cfg: &Config) -> Self {
        GameRules {
            min_players: cfg.min_players,
            max_players: cfg.max_players,
            imposter_ratio: cfg.imposter_ratio,
            task_count: cfg.task_count,
            kill_cooldown_ms: cfg.kill_cooldown_ms,
            discussion_time_ms: cfg.discussion_time_ms,
            voting_time_ms: cfg.voting_time_ms,
            emergency_meetings: cfg.emergency_meetings,
        }
    }
}

impl Default for GameRules {
    fn default() -> Self {
        GameRules::from(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_min_le_max_players() {
        let cfg = Config::default();
        assert!(cfg.min_players <= cfg.max_players);
        assert!(cfg.min_players >= 5);
    }

    #[test]
    fn game_rules_mirrors_config() {
        let cfg = Config::default();
        let rules = GameRules::from(&cfg);
        assert_eq!(rules.task_count, cfg.task_count);
        assert_eq!(rules.kill_cooldown_ms, cfg.kill_cooldown_ms);
    }
}
