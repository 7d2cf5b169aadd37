use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

use axum::http::HeaderValue;
use kromi_common::{IceCandidate, SessionDescription};

const DEFAULT_ALLOWED_ORIGINS: [&str; 5] = [
    "http://localhost:1144",
    "https://localhost:1144",
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "https://kromi.online",
];

pub const MAX_DESCRIPTION_BYTES: usize = 32 * 1024;
pub const MAX_CANDIDATE_BYTES: usize = 4096;

#[derive(Clone, Copy)]
struct RateEntry {
    count: u32,
    window_start: Instant,
}

pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    max_keys: usize,
    entries: Mutex<HashMap<String, RateEntry>>,
}

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            max_requests,
            window,
            max_keys,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = match self.entries.lock() {
            Ok(v) => v,
            Err(_) => return false,
        };

        if guard.len() > self.max_keys {
            guard.retain(|_, entry| now.duration_since(entry.window_start) < self.window);
            if guard.len() > self.max_keys {
                return false;
            }
        }

        let entry = guard.entry(key.to_string()).or_insert(RateEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        entry.count <= self.max_requests
    }
}

static REGISTER_LIMITER: OnceLock<FixedWindowRateLimiter> = OnceLock::new();
static ALLOWED_ORIGINS: OnceLock<HashSet<String>> = OnceLock::new();

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn parse_origins(configured: &str) -> HashSet<String> {
    let mut set: HashSet<String> = configured
        .split(',')
        .map(normalize_origin)
        .filter(|origin| !origin.is_empty())
        .collect();

    if set.is_empty() {
        set = DEFAULT_ALLOWED_ORIGINS
            .iter()
            .map(|origin| normalize_origin(origin))
            .collect();
    }
    set
}

fn load_allowed_origins() -> HashSet<String> {
    parse_origins(&std::env::var("KROMI_ALLOWED_ORIGINS").unwrap_or_default())
}

pub fn cors_allow_any() -> bool {
    env_bool("KROMI_CORS_ALLOW_ANY", false)
}

pub fn cors_origin_values() -> Vec<HeaderValue> {
    let set = ALLOWED_ORIGINS.get_or_init(load_allowed_origins);
    set.iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

/// Native capture apps connect without an `Origin` header, so a missing
/// origin is accepted unless `KROMI_WS_REQUIRE_ORIGIN=1`.
pub fn ws_origin_allowed(origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return !env_bool("KROMI_WS_REQUIRE_ORIGIN", false);
    };
    if cors_allow_any() {
        return true;
    }

    let set = ALLOWED_ORIGINS.get_or_init(load_allowed_origins);
    set.contains(&normalize_origin(origin))
}

pub fn allow_register_request(key: &str) -> bool {
    REGISTER_LIMITER
        .get_or_init(|| {
            FixedWindowRateLimiter::new(
                env_u32("KROMI_REGISTER_RATE_LIMIT", 30),
                Duration::from_secs(env_u32("KROMI_REGISTER_RATE_WINDOW_SECS", 60).max(1) as u64),
                env_usize("KROMI_REGISTER_RATE_MAX_KEYS", 50_000),
            )
        })
        .allow(key)
}

pub fn is_valid_description(description: &SessionDescription) -> bool {
    !description.0.is_null() && description.encoded_len() <= MAX_DESCRIPTION_BYTES
}

pub fn is_valid_candidate(candidate: &IceCandidate) -> bool {
    !candidate.0.is_null() && candidate.encoded_len() <= MAX_CANDIDATE_BYTES
}
