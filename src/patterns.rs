use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PatternConfig;

/// Navigation pattern tracker - 足あとから次の行き先を当てる
///
/// Records the sequence of visited paths per session and builds a
/// first-order Markov model of path -> next-path transitions. The
/// transition counts feed the predictive preloader.

/// Observed frequency and successor set for one path
#[derive(Debug, Clone)]
pub struct NavigationPattern {
    pub count: u64,
    pub first_accessed: Instant,
    pub last_accessed: Instant,
    /// Successor path -> times that exact transition was observed
    pub preload_targets: HashMap<String, u64>,
    /// Total transitions recorded out of this path
    pub total_transitions: u64,
}

impl NavigationPattern {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            first_accessed: now,
            last_accessed: now,
            preload_targets: HashMap::new(),
            total_transitions: 0,
        }
    }
}

/// A bounded sequence of navigations from one user context
#[derive(Debug)]
struct Session {
    started_at: Instant,
    last_activity: Instant,
    history: Vec<(String, Instant)>,
    /// Two-step patterns seen in this session
    transitions: HashSet<(String, String)>,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            last_activity: now,
            history: Vec::new(),
            transitions: HashSet::new(),
        }
    }
}

pub struct NavigationTracker {
    config: PatternConfig,
    patterns: RwLock<HashMap<String, NavigationPattern>>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl NavigationTracker {
    pub fn new(config: &PatternConfig) -> Self {
        Self {
            config: config.clone(),
            patterns: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.config.session_timeout_secs)
    }

    /// Record a navigation. Returns the previous path in this session,
    /// if the transition was recorded (callers use it for logging).
    pub fn track_navigation(&self, path: &str, session_id: Option<&str>) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        let session_key = session_id.unwrap_or("anonymous").to_string();

        {
            let mut patterns = self.patterns.write();
            let pattern = patterns
                .entry(path.to_string())
                .or_insert_with(|| NavigationPattern::new(now));
            pattern.count += 1;
            pattern.last_accessed = now;
        }

        let previous = {
            let mut sessions = self.sessions.write();
            let timeout = self.session_timeout();
            let session = match sessions.entry(session_key) {
                Entry::Occupied(mut e) => {
                    // Inactivity timeout: the old trail is stale context
                    if now.duration_since(e.get().last_activity) > timeout {
                        *e.get_mut() = Session::new(now);
                    }
                    e.into_mut()
                }
                Entry::Vacant(v) => v.insert(Session::new(now)),
            };
            session.last_activity = now;
            session.history.push((path.to_string(), now));

            if session.history.len() >= 2 {
                let prev = session.history[session.history.len() - 2].0.clone();
                session
                    .transitions
                    .insert((prev.clone(), path.to_string()));
                Some(prev)
            } else {
                None
            }
        };

        // Self-loops (refreshes) are recorded like any other transition
        if let Some(ref prev) = previous {
            let mut patterns = self.patterns.write();
            let pattern = patterns
                .entry(prev.clone())
                .or_insert_with(|| NavigationPattern::new(now));
            *pattern.preload_targets.entry(path.to_string()).or_insert(0) += 1;
            pattern.total_transitions += 1;
            debug!("Transition {} -> {}", prev, path);
        }

        self.cleanup(now);
        previous
    }

    /// LRU eviction of patterns and sessions beyond capacity; expired
    /// sessions are dropped outright.
    fn cleanup(&self, now: Instant) {
        {
            let mut patterns = self.patterns.write();
            while patterns.len() > self.config.max_patterns {
                let victim = patterns
                    .iter()
                    .min_by_key(|(_, p)| p.last_accessed)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(k) => {
                        patterns.remove(&k);
                    }
                    None => break,
                }
            }
        }

        let timeout = self.session_timeout();
        let mut sessions = self.sessions.write();
        sessions.retain(|_, s| now.duration_since(s.last_activity) <= timeout);
        while sessions.len() > self.config.max_sessions {
            let victim = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_activity)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    sessions.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Ranked predictive targets for a path: transition confidence =
    /// (count of that transition) / (total transitions from the path),
    /// top 3 above the configured threshold.
    pub fn predictions(&self, path: &str) -> Vec<(String, f64)> {
        let patterns = self.patterns.read();
        let pattern = match patterns.get(path) {
            Some(p) if p.total_transitions > 0 => p,
            _ => return Vec::new(),
        };

        let mut ranked: Vec<(String, f64)> = pattern
            .preload_targets
            .iter()
            .map(|(target, count)| {
                (target.clone(), *count as f64 / pattern.total_transitions as f64)
            })
            .filter(|(_, confidence)| *confidence >= self.config.confidence_threshold)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(3);
        ranked
    }

    pub fn clear(&self) {
        self.patterns.write().clear();
        self.sessions.write().clear();
        debug!("Navigation patterns cleared");
    }

    pub fn total_patterns(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn total_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// Aggregate view for GET_NAVIGATION_PATTERNS
    pub fn summary(&self, limit: usize) -> serde_json::Value {
        let patterns = self.patterns.read();
        let sessions = self.sessions.read();

        let mut top: Vec<(&String, &NavigationPattern)> = patterns.iter().collect();
        top.sort_by(|a, b| b.1.count.cmp(&a.1.count));

        let top_patterns: Vec<serde_json::Value> = top
            .iter()
            .take(limit)
            .map(|(path, p)| {
                let mut targets: Vec<(&String, &u64)> = p.preload_targets.iter().collect();
                targets.sort_by(|a, b| b.1.cmp(a.1));
                serde_json::json!({
                    "path": path,
                    "count": p.count,
                    "preload_targets": targets
                        .iter()
                        .map(|(t, c)| serde_json::json!({"path": t, "transitions": c}))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();

        let critical_paths: Vec<&String> = top
            .iter()
            .filter(|(_, p)| p.count >= self.config.critical_visits)
            .map(|(path, _)| *path)
            .collect();

        let session_activity: Vec<serde_json::Value> = sessions
            .values()
            .map(|s| {
                serde_json::json!({
                    "paths_visited": s.history.len(),
                    "transitions": s.transitions.len(),
                    "duration_secs": s.last_activity.duration_since(s.started_at).as_secs(),
                })
            })
            .collect();

        serde_json::json!({
            "topPatterns": top_patterns,
            "criticalPaths": critical_paths,
            "sessionActivity": session_activity,
            "totalPatterns": patterns.len(),
            "totalSessions": sessions.len(),
        })
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.config.enabled,
            "total_patterns": self.total_patterns(),
            "total_sessions": self.total_sessions(),
            "max_patterns": self.config.max_patterns,
            "max_sessions": self.config.max_sessions,
        })
    }
}
