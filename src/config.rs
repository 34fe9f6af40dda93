use std::path::PathBuf;

use chrono::NaiveTime;

use crate::limits::MAX_CONNECTIONS_DEFAULT;
use crate::model::TimeWindow;

/// How many approval gates a reservation passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalChain {
    /// `Pending → Approved | Rejected`, admin decides.
    TwoStage,
    /// `PendingCohortApproval → PendingStaffApproval → StaffApproved → Approved`.
    FourStage,
}

/// Which statuses occupy a slot for conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingPolicy {
    /// Only reservations past the last lower gate block others.
    CommittedOnly,
    /// Every non-rejected reservation blocks others.
    IncludePending,
}

/// Engine-wide booking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub chain: ApprovalChain,
    pub blocking: BlockingPolicy,
    /// Operating hours. Reservations must start at or after `start` and end at or before `end`.
    pub hours: TimeWindow,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            chain: ApprovalChain::FourStage,
            blocking: BlockingPolicy::CommittedOnly,
            hours: TimeWindow::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
                NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            ),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String, expected: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, expected } => {
                write!(f, "invalid {var}={value:?}: expected {expected}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Server configuration, read from `ROOMGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// JSON file with the initial actor roster.
    pub roster: Option<PathBuf>,
    pub policy: Policy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take defaults,
    /// malformed policy variables are errors.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = get("ROOMGATE_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5480);
        let bind = get("ROOMGATE_BIND").unwrap_or_else(|| "0.0.0.0".into());
        let data_dir = PathBuf::from(get("ROOMGATE_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let password = get("ROOMGATE_PASSWORD").unwrap_or_else(|| "roomgate".into());
        let max_connections = get("ROOMGATE_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(MAX_CONNECTIONS_DEFAULT);
        let compact_threshold = get("ROOMGATE_COMPACT_THRESHOLD")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);
        let metrics_port = get("ROOMGATE_METRICS_PORT").and_then(|s| s.parse().ok());
        let roster = get("ROOMGATE_ROSTER").map(PathBuf::from);

        let mut policy = Policy::default();
        if let Some(v) = get("ROOMGATE_CHAIN") {
            policy.chain = match v.as_str() {
                "2" | "two" | "two_stage" => ApprovalChain::TwoStage,
                "4" | "four" | "four_stage" => ApprovalChain::FourStage,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "ROOMGATE_CHAIN",
                        value: v,
                        expected: "two_stage or four_stage",
                    });
                }
            };
        }
        if let Some(v) = get("ROOMGATE_BLOCKING") {
            policy.blocking = match v.as_str() {
                "committed" | "committed_only" => BlockingPolicy::CommittedOnly,
                "pending" | "include_pending" => BlockingPolicy::IncludePending,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "ROOMGATE_BLOCKING",
                        value: v,
                        expected: "committed_only or include_pending",
                    });
                }
            };
        }
        if let Some(v) = get("ROOMGATE_OPEN") {
            policy.hours.start = parse_time("ROOMGATE_OPEN", v)?;
        }
        if let Some(v) = get("ROOMGATE_CLOSE") {
            policy.hours.end = parse_time("ROOMGATE_CLOSE", v)?;
        }
        if !policy.hours.is_well_formed() {
            return Err(ConfigError::Invalid {
                var: "ROOMGATE_CLOSE",
                value: policy.hours.end.format("%H:%M").to_string(),
                expected: "a closing time after ROOMGATE_OPEN",
            });
        }

        Ok(Self {
            bind,
            port,
            data_dir,
            password,
            max_connections,
            compact_threshold,
            metrics_port,
            roster,
            policy,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

fn parse_time(var: &'static str, value: String) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(&value, "%H:%M").map_err(|_| ConfigError::Invalid {
        var,
        value,
        expected: "HH:MM",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 5480);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.max_connections, MAX_CONNECTIONS_DEFAULT);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.policy, Policy::default());
        assert_eq!(cfg.policy.hours.to_string(), "09:00-16:00");
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/reservations.wal"));
    }

    #[test]
    fn policy_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("ROOMGATE_CHAIN", "two_stage"),
            ("ROOMGATE_BLOCKING", "include_pending"),
            ("ROOMGATE_OPEN", "08:30"),
            ("ROOMGATE_CLOSE", "18:00"),
        ]))
        .unwrap();
        assert_eq!(cfg.policy.chain, ApprovalChain::TwoStage);
        assert_eq!(cfg.policy.blocking, BlockingPolicy::IncludePending);
        assert_eq!(cfg.policy.hours.to_string(), "08:30-18:00");
    }

    #[test]
    fn bad_chain_rejected() {
        let err = Config::from_lookup(lookup(&[("ROOMGATE_CHAIN", "three")])).unwrap_err();
        assert!(err.to_string().contains("ROOMGATE_CHAIN"));
    }

    #[test]
    fn inverted_hours_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("ROOMGATE_OPEN", "17:00"),
            ("ROOMGATE_CLOSE", "09:00"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let cfg = Config::from_lookup(lookup(&[
            ("ROOMGATE_PORT", "not-a-port"),
            ("ROOMGATE_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 5480);
        assert_eq!(cfg.metrics_port, Some(9100));
    }
}
