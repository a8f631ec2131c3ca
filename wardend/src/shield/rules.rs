//! User-editable security rules matched against detected threats.
//!
//! Rules are persisted to `security_rules.json`; the built-in templates are
//! installed enabled on first run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::detector::Threat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    AutoBlock,
    RateLimit,
    GeoBlock,
    UserAgent,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// One of: threat_type, ip, score.
    pub field: String,
    /// String ops: eq, ne, contains. Numeric ops: eq, ne, gt, gte, lt, lte.
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    /// block, challenge, allow, log.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Block duration in seconds; 0 means permanent.
    pub duration_secs: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub rule_type: RuleType,
    pub enabled: bool,
    pub priority: i32,
    pub conditions: Vec<RuleCondition>,
    pub action: RuleAction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct RuleManager {
    rules: Mutex<HashMap<String, SecurityRule>>,
    data_path: PathBuf,
}

impl RuleManager {
    /// Load persisted rules, falling back to the built-in defaults on first
    /// run or unreadable state.
    pub fn new(data_dir: &Path) -> Self {
        let data_path = data_dir.join("security_rules.json");
        let rules = match std::fs::read(&data_path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, SecurityRule>>(&bytes) {
                Ok(rules) => {
                    info!(count = rules.len(), "loaded security rules");
                    rules
                }
                Err(e) => {
                    warn!(error = %e, "security rules unreadable, installing defaults");
                    default_rules()
                }
            },
            Err(_) => default_rules(),
        };
        let manager = Self {
            rules: Mutex::new(rules),
            data_path,
        };
        manager.save();
        manager
    }

    fn save(&self) {
        if let Some(dir) = self.data_path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let rules = self.rules.lock().unwrap();
        match serde_json::to_vec_pretty(&*rules) {
            Ok(bytes) => {
                let tmp = self.data_path.with_extension("json.tmp");
                if std::fs::write(&tmp, &bytes)
                    .and_then(|_| std::fs::rename(&tmp, &self.data_path))
                    .is_err()
                {
                    warn!(path = %self.data_path.display(), "failed to persist security rules");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize security rules"),
        }
    }

    pub fn create(&self, mut rule: SecurityRule) -> SecurityRule {
        if rule.id.is_empty() {
            rule.id = format!("rule-{}", uuid::Uuid::new_v4());
        }
        rule.created_at = Utc::now();
        rule.updated_at = Utc::now();
        self.rules
            .lock()
            .unwrap()
            .insert(rule.id.clone(), rule.clone());
        self.save();
        rule
    }

    pub fn update(&self, mut rule: SecurityRule) -> bool {
        let mut rules = self.rules.lock().unwrap();
        if !rules.contains_key(&rule.id) {
            return false;
        }
        rule.updated_at = Utc::now();
        rules.insert(rule.id.clone(), rule);
        drop(rules);
        self.save();
        true
    }

    pub fn delete(&self, id: &str) -> bool {
        let removed = self.rules.lock().unwrap().remove(id).is_some();
        if removed {
            self.save();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<SecurityRule> {
        self.rules.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<SecurityRule> {
        let mut rules: Vec<_> = self.rules.lock().unwrap().values().cloned().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        rules
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.get_mut(id) else {
            return false;
        };
        rule.enabled = enabled;
        rule.updated_at = Utc::now();
        drop(rules);
        self.save();
        true
    }

    pub fn enabled_count(&self) -> usize {
        self.rules
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.enabled)
            .count()
    }

    /// Highest-priority enabled rule whose conditions all match the threat.
    /// Ties break toward the rule created first.
    pub fn match_threat(&self, threat: &Threat) -> Option<SecurityRule> {
        let rules = self.rules.lock().unwrap();
        let mut matched: Option<&SecurityRule> = None;
        for rule in rules.values() {
            if !rule.enabled {
                continue;
            }
            if !conditions_match(&rule.conditions, threat) {
                continue;
            }
            match matched {
                Some(current)
                    if current.priority > rule.priority
                        || (current.priority == rule.priority
                            && current.created_at <= rule.created_at) => {}
                _ => matched = Some(rule),
            }
        }
        matched.cloned()
    }
}

fn conditions_match(conditions: &[RuleCondition], threat: &Threat) -> bool {
    conditions.iter().all(|c| condition_matches(c, threat))
}

fn condition_matches(cond: &RuleCondition, threat: &Threat) -> bool {
    match cond.field.as_str() {
        "threat_type" => {
            let value = serde_json::to_value(threat.threat_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            compare_string(&value, &cond.operator, &cond.value)
        }
        "ip" => compare_string(&threat.ip, &cond.operator, &cond.value),
        "score" => {
            let Ok(target) = cond.value.parse::<i64>() else {
                return false;
            };
            compare_numeric(threat.score as i64, &cond.operator, target)
        }
        _ => false,
    }
}

fn compare_string(value: &str, operator: &str, target: &str) -> bool {
    match operator {
        "eq" => value == target,
        "ne" => value != target,
        "contains" => value.contains(target),
        _ => false,
    }
}

fn compare_numeric(value: i64, operator: &str, target: i64) -> bool {
    match operator {
        "eq" => value == target,
        "ne" => value != target,
        "gt" => value > target,
        "gte" => value >= target,
        "lt" => value < target,
        "lte" => value <= target,
        _ => false,
    }
}

fn template(
    id: &str,
    name: &str,
    description: &str,
    priority: i32,
    conditions: Vec<RuleCondition>,
    duration_secs: u64,
    message: &str,
) -> SecurityRule {
    SecurityRule {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        rule_type: RuleType::AutoBlock,
        enabled: true,
        priority,
        conditions,
        action: RuleAction {
            action_type: "block".into(),
            duration_secs,
            message: message.to_string(),
        },
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn cond(field: &str, operator: &str, value: &str) -> RuleCondition {
    RuleCondition {
        field: field.into(),
        operator: operator.into(),
        value: value.into(),
    }
}

/// The default-enabled rule set installed on first run.
fn default_rules() -> HashMap<String, SecurityRule> {
    let rules = vec![
        template(
            "builtin-ssh-brute-force",
            "SSH brute force protection",
            "Repeated SSH login failures inside the window",
            100,
            vec![
                cond("threat_type", "eq", "brute_force"),
                cond("score", "gte", "100"),
            ],
            3600,
            "SSH brute force detected",
        ),
        template(
            "builtin-web-scanner",
            "Web scanner protection",
            "Sensitive path scanning",
            90,
            vec![
                cond("threat_type", "eq", "scanning"),
                cond("score", "gte", "50"),
            ],
            1800,
            "Web scanning detected",
        ),
        template(
            "builtin-sql-injection",
            "SQL injection protection",
            "Immediate block on injection attempts",
            100,
            vec![cond("threat_type", "eq", "sql_injection")],
            86_400,
            "SQL injection attempt detected",
        ),
        template(
            "builtin-xss",
            "XSS protection",
            "Cross-site scripting attempts",
            95,
            vec![cond("threat_type", "eq", "xss")],
            43_200,
            "XSS attempt detected",
        ),
        template(
            "builtin-path-traversal",
            "Path traversal protection",
            "Directory traversal attempts",
            95,
            vec![cond("threat_type", "eq", "path_traversal")],
            43_200,
            "Path traversal attempt detected",
        ),
        template(
            "builtin-malicious-bot",
            "Malicious bot protection",
            "Known scanning tools",
            80,
            vec![cond("threat_type", "eq", "bot_abuse")],
            86_400,
            "Malicious bot detected",
        ),
    ];
    rules.into_iter().map(|r| (r.id.clone(), r)).collect()
}
