//! 风险闸门：根据操作的文本描述给出风险等级，并决定是否需要人工审批
//!
//! 判定顺序：
//! 1. 闸门被配置关闭 -> low / 无需审批
//! 2. 命中 block_patterns -> critical / 必须审批（短路，始终优先）
//! 3. 命中 auto_approve_patterns -> low / 无需审批（短路）
//! 4. 内置模式表（critical -> high -> medium -> low，可由配置追加）：收集所有命中，
//!    取最高等级；同级取先注册者的 category / reason；matched_patterns 为全部命中的并集
//! 5. 无命中 -> low / safe / 无需审批
//!
//! 命中内置模式表时 requires_approval = 等级 >= approval_threshold。配置可通过 update_config 整体热替换。

use std::fmt;
use std::sync::{Arc, RwLock};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 风险等级（有序：Low < Medium < High < Critical）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// 单次评估结果，只在审批决策期间存在
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub category: String,
    pub reason: String,
    pub requires_approval: bool,
    pub matched_patterns: Vec<String>,
}

/// 配置中追加的模式条目
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RiskPatternSpec {
    pub pattern: String,
    pub category: String,
    pub level: RiskLevel,
    pub reason: String,
}

/// [hitl.risk] 段
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RiskConfig {
    pub enabled: bool,
    pub approval_threshold: RiskLevel,
    pub auto_approve_patterns: Vec<String>,
    pub block_patterns: Vec<String>,
    pub extra_patterns: Vec<RiskPatternSpec>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            approval_threshold: RiskLevel::High,
            auto_approve_patterns: Vec::new(),
            block_patterns: Vec::new(),
            extra_patterns: Vec::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RiskConfigError {
    #[error("Invalid risk pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// 内置模式表：(pattern, category, level, reason)，按 critical -> low 排列
const BUILTIN_PATTERNS: &[(&str, &str, RiskLevel, &str)] = &[
    (
        r"\brm\s+(-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*|-r\s+-f|-f\s+-r|--recursive\s+--force|--force\s+--recursive)\b",
        "destructive_delete",
        RiskLevel::Critical,
        "Recursive forced deletion",
    ),
    (r"\bmkfs(\.\w+)?\b", "disk_format", RiskLevel::Critical, "Formats a filesystem"),
    (r"\bdd\s+if=", "raw_disk_write", RiskLevel::Critical, "Raw block device copy"),
    (r">\s*/dev/(sd|nvme|hd)", "raw_disk_write", RiskLevel::Critical, "Writes directly to a block device"),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork_bomb", RiskLevel::Critical, "Fork bomb"),
    (
        r"\b(curl|wget)\b[^|\n]*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
        "remote_execution",
        RiskLevel::Critical,
        "Pipes a downloaded script into a shell",
    ),
    (r"\bsudo\b", "privilege_escalation", RiskLevel::High, "Runs with elevated privileges"),
    (r"\brm\s+", "file_delete", RiskLevel::High, "Deletes files"),
    (r"\b(delete|remove)_?(file|dir|directory)\b", "file_delete", RiskLevel::High, "Deletes files"),
    (
        r"\bgit\s+(push|reset\s+--hard|clean\s+-[a-z]*f)",
        "vcs_destructive",
        RiskLevel::High,
        "Rewrites or publishes repository history",
    ),
    (r"\bchmod\s+(-R\s+)?(777|\+s)|\bchown\b", "permission_change", RiskLevel::High, "Changes file ownership or permissions"),
    (r"\b(drop|truncate)\s+(table|database|schema)\b", "data_destruction", RiskLevel::High, "Destroys database objects"),
    (r"\b(shutdown|reboot|halt|pkill|killall)\b|\bkill\s+-9\b", "process_control", RiskLevel::High, "Stops processes or the machine"),
    (
        r"\b(write|create|overwrite|edit|modify|update|append)\b.*\bfiles?\b|\b(write|edit|create)_file\b",
        "file_write",
        RiskLevel::Medium,
        "Creates or modifies files",
    ),
    (
        r"\b(npm|pnpm|yarn|pip3?|cargo|apt(-get)?|brew|gem)\s+(install|add|remove|uninstall|publish)\b",
        "package_change",
        RiskLevel::Medium,
        "Changes installed packages",
    ),
    (r"\bgit\s+(commit|checkout|merge|rebase|stash)\b", "vcs_change", RiskLevel::Medium, "Modifies the working tree or history"),
    (r"\b(mv|cp)\s+", "file_move", RiskLevel::Medium, "Moves or copies files"),
    (r"\b(curl|wget)\b|https?://", "network", RiskLevel::Medium, "Accesses the network"),
    (
        r"\b(read|cat|ls|list|grep|find|search|view|show|head|tail)\b",
        "read_only",
        RiskLevel::Low,
        "Read-only operation",
    ),
    (r"\bgit\s+(status|diff|log|show)\b", "vcs_read", RiskLevel::Low, "Read-only repository query"),
];

struct CompiledPattern {
    regex: Regex,
    category: String,
    level: RiskLevel,
    reason: String,
}

/// 编译后的配置快照；update_config 时整体替换
struct CompiledRiskConfig {
    config: RiskConfig,
    block: Vec<Regex>,
    auto_approve: Vec<Regex>,
    table: Vec<CompiledPattern>,
}

fn compile(pattern: &str) -> Result<Regex, RiskConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| RiskConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

impl CompiledRiskConfig {
    fn build(config: RiskConfig) -> Result<Self, RiskConfigError> {
        let block = config
            .block_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let auto_approve = config
            .auto_approve_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut table = Vec::with_capacity(BUILTIN_PATTERNS.len() + config.extra_patterns.len());
        for (pattern, category, level, reason) in BUILTIN_PATTERNS {
            table.push(CompiledPattern {
                regex: compile(pattern)?,
                category: category.to_string(),
                level: *level,
                reason: reason.to_string(),
            });
        }
        for extra in &config.extra_patterns {
            table.push(CompiledPattern {
                regex: compile(&extra.pattern)?,
                category: extra.category.clone(),
                level: extra.level,
                reason: extra.reason.clone(),
            });
        }
        // 稳定排序：同级内保持注册顺序（内置在前）
        table.sort_by(|a, b| b.level.cmp(&a.level));

        Ok(Self {
            config,
            block,
            auto_approve,
            table,
        })
    }
}

/// 风险闸门：无状态，仅持有可热替换的配置
pub struct RiskGate {
    inner: RwLock<Arc<CompiledRiskConfig>>,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Result<Self, RiskConfigError> {
        Ok(Self {
            inner: RwLock::new(Arc::new(CompiledRiskConfig::build(config)?)),
        })
    }

    /// 先完整编译新配置，再原子替换；编译失败时旧配置保持不变
    pub fn update_config(&self, config: RiskConfig) -> Result<(), RiskConfigError> {
        let compiled = Arc::new(CompiledRiskConfig::build(config)?);
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = compiled;
        tracing::info!("Risk gate configuration updated");
        Ok(())
    }

    pub fn config(&self) -> RiskConfig {
        self.snapshot().config.clone()
    }

    fn snapshot(&self) -> Arc<CompiledRiskConfig> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 评估一次操作；detail 一般是工具参数的扁平化文本
    pub fn analyze(&self, description: &str, detail: Option<&str>) -> RiskAssessment {
        let snapshot = self.snapshot();
        evaluate(&snapshot, description, detail)
    }
}

fn evaluate(compiled: &CompiledRiskConfig, description: &str, detail: Option<&str>) -> RiskAssessment {
    let config = &compiled.config;
    if !config.enabled {
        return RiskAssessment {
            level: RiskLevel::Low,
            category: "disabled".to_string(),
            reason: "Risk analysis disabled".to_string(),
            requires_approval: false,
            matched_patterns: Vec::new(),
        };
    }

    let text = match detail {
        Some(d) if !d.is_empty() => format!("{description} {d}"),
        _ => description.to_string(),
    };

    let blocked: Vec<String> = compiled
        .block
        .iter()
        .filter(|re| re.is_match(&text))
        .map(|re| re.as_str().to_string())
        .collect();
    if !blocked.is_empty() {
        return RiskAssessment {
            level: RiskLevel::Critical,
            category: "blocked".to_string(),
            reason: "Matched a configured block pattern".to_string(),
            requires_approval: true,
            matched_patterns: blocked,
        };
    }

    if let Some(re) = compiled.auto_approve.iter().find(|re| re.is_match(&text)) {
        return RiskAssessment {
            level: RiskLevel::Low,
            category: "auto_approved".to_string(),
            reason: "Matched a configured auto-approve pattern".to_string(),
            requires_approval: false,
            matched_patterns: vec![re.as_str().to_string()],
        };
    }

    let mut top: Option<&CompiledPattern> = None;
    let mut matched = Vec::new();
    for entry in &compiled.table {
        if !entry.regex.is_match(&text) {
            continue;
        }
        let source = entry.regex.as_str().to_string();
        if !matched.contains(&source) {
            matched.push(source);
        }
        if top.map_or(true, |t| entry.level > t.level) {
            top = Some(entry);
        }
    }

    match top {
        Some(entry) => RiskAssessment {
            level: entry.level,
            category: entry.category.clone(),
            reason: entry.reason.clone(),
            requires_approval: entry.level >= config.approval_threshold,
            matched_patterns: matched,
        },
        None => RiskAssessment {
            level: RiskLevel::Low,
            category: "safe".to_string(),
            reason: "No risk pattern matched".to_string(),
            requires_approval: false,
            matched_patterns: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with_threshold(threshold: RiskLevel) -> RiskGate {
        RiskGate::new(RiskConfig {
            approval_threshold: threshold,
            ..RiskConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rm_rf_is_critical_at_any_threshold() {
        for threshold in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High, RiskLevel::Critical] {
            let a = gate_with_threshold(threshold).analyze("rm -rf /tmp/x", None);
            assert_eq!(a.level, RiskLevel::Critical);
            assert!(a.requires_approval);
            assert_eq!(a.category, "destructive_delete");
            // rm -rf 同时命中 high 级的删除模式，matched_patterns 为并集
            assert!(a.matched_patterns.len() >= 2);
        }
    }

    #[test]
    fn test_file_write_is_medium_and_threshold_decides() {
        let high = gate_with_threshold(RiskLevel::High).analyze("write new file index.ts", None);
        assert_eq!(high.level, RiskLevel::Medium);
        assert!(!high.requires_approval);

        let medium = gate_with_threshold(RiskLevel::Medium).analyze("write new file index.ts", None);
        assert_eq!(medium.level, RiskLevel::Medium);
        assert!(medium.requires_approval);
    }

    #[test]
    fn test_block_pattern_outranks_builtin_low() {
        let gate = RiskGate::new(RiskConfig {
            block_patterns: vec!["secrets?".to_string()],
            auto_approve_patterns: vec!["^cat".to_string()],
            ..RiskConfig::default()
        })
        .unwrap();
        let a = gate.analyze("cat", Some("config/secrets.env"));
        assert_eq!(a.level, RiskLevel::Critical);
        assert!(a.requires_approval);
        assert_eq!(a.category, "blocked");
        assert_eq!(a.matched_patterns, vec!["secrets?".to_string()]);
    }

    #[test]
    fn test_auto_approve_short_circuits_builtin_table() {
        let gate = RiskGate::new(RiskConfig {
            auto_approve_patterns: vec![r"^shell rm -rf target/debug$".to_string()],
            approval_threshold: RiskLevel::Low,
            ..RiskConfig::default()
        })
        .unwrap();
        let a = gate.analyze("shell", Some("rm -rf target/debug"));
        assert_eq!(a.level, RiskLevel::Low);
        assert!(!a.requires_approval);
        assert_eq!(a.category, "auto_approved");
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let a = gate_with_threshold(RiskLevel::High).analyze("SUDO apt-get update", None);
        assert_eq!(a.level, RiskLevel::High);
        assert_eq!(a.category, "privilege_escalation");
    }

    #[test]
    fn test_no_match_is_safe() {
        let a = gate_with_threshold(RiskLevel::Medium).analyze("echo", Some("hello"));
        assert_eq!(a.level, RiskLevel::Low);
        assert_eq!(a.category, "safe");
        assert!(!a.requires_approval);
        assert!(a.matched_patterns.is_empty());
    }

    #[test]
    fn test_low_threshold_gates_low_matches_but_not_unmatched() {
        let gate = gate_with_threshold(RiskLevel::Low);
        let matched = gate.analyze("shell", Some("git status"));
        assert_eq!(matched.level, RiskLevel::Low);
        assert_eq!(matched.category, "vcs_read");
        assert!(matched.requires_approval);

        let unmatched = gate.analyze("echo", Some("hello"));
        assert_eq!(unmatched.category, "safe");
        assert!(!unmatched.requires_approval);
    }

    #[test]
    fn test_disabled_gate_returns_low() {
        let gate = RiskGate::new(RiskConfig {
            enabled: false,
            ..RiskConfig::default()
        })
        .unwrap();
        let a = gate.analyze("rm -rf /", None);
        assert_eq!(a.level, RiskLevel::Low);
        assert!(!a.requires_approval);
    }

    #[test]
    fn test_extra_pattern_joins_ranking() {
        let gate = RiskGate::new(RiskConfig {
            extra_patterns: vec![RiskPatternSpec {
                pattern: r"\bterraform\s+apply\b".to_string(),
                category: "infra_change".to_string(),
                level: RiskLevel::Critical,
                reason: "Applies infrastructure changes".to_string(),
            }],
            ..RiskConfig::default()
        })
        .unwrap();
        let a = gate.analyze("shell", Some("terraform apply -auto-approve"));
        assert_eq!(a.level, RiskLevel::Critical);
        assert_eq!(a.category, "infra_change");
    }

    #[test]
    fn test_same_level_tie_keeps_first_registered() {
        let gate = RiskGate::new(RiskConfig {
            extra_patterns: vec![RiskPatternSpec {
                pattern: r"\bsudo\b".to_string(),
                category: "custom_sudo".to_string(),
                level: RiskLevel::High,
                reason: "custom".to_string(),
            }],
            ..RiskConfig::default()
        })
        .unwrap();
        let a = gate.analyze("sudo ls", None);
        assert_eq!(a.category, "privilege_escalation");
    }

    #[test]
    fn test_update_config_swaps_atomically_and_rejects_bad_regex() {
        let gate = gate_with_threshold(RiskLevel::High);
        assert!(!gate.analyze("write new file a.rs", None).requires_approval);

        gate.update_config(RiskConfig {
            approval_threshold: RiskLevel::Medium,
            ..RiskConfig::default()
        })
        .unwrap();
        assert!(gate.analyze("write new file a.rs", None).requires_approval);

        let err = gate.update_config(RiskConfig {
            block_patterns: vec!["(unclosed".to_string()],
            ..RiskConfig::default()
        });
        assert!(matches!(err, Err(RiskConfigError::InvalidPattern { .. })));
        // 失败的更新不影响现有配置
        assert_eq!(gate.config().approval_threshold, RiskLevel::Medium);
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical.to_string(), "critical");
    }
}
