//! Static security policy for sandboxed code.
//!
//! Grounded on `mesoclaw`'s `security::policy::SecurityPolicy`, generalized
//! from shell-command risk classification to static source-code scanning:
//! where that module classifies an executable name before running it as a
//! subprocess, this classifies a whole program's text before handing it to
//! the sandbox's interpreter/runtime. The blocklist-scan shape is carried
//! over; mesoclaw's `RiskLevel` only has three tiers (`Low`/`Medium`/`High`)
//! and matches with plain `.contains()`/`split_whitespace()`. The fourth
//! tier (`Critical`, for admission-blocking findings) and the regex-based
//! import matching below are this crate's own addition.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Severity of a policy finding. `Critical` rejects admission outright;
/// the lower tiers are recorded but do not block execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Low,
    Medium,
    High,
    Critical,
}

/// One policy finding produced while scanning a program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub classification: Classification,
    pub reason: String,
}

/// Outcome of scanning a program against the static security policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub violations: Vec<Violation>,
}

impl ScanResult {
    pub fn highest(&self) -> Option<Classification> {
        self.violations.iter().map(|v| v.classification).max()
    }

    pub fn is_admissible(&self) -> bool {
        self.highest() != Some(Classification::Critical)
    }
}

/// Modules/imports whose mere presence is an automatic `critical` finding:
/// process control, raw sockets, and dynamic code loading are the classic
/// sandbox-escape vectors.
const CRITICAL_IMPORTS: &[&str] = &[
    "os", "subprocess", "sys", "ctypes", "socket", "multiprocessing", "pty",
];

const CRITICAL_KEYWORDS: &[&str] = &[
    "exec(", "eval(", "__import__", "compile(", "os.system", "os.popen",
];

const HIGH_KEYWORDS: &[&str] = &["open(", "os.environ", "getattr(", "setattr("];

const MEDIUM_KEYWORDS: &[&str] = &["requests.", "urllib", "http.client"];

fn import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap())
}

/// Scan a program's source text for policy violations before it is ever
/// handed to the sandbox's runtime.
pub fn scan(code: &str) -> ScanResult {
    let mut violations = Vec::new();

    for caps in import_regex().captures_iter(code) {
        let module = &caps[1];
        let root = module.split('.').next().unwrap_or(module);
        if CRITICAL_IMPORTS.contains(&root) {
            violations.push(Violation {
                classification: Classification::Critical,
                reason: format!("import of blocklisted module '{module}'"),
            });
        }
    }

    for kw in CRITICAL_KEYWORDS {
        if code.contains(kw) {
            violations.push(Violation {
                classification: Classification::Critical,
                reason: format!("use of disallowed construct '{kw}'"),
            });
        }
    }

    for kw in HIGH_KEYWORDS {
        if code.contains(kw) {
            violations.push(Violation {
                classification: Classification::High,
                reason: format!("use of high-risk construct '{kw}'"),
            });
        }
    }

    for kw in MEDIUM_KEYWORDS {
        if code.contains(kw) {
            violations.push(Violation {
                classification: Classification::Medium,
                reason: format!("use of network-capable construct '{kw}'"),
            });
        }
    }

    if violations.is_empty() {
        violations.push(Violation {
            classification: Classification::Low,
            reason: "no policy findings".into(),
        });
    }

    ScanResult { violations }
}
