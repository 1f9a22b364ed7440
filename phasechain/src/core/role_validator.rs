//! Role conformance validation.
//!
//! Each role carries ordered deny and allow patterns; a process-wide override
//! set takes precedence over every per-role rule. Deny (overrides included) is
//! always evaluated before allow, and a role with an empty allow list is
//! permissive by default.
//!
//! Precedence, first match wins:
//! 1. global deny override -> reject `override_deny:<pattern>`
//! 2. role deny -> reject `forbidden_pattern:<pattern>`
//! 3. global allow override -> accept `allow_override`
//! 4. role allow list (non-empty) -> `allowed` or reject `no_allow_pattern`
//! 5. empty role allow list -> accept `allowed_by_default`
//! 6. role not configured -> accept `no_constraints`

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::text::normalize;

pub const REPHRASE_GUIDANCE: &str = "please_rephrase_to_avoid_forbidden_behavior";
pub const FOCUS_GUIDANCE: &str = "please_focus_on_role_responsibilities";

/// Uncompiled allow/deny pattern lists, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    fn compile(source: &str) -> Result<Self> {
        let regex = RegexBuilder::new(source)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("compile pattern '{source}'"))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    fn matches(&self, raw: &str, normalized: &str) -> bool {
        self.regex.is_match(raw) || self.regex.is_match(normalized)
    }
}

#[derive(Debug, Clone, Default)]
struct CompiledRules {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
}

impl CompiledRules {
    fn compile(rules: &PatternRules) -> Result<Self> {
        Ok(Self {
            allow: compile_all(&rules.allow)?,
            deny: compile_all(&rules.deny)?,
        })
    }
}

fn compile_all(sources: &[String]) -> Result<Vec<Pattern>> {
    sources.iter().map(|source| Pattern::compile(source)).collect()
}

fn first_match<'a>(patterns: &'a [Pattern], raw: &str, normalized: &str) -> Option<&'a Pattern> {
    patterns.iter().find(|pattern| pattern.matches(raw, normalized))
}

/// Audit record for one `enforce` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub role: String,
    pub text: String,
    pub ok: bool,
    pub reason: String,
    /// Re-prompt hint for rejected actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoleConformanceValidator {
    roles: BTreeMap<String, CompiledRules>,
    overrides: CompiledRules,
    decisions: Vec<ValidationRecord>,
}

impl RoleConformanceValidator {
    /// Compile per-role rules and global overrides. Fails on any invalid pattern.
    pub fn new(roles: &BTreeMap<String, PatternRules>, overrides: &PatternRules) -> Result<Self> {
        let mut compiled = BTreeMap::new();
        for (role, rules) in roles {
            let rules =
                CompiledRules::compile(rules).with_context(|| format!("constraints for {role}"))?;
            compiled.insert(role.clone(), rules);
        }
        let overrides = CompiledRules::compile(overrides).context("global overrides")?;
        Ok(Self {
            roles: compiled,
            overrides,
            decisions: Vec::new(),
        })
    }

    /// Validator with no constraints; every role is accepted.
    pub fn permissive() -> Self {
        Self {
            roles: BTreeMap::new(),
            overrides: CompiledRules::default(),
            decisions: Vec::new(),
        }
    }

    pub fn add_deny_override(&mut self, pattern: &str) -> Result<()> {
        self.overrides.deny.push(Pattern::compile(pattern)?);
        Ok(())
    }

    pub fn add_allow_override(&mut self, pattern: &str) -> Result<()> {
        self.overrides.allow.push(Pattern::compile(pattern)?);
        Ok(())
    }

    /// Classify `text` for `role` and append the decision to the audit log.
    pub fn enforce(&mut self, role: &str, text: &str) -> ValidationRecord {
        let (ok, reason) = self.classify(role, text);
        let guidance = if ok {
            None
        } else if reason == "no_allow_pattern" {
            Some(FOCUS_GUIDANCE.to_string())
        } else {
            Some(REPHRASE_GUIDANCE.to_string())
        };
        if ok {
            debug!(role, reason = %reason, "action accepted");
        } else {
            warn!(role, reason = %reason, "action rejected");
        }
        let record = ValidationRecord {
            role: role.to_string(),
            text: text.to_string(),
            ok,
            reason,
            guidance,
        };
        self.decisions.push(record.clone());
        record
    }

    fn classify(&self, role: &str, text: &str) -> (bool, String) {
        let normalized = normalize(text);

        if let Some(pattern) = first_match(&self.overrides.deny, text, &normalized) {
            return (false, format!("override_deny:{}", pattern.source));
        }

        let rules = self.roles.get(role);
        if let Some(pattern) = rules.and_then(|r| first_match(&r.deny, text, &normalized)) {
            return (false, format!("forbidden_pattern:{}", pattern.source));
        }

        if first_match(&self.overrides.allow, text, &normalized).is_some() {
            return (true, "allow_override".to_string());
        }

        match rules {
            None => (true, "no_constraints".to_string()),
            Some(rules) if rules.allow.is_empty() => (true, "allowed_by_default".to_string()),
            Some(rules) => {
                if first_match(&rules.allow, text, &normalized).is_some() {
                    (true, "allowed".to_string())
                } else {
                    (false, "no_allow_pattern".to_string())
                }
            }
        }
    }

    /// Every decision taken so far, oldest first.
    pub fn decisions(&self) -> &[ValidationRecord] {
        &self.decisions
    }
}
