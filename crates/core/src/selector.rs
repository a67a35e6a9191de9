//! Equality-based label selectors (`app=web,tier!=db,env,!canary`).

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label selector {input:?}: {reason}")]
pub struct SelectorError {
    pub input: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &[(String, String)]) -> bool {
        let get = |key: &str| labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v.as_str()),
            // Kubernetes semantics: a missing key satisfies `!=`.
            Requirement::NotEquals(k, v) => get(k) != Some(v.as_str()),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::DoesNotExist(k) => get(k).is_none(),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn equals(mut self, key: &str, value: &str) -> Self {
        self.reqs.push(Requirement::Equals(key.to_string(), value.to_string()));
        self
    }

    pub fn not_equals(mut self, key: &str, value: &str) -> Self {
        self.reqs.push(Requirement::NotEquals(key.to_string(), value.to_string()));
        self
    }

    pub fn exists(mut self, key: &str) -> Self {
        self.reqs.push(Requirement::Exists(key.to_string()));
        self
    }

    pub fn absent(mut self, key: &str) -> Self {
        self.reqs.push(Requirement::DoesNotExist(key.to_string()));
        self
    }

    pub fn matches(&self, labels: &[(String, String)]) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }

    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let err = |reason: &str| SelectorError { input: input.to_string(), reason: reason.to_string() };
        let mut sel = Self::default();
        for raw in input.split(',') {
            let term = raw.trim();
            if term.is_empty() {
                continue;
            }
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(valid_key(k).ok_or_else(|| err("empty key"))?, v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==") {
                Requirement::Equals(valid_key(k).ok_or_else(|| err("empty key"))?, v.trim().to_string())
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement::Equals(valid_key(k).ok_or_else(|| err("empty key"))?, v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::DoesNotExist(valid_key(k).ok_or_else(|| err("empty key after '!'"))?)
            } else {
                Requirement::Exists(valid_key(term).ok_or_else(|| err("empty key"))?)
            };
            sel.reqs.push(req);
        }
        Ok(sel)
    }
}

fn valid_key(k: &str) -> Option<String> {
    let k = k.trim();
    if k.is_empty() || k.contains(char::is_whitespace) { None } else { Some(k.to_string()) }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for r in &self.reqs {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match r {
                Requirement::Equals(k, v) => write!(f, "{}={}", k, v)?,
                Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v)?,
                Requirement::Exists(k) => write!(f, "{}", k)?,
                Requirement::DoesNotExist(k) => write!(f, "!{}", k)?,
            }
        }
        Ok(())
    }
}
