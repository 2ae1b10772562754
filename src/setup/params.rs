// src/setup/params.rs

//! Task parameters, variant enumeration and cache flags.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One legal value of a task parameter axis.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

/// A concrete parameter combination (one variant).
pub type Params = BTreeMap<String, ParamValue>;

/// Parameter axes declared on a task.
pub type ParamAxes = BTreeMap<String, Vec<ParamValue>>;

/// Cartesian product of all axes.
///
/// No axes yields no combinations; callers treat that as the single
/// no-params case.
pub fn get_combs(axes: &ParamAxes) -> Vec<Params> {
    if axes.is_empty() {
        return Vec::new();
    }

    let mut combs: Vec<Params> = vec![Params::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(combs.len() * values.len());
        for comb in &combs {
            for value in values {
                let mut extended = comb.clone();
                extended.insert(name.clone(), value.clone());
                next.push(extended);
            }
        }
        combs = next;
    }
    combs
}

/// Order-independent encoding of a variant, used as cache key suffix.
///
/// Boolean parameters set to `true` contribute their name and `false`
/// contributes nothing, so `{vext: true, dbg: false}` maps to `{"vext"}`.
/// String and integer parameters contribute their value, so
/// `{target_arch: "riscv", vlen: 256}` maps to `{"256", "riscv"}` and
/// variants differing only in those values get distinct keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Flags(BTreeSet<String>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: &Params) -> Self {
        Flags(
            params
                .iter()
                .filter_map(|(name, value)| match value {
                    ParamValue::Bool(true) => Some(name.clone()),
                    ParamValue::Bool(false) => None,
                    ParamValue::Int(i) => Some(i.to_string()),
                    ParamValue::Str(s) => Some(s.clone()),
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

impl<S: Into<String>> FromIterator<S> for Flags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Flags(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(","))
    }
}

/// Expand `{param}` placeholders in a key template with the variant values.
///
/// Placeholders without a matching param are left untouched.
pub fn expand_template(template: &str, params: &Params) -> String {
    let Some(re) = placeholder_regex() else {
        return template.to_string();
    };
    if !template.contains('{') {
        return template.to_string();
    }
    re.replace_all(template, |caps: &regex::Captures<'_>| match params.get(&caps[1]) {
        Some(value) => value.to_string(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Whether a key template still has `{placeholder}` parts.
pub fn is_template(key: &str) -> bool {
    placeholder_regex().is_some_and(|re| re.is_match(key))
}

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}
