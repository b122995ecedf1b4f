//! Version parsing and constraint matching
//!
//! Constraints accepted by [`VersionConstraint::parse`]:
//!
//! | input              | matches                      |
//! |--------------------|------------------------------|
//! | `""`, `*`          | every version `>= 0.0.0`     |
//! | `^1.2.3`           | `>=1.2.3 <2.0.0`             |
//! | `~1.2.3`           | `>=1.2.3 <1.3.0`             |
//! | `1.2.x`, `1.2.*`   | `>=1.2.0 <1.3.0`             |
//! | `>=1.2.0 <2.0.0`   | both comparators             |
//! | `<1.0.0 \|\| >=2.0.0` | either alternative        |
//! | `1.2`              | exactly `1.2.0`              |
//!
//! Versions are ordered by semantic-version precedence. Build metadata does
//! not take part in comparisons.

use crate::error::{DiscoveryError, DiscoveryResult};
use semver::Version;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A service version, compared by semantic-version precedence
#[derive(Debug, Clone)]
pub struct ServiceVersion(Version);

impl ServiceVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(Version::new(major, minor, patch))
    }

    /// Parse a version, completing missing components (`1.2` is `1.2.0`) and
    /// dropping a leading `v`.
    pub fn parse(input: &str) -> DiscoveryResult<Self> {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let (core, suffix) = split_core(trimmed);
        let mut numbers = [0u64; 3];
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return Err(DiscoveryError::version_parse(input, "too many components"));
        }
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = parse_component(input, part)?;
        }

        let normalized = format!("{}.{}.{}{}", numbers[0], numbers[1], numbers[2], suffix);
        Version::parse(&normalized)
            .map(Self)
            .map_err(|e| DiscoveryError::version_parse(input, e))
    }

    pub fn as_semver(&self) -> &Version {
        &self.0
    }

    fn bump_major(&self, input: &str) -> DiscoveryResult<Self> {
        let major = self.0.major.checked_add(1).ok_or_else(|| out_of_range(input))?;
        Ok(Self::new(major, 0, 0))
    }

    fn bump_minor(&self, input: &str) -> DiscoveryResult<Self> {
        let minor = self.0.minor.checked_add(1).ok_or_else(|| out_of_range(input))?;
        Ok(Self::new(self.0.major, minor, 0))
    }
}

impl PartialEq for ServiceVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ServiceVersion {}

impl PartialOrd for ServiceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // `Prerelease` orders the empty pre-release above any non-empty one.
        (self.0.major, self.0.minor, self.0.patch, &self.0.pre).cmp(&(
            other.0.major,
            other.0.minor,
            other.0.patch,
            &other.0.pre,
        ))
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceVersion {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Splits `1.2.3-beta+build` into `("1.2.3", "-beta+build")`.
fn split_core(input: &str) -> (&str, &str) {
    match input.find(['-', '+']) {
        Some(idx) => input.split_at(idx),
        None => (input, ""),
    }
}

fn out_of_range(input: &str) -> DiscoveryError {
    DiscoveryError::version_parse(input, "version component out of range")
}

fn parse_component(input: &str, part: &str) -> DiscoveryResult<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DiscoveryError::version_parse(
            input,
            format!("'{}' is not a numeric version component", part),
        ));
    }
    part.parse()
        .map_err(|e| DiscoveryError::version_parse(input, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Op {
    /// Longest operators first so `>=` is not read as `>`.
    const PREFIXES: [(&'static str, Op); 8] = [
        (">=", Op::Ge),
        ("<=", Op::Le),
        ("!=", Op::Ne),
        ("==", Op::Eq),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
        ("!", Op::Ne),
    ];

    fn split(token: &str) -> (Option<Op>, &str) {
        for (prefix, op) in Self::PREFIXES {
            if let Some(rest) = token.strip_prefix(prefix) {
                return (Some(op), rest);
            }
        }
        (None, token)
    }
}

#[derive(Debug, Clone)]
struct Comparator {
    op: Op,
    version: ServiceVersion,
}

impl Comparator {
    fn new(op: Op, version: ServiceVersion) -> Self {
        Self { op, version }
    }

    fn matches(&self, candidate: &ServiceVersion) -> bool {
        let ord = candidate.cmp(&self.version);
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
        }
    }
}

/// A parsed version constraint
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    raw: String,
    /// OR of AND-ed comparators
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionConstraint {
    /// The constraint every version satisfies
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            alternatives: vec![vec![Comparator::new(Op::Ge, ServiceVersion::new(0, 0, 0))]],
        }
    }

    /// Parse a constraint string
    pub fn parse(input: &str) -> DiscoveryResult<Self> {
        let trimmed = input.trim();
        if is_wildcard(trimmed) || trimmed.is_empty() {
            return Ok(Self {
                raw: input.to_string(),
                ..Self::any()
            });
        }

        let alternatives = if let Some(rest) = trimmed.strip_prefix('^') {
            let base = ServiceVersion::parse(rest)?;
            let upper = base.bump_major(input)?;
            vec![vec![Comparator::new(Op::Ge, base), Comparator::new(Op::Lt, upper)]]
        } else if let Some(rest) = trimmed.strip_prefix('~') {
            let base = ServiceVersion::parse(rest)?;
            let upper = base.bump_minor(input)?;
            vec![vec![Comparator::new(Op::Ge, base), Comparator::new(Op::Lt, upper)]]
        } else {
            trimmed
                .split("||")
                .map(|alternative| parse_alternative(input, alternative))
                .collect::<DiscoveryResult<Vec<_>>>()?
        };

        Ok(Self {
            raw: input.to_string(),
            alternatives,
        })
    }

    /// Whether `version` satisfies the constraint
    pub fn matches(&self, version: &ServiceVersion) -> bool {
        self.alternatives
            .iter()
            .any(|all| all.iter().all(|c| c.matches(version)))
    }

    /// The constraint as it was given
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Keep the candidates at the highest version satisfying the constraint.
    ///
    /// Every candidate at that version is returned, in input order. The result
    /// is empty when nothing matches.
    pub fn select_latest<T, F>(&self, candidates: Vec<T>, version_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &ServiceVersion,
    {
        let Some(latest) = candidates
            .iter()
            .map(&version_of)
            .filter(|v| self.matches(v))
            .max()
            .cloned()
        else {
            return Vec::new();
        };

        candidates
            .into_iter()
            .filter(|c| *version_of(c) == latest)
            .collect()
    }
}

impl FromStr for VersionConstraint {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn is_wildcard(part: &str) -> bool {
    matches!(part, "*" | "x" | "X")
}

fn parse_alternative(input: &str, alternative: &str) -> DiscoveryResult<Vec<Comparator>> {
    let mut comparators = Vec::new();
    let mut pending_op: Option<Op> = None;

    for token in alternative.split_whitespace() {
        // An operator on its own (`>= 1.2.0`) binds to the next token.
        let (op, rest) = match pending_op.take() {
            Some(op) => (Some(op), token),
            None => Op::split(token),
        };

        if op.is_some() && rest.is_empty() {
            pending_op = op;
            continue;
        }
        comparators.extend(parse_comparator(input, op, rest)?);
    }

    if pending_op.is_some() {
        return Err(DiscoveryError::version_parse(input, "operator without a version"));
    }
    if comparators.is_empty() {
        return Err(DiscoveryError::version_parse(input, "empty version range"));
    }
    Ok(comparators)
}

fn parse_comparator(input: &str, op: Option<Op>, version: &str) -> DiscoveryResult<Vec<Comparator>> {
    let op = op.unwrap_or(Op::Eq);
    let (core, suffix) = split_core(version);
    let parts: Vec<&str> = core.split('.').collect();

    let Some(wildcard_at) = parts.iter().position(|p| is_wildcard(p)) else {
        return Ok(vec![Comparator::new(op, ServiceVersion::parse(version)?)]);
    };

    if !suffix.is_empty() {
        return Err(DiscoveryError::version_parse(
            input,
            "wildcards cannot carry pre-release or build metadata",
        ));
    }
    if parts.len() > 3 || parts[wildcard_at..].iter().any(|p| !is_wildcard(p)) {
        return Err(DiscoveryError::version_parse(
            input,
            format!("'{}' mixes wildcards with fixed components", version),
        ));
    }

    let mut fixed = [0u64; 3];
    for (slot, part) in fixed.iter_mut().zip(&parts[..wildcard_at]) {
        *slot = parse_component(input, part)?;
    }
    let lower = ServiceVersion::new(fixed[0], fixed[1], fixed[2]);
    let upper = match wildcard_at {
        0 => None,
        1 => Some(lower.bump_major(input)?),
        _ => Some(lower.bump_minor(input)?),
    };

    let comparators = match (op, upper) {
        (Op::Eq, Some(upper)) => vec![Comparator::new(Op::Ge, lower), Comparator::new(Op::Lt, upper)],
        (Op::Eq | Op::Ge | Op::Le, None) | (Op::Ge, Some(_)) => vec![Comparator::new(Op::Ge, lower)],
        (Op::Gt, Some(upper)) => vec![Comparator::new(Op::Ge, upper)],
        (Op::Lt, _) => vec![Comparator::new(Op::Lt, lower)],
        (Op::Le, Some(upper)) => vec![Comparator::new(Op::Lt, upper)],
        (Op::Gt, None) | (Op::Ne, _) => {
            return Err(DiscoveryError::version_parse(
                input,
                format!("wildcard '{}' cannot be used with this operator", version),
            ));
        }
    };
    Ok(comparators)
}
