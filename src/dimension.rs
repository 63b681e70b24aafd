//! Declaring the configuration dimensions of a sweep. A dimension is
//! a named axis with an ordered list of legal values; the declared
//! order is significant--it is the traversal order, and the position
//! of a dimension in the declaration list decides how rarely it
//! toggles during a sweep (first = slowest-varying, most expensive to
//! change, e.g. which managed host to run against).
//!
//! Values are carried as checked strings, the same way they would be
//! handed to a remote command or an environment variable; the
//! handlers that consume them parse what they need.

use std::{fmt::Display, str::FromStr};

use itertools::Itertools;
use kstring::KString;

/// Fatal configuration mistakes. No sweep proceeds after any of
/// these.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigurationError {
    #[error("invalid dimension name {name:?}: {problem}")]
    InvalidDimensionName { name: String, problem: String },
    #[error("duplicated dimension name {name:?}")]
    DuplicateDimension { name: DimensionName },
    #[error("marker dimension {name:?} is not a declared dimension (declared are: {declared})")]
    UnknownMarkerDimension { name: DimensionName, declared: String },
    #[error("no handler registered for dimension {name:?}")]
    MissingHandler { name: DimensionName },
    #[error("a handler is already registered for dimension {name:?}")]
    DuplicateHandler { name: DimensionName },
    #[error("threshold multiplier must be finite and >= 1.0, got {value}")]
    InvalidThresholdMultiplier { value: f64 },
    #[error("wait step must be > 0 ms")]
    ZeroWaitStep,
    #[error("the experiment was already run; a driver is single-pass")]
    AlreadyRan,
}

/// The name of a configuration dimension. Checked on construction:
/// non-empty, no whitespace and none of the characters used as
/// delimiters in coordinate strings and report rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DimensionName(KString);

impl DimensionName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn dimension_name_problem(s: &str) -> Option<&'static str> {
    if s.is_empty() {
        return Some("name is empty");
    }
    if s.chars().any(|c| c.is_whitespace()) {
        return Some("name contains whitespace");
    }
    if s.contains(['=', ',', '\t']) {
        return Some("name contains a delimiter character ('=', ',' or tab)");
    }
    None
}

impl FromStr for DimensionName {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match dimension_name_problem(s) {
            None => Ok(Self(KString::from_ref(s))),
            Some(problem) => Err(ConfigurationError::InvalidDimensionName {
                name: s.into(),
                problem: problem.into(),
            }),
        }
    }
}

impl TryFrom<String> for DimensionName {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DimensionName> for String {
    fn from(value: DimensionName) -> Self {
        value.0.into_string()
    }
}

impl Display for DimensionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One value on a dimension axis. Opaque to the sweep engine; only
/// compared for equality and rendered into coordinate strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct DimValue(KString);

impl DimValue {
    pub fn new(s: &str) -> Self {
        Self(KString::from_ref(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DimValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DimValue {
    fn from(value: String) -> Self {
        Self(KString::from_string(value))
    }
}

impl From<u64> for DimValue {
    fn from(value: u64) -> Self {
        Self(KString::from_string(value.to_string()))
    }
}

impl From<i64> for DimValue {
    fn from(value: i64) -> Self {
        Self(KString::from_string(value.to_string()))
    }
}

impl Display for DimValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    pub name: DimensionName,
    /// Ordered; the first value is the one whose handler invocation
    /// is eligible to (re-)calibrate measurements (see
    /// `Measurement`). Dimensions with no values are dropped from
    /// traversal entirely.
    pub values: Vec<DimValue>,
}

impl Dimension {
    pub fn new(name: &str, values: impl IntoIterator<Item = impl Into<DimValue>>) -> Result<Self, ConfigurationError> {
        Ok(Self {
            name: name.parse()?,
            values: values.into_iter().map(Into::into).collect(),
        })
    }
}

/// The declared axes of one experiment, plus the optional marker
/// dimension (the coarse axis whose handler must be re-invoked
/// whenever anything beneath it changes; see
/// `PointEnumerator::widen_to_leftmost_changed`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionSpace {
    dimensions: Vec<Dimension>,
    marker: Option<DimensionName>,
}

impl DimensionSpace {
    pub fn new(
        dimensions: Vec<Dimension>,
        marker: Option<DimensionName>,
    ) -> Result<Self, ConfigurationError> {
        let mut seen = Vec::new();
        for dimension in &dimensions {
            if seen.contains(&&dimension.name) {
                return Err(ConfigurationError::DuplicateDimension {
                    name: dimension.name.clone(),
                });
            }
            seen.push(&dimension.name);
        }
        if let Some(marker) = &marker {
            if !seen.contains(&marker) {
                return Err(ConfigurationError::UnknownMarkerDimension {
                    name: marker.clone(),
                    declared: seen.iter().map(|name| format!("{name:?}")).join(", "),
                });
            }
        }
        Ok(Self { dimensions, marker })
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn marker(&self) -> Option<&DimensionName> {
        self.marker.as_ref()
    }

    /// The dimensions that take part in traversal: declaration order
    /// with every empty-valued dimension removed.
    pub fn active(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions
            .iter()
            .filter(|dimension| !dimension.values.is_empty())
    }

    pub fn active_order(&self) -> Vec<DimensionName> {
        self.active()
            .map(|dimension| dimension.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dim(name: &str, values: &[&str]) -> Dimension {
        Dimension::new(name, values.iter().copied()).unwrap()
    }

    #[test]
    fn t_dimension_name_checks() {
        assert!("host".parse::<DimensionName>().is_ok());
        assert!("vm_type".parse::<DimensionName>().is_ok());
        assert!("".parse::<DimensionName>().is_err());
        assert!("a b".parse::<DimensionName>().is_err());
        assert!("a=b".parse::<DimensionName>().is_err());
        assert!("a,b".parse::<DimensionName>().is_err());
    }

    #[test]
    fn t_active_order_drops_empty() {
        let space = DimensionSpace::new(
            vec![dim("host", &["h1"]), dim("ram", &[]), dim("vms", &["1", "2"])],
            None,
        )
        .unwrap();
        let order: Vec<String> = space
            .active_order()
            .iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(order, ["host", "vms"]);
    }

    #[test]
    fn t_duplicate_dimension_is_fatal() {
        let err = DimensionSpace::new(vec![dim("host", &["h1"]), dim("host", &["h2"])], None)
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConfigurationError::DuplicateDimension {
                name: "host".parse().unwrap()
            }
        );
    }

    #[test]
    fn t_marker_must_be_declared() {
        let marker: DimensionName = "version".parse().unwrap();
        let err = DimensionSpace::new(vec![dim("host", &["h1"])], Some(marker))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConfigurationError::UnknownMarkerDimension { .. }
        ));
    }

    #[test]
    fn t_dimension_space_serde_roundtrip() {
        let space = DimensionSpace::new(
            vec![dim("host", &["h1", "h2"]), dim("vms", &["1"])],
            Some("host".parse().unwrap()),
        )
        .unwrap();
        let json = serde_json::to_string(&space).unwrap();
        let back: DimensionSpace = serde_json::from_str(&json).unwrap();
        assert_eq!(space, back);
    }
}
