//! Documents stored in the abstracts index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// PubMed identifier; the document id in the abstracts index.
///
/// Serializes as a bare number. Deserializes from a number or a numeric
/// string, since the backend reports document ids as strings and JSON object
/// keys are always strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Pmid(pub u64);

impl Pmid {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Pmid {
    fn from(value: u64) -> Self {
        Pmid(value)
    }
}

impl fmt::Display for Pmid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Pmid {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Pmid)
            .map_err(|_| IndexError::InvalidArgument(format!("'{}' is not a numeric PMID", s)))
    }
}

impl<'de> Deserialize<'de> for Pmid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PmidVisitor;

        impl<'de> serde::de::Visitor<'de> for PmidVisitor {
            type Value = Pmid;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a numeric PMID")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Pmid, E> {
                Ok(Pmid(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Pmid, E> {
                u64::try_from(v)
                    .map(Pmid)
                    .map_err(|_| E::custom(format!("negative PMID {}", v)))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Pmid, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(PmidVisitor)
    }
}

/// One searchable abstract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Abstract {
    pub pmid: Pmid,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_year: Option<i32>,
    /// Source the abstract was parsed from (e.g. a baseline XML file name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_count: Option<u64>,
}

impl Abstract {
    pub fn new(pmid: impl Into<Pmid>, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            pmid: pmid.into(),
            title: title.into(),
            text: text.into(),
            pub_year: None,
            origin: None,
            citation_count: None,
        }
    }

    pub fn with_pub_year(mut self, year: i32) -> Self {
        self.pub_year = Some(year);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_citation_count(mut self, count: u64) -> Self {
        self.citation_count = Some(count);
        self
    }
}

/// What a delete call removes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeleteTargetRepr", into = "DeleteTargetRepr")]
pub enum DeleteTarget {
    /// Remove the listed documents.
    Ids(Vec<Pmid>),
    /// Drop the whole index. It is not recreated.
    All,
}

impl DeleteTarget {
    /// Builds a target from raw command-line style arguments.
    ///
    /// A single `"all"` (any case) selects the whole index. Anything else must
    /// be a list of numeric ids; `"all"` mixed in with ids is rejected.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, IndexError> {
        if let [only] = args {
            if only.as_ref().eq_ignore_ascii_case("all") {
                return Ok(DeleteTarget::All);
            }
        }

        args.iter()
            .map(|arg| arg.as_ref().parse::<Pmid>())
            .collect::<Result<Vec<_>, _>>()
            .map(DeleteTarget::Ids)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DeleteTargetRepr {
    Sentinel(String),
    Ids(Vec<Pmid>),
}

impl TryFrom<DeleteTargetRepr> for DeleteTarget {
    type Error = String;

    fn try_from(repr: DeleteTargetRepr) -> Result<Self, Self::Error> {
        match repr {
            DeleteTargetRepr::Sentinel(s) if s.eq_ignore_ascii_case("all") => Ok(DeleteTarget::All),
            DeleteTargetRepr::Sentinel(s) => {
                Err(format!("expected \"all\" or a list of PMIDs, got \"{}\"", s))
            }
            DeleteTargetRepr::Ids(ids) => Ok(DeleteTarget::Ids(ids)),
        }
    }
}

impl From<DeleteTarget> for DeleteTargetRepr {
    fn from(target: DeleteTarget) -> Self {
        match target {
            DeleteTarget::All => DeleteTargetRepr::Sentinel("all".to_string()),
            DeleteTarget::Ids(ids) => DeleteTargetRepr::Ids(ids),
        }
    }
}
