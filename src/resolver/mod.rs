//! Maps human-supplied names to resource identifiers.
//!
//! A UUID-shaped input is treated as already resolved and never triggers a
//! listing. Anything else is matched against the candidate names of a lazily
//! fetched listing and must select exactly one candidate.

use std::fmt;
use std::future::Future;

use thiserror::Error;
use uuid::Uuid;

use crate::cloud::{Flavor, Image, SecurityGroup};

/// Resource that can be selected by name.
pub trait Candidate {
    /// Identifier returned on a successful match.
    fn id(&self) -> &str;
    /// Name compared against the input.
    fn name(&self) -> &str;
}

impl Candidate for Image {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Candidate for Flavor {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Candidate for SecurityGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// How candidate names are compared with the input.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MatchMode {
    /// Case-sensitive equality.
    #[default]
    Exact,
    /// The input appears anywhere in the candidate name. Kept for lookups
    /// that accept name fragments.
    Substring,
}

impl MatchMode {
    /// Returns `true` when `name` matches `input` under this mode.
    #[must_use]
    pub fn matches(self, input: &str, name: &str) -> bool {
        match self {
            Self::Exact => name == input,
            Self::Substring => name.contains(input),
        }
    }
}

/// Kind of resource being resolved, used in error messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// Boot image.
    Image,
    /// Compute flavor.
    Flavor,
    /// Security group.
    SecurityGroup,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Image => "image",
            Self::Flavor => "flavor",
            Self::SecurityGroup => "security group",
        })
    }
}

/// Errors raised while resolving a name.
#[derive(Debug, Error)]
pub enum ResolveError<E>
where
    E: std::error::Error + 'static,
{
    /// No candidate matched the input.
    #[error(
        "could not find any {kind} matching '{name}'; check that it exists and is public or shared with the current project"
    )]
    NotFound {
        /// Kind of resource requested.
        kind: ResourceKind,
        /// Input that failed to match.
        name: String,
    },
    /// More than one candidate matched the input.
    #[error("found too many {kind}s matching '{name}': {}", .matches.join(", "))]
    Ambiguous {
        /// Kind of resource requested.
        kind: ResourceKind,
        /// Input that matched several candidates.
        name: String,
        /// Identifiers of every matching candidate.
        matches: Vec<String>,
    },
    /// The candidate listing could not be fetched.
    #[error("failed to list {kind}s: {source}")]
    Listing {
        /// Kind of resource requested.
        kind: ResourceKind,
        /// Provider error.
        #[source]
        source: E,
    },
}

/// Returns `true` when `input` is a well-formed UUID in any of the accepted
/// textual forms.
#[must_use]
pub fn is_uuid(input: &str) -> bool {
    Uuid::parse_str(input).is_ok()
}

/// Selects the single candidate whose name matches `input`.
///
/// # Errors
///
/// Returns [`ResolveError::NotFound`] when nothing matches and
/// [`ResolveError::Ambiguous`] with every matching identifier otherwise.
pub fn select<C, E>(
    kind: ResourceKind,
    input: &str,
    mode: MatchMode,
    candidates: &[C],
) -> Result<String, ResolveError<E>>
where
    C: Candidate,
    E: std::error::Error + 'static,
{
    let mut matching: Vec<String> = candidates
        .iter()
        .filter(|candidate| mode.matches(input, candidate.name()))
        .map(|candidate| candidate.id().to_owned())
        .collect();

    match matching.len() {
        0 => Err(ResolveError::NotFound {
            kind,
            name: input.to_owned(),
        }),
        1 => Ok(matching.remove(0)),
        _ => Err(ResolveError::Ambiguous {
            kind,
            name: input.to_owned(),
            matches: matching,
        }),
    }
}

/// Resolves a name-or-identifier to an identifier.
///
/// `fetch` is only awaited when `input` is not a UUID.
///
/// # Errors
///
/// Returns [`ResolveError::Listing`] when `fetch` fails, otherwise the
/// errors of [`select`].
pub async fn resolve<C, E, F, Fut>(
    kind: ResourceKind,
    input: &str,
    mode: MatchMode,
    fetch: F,
) -> Result<String, ResolveError<E>>
where
    C: Candidate,
    E: std::error::Error + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<C>, E>>,
{
    if is_uuid(input) {
        return Ok(input.to_owned());
    }

    let candidates = fetch()
        .await
        .map_err(|source| ResolveError::Listing { kind, source })?;
    select(kind, input, mode, &candidates)
}
