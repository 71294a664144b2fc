//! Entity reconciliation
//!
//! Spreadsheets name governments, departments, public entities and category
//! groups in free text. We map those names onto canonical records through a
//! fixed sequence of lookups, first hit wins:
//!
//! 1. exact name within the scope
//! 2. slug of the name within the scope (case and punctuation drift)
//! 3. departments only: a leading vote number, matched against the primary
//!    department of that vote
//! 4. alias table within the scope
//!
//! A miss is a normal outcome, returned as `Resolution::Missing`. Errors only
//! come from the store itself.

use std::collections::HashMap;

use crate::store::{Entity, EntityKind, EntityScope, EntityStore, StoreError};

/// Lowercase, alphanumeric words joined by `-`.
///
/// Same input always yields the same slug; stored slugs are produced by this
/// function too.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;

    for c in value.trim().chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '_' {
            pending_dash = true;
        }
        // other punctuation is dropped, like "Dept." -> "dept"
    }

    slug
}

/// Leading vote number of a department label: `16`, `Vote 16`, `16. Health`.
pub fn vote_number(name: &str) -> Option<i32> {
    let trimmed = name.trim();
    let rest = match trimmed.get(..4) {
        Some(head) if head.eq_ignore_ascii_case("vote") => trimmed[4..].trim_start(),
        _ => trimmed,
    };

    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    // "16. Health", "16 - Health", "16: Health" but not "16th Street"
    let tail = rest[digits.len()..].trim_start();
    if !(tail.is_empty() || tail.starts_with(['.', '-', ':', ')'])) {
        return None;
    }

    digits.parse().ok()
}

/// Which lookup tier produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    ExactName,
    Slug,
    VoteNumber,
    Alias,
}

/// A name that could not be matched within its scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityMiss {
    pub kind: EntityKind,
    pub scope: EntityScope,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found { entity: Entity, tier: MatchTier },
    Missing(EntityMiss),
}

impl Resolution {
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Resolution::Found { entity, .. } => Some(entity),
            Resolution::Missing(_) => None,
        }
    }
}

/// Read-only resolver with a per-job memo.
///
/// The memo only skips repeated store round trips; within one job the entity
/// table is not expected to change.
pub struct Reconciler<'a, S: EntityStore + ?Sized> {
    store: &'a S,
    memo: HashMap<(EntityKind, EntityScope, String), Resolution>,
}

impl<'a, S: EntityStore + ?Sized> Reconciler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            memo: HashMap::new(),
        }
    }

    pub async fn resolve(
        &mut self,
        kind: EntityKind,
        scope: &EntityScope,
        name: &str,
    ) -> Result<Resolution, StoreError> {
        let name = name.trim();
        let key = (kind, scope.clone(), name.to_string());
        if let Some(hit) = self.memo.get(&key) {
            return Ok(hit.clone());
        }

        let resolution = resolve_uncached(self.store, kind, scope, name).await?;
        if let Resolution::Found { entity, tier } = &resolution {
            if *tier != MatchTier::ExactName {
                tracing::debug!(
                    kind = kind.as_str(),
                    name = %name,
                    matched = %entity.name,
                    tier = ?tier,
                    "Resolved entity through fallback"
                );
            }
        }

        self.memo.insert(key, resolution.clone());
        Ok(resolution)
    }
}

async fn resolve_uncached<S: EntityStore + ?Sized>(
    store: &S,
    kind: EntityKind,
    scope: &EntityScope,
    name: &str,
) -> Result<Resolution, StoreError> {
    let found = |entity, tier| Ok(Resolution::Found { entity, tier });

    if !name.is_empty() {
        if let Some(entity) = store.find_by_exact_name(kind, scope, name).await? {
            return found(entity, MatchTier::ExactName);
        }

        let slug = slugify(name);
        if !slug.is_empty() {
            if let Some(entity) = store.find_by_slug(kind, scope, &slug).await? {
                return found(entity, MatchTier::Slug);
            }
        }

        if kind == EntityKind::Department {
            if let Some(vote) = vote_number(name) {
                if let Some(entity) = store.find_primary_by_vote(kind, scope, vote).await? {
                    return found(entity, MatchTier::VoteNumber);
                }
            }
        }

        if let Some(entity) = store.find_by_alias(kind, scope, name).await? {
            return found(entity, MatchTier::Alias);
        }
    }

    Ok(Resolution::Missing(EntityMiss {
        kind,
        scope: scope.clone(),
        name: name.to_string(),
    }))
}
