//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Queue records implement this with the identifier owned by the external lead
/// store; the queue never mints lead identities itself.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Identifier of the project (tenant) that owns the entity.
    fn project_id(&self) -> crate::ProjectId;
}
