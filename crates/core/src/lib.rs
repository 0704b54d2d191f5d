//! `leadflow-core`: shared building blocks for the lead automation queue.
//!
//! Identifiers, the error taxonomy and the entity trait. No IO lives here.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{QueueError, QueueResult};
pub use id::{ActorId, LeadId, ProjectId};
