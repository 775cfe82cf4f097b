pub mod canonical;
pub mod models;

pub use canonical::{
    create_integration_entity, ClassAssignment, EntityAssignments, IntegrationEntityInput,
};
pub use models::{Entity, RawDataEntry, Relationship};
