//! Programs and the resource graph builder.
//!
//! A program declares typed resources with dependency references plus named
//! exports. [`ResourceGraph::build`] validates it into a DAG with a stable
//! topological order.

mod builder;
mod graph;
mod hash;
pub mod kubernetes;
mod resource;

pub use builder::Program;
pub use graph::ResourceGraph;
pub use hash::{canonical_json, PropertyHasher};
pub use resource::{ExportValue, ResourceDefinition, ResourceRef};
