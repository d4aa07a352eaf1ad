//! Plan reconciliation for RKE2/K3s clusters provisioned through Cluster API
//!
//! The planner turns an RKEControlPlane and its machines into one plan per
//! machine, delivered through plan secrets that the system agent applies.
//! Entry point is [`Planner::process`].

#![deny(missing_docs)]

/// Collaborator traits and their Kubernetes-backed implementations
pub mod client;
/// Distro config rendering
pub mod config;
/// Cordon and drain protocol
pub mod drain;
/// Init-node election
pub mod election;
/// Plan entry predicates
pub mod filters;
/// Plan instruction builders
pub mod instructions;
/// Node plan data model
pub mod plan;
/// Planner entry point and operation state machines
pub mod planner;
/// Health probe templates
pub mod probes;
/// Private registry config
pub mod registries;
/// Etcd S3 argument rendering
pub mod s3;
/// Planner configuration
pub mod settings;
/// Plan secret access
pub mod store;

#[cfg(test)]
mod testing;

pub use planner::{Planner, PlannerBuilder};
pub use settings::PlannerConfig;
