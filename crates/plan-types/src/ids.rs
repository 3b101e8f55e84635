//! Identifier types.
//!
//! These are opaque strings. Equality is the only operation the state
//! machine requires of `AssetKey` and `LogicalVersion`.

/// Unique identifier for a step within a plan.
pub type StepKey = String;

/// Name of one of a step's declared outputs.
pub type OutputName = String;

/// One discrete value of a dynamic output, naming a fan-out branch.
pub type MappingKey = String;

/// Opaque identifier for a persisted asset.
pub type AssetKey = String;

/// Opaque identity token for the content of an asset at one production.
pub type LogicalVersion = String;
