//! Link routing: geometry primitives, the route calculator, and the
//! crossing resolver. The orchestrator in `crate::engine` is the only
//! intended entry point; the pieces are public for direct use in tests
//! and host tooling.

pub mod calculator;
pub mod crossings;
pub mod geometry;
mod types;

pub use types::{AvoidanceZone, MultiLinkInfo, NodeBoxes, Route, RouteMeta, RoutePath};
