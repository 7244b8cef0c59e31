//! moltagent — control plane and agent worker in one binary.
//!
//! `MOLTAGENT_MANIFEST` selects worker mode, a configured API token (or
//! `MOLTAGENT_CONTROL_PLANE=1`) selects orchestrator mode, both together run
//! hybrid. The CLI verbs are a thin front-end over the orchestrator's HTTP
//! surface.

#![forbid(unsafe_code)]

pub mod api_client;
pub mod env;
pub mod orchestrator;
pub mod worker;
