//! Playbook execution engine and quality-gated Forge stage pipeline.
//!
//! A [`playbook::Playbook`] is a graph of typed steps. The [`engine::Engine`]
//! validates it, runs independent steps concurrently, suspends on
//! `human_input` steps and meters every provider call through the
//! [`provider::ProviderGateway`] into the [`ledger::CostLedger`].
//!
//! The [`pipeline::StagePipeline`] drives a [`pipeline::ForgeProject`] through
//! five ordered stages, generating each artifact with the engine and gating
//! each advance on a [`gates::QualityGate`] assessment.

pub mod config;
pub mod consensus;
pub mod engine;
pub mod errors;
pub mod executors;
pub mod gates;
pub mod ledger;
pub mod pipeline;
pub mod playbook;
pub mod provider;
pub mod service;
pub mod store;
pub mod util;
