//! Completion harness for CodeFRAME — the thin async surface between the
//! orchestrator and whatever LLM backend is wired in at deployment time.
//!
//! Ships the [`provider::CompletionProvider`] trait, cancellation tokens,
//! the operator-supplied price table, and deterministic in-process
//! providers for tests.

pub mod cancel;
pub mod pricing;
pub mod provider;
