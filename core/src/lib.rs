//! Synchronizes survey submissions from an ODK Central form server into a relational database,
//! copies their images to object storage and materializes a unified reporting table.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod config;
pub mod document;
pub mod error;
pub mod infra;
pub mod logging;
pub mod media;
pub mod orchestrator;
pub mod persistence;
pub mod processor;
pub mod source;
pub mod storage;
pub mod tracker;
pub mod unified;

pub use config::AppConfig;
pub use error::Error;
pub use orchestrator::{CycleClaim, CycleReport, CycleSummary, SyncOrchestrator};
