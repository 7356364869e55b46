//! Request routing and service account resolution
//!
//! Handles:
//! - Glob matching of identity and issuer claims
//! - Priority-ordered mapping rules
//! - Health-gated account selection with fallback chains

mod mapper;
mod matcher;
mod rules;

pub use mapper::{Mapper, MapperOptions, Resolution};
pub use matcher::{PatternError, PatternMatcher};
pub use rules::{MappingRule, RuleCondition};
